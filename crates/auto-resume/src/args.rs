//! `key=value` override tokens as understood by the host configuration system.
//!
//! A key may carry a prefix: `+` adds a key that is not in the base config,
//! `++` adds or overrides, `~` deletes. Keys containing `/` address config
//! groups, which cannot be force-overridden with `++`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    None,
    Add,
    Force,
    Remove,
}

impl Prefix {
    pub fn as_str(self) -> &'static str {
        match self {
            Prefix::None => "",
            Prefix::Add => "+",
            Prefix::Force => "++",
            Prefix::Remove => "~",
        }
    }

    fn split(raw_key: &str) -> (Prefix, &str) {
        if let Some(rest) = raw_key.strip_prefix("++") {
            (Prefix::Force, rest)
        } else if let Some(rest) = raw_key.strip_prefix('+') {
            (Prefix::Add, rest)
        } else if let Some(rest) = raw_key.strip_prefix('~') {
            (Prefix::Remove, rest)
        } else {
            (Prefix::None, raw_key)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub prefix: Prefix,
    pub key: String,
    pub value: String,
}

impl Argument {
    /// Split at the first `=`. Tokens without one (flags) are not arguments.
    pub fn parse(token: &str) -> Option<Argument> {
        let (raw_key, value) = token.split_once('=')?;
        let (prefix, key) = Prefix::split(raw_key);
        Some(Argument {
            prefix,
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn is_group_key(&self) -> bool {
        self.key.contains('/')
    }

    pub fn to_token(&self) -> String {
        format!("{}{}={}", self.prefix.as_str(), self.key, self.value)
    }
}

/// Bare key of a `key=value` token with every `+`/`~` marker stripped.
/// Tokens without `=` are returned unchanged.
pub fn normalize_key(token: &str) -> &str {
    match token.split_once('=') {
        Some((raw_key, _)) => raw_key.trim_start_matches('+').trim_start_matches('~'),
        None => token,
    }
}

/// Dotted config path an override token addresses. Group keys map to their
/// package path (`data/aug` composes under `data.aug`). Flags and bare words
/// address nothing.
pub fn config_path(token: &str) -> Option<String> {
    let raw_key = match token.split_once('=') {
        Some((k, _)) => k,
        None if token.starts_with('~') => token,
        None => return None,
    };
    let (_, key) = Prefix::split(raw_key);
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some(key.replace('/', "."))
}

/// Rewrite a replayed override so it wins over base-config defaults.
///
/// Bare and `+` tokens become `++`; group keys, `++` and `~` tokens are
/// returned unchanged.
pub fn force(token: &str) -> String {
    let Some(mut arg) = Argument::parse(token) else {
        return token.to_string();
    };
    if arg.is_group_key() {
        return token.to_string();
    }
    match arg.prefix {
        Prefix::None | Prefix::Add => {
            arg.prefix = Prefix::Force;
            arg.to_token()
        }
        Prefix::Force | Prefix::Remove => token.to_string(),
    }
}
