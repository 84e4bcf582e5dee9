use std::fs;
use std::path::Path;

use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};

/// Dot-addressable view over the host program's composed configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    pub value: Value,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            value: Value::Mapping(Mapping::new()),
        }
    }
}

impl HostConfig {
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Mapping(_) => Ok(Self { value }),
            other => Err(Error::msg(format!(
                "configuration root must be a mapping, got {}",
                kind_name(&other)
            ))),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(raw)?;
        Self::from_value(value)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&data).map_err(|e| e.context(path.display()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.value)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        fs::write(path, self.to_yaml()?)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        let mut cur = &self.value;
        for seg in path.split('.') {
            cur = cur.as_mapping()?.get(seg)?;
        }
        Some(cur)
    }

    /// Scalar at `path` rendered as a string; `None` for null, missing and
    /// non-scalar values.
    pub fn get_str(&self, path: &str) -> Option<String> {
        match self.get(path)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Set `path`, creating (or replacing non-mapping) intermediate nodes.
    pub fn set(&mut self, path: &str, value: Value) {
        let segs: Vec<&str> = path.trim().split('.').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segs.split_last() else {
            return;
        };
        let mut cur = &mut self.value;
        for seg in parents {
            if !cur.is_mapping() {
                *cur = Value::Mapping(Mapping::new());
            }
            let Value::Mapping(map) = cur else {
                return;
            };
            cur = map
                .entry(Value::String((*seg).to_string()))
                .or_insert_with(|| Value::Mapping(Mapping::new()));
        }
        if !cur.is_mapping() {
            *cur = Value::Mapping(Mapping::new());
        }
        if let Value::Mapping(map) = cur {
            map.insert(Value::String((*last).to_string()), value);
        }
    }

    /// Deep merge; values from `overlay` win.
    pub fn merge(&mut self, overlay: &HostConfig) {
        merge_values(&mut self.value, overlay.value.clone());
    }

    /// Current values at `paths`, absent ones included, for a later
    /// [`HostConfig::restore`].
    pub fn capture<S: AsRef<str>>(&self, paths: &[S]) -> Vec<(String, Option<Value>)> {
        paths
            .iter()
            .map(|p| (p.as_ref().to_string(), self.get(p.as_ref()).cloned()))
            .collect()
    }

    /// Put captured values back; paths that were absent are removed again.
    pub fn restore(&mut self, captured: Vec<(String, Option<Value>)>) {
        for (path, value) in captured {
            match value {
                Some(v) => self.set(&path, v),
                None => {
                    self.remove(&path);
                }
            }
        }
    }

    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let (parent, last) = match path.trim().rsplit_once('.') {
            Some((p, l)) => (Some(p), l),
            None => (None, path.trim()),
        };
        let holder = match parent {
            Some(p) => self.get_mut(p)?,
            None => &mut self.value,
        };
        holder.as_mapping_mut()?.remove(last)
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut Value> {
        let mut cur = &mut self.value;
        for seg in path.split('.') {
            cur = cur.as_mapping_mut()?.get_mut(seg)?;
        }
        Some(cur)
    }
}

fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Mapping(base_map), Value::Mapping(child_map)) => {
            for (k, v) in child_map {
                match base_map.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}
