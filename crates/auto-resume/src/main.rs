use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};

use auto_resume::config::HostConfig;
use auto_resume::fsview::LocalFs;
use auto_resume::inject::Injector;
use auto_resume::resolve::{ProcessEnv, Resolution, Resolver};
use auto_resume::settings::{self, ResumeSettings};
use auto_resume::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Settings file (defaults to ./auto-resume.toml when present)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Rewrite a command line for resumption and print it
    Args {
        /// Print a JSON array instead of one argument per line
        #[arg(long)]
        json: bool,
        /// Program and its arguments, after `--`
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },
    /// Rewrite a command line for resumption and run it
    Exec {
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },
    /// Resolve checkpoint and run id against a composed configuration
    Resolve {
        /// Composed host configuration (YAML)
        #[arg(long)]
        config: PathBuf,
        /// Command-line overrides of the current process; their paths keep the composed values over a saved snapshot
        #[arg(long = "override")]
        overrides: Vec<String>,
        /// Write the merged configuration here
        #[arg(long)]
        write: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show how a resume target is classified
    Classify { target: String },
    /// Recover the tracked run id from a local run directory
    Identity { dir: PathBuf },
}

fn main() -> Result<()> {
    auto_resume::logging::init();
    let args = Args::parse();
    let settings = settings::load_or_default(args.settings.as_deref())?;
    match args.cmd {
        Command::Args { json, argv } => cmd_args(&settings, &argv, json),
        Command::Exec { argv } => {
            let code = cmd_exec(&settings, &argv)?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Command::Resolve {
            config,
            overrides,
            write,
            json,
        } => cmd_resolve(&settings, &config, &overrides, write.as_deref(), json),
        Command::Classify { target } => {
            let t = auto_resume::target::classify(&target, &LocalFs, &settings);
            println!("{}\t{}", t.kind(), t.value());
            Ok(())
        }
        Command::Identity { dir } => {
            match auto_resume::identity::recover_identity(&LocalFs, &dir, &settings) {
                Some(id) => {
                    println!("{id}");
                    Ok(())
                }
                None => Err(Error::msg(format!(
                    "no run id found under {}",
                    dir.display()
                ))),
            }
        }
    }
}

fn rewrite(settings: &ResumeSettings, argv: &[String]) -> Result<Vec<String>> {
    let remote = auto_resume::remote::from_settings(settings)?;
    let injector = Injector::new(settings, &LocalFs, remote.as_ref());
    Ok(injector.bootstrap(argv))
}

fn cmd_args(settings: &ResumeSettings, argv: &[String], json: bool) -> Result<()> {
    let out = rewrite(settings, argv)?;
    if json {
        println!("{}", serde_json::to_string(&out)?);
    } else {
        for a in out {
            println!("{a}");
        }
    }
    Ok(())
}

fn cmd_exec(settings: &ResumeSettings, argv: &[String]) -> Result<i32> {
    let out = rewrite(settings, argv)?;
    let Some((program, rest)) = out.split_first() else {
        return Err(Error::msg("nothing to execute"));
    };
    let status = std::process::Command::new(program)
        .args(rest)
        .status()
        .map_err(|e| Error::msg(format!("failed to run {program}: {e}")))?;
    // Killed by a signal: no exit code.
    Ok(status.code().unwrap_or(1))
}

fn cmd_resolve(
    settings: &ResumeSettings,
    config: &Path,
    overrides: &[String],
    write: Option<&Path>,
    json: bool,
) -> Result<()> {
    let mut cfg = HostConfig::load(config)?;
    let remote = auto_resume::remote::from_settings(settings)?;
    let resolver = Resolver::new(settings, &LocalFs, &ProcessEnv, remote.as_ref());
    let resolution = resolver.resolve(&cfg);

    if let Some(out) = write {
        resolution.apply(&mut cfg, overrides, settings);
        cfg.write(out)?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&resolution_json(&resolution))?);
        return Ok(());
    }
    let ckpt = resolution
        .checkpoint
        .as_ref()
        .map(|c| format!("{} ({})", c.path.display(), c.source))
        .unwrap_or_else(|| "-".into());
    println!("checkpoint: {ckpt}");
    println!("run_id:     {}", resolution.run_id.as_deref().unwrap_or("-"));
    println!(
        "snapshot:   {}",
        if resolution.saved_config.is_some() { "yes" } else { "no" }
    );
    Ok(())
}

fn resolution_json(r: &Resolution) -> serde_json::Value {
    json!({
        "checkpoint": r.checkpoint.as_ref().map(|c| c.path.display().to_string()),
        "source": r.checkpoint.as_ref().map(|c| c.source.as_str()),
        "run_id": r.run_id,
        "saved_config": r.saved_config.is_some(),
    })
}
