//! `cairn` operator CLI: inspect a store and move sites between stores.

use crate::backend::Backend;
use crate::core::config::{BackendConfig, load_config};
use crate::kv::{EngineExt, Key, NodeKind};
use crate::ops::plan::{OperationPhase, OperationPlan, PhaseState};
use crate::transfer::{self, SiteExport};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(
    name = "cairn",
    version = env!("CARGO_PKG_VERSION"),
    about = "Inspect cluster state stores and move sites between them"
)]
pub struct Cli {
    /// TOML file with backend settings; overrides --db.
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,
    /// Store file to open.
    #[clap(long, global = true, default_value = "cairn.db")]
    db: PathBuf,
    /// Open without taking the write lock for longer than a single call.
    #[clap(long, global = true)]
    multi_client: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the children of a directory key, e.g. /root/sites
    Keys {
        #[clap(default_value = "/root")]
        key: String,
    },
    /// Print the value stored at a key
    Get {
        key: String,
        /// Print the undecoded bytes.
        #[clap(long)]
        raw: bool,
    },
    /// Print an operation plan with aggregated phase states
    Plan {
        #[clap(long)]
        site: String,
        #[clap(long)]
        operation: String,
        /// Overlay the recorded changelog before printing.
        #[clap(long)]
        changelog: bool,
    },
    /// Write a site and its dependencies to a JSON file
    Export {
        #[clap(long)]
        site: String,
        #[clap(short, long)]
        out: PathBuf,
    },
    /// Load a site export produced by `export`
    Import {
        #[clap(short, long)]
        file: PathBuf,
    },
    /// Copy a site into another store
    Transfer {
        #[clap(long)]
        site: String,
        /// Destination store file.
        #[clap(long)]
        to: PathBuf,
    },
}

/// Parses `/a/b/c` into a key.
fn parse_key(raw: &str) -> Result<Key> {
    let key = Key::new(raw.split('/').filter(|s| !s.is_empty()));
    key.check()
        .with_context(|| format!("invalid key {raw:?}"))?;
    Ok(key)
}

fn paint(state: PhaseState) -> ColoredString {
    let label = state.as_str();
    match state {
        PhaseState::Completed => label.green(),
        PhaseState::Failed => label.red().bold(),
        PhaseState::RolledBack => label.magenta(),
        PhaseState::InProgress => label.yellow(),
        PhaseState::Unstarted => label.dimmed(),
    }
}

fn print_phase(phase: &OperationPhase, depth: usize) {
    let indent = "  ".repeat(depth);
    let mut line = format!("{indent}{} [{}]", phase.id.bold(), paint(phase.state()));
    if !phase.description.is_empty() {
        line.push_str(&format!(" {}", phase.description));
    }
    if !phase.requires.is_empty() {
        line.push_str(&format!(" (requires {})", phase.requires.join(", ")).dimmed().to_string());
    }
    println!("{line}");
    if let Some(err) = &phase.error {
        println!("{indent}  {} {}", "error:".red(), err);
    }
    for sub in &phase.phases {
        print_phase(sub, depth + 1);
    }
}

fn print_plan(plan: &OperationPlan) {
    println!(
        "{} {} on {} [{}]",
        plan.operation_type.bold(),
        plan.operation_id,
        plan.cluster_name,
        paint(plan.state())
    );
    for phase in &plan.phases {
        print_phase(phase, 1);
    }
}

/// Settings for the store at `path`, or for the source store named by
/// `--config` or `--db`.
fn resolve_config(cli: &Cli, path: Option<PathBuf>) -> Result<BackendConfig> {
    let config = match (&cli.config, path) {
        (_, Some(path)) => BackendConfig::new(path),
        (Some(file), None) => load_config(file)?,
        (None, None) => BackendConfig::new(cli.db.clone()),
    };
    Ok(if cli.multi_client {
        config.multi_client(true)
    } else {
        config
    })
}

fn open_config(config: BackendConfig) -> Result<Backend> {
    let display = config.path.display().to_string();
    Backend::open(config).with_context(|| format!("opening {display}"))
}

fn open(cli: &Cli, path: Option<PathBuf>) -> Result<Backend> {
    open_config(resolve_config(cli, path)?)
}

fn same_store(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Command::Keys { key } => {
            let backend = open(&cli, None)?;
            let key = parse_key(key)?;
            for name in backend.engine().get_keys(&key)? {
                let child = key.join(name.as_str());
                match backend.engine().get_kind(&child)? {
                    Some(NodeKind::Dir) => println!("{}/", name.blue().bold()),
                    _ => println!("{name}"),
                }
            }
            backend.close()?;
        }
        Command::Get { key, raw } => {
            let backend = open(&cli, None)?;
            let key = parse_key(key)?;
            if *raw {
                let bytes = backend.engine().get_val_bytes(&key)?;
                println!("{}", String::from_utf8_lossy(&bytes));
            } else {
                let value: serde_json::Value = backend.engine().get_val(&key)?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            backend.close()?;
        }
        Command::Plan {
            site,
            operation,
            changelog,
        } => {
            let backend = open(&cli, None)?;
            let mut plan = (*backend.get_operation_plan(site, operation)?).clone();
            if *changelog {
                plan.apply_changelog(&backend.get_operation_plan_changelog(site, operation)?);
            }
            print_plan(&plan);
            backend.close()?;
        }
        Command::Export { site, out } => {
            let backend = open(&cli, None)?;
            let export = transfer::export_site(&backend, site)?;
            fs::write(out, serde_json::to_vec_pretty(&export)?)
                .with_context(|| format!("writing {}", out.display()))?;
            println!(
                "{} {} ({} operations) to {}",
                "exported".green(),
                site,
                export.operations.len(),
                out.display()
            );
            backend.close()?;
        }
        Command::Import { file } => {
            let data = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
            let export: SiteExport = serde_json::from_slice(&data)
                .with_context(|| format!("{} is not a site export", file.display()))?;
            let backend = open(&cli, None)?;
            transfer::import_site(&backend, &export)?;
            println!("{} {}", "imported".green(), export.site.domain);
            backend.close()?;
        }
        Command::Transfer { site, to } => {
            let src_config = resolve_config(&cli, None)?;
            if same_store(&src_config.path, to) {
                bail!("source and destination are the same store");
            }
            let src = open_config(src_config)?;
            let dst = open(&cli, Some(to.clone()))?;
            let export = transfer::transfer_site(&src, &dst, site)?;
            println!(
                "{} {} to {} ({} users, {} operations)",
                "transferred".green(),
                site,
                to.display(),
                export.users.len(),
                export.operations.len()
            );
            dst.close()?;
            src.close()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn keys_parse_from_paths() {
        assert_eq!(
            parse_key("/root/sites/a.example.com").unwrap(),
            Key::from(["root", "sites", "a.example.com"])
        );
        assert_eq!(parse_key("root//sites/").unwrap(), Key::from(["root", "sites"]));
        assert!(parse_key("/").is_err());
    }

    #[test]
    fn transfer_source_comes_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("source.db");
        let config = dir.path().join("cairn.toml");
        fs::write(&config, format!("path = {:?}\n", db.display().to_string())).unwrap();
        let args: Vec<OsString> = vec![
            "cairn".into(),
            "transfer".into(),
            "--site".into(),
            "a.example.com".into(),
            "--to".into(),
            db.clone().into_os_string(),
            "--config".into(),
            config.clone().into_os_string(),
        ];
        let cli = Cli::try_parse_from(args).unwrap();
        let resolved = resolve_config(&cli, None).unwrap();
        assert_eq!(resolved.path, db);
        assert_ne!(cli.db, db);
        assert!(same_store(&resolved.path, &db));
        assert!(!same_store(&resolved.path, &dir.path().join("other.db")));

        // the same file under a different spelling
        fs::write(&db, b"").unwrap();
        assert!(same_store(&db, &dir.path().join(".").join("source.db")));
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["cairn", "keys", "/root/sites", "--db", "x.db"]).unwrap();
        assert_eq!(cli.db, PathBuf::from("x.db"));
        assert!(matches!(cli.command, Command::Keys { ref key } if key == "/root/sites"));
    }
}
