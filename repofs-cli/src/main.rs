//! Command-line inspector for a `repofs` repository.
//!
//! Thin wrapper over [`repofs::Fs`]: every subcommand opens (or creates)
//! the repository at `--root`, performs one operation, and prints the
//! result. Exit codes: `0` success, `1` usage error, `2` any engine error.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use repofs::{Fs, FsConfig, RepoPath};

#[derive(Parser, Debug)]
#[command(name = "repofs", about = "Inspect and drive a repofs repository", disable_help_subcommand = true)]
struct Cli {
    /// Path to the repository root.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new, empty repository at `--root`.
    Create,
    /// Print the youngest committed revision number.
    YoungestRev,
    /// Print the contents of a file at a given revision.
    Cat {
        #[arg(long, default_value_t = u64::MAX)]
        rev: u64,
        path: String,
    },
    /// List a directory's entries at a given revision.
    Tree {
        #[arg(long, default_value_t = u64::MAX)]
        rev: u64,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Get or set a revision property.
    Revprop {
        #[command(subcommand)]
        action: RevpropAction,
    },
    /// Verify every committed revision's DAG for structural consistency.
    Verify,
    /// Pack any shards eligible for packing.
    Pack,
    /// Copy the repository to a fresh directory via hardlink-or-copy.
    Hotcopy { dest: PathBuf },
    /// Lock a path.
    Lock {
        path: String,
        #[arg(long)]
        owner: String,
        #[arg(long, default_value = "")]
        comment: String,
        #[arg(long)]
        steal: bool,
    },
    /// Release a lock.
    Unlock {
        path: String,
        #[arg(long)]
        token: String,
        #[arg(long)]
        break_lock: bool,
    },
    /// List every non-expired lock at or under a path.
    Locks {
        #[arg(default_value = "/")]
        path: String,
    },
}

#[derive(Subcommand, Debug)]
enum RevpropAction {
    Get { rev: u64, name: String },
    Set { rev: u64, name: String, value: String },
    List { rev: u64 },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::from(0),
        Err(Error::Usage(msg)) => {
            eprintln!("usage error: {msg}");
            ExitCode::from(1)
        }
        Err(Error::Engine(err)) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}

enum Error {
    Usage(String),
    Engine(repofs::FsError),
}

impl From<repofs::FsError> for Error {
    fn from(err: repofs::FsError) -> Self {
        Error::Engine(err)
    }
}

fn parse_path(raw: &str) -> Result<RepoPath, Error> {
    RepoPath::parse(raw).map_err(|e| Error::Usage(format!("bad path {raw:?}: {e}")))
}

fn resolve_rev(fs: &Fs, rev: u64) -> Result<u64, Error> {
    if rev == u64::MAX {
        Ok(fs.youngest_rev()?)
    } else {
        Ok(rev)
    }
}

fn run(cli: &Cli) -> Result<(), Error> {
    match &cli.command {
        Command::Create => {
            Fs::create(&cli.root, FsConfig::default())?;
            println!("created repository at {}", cli.root.display());
            Ok(())
        }
        Command::YoungestRev => {
            let fs = Fs::open(&cli.root, FsConfig::default())?;
            println!("{}", fs.youngest_rev()?);
            Ok(())
        }
        Command::Cat { rev, path } => {
            let fs = Fs::open(&cli.root, FsConfig::default())?;
            let rev = resolve_rev(&fs, *rev)?;
            let path = parse_path(path)?;
            let root = fs.revision_root(rev)?;
            let contents = root.read_file(&path)?;
            std::io::stdout()
                .write_all(&contents)
                .map_err(|e| Error::Engine(repofs::FsError::io(path.to_string(), e)))?;
            Ok(())
        }
        Command::Tree { rev, path } => {
            let fs = Fs::open(&cli.root, FsConfig::default())?;
            let rev = resolve_rev(&fs, *rev)?;
            let path = parse_path(path)?;
            let root = fs.revision_root(rev)?;
            for entry in root.read_dir(&path)? {
                println!("{}\t{}", entry.kind, entry.name.as_str());
            }
            Ok(())
        }
        Command::Revprop { action } => cmd_revprop(cli, action),
        Command::Verify => {
            let fs = Fs::open(&cli.root, FsConfig::default())?;
            fs.verify(&())?;
            println!("ok");
            Ok(())
        }
        Command::Pack => {
            let fs = Fs::open(&cli.root, FsConfig::default())?;
            fs.pack(&())?;
            println!("ok");
            Ok(())
        }
        Command::Hotcopy { dest } => {
            let fs = Fs::open(&cli.root, FsConfig::default())?;
            fs.hotcopy(dest)?;
            println!("copied to {}", dest.display());
            Ok(())
        }
        Command::Lock { path, owner, comment, steal } => {
            let fs = Fs::open(&cli.root, FsConfig::default())?;
            let path = parse_path(path)?;
            let lock = fs.lock_store().lock(
                path.to_string().as_str(),
                generate_lock_token(),
                owner.clone(),
                comment.clone(),
                None,
                *steal,
                chrono::Utc::now(),
            )?;
            println!("{}", lock.token);
            Ok(())
        }
        Command::Unlock { path, token, break_lock } => {
            let fs = Fs::open(&cli.root, FsConfig::default())?;
            let path = parse_path(path)?;
            fs.lock_store().unlock(path.to_string().as_str(), token, *break_lock)?;
            println!("ok");
            Ok(())
        }
        Command::Locks { path } => {
            let fs = Fs::open(&cli.root, FsConfig::default())?;
            let path = parse_path(path)?;
            for lock in fs.lock_store().get_all(path.to_string().as_str(), chrono::Utc::now())? {
                println!("{}\t{}\t{}", lock.path, lock.owner, lock.token);
            }
            Ok(())
        }
    }
}

fn cmd_revprop(cli: &Cli, action: &RevpropAction) -> Result<(), Error> {
    let fs = Fs::open(&cli.root, FsConfig::default())?;
    match action {
        RevpropAction::Get { rev, name } => {
            match fs.revision_prop(*rev, name)? {
                Some(value) => println!("{value}"),
                None => return Err(Error::Usage(format!("no property {name:?} on r{rev}"))),
            }
            Ok(())
        }
        RevpropAction::Set { rev, name, value } => {
            fs.change_rev_prop(*rev, name, Some(value))?;
            Ok(())
        }
        RevpropAction::List { rev } => {
            let props: BTreeMap<String, String> = fs.revision_proplist(*rev)?;
            for (k, v) in props {
                println!("{k}={v}");
            }
            Ok(())
        }
    }
}

/// A lock token is an opaque string the client presents on `unlock`; the
/// engine never parses it, so a process id plus a timestamp is enough to
/// keep tokens from colliding across concurrent CLI invocations.
fn generate_lock_token() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("opaquelocktoken:{:x}-{:x}", std::process::id(), nanos)
}
