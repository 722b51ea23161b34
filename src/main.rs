use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use snapvault::auth::kdf::{generate_salt, Argon2idKdf, KdfParams, KeyDerivation};
use snapvault::config::{
    NodeConfig, RemoteConfig, SecretConfig, StoreConfig, StoreKind, DEFAULT_CONFIG_PATH,
};
use snapvault::lineage::{AuditLog, LineageFile, LineageTracker, TransferRecord};
use snapvault::logging::{init_logging, LogFormat};
use snapvault::server::shutdown_signal;
use snapvault::snapshot::{parse_timestamp, SnapshotRef};
use snapvault::streaming::{SessionOutcome, ShutdownSignal};
use snapvault::sync::{plan_jobs, run_cycle, CycleReport, Endpoint, Initiator};

#[derive(Parser, Debug)]
#[command(name = "snapvault", version, about = "Encrypted snapshot backup between peers")]
struct Cli {
    /// Node configuration file
    #[arg(short, long, global = true, env = "SNAPVAULT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a new node configuration
    Init {
        node_name: String,

        /// Where local captures live
        #[arg(long)]
        snapshot_dir: PathBuf,

        /// Where backups received from other nodes are kept
        #[arg(long)]
        backup_dir: PathBuf,

        /// Use btrfs subvolumes under this mountpoint (default: plain directories)
        #[arg(long, value_name = "MOUNTPOINT")]
        btrfs: Option<PathBuf>,

        /// Address the daemon listens on
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Directory for lineage and transfer logs
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Replace an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Mark a subvolume as owned by this node
    Track { subvolume: String },

    /// Stop owning a subvolume; pushes and pull grants naming it are dropped
    Untrack { subvolume: String },

    /// Add a remote to push to or pull from, or change its transfers
    AddRemote {
        name: String,

        /// `host` or `host:port`
        #[arg(long)]
        address: Option<String>,

        /// Own subvolumes to push
        #[arg(long)]
        push: Vec<String>,

        /// Volumes of the remote to pull, as host/subvolume
        #[arg(long)]
        pull: Vec<String>,

        /// Salt shared with the remote, for a new remote (hex)
        #[arg(long)]
        salt: Option<String>,
    },

    /// Stop initiating transfers with a remote, keeping its grants
    RmRemote { name: String },

    /// Set what a remote may do here, replacing earlier grants
    Grant {
        name: String,

        /// Subvolumes of the remote it may push here
        #[arg(long)]
        push: Vec<String>,

        /// Own subvolumes it may pull
        #[arg(long)]
        pull: Vec<String>,

        /// Allow it to recover its backups
        #[arg(long)]
        recover: bool,

        /// Salt shared with the remote, for a new remote (hex)
        #[arg(long)]
        salt: Option<String>,
    },

    /// Forget a remote entirely, including its secret
    Revoke { name: String },

    /// Derive a shared key from a passphrase (prompted on stdin)
    DeriveKey {
        /// Reuse the salt printed on the other peer (hex)
        #[arg(long)]
        salt: Option<String>,
    },

    /// Capture read-only snapshots of owned subvolumes
    Snapshot {
        /// Subvolumes to capture (default: all configured)
        subvolumes: Vec<String>,
    },

    /// Run all configured pushes and pulls
    Backup {
        /// Only these remotes
        #[arg(long = "remote")]
        remotes: Vec<String>,

        /// Only these subvolumes
        #[arg(long = "subvol")]
        subvolumes: Vec<String>,

        /// Ignore recorded lineage and send full captures
        #[arg(long)]
        full: bool,
    },

    /// Inspect or reset lineage records
    Lineage {
        #[command(subcommand)]
        command: LineageCommand,
    },

    /// Show recent transfer attempts
    Transfers {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Fetch back a backup of an own snapshot from a remote
    Recover {
        remote: String,
        subvolume: String,
        /// Capture timestamp, YYYYMMDDHHMMSS
        timestamp: String,
    },
}

#[derive(Subcommand, Debug)]
enum LineageCommand {
    /// List every lineage record
    List,

    /// Forget a record so the next transfer is full
    Reset {
        subvolume: String,
        remote: String,

        /// Reset a record of the daemon's served pulls (daemon must be stopped)
        #[arg(long)]
        served: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_logging(cli.verbose, format)?;

    match cli.command {
        Command::Init {
            node_name,
            snapshot_dir,
            backup_dir,
            btrfs,
            bind,
            state_dir,
            force,
        } => {
            let store = StoreConfig {
                kind: if btrfs.is_some() {
                    StoreKind::Btrfs
                } else {
                    StoreKind::Dir
                },
                mountpoint: btrfs,
                snapshot_dir,
                backup_dir,
            };
            let mut config = NodeConfig::new(node_name, store);
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if let Some(state_dir) = state_dir {
                config.state_dir = state_dir;
            }
            init(&cli.config, &config, force)
        }
        Command::Track { subvolume } => edit(&cli.config, |config| {
            Ok(if config.track(&subvolume) {
                format!("Tracking {}", subvolume)
            } else {
                format!("{} was already tracked", subvolume)
            })
        }),
        Command::Untrack { subvolume } => edit(&cli.config, |config| {
            Ok(if config.untrack(&subvolume) {
                format!("No longer tracking {}", subvolume)
            } else {
                format!("{} was not tracked", subvolume)
            })
        }),
        Command::AddRemote {
            name,
            address,
            push,
            pull,
            salt,
        } => edit(&cli.config, |config| {
            let remote = remote_entry(config, &name, salt.as_deref())?;
            if address.is_some() {
                remote.address = address;
            }
            remote.push = push;
            remote.pull = pull;
            Ok(format!("Updated transfers with {}", name))
        }),
        Command::RmRemote { name } => edit(&cli.config, |config| {
            let remote = config
                .remote_mut(&name)
                .with_context(|| format!("Unknown remote {}", name))?;
            remote.clear_transfers();
            Ok(format!("No transfers with {} any more", name))
        }),
        Command::Grant {
            name,
            push,
            pull,
            recover,
            salt,
        } => edit(&cli.config, |config| {
            let remote = remote_entry(config, &name, salt.as_deref())?;
            remote.accept_push = push;
            remote.allow_pull = pull;
            remote.allow_recover = recover;
            Ok(format!("Updated grants for {}", name))
        }),
        Command::Revoke { name } => edit(&cli.config, |config| {
            config
                .remove_remote(&name)
                .with_context(|| format!("Unknown remote {}", name))?;
            Ok(format!("Revoked {}", name))
        }),
        Command::DeriveKey { salt } => derive_key(salt.as_deref()),
        Command::Snapshot { subvolumes } => snapshot(&load(&cli.config)?, subvolumes).await,
        Command::Backup {
            remotes,
            subvolumes,
            full,
        } => backup(&load(&cli.config)?, &remotes, &subvolumes, full).await,
        Command::Lineage { command } => lineage(&load(&cli.config)?, command).await,
        Command::Transfers { limit } => transfers(&load(&cli.config)?, limit),
        Command::Recover {
            remote,
            subvolume,
            timestamp,
        } => recover(&load(&cli.config)?, &remote, &subvolume, &timestamp).await,
    }
}

fn load(path: &Path) -> Result<NodeConfig> {
    NodeConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Load, change and save the configuration, printing what changed.
fn edit<F>(path: &Path, change: F) -> Result<ExitCode>
where
    F: FnOnce(&mut NodeConfig) -> Result<String>,
{
    let mut config = load(path)?;
    let message = change(&mut config)?;
    config
        .save(path)
        .with_context(|| format!("Failed to save {}", path.display()))?;
    println!("{}", message);
    Ok(ExitCode::SUCCESS)
}

/// The named remote, created with a freshly derived secret if unknown.
fn remote_entry<'a>(
    config: &'a mut NodeConfig,
    name: &str,
    salt: Option<&str>,
) -> Result<&'a mut RemoteConfig> {
    if config.remote(name).is_none() {
        let (salt, key) = derive_secret(config.kdf, salt)?;
        config
            .remotes
            .push(RemoteConfig::new(name, SecretConfig::Key { salt, key }));
    }
    config
        .remote_mut(name)
        .with_context(|| format!("Unknown remote {}", name))
}

fn read_passphrase() -> Result<String> {
    eprint!("Passphrase: ");
    io::stderr().flush()?;
    let mut passphrase = String::new();
    io::stdin().lock().read_line(&mut passphrase)?;
    let passphrase = passphrase.trim_end_matches(['\r', '\n']);
    if passphrase.is_empty() {
        anyhow::bail!("Empty passphrase");
    }
    Ok(passphrase.to_string())
}

/// Prompt for the passphrase shared with a remote and stretch it.
/// Returns the hex salt and key.
fn derive_secret(params: KdfParams, salt: Option<&str>) -> Result<(String, String)> {
    let salt = match salt {
        Some(hex_salt) => hex::decode(hex_salt).context("Salt must be hex")?,
        None => generate_salt().to_vec(),
    };
    let passphrase = read_passphrase()?;
    let key = Argon2idKdf::new(params).derive(passphrase.as_bytes(), &salt)?;
    Ok((hex::encode(&salt), key.to_hex()))
}

// ====== Commands ======

fn init(path: &Path, config: &NodeConfig, force: bool) -> Result<ExitCode> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to replace it)", path.display());
    }
    config
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("{} {}", "initialized".green(), path.display());
    Ok(ExitCode::SUCCESS)
}

fn derive_key(salt: Option<&str>) -> Result<ExitCode> {
    let (salt, key) = derive_secret(KdfParams::default(), salt)?;
    println!("secret = {{ salt = \"{}\", key = \"{}\" }}", salt, key);
    Ok(ExitCode::SUCCESS)
}

async fn snapshot(config: &NodeConfig, subvolumes: Vec<String>) -> Result<ExitCode> {
    let store = config.open_store()?;
    let subvolumes = if subvolumes.is_empty() {
        config.subvolumes.clone()
    } else {
        subvolumes
    };

    let mut failed = false;
    for subvolume in &subvolumes {
        if !config.subvolumes.contains(subvolume) {
            eprintln!("{} {} is not a configured subvolume", "error:".red(), subvolume);
            failed = true;
            continue;
        }
        match store.capture(subvolume).await {
            Ok(snapshot) => println!("{} {}", "captured".green(), snapshot),
            Err(e) => {
                eprintln!("{} {}: {:#}", "error:".red(), subvolume, e);
                failed = true;
            }
        }
    }
    Ok(exit_code(!failed))
}

async fn backup(
    config: &NodeConfig,
    remotes: &[String],
    subvolumes: &[String],
    full: bool,
) -> Result<ExitCode> {
    let jobs = plan_jobs(config, remotes, subvolumes, full)?;
    if jobs.is_empty() {
        println!("Nothing to do");
        return Ok(ExitCode::SUCCESS);
    }

    let (trigger, shutdown) = ShutdownSignal::new();
    let ctx = config.session_context(&config.initiator_state_dir(), shutdown)?;
    let initiator = Initiator::new(ctx, config.timeouts.connect());
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = trigger.send(true);
    });

    let report = run_cycle(&initiator, jobs).await;
    print_report(&config.node_name, &report);
    Ok(exit_code(report.is_success()))
}

fn print_report(node: &str, report: &CycleReport) {
    for job in &report.jobs {
        let what = format!(
            "{:<5} {} -> {}",
            job.job.intent.direction().as_str(),
            job.job.volume_label(node),
            job.job.remote.name
        );
        match &job.result {
            Ok(SessionOutcome::Completed {
                snapshot,
                bytes,
                transfers,
                ..
            }) => println!(
                "{} {} ({}, {} capture(s), {} bytes)",
                "ok".green(),
                what,
                snapshot,
                transfers,
                bytes
            ),
            Ok(SessionOutcome::UpToDate { .. }) => {
                println!("{} {} (up to date)", "ok".green(), what)
            }
            Err(e) => println!("{} {}: {}", "FAILED".red().bold(), what, e),
        }
    }
    if report.panicked > 0 {
        println!("{} {} job(s) crashed", "FAILED".red().bold(), report.panicked);
    }
    println!(
        "{} completed, {} up to date, {} failed",
        report.completed(),
        report.up_to_date(),
        report.failed()
    );
}

async fn lineage(config: &NodeConfig, command: LineageCommand) -> Result<ExitCode> {
    match command {
        LineageCommand::List => {
            for (label, dir) in [
                ("initiated", config.initiator_state_dir()),
                ("served", config.responder_state_dir()),
            ] {
                let mut entries: Vec<_> = LineageFile::load(&dir)?.into_iter().collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                for (key, snapshot) in entries {
                    println!(
                        "{:<9} {:<16} {:<16} {}",
                        label.dimmed(),
                        key.subvolume,
                        key.remote,
                        snapshot
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        LineageCommand::Reset {
            subvolume,
            remote,
            served,
        } => {
            let dir = if served {
                config.responder_state_dir()
            } else {
                config.initiator_state_dir()
            };
            let tracker = LineageTracker::open(&dir)?;
            match tracker.reset(&subvolume, &remote).await? {
                Some(previous) => println!("Forgot ({}, {}) -> {}", subvolume, remote, previous),
                None => println!("No record for ({}, {})", subvolume, remote),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn transfers(config: &NodeConfig, limit: usize) -> Result<ExitCode> {
    let mut records: Vec<TransferRecord> = Vec::new();
    for dir in [config.initiator_state_dir(), config.responder_state_dir()] {
        records.extend(AuditLog::new(&dir).recent(limit)?);
    }
    records.sort_by_key(|r| r.started);
    let skip = records.len().saturating_sub(limit);

    for record in records.iter().skip(skip) {
        let outcome = match record.outcome().as_str() {
            "succeeded" => "succeeded".green(),
            other => other.red(),
        };
        println!(
            "{} {} {:<5} {:<11} {} -> {} {} bytes {}",
            record.started.format("%Y-%m-%d %H:%M:%S"),
            record.id.dimmed(),
            record.direction.as_str(),
            record.mode.as_str(),
            record.snapshot,
            record.remote,
            record.bytes,
            outcome
        );
        if let Some(error) = &record.error {
            println!("    {}", error.dimmed());
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn recover(
    config: &NodeConfig,
    remote: &str,
    subvolume: &str,
    timestamp: &str,
) -> Result<ExitCode> {
    let remote_config = config
        .remote(remote)
        .with_context(|| format!("Unknown remote {}", remote))?;
    let address = remote_config
        .address
        .clone()
        .with_context(|| format!("Remote {} has no address", remote))?;
    let snapshot = SnapshotRef::new(
        config.node_name.clone(),
        subvolume,
        parse_timestamp(timestamp)?,
    );

    let (trigger, shutdown) = ShutdownSignal::new();
    let ctx = config.session_context(&config.initiator_state_dir(), shutdown)?;
    let initiator = Initiator::new(ctx, config.timeouts.connect());
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = trigger.send(true);
    });

    match initiator
        .recover(&Endpoint::new(remote, address), &snapshot)
        .await?
    {
        SessionOutcome::Completed {
            bytes, transfers, ..
        } => println!(
            "{} {} ({} capture(s), {} bytes)",
            "recovered".green(),
            snapshot,
            transfers,
            bytes
        ),
        SessionOutcome::UpToDate { .. } => println!("{} already exists locally", snapshot),
    }
    Ok(ExitCode::SUCCESS)
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
