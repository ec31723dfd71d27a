use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use foreman_config::{ConfigLoader, FabricConfig, LoggingConfig, WarningSeverity};
use foreman_core::{Embodiment, FabricError, Result};

mod audit;
mod inspect;
mod scan;

/// Foreman Memory Fabric — tiered, multi-tenant memory for cooperating embodiments
#[derive(Parser)]
#[command(name = "foreman", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to fabric.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current configuration (key material redacted)
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Audit configuration for problems
    Doctor,
    /// Print the embodiment privilege matrix
    Privileges {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show governance audit log entries, newest first
    Audit {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        /// Filter by category (boundary_violation, sync_event, arc_decision, security_event, memory_operation)
        #[arg(long)]
        category: Option<String>,

        /// Filter by event type (e.g. ltm_deletion_approved)
        #[arg(short = 't', long)]
        event_type: Option<String>,

        /// Filter by entry id
        #[arg(short, long)]
        entry: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Verify the checksum chain instead of listing entries
        #[arg(long)]
        verify: bool,
    },
    /// Show hosted instances, entry counts and sync health
    Status {
        /// Only this embodiment
        #[arg(short, long)]
        embodiment: Option<Embodiment>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Scan a JSON payload for secrets ("-" reads stdin)
    Scan {
        /// JSON file to scan
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show version and build info
    Version,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // Resolve log level: --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(&config.logging.level)
        };
        init_tracing(&config.logging, log_level)?;
        debug!(config = %config_loader.path().display(), "config loaded");

        match self.command {
            Commands::Config { json } => cmd_config(&config, json),
            Commands::Doctor => cmd_doctor(&config, &config_loader),
            Commands::Privileges { json } => inspect::cmd_privileges(json),
            Commands::Audit {
                limit,
                category,
                event_type,
                entry,
                json,
                verify,
            } => {
                let query = audit::AuditQuery {
                    limit,
                    category,
                    event_type,
                    entry,
                };
                if verify {
                    audit::cmd_verify(&config)
                } else {
                    audit::cmd_audit(&config, query, json)
                }
            }
            Commands::Status { embodiment, json } => inspect::cmd_status(config, embodiment, json).await,
            Commands::Scan { file, json } => scan::cmd_scan(&config, &file, json),
            Commands::Version => cmd_version(),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
fn init_tracing(logging: &LoggingConfig, level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    // Logs go to stderr (or a file) so command output stays pipeable.
    let (writer, ansi) = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    match logging.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .json()
            .with_target(true)
            .init(),
        "compact" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(ansi)
            .compact()
            .with_target(false)
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(false)
            .init(),
    }
    Ok(())
}

fn cmd_config(config: &FabricConfig, json: bool) -> Result<()> {
    let redacted = config.redacted();
    if json {
        println!("{}", serde_json::to_string_pretty(&redacted)?);
    } else {
        println!(
            "{}",
            toml::to_string_pretty(&redacted).map_err(|e| FabricError::Config(e.to_string()))?
        );
    }
    Ok(())
}

fn cmd_doctor(config: &FabricConfig, loader: &ConfigLoader) -> Result<()> {
    println!("🩺 Foreman Doctor — Configuration Audit");
    println!("   config: {}", loader.path().display());
    println!();

    // Run structured validation
    let warnings = match config.validate() {
        Ok(w) => w,
        Err(e) => {
            println!("{e}");
            return Ok(());
        }
    };

    let mut warn_count = 0;
    let mut info_count = 0;
    for w in &warnings {
        println!("  {w}");
        match w.severity {
            WarningSeverity::Warning => warn_count += 1,
            WarningSeverity::Info => info_count += 1,
            WarningSeverity::Error => {}
        }
    }

    // Checks that need more than one section at a time
    let mut ok_count = 0;
    for instance in config.effective_instances() {
        let Some(tenant) = &instance.tenant else {
            continue;
        };
        if config.encryption.tenant_keys.contains_key(tenant) {
            ok_count += 1;
        } else {
            println!(
                "  ⚠️  instances.{}: no key in [encryption.tenant_keys] for '{tenant}'\n   ↳ LTM writes for this tenant will be rejected",
                instance.instance_id()
            );
            warn_count += 1;
        }
    }
    if !config
        .effective_instances()
        .iter()
        .any(|i| i.embodiment == Embodiment::IsmsRuntime && i.tenant.is_some())
    {
        println!("  💡 instances: no isms_runtime instance serves a tenant — LTM is unavailable");
        info_count += 1;
    }
    if config.storage.is_in_memory() {
        println!("  💡 storage.db_path: ':memory:' — nothing is persisted");
        info_count += 1;
    } else {
        ok_count += 1;
    }

    println!();
    println!("  ✅ {ok_count} checks passed, ⚠️  {warn_count} warnings, 💡 {info_count} suggestions");
    Ok(())
}

fn cmd_version() -> Result<()> {
    println!("Foreman Memory Fabric v{}", env!("CARGO_PKG_VERSION"));
    println!("   Rust edition: 2024");
    println!("   Target: {}", std::env::consts::ARCH);
    println!("   OS: {}", std::env::consts::OS);
    #[cfg(debug_assertions)]
    println!("   Profile: debug");
    #[cfg(not(debug_assertions))]
    println!("   Profile: release");
    Ok(())
}

/// Truncate a string to `max` characters, appending "..." if truncated.
fn truncate_output(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ");
    match flat.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}
