use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use idmef_manager::audit::{AuditEntry, AuditEventType, AuditLog};
use idmef_manager::cert::generate_self_signed_cert;
use idmef_manager::config::ManagerConfig;
use idmef_manager::identity::Identity;
use idmef_manager::permissions::{Permission, PermissionSet};
use idmef_manager::spool::Spool;

#[derive(Parser)]
#[command(
    name = "idmef-manager",
    about = "Intrusion-detection event manager: sensor-facing collector and failover-aware reporting fan-out",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the manager's TOML config file. Falls back to
    /// IDMEF_MANAGER_CONFIG, then /etc/idmef-manager/config.toml, then
    /// compiled-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the manager (default if no subcommand is given)
    Serve,

    /// Load and validate the configuration without starting the manager
    CheckConfig,

    /// Mint a self-signed identity certificate for a sensor or peer manager
    GenCert {
        /// Analyzer id to embed in the certificate's subjectAltName
        #[arg(long)]
        analyzer_id: u64,

        /// Permission flags to grant, e.g. --perm idmef-write --perm idmef-read
        #[arg(long = "perm", value_name = "FLAG")]
        perms: Vec<String>,

        /// Path to write the ed25519 identity key to (generated if absent)
        #[arg(long, default_value = "identity.ed25519")]
        out_key: PathBuf,

        /// Path to write the DER-encoded certificate to
        #[arg(long, default_value = "cert.der")]
        out_cert: PathBuf,
    },

    /// Report the on-disk failover spool state for every configured sink
    SpoolStatus,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    init_logging(&config);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            tracing::info!(
                analyzer_id = config.identity.analyzer_id,
                "starting idmef-manager"
            );
            idmef_manager::run(config).await
        }
        Commands::CheckConfig => {
            println!("configuration is valid");
            println!("  analyzer id: {}", config.identity.analyzer_id);
            println!("  tcp listeners: {:?}", config.listen.tcp_addrs);
            if let Some(unix) = &config.listen.unix_path {
                println!("  unix listener: {}", unix.display());
            }
            println!("  sinks: {}", config.sinks.len());
            Ok(())
        }
        Commands::GenCert {
            analyzer_id,
            perms,
            out_key,
            out_cert,
        } => gen_cert(&config, analyzer_id, &perms, &out_key, &out_cert).await,
        Commands::SpoolStatus => spool_status(&config).await,
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<ManagerConfig> {
    match path {
        Some(path) => ManagerConfig::load(path).context("failed to load configuration"),
        None => ManagerConfig::load_or_default().context("failed to load configuration"),
    }
}

fn init_logging(config: &ManagerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn gen_cert(
    config: &ManagerConfig,
    analyzer_id: u64,
    perm_flags: &[String],
    out_key: &std::path::Path,
    out_cert: &std::path::Path,
) -> Result<()> {
    let mut permissions = PermissionSet::new();
    for flag in perm_flags {
        let perm = Permission::from_flag(flag)
            .with_context(|| format!("unrecognized permission flag: {flag}"))?;
        permissions.insert(perm);
    }
    let perm_display = permissions
        .iter()
        .map(|p| p.as_flag())
        .collect::<Vec<_>>()
        .join(", ");

    let identity =
        Identity::load_or_generate(out_key).context("failed to load or generate identity key")?;
    let (cert_der, key_der) = generate_self_signed_cert(&identity, analyzer_id, &permissions)
        .context("failed to generate certificate")?;

    std::fs::write(out_cert, &cert_der)
        .with_context(|| format!("failed to write {}", out_cert.display()))?;
    std::fs::write(out_key, &key_der)
        .with_context(|| format!("failed to write {}", out_key.display()))?;

    let audit = AuditLog::open(config.spool.directory.join("audit.jsonl"))
        .await
        .context("failed to open audit log")?;
    audit
        .log(
            AuditEntry::new(AuditEventType::CredentialIssued)
                .with_analyzer_id(analyzer_id)
                .with_reason(format!("perms={perm_flags:?}")),
        )
        .await;

    println!("wrote certificate to {}", out_cert.display());
    println!("wrote identity key to {}", out_key.display());
    println!("analyzer id: {analyzer_id}");
    println!("permissions: {perm_display}");
    Ok(())
}

async fn spool_status(config: &ManagerConfig) -> Result<()> {
    if config.sinks.is_empty() {
        println!("no sinks configured");
        return Ok(());
    }

    println!("{:<20} | {:<15} | {:<10} | Deleted", "Sink", "Instance", "Available");
    println!("{:-<20}-|-{:-<15}-|-{:-<10}-|-{:-<7}", "", "", "", "");

    for sink in &config.sinks {
        let path = Spool::path_for(&config.spool.directory, &sink.name, &sink.instance);
        let quota = config.quota_for(&sink.name, &sink.instance);
        let spool = Spool::open(path, quota)
            .await
            .with_context(|| format!("failed to open spool for {}[{}]", sink.name, sink.instance))?;

        // deleted_count is persisted alongside the spooled records, so a
        // fresh open here reads the true lifetime eviction count rather
        // than restarting it at zero.
        println!(
            "{:<20} | {:<15} | {:<10} | {}",
            sink.name,
            sink.instance,
            spool.available_count().await,
            spool.deleted_count().await
        );
    }

    Ok(())
}
