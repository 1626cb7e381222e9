//! Biobridge - biometric device gateway
//!
//! Accepts device connections, drives enrollments against the upstream
//! enrollment service, and records their outcomes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use biobridge_core::{EnrollmentRecord, GatewayStatus, IdentityId};
use biobridge_gateway::config::{self, ServeArgs, DEFAULT_CONTROL_ADDR};
use biobridge_gateway::control::{serve_control, ControlClient};
use biobridge_gateway::{
    Gateway, HttpEnrollmentApi, RecordSink, SessionConfig, SqliteRecordSink, TracingRecordSink,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

// ============================================================================
// CLI Definition
// ============================================================================

/// Biobridge - biometric device gateway
#[derive(Parser)]
#[command(name = "biobridge", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default if no command given)
    Serve(ServeArgs),

    /// Show connected devices and upstream session health
    Status {
        /// Control API address
        #[arg(long, default_value = DEFAULT_CONTROL_ADDR)]
        control: String,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Start an enrollment on a connected device
    Enroll {
        /// Connection id (see `biobridge status`)
        connection_id: u64,

        /// External reference for the person being enrolled (e.g. "M-100")
        #[arg(long)]
        external_id: String,

        /// Display name (defaults to the external id)
        #[arg(long)]
        name: Option<String>,

        /// Control API address
        #[arg(long, default_value = DEFAULT_CONTROL_ADDR)]
        control: String,
    },

    /// List stored enrollment records
    Records {
        /// SQLite database path (defaults to the local data directory)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Only records for this upstream identity, oldest first
        #[arg(long)]
        identity: Option<String>,

        /// Maximum number of recent records to show
        #[arg(long, default_value_t = 20)]
        limit: u32,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve(args)) => run_gateway(args).await,
        None => run_gateway(ServeArgs::parse_default()).await,
        Some(Commands::Status { control, json }) => show_status(&control, json).await,
        Some(Commands::Enroll {
            connection_id,
            external_id,
            name,
            control,
        }) => {
            let name = name.unwrap_or_else(|| external_id.clone());
            start_enrollment(&control, connection_id, &name, &external_id).await
        }
        Some(Commands::Records {
            db,
            identity,
            limit,
            json,
        }) => {
            let db = db.unwrap_or_else(config::default_db_path);
            list_records(&db, identity.map(IdentityId::new), limit, json).await
        }
    }
}

// ============================================================================
// Client subcommands
// ============================================================================

async fn show_status(control: &str, json: bool) -> anyhow::Result<()> {
    let client = ControlClient::new(config::parse_addr(control)?);
    let status = client
        .status()
        .await
        .with_context(|| format!("Failed to query gateway at {}", control))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

fn print_status(status: &GatewayStatus) {
    println!("Listening on {}", status.listen_addr);
    println!(
        "Upstream session: {:?}{}",
        status.session.phase,
        status
            .session
            .endpoint
            .as_deref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default()
    );
    if status.session.retry_scheduled {
        println!(
            "  login retry pending ({} consecutive failures)",
            status.session.consecutive_failures
        );
    }

    println!("Connected devices: {}", status.connected_clients);
    for conn in &status.connections {
        let device = conn
            .device_id
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        let enrollment = conn
            .enrollment
            .as_ref()
            .map(|e| match e.failure {
                Some(reason) => format!("{} {} ({})", e.external_id, e.phase, reason.as_str()),
                None => format!("{} {}", e.external_id, e.phase),
            })
            .unwrap_or_else(|| "idle".to_string());
        println!("  #{:<4} {:<22} device {:<12} {}", conn.id, conn.peer, device, enrollment);
    }
}

async fn start_enrollment(
    control: &str,
    connection_id: u64,
    display_name: &str,
    external_id: &str,
) -> anyhow::Result<()> {
    let client = ControlClient::new(config::parse_addr(control)?);
    let view = client
        .start_enrollment(connection_id, display_name, external_id)
        .await
        .with_context(|| format!("Failed to start enrollment on connection {}", connection_id))?;

    match (view.phase.is_terminal(), view.failure) {
        (true, Some(reason)) => {
            anyhow::bail!("Enrollment for {} failed: {}", view.external_id, reason.as_str())
        }
        _ => {
            println!(
                "Enrollment for {} started on device {} (identity {})",
                view.external_id,
                view.device_id,
                view.identity_id
                    .as_ref()
                    .map(|i| i.as_str())
                    .unwrap_or("-")
            );
            Ok(())
        }
    }
}

async fn list_records(
    db_path: &std::path::Path,
    identity: Option<IdentityId>,
    limit: u32,
    json: bool,
) -> anyhow::Result<()> {
    let sink = SqliteRecordSink::open(db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    let records = match &identity {
        Some(identity) => sink
            .for_identity(identity)
            .await
            .with_context(|| format!("Failed to load records for {}", identity))?,
        None => sink.recent(limit).await.context("Failed to load records")?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No records");
    }
    for record in &records {
        print_record(record);
    }
    Ok(())
}

fn print_record(record: &EnrollmentRecord) {
    println!(
        "{}  {:<10} identity {:<12} {:<12} device {:<12} {}",
        record.ts.format("%Y-%m-%d %H:%M:%S"),
        record.outcome.as_str(),
        record.identity_id,
        record.external_id.as_deref().unwrap_or("-"),
        record
            .device_id
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string()),
        record.detail.as_deref().unwrap_or("")
    );
}

// ============================================================================
// Gateway
// ============================================================================

async fn run_gateway(args: ServeArgs) -> anyhow::Result<()> {
    let session = SessionConfig::from_env().context("Invalid upstream configuration")?;
    let no_persist = args.no_persist;
    let db_path = args.db_path();
    let config = args.into_config(session).context("Invalid gateway configuration")?;

    let sink: Arc<dyn RecordSink> = if no_persist {
        tracing::info!("Persistence disabled, logging records only");
        Arc::new(TracingRecordSink)
    } else {
        let sink = SqliteRecordSink::open(&db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
        tracing::info!(path = %db_path.display(), "Record database opened");
        Arc::new(sink)
    };

    let api = HttpEnrollmentApi::new(config.request_timeout).context("Failed to build HTTP client")?;
    let gateway = Gateway::new(config.clone(), Arc::new(api), sink);

    let device_listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind device listener on {}", config.listen_addr))?;
    let control_listener = match config.control_addr {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind control listener on {}", addr))?,
        ),
        None => None,
    };

    tracing::info!(
        listen = %config.listen_addr,
        endpoints = config.session.endpoints.len(),
        "Biobridge gateway starting"
    );

    // Broadcast channel for shutdown (multiple receivers)
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let shutdown_tx_clone = shutdown_tx.clone();
    let signal_task = tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown");
            }
        }

        let _ = shutdown_tx_clone.send(());
    });

    // Log in up front so the first enrollment does not pay for it. Failure
    // here only arms the retry timer.
    let sessions = gateway.sessions().clone();
    tokio::spawn(async move {
        if let Err(e) = sessions.acquire().await {
            tracing::warn!(error = %e, "Initial upstream login failed");
        }
    });

    let control = async {
        match control_listener {
            Some(listener) => serve_control(listener, gateway.clone(), &shutdown_tx).await,
            None => Ok(()),
        }
    };
    let devices = gateway.serve(device_listener, &shutdown_tx);

    let (devices_result, control_result) = tokio::join!(devices, control);
    signal_task.abort();

    devices_result.context("Device listener failed")?;
    control_result.context("Control listener failed")?;

    tracing::info!("Gateway shutdown complete");
    Ok(())
}
