use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::Level;

use actiontrail_engine::settings::apply_env_overrides;
use actiontrail_engine::{load_settings_from_path, Agent, AgentSettings};
use actiontrail_store::{Database, SqliteActionStore};
use actiontrail_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

mod demo;

/// Demo service: a users API whose mutations are recorded as audit actions.
#[derive(Debug, Parser)]
#[command(name = "actiontrail", version)]
struct Args {
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Users database. In-memory when omitted.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Store actions in this SQLite file instead of posting to the collector.
    #[arg(long)]
    audit_db: Option<PathBuf>,

    /// JSON agent settings; `ACTIONTRAIL_*` variables override it.
    #[arg(long)]
    settings: Option<PathBuf>,

    #[arg(long, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: args.log_level,
        module_levels: Vec::new(),
        format: args.log_format,
    });

    let mut settings = match &args.settings {
        Some(path) => load_settings_from_path(path).with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut settings = AgentSettings::default();
            apply_env_overrides(&mut settings);
            settings
        }
    };

    let audit = match &args.audit_db {
        Some(path) => Some(SqliteActionStore::new(
            Database::open(path).context("opening audit database")?,
        )),
        None => None,
    };
    if audit.is_some() && settings.application_id.is_empty() {
        settings.application_id = "actiontrail-demo".into();
    }

    let mut builder = Agent::builder(settings);
    if let Some(store) = &audit {
        builder = builder.store(Arc::new(store.clone()));
    }
    let agent = builder.build().context("configuring agent")?;

    let users = demo::UsersDb::open(args.db.as_deref()).context("opening users database")?;
    let app = demo::router(&agent, users, audit);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(port = args.port, application_id = agent.application_id(), "demo service ready");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving")?;

    tracing::info!("shutting down");
    agent.shutdown().await;
    Ok(())
}
