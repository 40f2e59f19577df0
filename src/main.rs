//! # screenflow
//!
//! Screening workflow server binary: loads settings, opens the store and
//! serves the HTTP/WebSocket gateway until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use screenflow_core::ids::PatientId;
use screenflow_engine::{EngineConfig, InMemoryPatientDirectory, PatientDirectory, WorkflowEngine};
use screenflow_server::{ScreenflowServer, ServerConfig, StaticTokenAuthenticator};
use screenflow_settings::{load_settings_from_path, resolve_data_path, settings_path, ScreenflowSettings};
use screenflow_store::Database;
use screenflow_telemetry::{init_telemetry, TelemetryConfig};

/// Collaborative screening-session workflow server.
#[derive(Parser, Debug)]
#[command(name = "screenflow", about = "Screening workflow server")]
struct Cli {
    /// Settings file (defaults to `~/.screenflow/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// SQLite database path, or `:memory:`.
    #[arg(long)]
    db: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut ScreenflowSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(db) = &self.db {
            settings.database.path.clone_from(db);
        }
    }
}

fn open_database(raw: &str) -> Result<Database> {
    if raw == ":memory:" {
        return Database::in_memory().context("failed to open in-memory database");
    }
    let path = resolve_data_path(raw);
    Database::open(&path).with_context(|| format!("failed to open database at {}", path.display()))
}

fn patient_directory(settings: &ScreenflowSettings) -> Arc<dyn PatientDirectory> {
    if settings.patients.allow_unknown {
        return Arc::new(InMemoryPatientDirectory::permissive());
    }
    Arc::new(InMemoryPatientDirectory::new(
        settings.patients.known.iter().map(PatientId::from_raw),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);

    let _telemetry = init_telemetry(TelemetryConfig {
        filter: settings.logging.level.clone(),
        json: settings.logging.json,
        log_to_sqlite: settings.logging.persist_warnings,
        log_db_path: resolve_data_path(&settings.logging.db_path),
    });
    tracing::info!(settings = %path.display(), "starting screenflow");

    let db = open_database(&settings.database.path)?;
    let engine = WorkflowEngine::new(
        db,
        patient_directory(&settings),
        EngineConfig::from(&settings.workflow),
    );
    let auth = StaticTokenAuthenticator::from_grants(&settings.auth.tokens)
        .context("invalid auth token configuration")?;
    if auth.is_empty() {
        tracing::warn!("no auth tokens configured; every request will be rejected");
    }

    let server = ScreenflowServer::new(ServerConfig::from(&settings), engine, Arc::new(auth));
    let handle = server.start().await.context("failed to start server")?;
    tracing::info!(addr = %handle.local_addr(), "screenflow ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    handle.shutdown().await;
    tracing::info!("screenflow stopped");
    Ok(())
}
