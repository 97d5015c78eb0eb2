//! # virtlab apply
//!
//! Reconciles one libvirt host against a declarative lab topology and prints
//! the apply report as JSON on stdout.
//!
//! Exit status:
//! - `0` every resource reconciled
//! - `1` at least one resource failed
//! - `2` the topology was rejected before any change was made
//!
//! ## Usage
//! ```bash
//! virtlab-apply lab.yaml --config /etc/virtlab/virtlab.yaml
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use virtlab_hypervisor::{ApplyOptions, HypervisorClient, MockBackend, ReconcileError, Reconciler};

mod cli;
mod config;
mod topology;

use cli::Args;
use config::{Config, HypervisorBackend, DEFAULT_CONFIG_PATH};

const EXIT_FAILED: u8 = 1;
const EXIT_REJECTED: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration; an explicit path must exist, the default may not
    let (config, source) = match &args.config {
        Some(path) => (Config::load(path)?, Some(path.clone())),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => (
            Config::load(DEFAULT_CONFIG_PATH)?,
            Some(DEFAULT_CONFIG_PATH.to_string()),
        ),
        None => (Config::default(), None),
    };
    let config = config.with_cli_overrides(&args);

    // Initialize logging
    virtlab_common::init_logging_with_format(&config.logging.level, config.logging.format)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting virtlab apply");
    match &source {
        Some(path) => info!(config_path = %path, "Configuration loaded"),
        None => info!("No configuration file found, using defaults"),
    }

    let desired = match topology::desired_state(&args.topology) {
        Ok(desired) => desired,
        Err(e) => {
            error!(error = %e, topology = %args.topology, "Topology rejected");
            print_rejection(&[e])?;
            return Ok(ExitCode::from(EXIT_REJECTED));
        }
    };

    let client = connect(&config).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight calls");
            on_signal.cancel();
        }
    });

    let options = ApplyOptions::default()
        .with_max_parallel(config.reconcile.max_parallel)
        .with_cancel(cancel);
    let reconciler = Reconciler::new(client).with_options(options);

    let report = match reconciler.apply(&desired).await {
        Ok(report) => report,
        Err(ReconcileError::Validation(errors)) => {
            for e in &errors.0 {
                error!(error = %e, "Validation failed");
            }
            let messages: Vec<String> = errors.0.iter().map(ToString::to_string).collect();
            print_rejection(&messages)?;
            return Ok(ExitCode::from(EXIT_REJECTED));
        }
        Err(e @ ReconcileError::Cancelled) => {
            warn!(error = %e, "Apply cancelled");
            return Ok(ExitCode::from(EXIT_FAILED));
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize apply report")?
    );

    if report.success {
        info!("Apply succeeded");
        Ok(ExitCode::SUCCESS)
    } else {
        for failure in report.failures() {
            error!(kind = %failure.kind, name = %failure.name, outcome = ?failure.outcome, "Resource failed");
        }
        Ok(ExitCode::from(EXIT_FAILED))
    }
}

/// Connect the configured hypervisor backend.
async fn connect(config: &Config) -> Result<Arc<dyn HypervisorClient>> {
    let client: Arc<dyn HypervisorClient> = match config.hypervisor.backend {
        HypervisorBackend::Mock => {
            info!("Using mock hypervisor backend (development mode)");
            Arc::new(MockBackend::new())
        }
        HypervisorBackend::Libvirt => {
            #[cfg(feature = "libvirt")]
            {
                let uri = &config.hypervisor.libvirt_uri;
                Arc::new(
                    virtlab_hypervisor::LibvirtBackend::new(uri)
                        .await
                        .with_context(|| format!("Failed to connect to libvirt at {}", uri))?,
                )
            }
            #[cfg(not(feature = "libvirt"))]
            {
                anyhow::bail!("Libvirt backend requested but not compiled in; rebuild with the libvirt feature or pass --dev");
            }
        }
    };

    match client.health_check().await {
        Ok(true) => {
            let caps = client.capabilities();
            info!(
                name = %caps.name,
                volume_resize = caps.supports_volume_resize,
                "Hypervisor connected"
            );
        }
        Ok(false) | Err(_) => warn!("Hypervisor health check failed"),
    }

    Ok(client)
}

/// Report a rejected topology on stdout.
fn print_rejection(errors: &[String]) -> Result<()> {
    let rejection = serde_json::json!({
        "success": false,
        "validation_errors": errors,
    });
    println!("{}", serde_json::to_string_pretty(&rejection)?);
    Ok(())
}
