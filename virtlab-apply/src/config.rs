//! Configuration management for virtlab-apply.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use virtlab_common::LogFormat;
use virtlab_hypervisor::reconcile::DEFAULT_MAX_PARALLEL;

use crate::cli::Args;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/virtlab/virtlab.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hypervisor backend configuration
    pub hypervisor: HypervisorConfig,
    /// Reconciliation tuning
    pub reconcile: ReconcileConfig,
    /// Log output
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref uri) = args.libvirt_uri {
            self.hypervisor.libvirt_uri = uri.clone();
        }

        if args.dev {
            self.hypervisor.backend = HypervisorBackend::Mock;
        }

        if let Some(max_parallel) = args.max_parallel {
            self.reconcile.max_parallel = max_parallel;
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if args.log_json {
            self.logging.format = LogFormat::Json;
        }

        self
    }
}

/// Hypervisor backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Backend type
    pub backend: HypervisorBackend,
    /// Libvirt connection URI
    pub libvirt_uri: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            backend: HypervisorBackend::default(),
            libvirt_uri: "qemu:///system".to_string(),
        }
    }
}

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    /// Libvirt/QEMU backend
    #[default]
    Libvirt,
    /// In-memory backend for testing/development
    Mock,
}

/// Reconciliation configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Maximum number of networks/pools reconciled at once
    pub max_parallel: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Libvirt);
        assert_eq!(config.hypervisor.libvirt_uri, "qemu:///system");
        assert_eq!(config.reconcile.max_parallel, 4);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "hypervisor:\n  backend: mock\nlogging:\n  format: json").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
        assert_eq!(config.hypervisor.libvirt_uri, "qemu:///system");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.reconcile.max_parallel, 4);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(dir.path().join("absent.yaml")).is_err());
    }

    #[test]
    fn test_load_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "reconcile:\n  max_parallel: many").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args {
            topology: "lab.yaml".to_string(),
            libvirt_uri: Some("qemu+ssh://lab@host/system".to_string()),
            max_parallel: Some(1),
            log_level: Some("debug".to_string()),
            dev: true,
            ..Args::default()
        };

        let config = Config::default().with_cli_overrides(&args);
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
        assert_eq!(config.hypervisor.libvirt_uri, "qemu+ssh://lab@host/system");
        assert_eq!(config.reconcile.max_parallel, 1);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }
}
