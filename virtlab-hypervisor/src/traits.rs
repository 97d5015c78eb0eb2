//! Hypervisor management client abstraction.

use async_trait::async_trait;

use crate::document;
use crate::error::{HypervisorError, Result};

/// Optional features of a client backend.
#[derive(Debug, Clone)]
pub struct ClientCapabilities {
    /// Name of the backend (e.g. "libvirt", "mock")
    pub name: String,
    /// Supports growing a volume in place
    pub supports_volume_resize: bool,
}

/// Management API of a single hypervisor.
///
/// Definitions are exchanged as libvirt XML documents. Every method is a
/// single call against the management socket; implementations do not retry
/// and do not cache.
///
/// `undefine_domain` must remove the domain definition only; it never
/// touches the domain's disks.
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    // =========================================================================
    // Capabilities & Health
    // =========================================================================

    fn capabilities(&self) -> ClientCapabilities;

    /// Check if the hypervisor connection is healthy.
    async fn health_check(&self) -> Result<bool>;

    // =========================================================================
    // Networks
    // =========================================================================

    /// Names of all persistent networks.
    async fn list_networks(&self) -> Result<Vec<String>>;

    async fn network_definition(&self, name: &str) -> Result<String>;

    /// Define a network, or replace the definition of an existing one.
    async fn define_network(&self, xml: &str) -> Result<()>;

    async fn undefine_network(&self, name: &str) -> Result<()>;

    async fn start_network(&self, name: &str) -> Result<()>;

    async fn stop_network(&self, name: &str) -> Result<()>;

    async fn is_network_active(&self, name: &str) -> Result<bool>;

    // =========================================================================
    // Storage pools
    // =========================================================================

    /// Names of all persistent storage pools.
    async fn list_pools(&self) -> Result<Vec<String>>;

    async fn pool_definition(&self, name: &str) -> Result<String>;

    /// Define a pool, or replace the definition of an existing one.
    async fn define_pool(&self, xml: &str) -> Result<()>;

    async fn undefine_pool(&self, name: &str) -> Result<()>;

    /// Start a pool, building its target first when needed.
    async fn start_pool(&self, name: &str) -> Result<()>;

    async fn stop_pool(&self, name: &str) -> Result<()>;

    async fn is_pool_active(&self, name: &str) -> Result<bool>;

    // =========================================================================
    // Volumes
    // =========================================================================

    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>>;

    async fn volume_definition(&self, pool: &str, name: &str) -> Result<String>;

    async fn create_volume(&self, pool: &str, xml: &str) -> Result<()>;

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()>;

    /// Grow a volume to `capacity_bytes`.
    async fn resize_volume(&self, pool: &str, name: &str, capacity_bytes: u64) -> Result<()> {
        let _ = capacity_bytes;
        Err(HypervisorError::Unsupported(format!(
            "{} does not support resizing volume {}/{}",
            self.capabilities().name,
            pool,
            name
        )))
    }

    // =========================================================================
    // Domains
    // =========================================================================

    /// Names of all persistent domains.
    async fn list_domains(&self) -> Result<Vec<String>>;

    /// Inactive (persistent) definition of a domain.
    async fn domain_definition(&self, name: &str) -> Result<String>;

    /// Definition the domain is running with, or the persistent one when it
    /// is shut off. Backends without a separate running configuration return
    /// the persistent definition.
    async fn running_domain_definition(&self, name: &str) -> Result<String> {
        self.domain_definition(name).await
    }

    async fn define_domain(&self, xml: &str) -> Result<()>;

    /// Remove a domain definition, keeping its disks.
    async fn undefine_domain(&self, name: &str) -> Result<()>;

    async fn start_domain(&self, name: &str) -> Result<()>;

    /// Request a graceful (ACPI) shutdown.
    async fn shutdown_domain(&self, name: &str) -> Result<()>;

    async fn is_domain_active(&self, name: &str) -> Result<bool>;

    // =========================================================================
    // Comparison
    // =========================================================================

    /// Whether a rendered definition is satisfied by a live one.
    fn definitions_match(&self, desired: &str, live: &str) -> bool {
        document::definitions_match(desired, live)
    }
}
