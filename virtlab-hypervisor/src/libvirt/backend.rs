//! Libvirt backend implementation.

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::network::Network;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::sys;

use crate::error::{HypervisorError, ResourceKind, Result};
use crate::traits::{ClientCapabilities, HypervisorClient};

/// Libvirt/QEMU hypervisor backend.
///
/// Every trait method maps to one or two libvirt calls. Listing enumerates
/// persistent resources only; transient ones are never reconciled.
/// Definitions are read back from the persistent configuration, which is
/// what `define_*` replaces even while the object is running.
pub struct LibvirtBackend {
    uri: String,
    connection: Connect,
}

fn query_failed(e: virt::error::Error) -> HypervisorError {
    HypervisorError::QueryFailed(e.to_string())
}

fn not_found(kind: ResourceKind, name: &str, e: virt::error::Error) -> HypervisorError {
    debug!(kind = %kind, name = %name, error = %e, "Lookup failed");
    HypervisorError::NotFound {
        kind,
        name: name.to_string(),
    }
}

impl LibvirtBackend {
    /// Create a new libvirt backend connected to the specified URI.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu+ssh://user@host/system` - Remote via SSH
    pub async fn new(uri: &str) -> Result<Self> {
        info!(uri = %uri, "Connecting to libvirt");

        let connection = Connect::open(Some(uri))
            .map_err(|e| HypervisorError::ConnectionFailed(e.to_string()))?;

        info!("Connected to libvirt");

        Ok(Self {
            uri: uri.to_string(),
            connection,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn network(&self, name: &str) -> Result<Network> {
        Network::lookup_by_name(&self.connection, name)
            .map_err(|e| not_found(ResourceKind::Network, name, e))
    }

    fn pool(&self, name: &str) -> Result<StoragePool> {
        StoragePool::lookup_by_name(&self.connection, name)
            .map_err(|e| not_found(ResourceKind::Pool, name, e))
    }

    fn volume(&self, pool: &str, name: &str) -> Result<StorageVol> {
        let pool = self.pool(pool)?;
        StorageVol::lookup_by_name(&pool, name)
            .map_err(|e| not_found(ResourceKind::Volume, name, e))
    }

    fn domain(&self, name: &str) -> Result<Domain> {
        Domain::lookup_by_name(&self.connection, name)
            .map_err(|e| not_found(ResourceKind::Domain, name, e))
    }
}

#[async_trait]
impl HypervisorClient for LibvirtBackend {
    fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities {
            name: "libvirt".to_string(),
            supports_volume_resize: true,
        }
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<bool> {
        match self.connection.is_alive() {
            Ok(alive) => Ok(alive),
            Err(_) => Ok(false),
        }
    }

    // =========================================================================
    // Networks
    // =========================================================================

    #[instrument(skip(self))]
    async fn list_networks(&self) -> Result<Vec<String>> {
        let networks = self
            .connection
            .list_all_networks(sys::VIR_CONNECT_LIST_NETWORKS_PERSISTENT)
            .map_err(query_failed)?;
        networks
            .iter()
            .map(|n| n.get_name().map_err(query_failed))
            .collect()
    }

    async fn network_definition(&self, name: &str) -> Result<String> {
        self.network(name)?
            .get_xml_desc(sys::VIR_NETWORK_XML_INACTIVE)
            .map_err(query_failed)
    }

    #[instrument(skip(self, xml))]
    async fn define_network(&self, xml: &str) -> Result<()> {
        debug!(xml = %xml, "Defining network");
        Network::define_xml(&self.connection, xml).map_err(|e| HypervisorError::DefineFailed {
            kind: ResourceKind::Network,
            reason: e.to_string(),
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn undefine_network(&self, name: &str) -> Result<()> {
        self.network(name)?
            .undefine()
            .map_err(|e| HypervisorError::UndefineFailed {
                kind: ResourceKind::Network,
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start_network(&self, name: &str) -> Result<()> {
        let network = self.network(name)?;
        let start_failed = |e: virt::error::Error| HypervisorError::StartFailed {
            kind: ResourceKind::Network,
            name: name.to_string(),
            reason: e.to_string(),
        };
        network.create().map_err(start_failed)?;
        network.set_autostart(true).map_err(start_failed)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop_network(&self, name: &str) -> Result<()> {
        self.network(name)?
            .destroy()
            .map_err(|e| HypervisorError::StopFailed {
                kind: ResourceKind::Network,
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn is_network_active(&self, name: &str) -> Result<bool> {
        self.network(name)?.is_active().map_err(query_failed)
    }

    // =========================================================================
    // Storage pools
    // =========================================================================

    #[instrument(skip(self))]
    async fn list_pools(&self) -> Result<Vec<String>> {
        let pools = self
            .connection
            .list_all_storage_pools(sys::VIR_CONNECT_LIST_STORAGE_POOLS_PERSISTENT)
            .map_err(query_failed)?;
        pools
            .iter()
            .map(|p| p.get_name().map_err(query_failed))
            .collect()
    }

    async fn pool_definition(&self, name: &str) -> Result<String> {
        self.pool(name)?
            .get_xml_desc(sys::VIR_STORAGE_XML_INACTIVE)
            .map_err(query_failed)
    }

    #[instrument(skip(self, xml))]
    async fn define_pool(&self, xml: &str) -> Result<()> {
        debug!(xml = %xml, "Defining storage pool");
        StoragePool::define_xml(&self.connection, xml, 0).map_err(|e| {
            HypervisorError::DefineFailed {
                kind: ResourceKind::Pool,
                reason: e.to_string(),
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn undefine_pool(&self, name: &str) -> Result<()> {
        self.pool(name)?
            .undefine()
            .map_err(|e| HypervisorError::UndefineFailed {
                kind: ResourceKind::Pool,
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start_pool(&self, name: &str) -> Result<()> {
        let pool = self.pool(name)?;
        let start_failed = |e: virt::error::Error| HypervisorError::StartFailed {
            kind: ResourceKind::Pool,
            name: name.to_string(),
            reason: e.to_string(),
        };

        // Creates the target directory (or volume group); never wipes data.
        // Fails harmlessly when the target already exists.
        if let Err(e) = pool.build(sys::VIR_STORAGE_POOL_BUILD_NO_OVERWRITE) {
            debug!(pool = %name, error = %e, "Pool build skipped");
        }
        pool.create(0).map_err(start_failed)?;
        pool.set_autostart(true).map_err(start_failed)?;
        info!(pool = %name, "Storage pool started");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop_pool(&self, name: &str) -> Result<()> {
        self.pool(name)?
            .destroy()
            .map_err(|e| HypervisorError::StopFailed {
                kind: ResourceKind::Pool,
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn is_pool_active(&self, name: &str) -> Result<bool> {
        self.pool(name)?.is_active().map_err(query_failed)
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        let pool = self.pool(pool)?;
        pool.refresh(0).map_err(query_failed)?;
        pool.list_volumes().map_err(query_failed)
    }

    async fn volume_definition(&self, pool: &str, name: &str) -> Result<String> {
        self.volume(pool, name)?.get_xml_desc(0).map_err(query_failed)
    }

    #[instrument(skip(self, xml))]
    async fn create_volume(&self, pool: &str, xml: &str) -> Result<()> {
        debug!(xml = %xml, "Creating volume");
        let pool = self.pool(pool)?;
        StorageVol::create_xml(&pool, xml, 0).map_err(|e| HypervisorError::DefineFailed {
            kind: ResourceKind::Volume,
            reason: e.to_string(),
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        self.volume(pool, name)?
            .delete(0)
            .map_err(|e| HypervisorError::UndefineFailed {
                kind: ResourceKind::Volume,
                name: format!("{}/{}", pool, name),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resize_volume(&self, pool: &str, name: &str, capacity_bytes: u64) -> Result<()> {
        self.volume(pool, name)?
            .resize(capacity_bytes, 0)
            .map_err(|e| HypervisorError::Unsupported(format!("resize of {}/{} failed: {}", pool, name, e)))?;
        Ok(())
    }

    // =========================================================================
    // Domains
    // =========================================================================

    #[instrument(skip(self))]
    async fn list_domains(&self) -> Result<Vec<String>> {
        let domains = self
            .connection
            .list_all_domains(sys::VIR_CONNECT_LIST_DOMAINS_PERSISTENT)
            .map_err(query_failed)?;
        domains
            .iter()
            .map(|d| d.get_name().map_err(query_failed))
            .collect()
    }

    async fn domain_definition(&self, name: &str) -> Result<String> {
        self.domain(name)?
            .get_xml_desc(sys::VIR_DOMAIN_XML_INACTIVE)
            .map_err(query_failed)
    }

    async fn running_domain_definition(&self, name: &str) -> Result<String> {
        self.domain(name)?.get_xml_desc(0).map_err(query_failed)
    }

    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> Result<()> {
        debug!(xml = %xml, "Defining domain");
        Domain::define_xml(&self.connection, xml).map_err(|e| HypervisorError::DefineFailed {
            kind: ResourceKind::Domain,
            reason: e.to_string(),
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn undefine_domain(&self, name: &str) -> Result<()> {
        // NVRAM goes with the definition; storage volumes stay
        self.domain(name)?
            .undefine_flags(sys::VIR_DOMAIN_UNDEFINE_NVRAM)
            .map_err(|e| HypervisorError::UndefineFailed {
                kind: ResourceKind::Domain,
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start_domain(&self, name: &str) -> Result<()> {
        self.domain(name)?
            .create()
            .map_err(|e| HypervisorError::StartFailed {
                kind: ResourceKind::Domain,
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn shutdown_domain(&self, name: &str) -> Result<()> {
        // Send ACPI shutdown
        self.domain(name)?
            .shutdown()
            .map_err(|e| HypervisorError::StopFailed {
                kind: ResourceKind::Domain,
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn is_domain_active(&self, name: &str) -> Result<bool> {
        self.domain(name)?.is_active().map_err(query_failed)
    }
}
