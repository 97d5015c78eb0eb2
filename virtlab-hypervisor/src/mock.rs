//! Mock hypervisor backend for testing and development.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::document::Document;
use crate::error::{HypervisorError, ResourceKind, Result};
use crate::traits::{ClientCapabilities, HypervisorClient};

/// Operation recorded by the [`MockBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    ListNetworks,
    NetworkDefinition,
    DefineNetwork,
    UndefineNetwork,
    StartNetwork,
    StopNetwork,
    IsNetworkActive,
    ListPools,
    PoolDefinition,
    DefinePool,
    UndefinePool,
    StartPool,
    StopPool,
    IsPoolActive,
    ListVolumes,
    VolumeDefinition,
    CreateVolume,
    DeleteVolume,
    ResizeVolume,
    ListDomains,
    DomainDefinition,
    RunningDomainDefinition,
    DefineDomain,
    UndefineDomain,
    StartDomain,
    ShutdownDomain,
    IsDomainActive,
}

impl MockOp {
    /// Whether the operation changes hypervisor state.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            MockOp::ListNetworks
                | MockOp::NetworkDefinition
                | MockOp::IsNetworkActive
                | MockOp::ListPools
                | MockOp::PoolDefinition
                | MockOp::IsPoolActive
                | MockOp::ListVolumes
                | MockOp::VolumeDefinition
                | MockOp::ListDomains
                | MockOp::DomainDefinition
                | MockOp::RunningDomainDefinition
                | MockOp::IsDomainActive
        )
    }
}

/// A call made against the [`MockBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    /// Resource name, `pool/volume` for volumes, empty for listings
    pub target: String,
}

/// Mock hypervisor backend for testing.
///
/// Keeps definitions in memory and records every call. Useful for:
/// - Unit and integration testing of the reconciler
/// - Dry runs without libvirt installed
///
/// Behaves like libvirt where the reconciler depends on it:
/// - volume definitions are echoed back with the extra elements libvirt adds
///   (key, allocation, path)
/// - domain interfaces defined without a MAC get a fresh random one
/// - an active object keeps running with the definition it was started with;
///   redefining it only replaces the persistent definition
pub struct MockBackend {
    state: RwLock<MockState>,
    calls: RwLock<Vec<MockCall>>,
    failures: RwLock<HashSet<(MockOp, String)>>,
    cancel_triggers: RwLock<Vec<(MockOp, String, CancellationToken)>>,
    supports_volume_resize: bool,
}

#[derive(Default)]
struct MockState {
    networks: BTreeMap<String, MockObject>,
    pools: BTreeMap<String, MockPool>,
    domains: BTreeMap<String, MockObject>,
}

struct MockObject {
    /// Persistent definition
    xml: String,
    uuid: Option<String>,
    active: bool,
    /// Definition at start time, while active
    running: Option<String>,
}

impl MockObject {
    fn new(xml: &str, uuid: Option<String>) -> Self {
        Self {
            xml: xml.to_string(),
            uuid,
            active: false,
            running: None,
        }
    }

    fn set_active(&mut self, active: bool) {
        self.active = active;
        self.running = active.then(|| self.xml.clone());
    }
}

struct MockPool {
    object: MockObject,
    target: String,
    volumes: BTreeMap<String, MockVolume>,
}

struct MockVolume {
    capacity_bytes: u64,
    format: Option<String>,
}

/// Name and UUID of a definition.
fn identity(kind: ResourceKind, xml: &str) -> Result<(Document, String, Option<String>)> {
    let doc = Document::parse(xml)?;
    let name = doc
        .name()
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or_else(|| HypervisorError::DefineFailed {
            kind,
            reason: "definition has no name".to_string(),
        })?;
    let uuid = doc.root().child("uuid").map(|u| u.text.to_lowercase());
    Ok((doc, name, uuid))
}

fn not_found(kind: ResourceKind, name: &str) -> HypervisorError {
    HypervisorError::NotFound {
        kind,
        name: name.to_string(),
    }
}

/// Insert or replace a definition the way libvirt does: same name must keep
/// the same UUID, and replacing keeps the active state.
fn upsert(
    objects: &mut BTreeMap<String, MockObject>,
    kind: ResourceKind,
    name: String,
    uuid: Option<String>,
    xml: &str,
) -> Result<()> {
    if let Some(existing) = objects.get_mut(&name) {
        if let (Some(old), Some(new)) = (&existing.uuid, &uuid) {
            if old != new {
                return Err(HypervisorError::Conflict {
                    kind,
                    name,
                    reason: format!("already exists with uuid {}", old),
                });
            }
        }
        existing.xml = xml.to_string();
        return Ok(());
    }

    if let Some(uuid) = &uuid {
        if let Some((other, _)) = objects.iter().find(|(_, o)| o.uuid.as_ref() == Some(uuid)) {
            return Err(HypervisorError::Conflict {
                kind,
                name,
                reason: format!("uuid {} already used by {}", uuid, other),
            });
        }
    }

    objects.insert(name, MockObject::new(xml, uuid));
    Ok(())
}

fn random_mac() -> String {
    let id = Uuid::new_v4();
    let bytes = id.as_bytes();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

/// Give every interface defined without a `<mac>` a random address.
fn assign_macs(xml: &str) -> String {
    let mut out = String::with_capacity(xml.len());
    let mut rest = xml;

    while let Some(start) = rest.find("<interface") {
        let Some(len) = rest[start..].find('>') else {
            break;
        };
        let open_end = start + len + 1;
        let self_closing = rest[..open_end].ends_with("/>");
        out.push_str(&rest[..open_end]);
        rest = &rest[open_end..];
        if self_closing {
            continue;
        }

        let block_end = rest.find("</interface>").unwrap_or(rest.len());
        if !rest[..block_end].contains("<mac ") {
            out.push_str(&format!("<mac address='{}'/>", random_mac()));
        }
    }

    out.push_str(rest);
    out
}

impl MockBackend {
    /// Create a new, empty mock backend.
    pub fn new() -> Self {
        info!("Creating mock hypervisor backend");
        Self {
            state: RwLock::new(MockState::default()),
            calls: RwLock::new(Vec::new()),
            failures: RwLock::new(HashSet::new()),
            cancel_triggers: RwLock::new(Vec::new()),
            supports_volume_resize: true,
        }
    }

    /// Set whether the backend advertises in-place volume resizing.
    pub fn with_volume_resize(mut self, supported: bool) -> Self {
        self.supports_volume_resize = supported;
        self
    }

    /// Make `op` against `target` fail from now on.
    pub fn fail_on(&self, op: MockOp, target: impl Into<String>) {
        if let Ok(mut failures) = self.failures.write() {
            failures.insert((op, target.into()));
        }
    }

    /// Cancel `token` when `op` against `target` is called. The call itself
    /// still completes.
    pub fn cancel_on(&self, op: MockOp, target: impl Into<String>, token: CancellationToken) {
        if let Ok(mut triggers) = self.cancel_triggers.write() {
            triggers.push((op, target.into(), token));
        }
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Calls that changed state.
    pub fn mutations(&self) -> Vec<MockCall> {
        self.calls().into_iter().filter(|c| c.op.is_mutation()).collect()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.write() {
            calls.clear();
        }
    }

    // =========================================================================
    // Seeding (not recorded as calls)
    // =========================================================================

    /// Seed a network definition.
    pub fn insert_network(&self, xml: &str, active: bool) -> Result<()> {
        let (_, name, uuid) = identity(ResourceKind::Network, xml)?;
        let mut state = self.write()?;
        upsert(&mut state.networks, ResourceKind::Network, name.clone(), uuid, xml)?;
        if let Some(network) = state.networks.get_mut(&name) {
            network.set_active(active);
        }
        Ok(())
    }

    /// Seed a storage pool definition.
    pub fn insert_pool(&self, xml: &str, active: bool) -> Result<()> {
        let mut state = self.write()?;
        Self::upsert_pool(&mut state, xml)?;
        let (_, name, _) = identity(ResourceKind::Pool, xml)?;
        if let Some(pool) = state.pools.get_mut(&name) {
            pool.object.set_active(active);
        }
        Ok(())
    }

    /// Seed a volume into an existing pool.
    pub fn insert_volume(&self, pool: &str, xml: &str) -> Result<()> {
        let mut state = self.write()?;
        Self::add_volume(&mut state, pool, xml)
    }

    /// Seed a domain definition.
    pub fn insert_domain(&self, xml: &str, active: bool) -> Result<()> {
        let (_, name, uuid) = identity(ResourceKind::Domain, xml)?;
        let mut state = self.write()?;
        upsert(&mut state.domains, ResourceKind::Domain, name.clone(), uuid, xml)?;
        if let Some(domain) = state.domains.get_mut(&name) {
            domain.set_active(active);
        }
        Ok(())
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn network_names(&self) -> Vec<String> {
        self.state.read().map(|s| s.networks.keys().cloned().collect()).unwrap_or_default()
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.state.read().map(|s| s.pools.keys().cloned().collect()).unwrap_or_default()
    }

    pub fn volume_names(&self, pool: &str) -> Vec<String> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.pools.get(pool).map(|p| p.volumes.keys().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.state.read().map(|s| s.domains.keys().cloned().collect()).unwrap_or_default()
    }

    /// Stored domain XML, without recording a call.
    pub fn domain_xml(&self, name: &str) -> Option<String> {
        self.state.read().ok().and_then(|s| s.domains.get(name).map(|d| d.xml.clone()))
    }

    /// XML an active network is running with.
    pub fn network_running_xml(&self, name: &str) -> Option<String> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.networks.get(name).and_then(|n| n.running.clone()))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn read(&self) -> Result<RwLockReadGuard<'_, MockState>> {
        self.state
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MockState>> {
        self.state
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    /// Record a call, fire cancel triggers and apply any injected failure.
    fn record(&self, op: MockOp, target: &str) -> Result<()> {
        debug!(op = ?op, target = %target, "Mock call");
        self.calls
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?
            .push(MockCall {
                op,
                target: target.to_string(),
            });

        let triggers = self
            .cancel_triggers
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        for (_, _, token) in triggers.iter().filter(|(o, t, _)| *o == op && t == target) {
            token.cancel();
        }
        drop(triggers);

        let failures = self
            .failures
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        if failures.contains(&(op, target.to_string())) {
            return Err(HypervisorError::Internal(format!(
                "injected failure: {:?} {}",
                op, target
            )));
        }
        Ok(())
    }

    fn upsert_pool(state: &mut MockState, xml: &str) -> Result<String> {
        let (doc, name, uuid) = identity(ResourceKind::Pool, xml)?;
        let target = doc
            .root()
            .find(&["target", "path"])
            .map(|p| p.text.clone())
            .unwrap_or_default();

        if let Some(existing) = state.pools.get_mut(&name) {
            if let (Some(old), Some(new)) = (&existing.object.uuid, &uuid) {
                if old != new {
                    return Err(HypervisorError::Conflict {
                        kind: ResourceKind::Pool,
                        name,
                        reason: format!("already exists with uuid {}", old),
                    });
                }
            }
            existing.object.xml = xml.to_string();
            existing.target = target;
            return Ok(name);
        }

        state.pools.insert(
            name.clone(),
            MockPool {
                object: MockObject::new(xml, uuid),
                target,
                volumes: BTreeMap::new(),
            },
        );
        Ok(name)
    }

    fn add_volume(state: &mut MockState, pool: &str, xml: &str) -> Result<()> {
        let doc = Document::parse(xml)?;
        let name = doc
            .name()
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .ok_or_else(|| HypervisorError::DefineFailed {
                kind: ResourceKind::Volume,
                reason: "volume has no name".to_string(),
            })?;
        let capacity_bytes = doc
            .root()
            .child("capacity")
            .and_then(|c| c.text.parse::<u64>().ok())
            .unwrap_or(0);
        let format = doc
            .root()
            .find(&["target", "format"])
            .and_then(|f| f.attr("type"))
            .map(str::to_string);

        let pool = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| not_found(ResourceKind::Pool, pool))?;
        if pool.volumes.contains_key(&name) {
            return Err(HypervisorError::Conflict {
                kind: ResourceKind::Volume,
                name,
                reason: "volume already exists".to_string(),
            });
        }
        pool.volumes.insert(name, MockVolume { capacity_bytes, format });
        Ok(())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorClient for MockBackend {
    fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities {
            name: "mock".to_string(),
            supports_volume_resize: self.supports_volume_resize,
        }
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    // =========================================================================
    // Networks
    // =========================================================================

    async fn list_networks(&self) -> Result<Vec<String>> {
        self.record(MockOp::ListNetworks, "")?;
        Ok(self.read()?.networks.keys().cloned().collect())
    }

    async fn network_definition(&self, name: &str) -> Result<String> {
        self.record(MockOp::NetworkDefinition, name)?;
        self.read()?
            .networks
            .get(name)
            .map(|n| n.xml.clone())
            .ok_or_else(|| not_found(ResourceKind::Network, name))
    }

    #[instrument(skip(self, xml))]
    async fn define_network(&self, xml: &str) -> Result<()> {
        let (_, name, uuid) = identity(ResourceKind::Network, xml)?;
        self.record(MockOp::DefineNetwork, &name)?;
        let mut state = self.write()?;
        upsert(&mut state.networks, ResourceKind::Network, name.clone(), uuid, xml)?;
        info!(network = %name, "Mock network defined");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn undefine_network(&self, name: &str) -> Result<()> {
        self.record(MockOp::UndefineNetwork, name)?;
        let mut state = self.write()?;
        let network = state
            .networks
            .get(name)
            .ok_or_else(|| not_found(ResourceKind::Network, name))?;
        if network.active {
            return Err(HypervisorError::UndefineFailed {
                kind: ResourceKind::Network,
                name: name.to_string(),
                reason: "network is still active".to_string(),
            });
        }
        state.networks.remove(name);
        info!(network = %name, "Mock network undefined");
        Ok(())
    }

    async fn start_network(&self, name: &str) -> Result<()> {
        self.record(MockOp::StartNetwork, name)?;
        let mut state = self.write()?;
        let network = state
            .networks
            .get_mut(name)
            .ok_or_else(|| not_found(ResourceKind::Network, name))?;
        if network.active {
            return Err(HypervisorError::StartFailed {
                kind: ResourceKind::Network,
                name: name.to_string(),
                reason: "network is already active".to_string(),
            });
        }
        network.set_active(true);
        Ok(())
    }

    async fn stop_network(&self, name: &str) -> Result<()> {
        self.record(MockOp::StopNetwork, name)?;
        let mut state = self.write()?;
        let network = state
            .networks
            .get_mut(name)
            .ok_or_else(|| not_found(ResourceKind::Network, name))?;
        network.set_active(false);
        Ok(())
    }

    async fn is_network_active(&self, name: &str) -> Result<bool> {
        self.record(MockOp::IsNetworkActive, name)?;
        self.read()?
            .networks
            .get(name)
            .map(|n| n.active)
            .ok_or_else(|| not_found(ResourceKind::Network, name))
    }

    // =========================================================================
    // Storage pools
    // =========================================================================

    async fn list_pools(&self) -> Result<Vec<String>> {
        self.record(MockOp::ListPools, "")?;
        Ok(self.read()?.pools.keys().cloned().collect())
    }

    async fn pool_definition(&self, name: &str) -> Result<String> {
        self.record(MockOp::PoolDefinition, name)?;
        self.read()?
            .pools
            .get(name)
            .map(|p| p.object.xml.clone())
            .ok_or_else(|| not_found(ResourceKind::Pool, name))
    }

    #[instrument(skip(self, xml))]
    async fn define_pool(&self, xml: &str) -> Result<()> {
        let (_, name, _) = identity(ResourceKind::Pool, xml)?;
        self.record(MockOp::DefinePool, &name)?;
        let mut state = self.write()?;
        Self::upsert_pool(&mut state, xml)?;
        info!(pool = %name, "Mock pool defined");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn undefine_pool(&self, name: &str) -> Result<()> {
        self.record(MockOp::UndefinePool, name)?;
        let mut state = self.write()?;
        let pool = state
            .pools
            .get(name)
            .ok_or_else(|| not_found(ResourceKind::Pool, name))?;
        if pool.object.active {
            return Err(HypervisorError::UndefineFailed {
                kind: ResourceKind::Pool,
                name: name.to_string(),
                reason: "pool is still active".to_string(),
            });
        }
        // Volume files stay on disk; only the pool definition goes away
        state.pools.remove(name);
        info!(pool = %name, "Mock pool undefined");
        Ok(())
    }

    async fn start_pool(&self, name: &str) -> Result<()> {
        self.record(MockOp::StartPool, name)?;
        let mut state = self.write()?;
        let pool = state
            .pools
            .get_mut(name)
            .ok_or_else(|| not_found(ResourceKind::Pool, name))?;
        if pool.object.active {
            return Err(HypervisorError::StartFailed {
                kind: ResourceKind::Pool,
                name: name.to_string(),
                reason: "pool is already active".to_string(),
            });
        }
        pool.object.set_active(true);
        Ok(())
    }

    async fn stop_pool(&self, name: &str) -> Result<()> {
        self.record(MockOp::StopPool, name)?;
        let mut state = self.write()?;
        let pool = state
            .pools
            .get_mut(name)
            .ok_or_else(|| not_found(ResourceKind::Pool, name))?;
        pool.object.set_active(false);
        Ok(())
    }

    async fn is_pool_active(&self, name: &str) -> Result<bool> {
        self.record(MockOp::IsPoolActive, name)?;
        self.read()?
            .pools
            .get(name)
            .map(|p| p.object.active)
            .ok_or_else(|| not_found(ResourceKind::Pool, name))
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        self.record(MockOp::ListVolumes, pool)?;
        self.read()?
            .pools
            .get(pool)
            .map(|p| p.volumes.keys().cloned().collect())
            .ok_or_else(|| not_found(ResourceKind::Pool, pool))
    }

    async fn volume_definition(&self, pool: &str, name: &str) -> Result<String> {
        self.record(MockOp::VolumeDefinition, &format!("{}/{}", pool, name))?;
        let state = self.read()?;
        let pool_state = state
            .pools
            .get(pool)
            .ok_or_else(|| not_found(ResourceKind::Pool, pool))?;
        let volume = pool_state
            .volumes
            .get(name)
            .ok_or_else(|| not_found(ResourceKind::Volume, &format!("{}/{}", pool, name)))?;

        let path = format!("{}/{}", pool_state.target.trim_end_matches('/'), name);
        let format = volume
            .format
            .as_ref()
            .map(|f| format!("    <format type='{}'/>\n", f))
            .unwrap_or_default();
        Ok(format!(
            "<volume type='file'>\n  <name>{}</name>\n  <key>{}</key>\n  <capacity unit='bytes'>{}</capacity>\n  <allocation unit='bytes'>0</allocation>\n  <target>\n    <path>{}</path>\n{}  </target>\n</volume>\n",
            name, path, volume.capacity_bytes, path, format
        ))
    }

    #[instrument(skip(self, xml))]
    async fn create_volume(&self, pool: &str, xml: &str) -> Result<()> {
        let doc = Document::parse(xml)?;
        let name = doc.name().unwrap_or_default().to_string();
        self.record(MockOp::CreateVolume, &format!("{}/{}", pool, name))?;

        let mut state = self.write()?;
        let active = state
            .pools
            .get(pool)
            .map(|p| p.object.active)
            .ok_or_else(|| not_found(ResourceKind::Pool, pool))?;
        if !active {
            return Err(HypervisorError::DefineFailed {
                kind: ResourceKind::Volume,
                reason: format!("pool {} is not active", pool),
            });
        }
        Self::add_volume(&mut state, pool, xml)?;
        info!(pool = %pool, volume = %name, "Mock volume created");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        let target = format!("{}/{}", pool, name);
        self.record(MockOp::DeleteVolume, &target)?;
        let mut state = self.write()?;
        let pool_state = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| not_found(ResourceKind::Pool, pool))?;
        pool_state
            .volumes
            .remove(name)
            .ok_or_else(|| not_found(ResourceKind::Volume, &target))?;
        info!(volume = %target, "Mock volume deleted");
        Ok(())
    }

    async fn resize_volume(&self, pool: &str, name: &str, capacity_bytes: u64) -> Result<()> {
        let target = format!("{}/{}", pool, name);
        self.record(MockOp::ResizeVolume, &target)?;
        if !self.supports_volume_resize {
            return Err(HypervisorError::Unsupported(format!(
                "mock does not support resizing volume {}",
                target
            )));
        }

        let mut state = self.write()?;
        let volume = state
            .pools
            .get_mut(pool)
            .and_then(|p| p.volumes.get_mut(name))
            .ok_or_else(|| not_found(ResourceKind::Volume, &target))?;
        if capacity_bytes < volume.capacity_bytes {
            return Err(HypervisorError::Unsupported(format!(
                "cannot shrink volume {}",
                target
            )));
        }
        volume.capacity_bytes = capacity_bytes;
        Ok(())
    }

    // =========================================================================
    // Domains
    // =========================================================================

    async fn list_domains(&self) -> Result<Vec<String>> {
        self.record(MockOp::ListDomains, "")?;
        Ok(self.read()?.domains.keys().cloned().collect())
    }

    async fn domain_definition(&self, name: &str) -> Result<String> {
        self.record(MockOp::DomainDefinition, name)?;
        self.read()?
            .domains
            .get(name)
            .map(|d| d.xml.clone())
            .ok_or_else(|| not_found(ResourceKind::Domain, name))
    }

    async fn running_domain_definition(&self, name: &str) -> Result<String> {
        self.record(MockOp::RunningDomainDefinition, name)?;
        self.read()?
            .domains
            .get(name)
            .map(|d| d.running.clone().unwrap_or_else(|| d.xml.clone()))
            .ok_or_else(|| not_found(ResourceKind::Domain, name))
    }

    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> Result<()> {
        let (_, name, uuid) = identity(ResourceKind::Domain, xml)?;
        self.record(MockOp::DefineDomain, &name)?;
        let xml = assign_macs(xml);
        let mut state = self.write()?;
        upsert(&mut state.domains, ResourceKind::Domain, name.clone(), uuid, &xml)?;
        info!(domain = %name, "Mock domain defined");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn undefine_domain(&self, name: &str) -> Result<()> {
        self.record(MockOp::UndefineDomain, name)?;
        let mut state = self.write()?;
        state
            .domains
            .remove(name)
            .ok_or_else(|| not_found(ResourceKind::Domain, name))?;
        info!(domain = %name, "Mock domain undefined");
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> Result<()> {
        self.record(MockOp::StartDomain, name)?;
        let mut state = self.write()?;
        let domain = state
            .domains
            .get_mut(name)
            .ok_or_else(|| not_found(ResourceKind::Domain, name))?;
        if domain.active {
            return Err(HypervisorError::StartFailed {
                kind: ResourceKind::Domain,
                name: name.to_string(),
                reason: "domain is already running".to_string(),
            });
        }
        domain.set_active(true);
        Ok(())
    }

    async fn shutdown_domain(&self, name: &str) -> Result<()> {
        self.record(MockOp::ShutdownDomain, name)?;
        let mut state = self.write()?;
        let domain = state
            .domains
            .get_mut(name)
            .ok_or_else(|| not_found(ResourceKind::Domain, name))?;
        domain.set_active(false);
        Ok(())
    }

    async fn is_domain_active(&self, name: &str) -> Result<bool> {
        self.record(MockOp::IsDomainActive, name)?;
        self.read()?
            .domains
            .get(name)
            .map(|d| d.active)
            .ok_or_else(|| not_found(ResourceKind::Domain, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETWORK: &str = "<network><name>lab</name><uuid>5d1e0d51-9c1f-4aa0-a0f3-1b2b8f1f6c01</uuid></network>";
    const POOL: &str = "<pool type='dir'><name>p</name><target><path>/images</path></target></pool>";

    #[tokio::test]
    async fn test_network_lifecycle() {
        let backend = MockBackend::new();

        backend.define_network(NETWORK).await.unwrap();
        assert_eq!(backend.list_networks().await.unwrap(), vec!["lab".to_string()]);
        assert!(!backend.is_network_active("lab").await.unwrap());

        backend.start_network("lab").await.unwrap();
        assert!(backend.start_network("lab").await.is_err());
        assert!(backend.undefine_network("lab").await.is_err());

        backend.stop_network("lab").await.unwrap();
        backend.undefine_network("lab").await.unwrap();
        assert!(backend.list_networks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_redefine_with_other_uuid_conflicts() {
        let backend = MockBackend::new();
        backend.define_network(NETWORK).await.unwrap();

        let other = NETWORK.replace("5d1e0d51", "aaaaaaaa");
        let err = backend.define_network(&other).await.unwrap_err();
        assert!(matches!(err, HypervisorError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_volume_echo_has_live_detail() {
        let backend = MockBackend::new();
        backend.insert_pool(POOL, true).unwrap();
        backend
            .create_volume(
                "p",
                "<volume><name>root</name><capacity unit='bytes'>1024</capacity><target><format type='qcow2'/></target></volume>",
            )
            .await
            .unwrap();

        let xml = backend.volume_definition("p", "root").await.unwrap();
        assert!(xml.contains("<path>/images/root</path>"));
        assert!(xml.contains("<format type='qcow2'/>"));
        assert!(xml.contains("<capacity unit='bytes'>1024</capacity>"));
    }

    #[tokio::test]
    async fn test_volume_requires_active_pool() {
        let backend = MockBackend::new();
        backend.insert_pool(POOL, false).unwrap();
        let result = backend
            .create_volume("p", "<volume><name>v</name><capacity>1</capacity></volume>")
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_resize() {
        let backend = MockBackend::new();
        backend.insert_pool(POOL, true).unwrap();
        backend
            .insert_volume("p", "<volume><name>v</name><capacity unit='bytes'>100</capacity></volume>")
            .unwrap();

        backend.resize_volume("p", "v", 200).await.unwrap();
        assert!(backend.resize_volume("p", "v", 50).await.is_err());

        let fixed = MockBackend::new().with_volume_resize(false);
        assert!(!fixed.capabilities().supports_volume_resize);
    }

    #[tokio::test]
    async fn test_calls_and_failure_injection() {
        let backend = MockBackend::new();
        backend.fail_on(MockOp::DefineNetwork, "lab");

        assert!(backend.define_network(NETWORK).await.is_err());
        backend.list_networks().await.unwrap();

        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], MockCall { op: MockOp::DefineNetwork, target: "lab".to_string() });
        assert_eq!(backend.mutations().len(), 1);

        backend.clear_calls();
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_redefining_active_network_keeps_running_definition() {
        let backend = MockBackend::new();
        backend.insert_network(NETWORK, true).unwrap();

        let renamed_bridge = NETWORK.replace("</network>", "<bridge name='virbr9'/></network>");
        backend.define_network(&renamed_bridge).await.unwrap();

        assert_eq!(backend.network_definition("lab").await.unwrap(), renamed_bridge);
        assert_eq!(backend.network_running_xml("lab").as_deref(), Some(NETWORK));

        backend.stop_network("lab").await.unwrap();
        backend.start_network("lab").await.unwrap();
        assert_eq!(backend.network_running_xml("lab"), Some(renamed_bridge));
    }

    #[tokio::test]
    async fn test_define_domain_generates_missing_macs() {
        let backend = MockBackend::new();
        let xml = "<domain><name>vm</name><devices><interface type='network'><source network='a'/></interface><interface type='network'><mac address='52:54:00:00:00:01'/><source network='b'/></interface></devices></domain>";

        backend.define_domain(xml).await.unwrap();
        let first = backend.domain_xml("vm").unwrap();
        backend.define_domain(xml).await.unwrap();
        let second = backend.domain_xml("vm").unwrap();

        assert_eq!(first.matches("<mac ").count(), 2);
        assert!(second.contains("52:54:00:00:00:01"));
        // A new address on every define, like libvirt
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_running_domain_definition() {
        let backend = MockBackend::new();
        let old = "<domain><name>vm</name><memory>1</memory></domain>";
        let new = "<domain><name>vm</name><memory>2</memory></domain>";
        backend.insert_domain(old, true).unwrap();
        backend.define_domain(new).await.unwrap();

        assert_eq!(backend.domain_definition("vm").await.unwrap(), new);
        assert_eq!(backend.running_domain_definition("vm").await.unwrap(), old);

        backend.shutdown_domain("vm").await.unwrap();
        assert_eq!(backend.running_domain_definition("vm").await.unwrap(), new);
    }

    #[tokio::test]
    async fn test_cancel_trigger_lets_call_finish() {
        let backend = MockBackend::new();
        let token = CancellationToken::new();
        backend.cancel_on(MockOp::DefineNetwork, "lab", token.clone());

        backend.list_networks().await.unwrap();
        assert!(!token.is_cancelled());

        backend.define_network(NETWORK).await.unwrap();
        assert!(token.is_cancelled());
        assert_eq!(backend.network_names(), vec!["lab".to_string()]);
    }

    #[tokio::test]
    async fn test_undefine_domain_keeps_volumes() {
        let backend = MockBackend::new();
        backend.insert_pool(POOL, true).unwrap();
        backend
            .insert_volume("p", "<volume><name>root</name><capacity>1</capacity></volume>")
            .unwrap();
        backend
            .insert_domain("<domain><name>vm</name><devices><disk type='volume'><source pool='p' volume='root'/></disk></devices></domain>", true)
            .unwrap();

        backend.undefine_domain("vm").await.unwrap();
        assert!(backend.domain_names().is_empty());
        assert_eq!(backend.volume_names("p"), vec!["root".to_string()]);
    }
}
