//! Desired-state input: per resource kind, either unmanaged or an explicit list.

use serde::{Deserialize, Serialize};

use crate::error::ValidationErrors;
use crate::profile::{DomainDecl, ProfileError};
use crate::types::*;
use crate::validate;

/// Management mode for one resource kind.
///
/// `Unmanaged` leaves every live resource of the kind alone. `Managed(vec![])` means
/// "this kind should have no resources" and deletes whatever is live.
///
/// In YAML this is either the string `unmanaged` or `managed: [ ... ]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Managed<T> {
    Unmanaged,
    Managed(Vec<T>),
}

impl<T> Default for Managed<T> {
    fn default() -> Self {
        Managed::Unmanaged
    }
}

impl<T> Managed<T> {
    pub fn is_managed(&self) -> bool {
        matches!(self, Managed::Managed(_))
    }

    /// The managed list, or `None` when unmanaged.
    pub fn items(&self) -> Option<&[T]> {
        match self {
            Managed::Unmanaged => None,
            Managed::Managed(items) => Some(items),
        }
    }

    /// Iterate the managed items (empty when unmanaged).
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items().unwrap_or(&[]).iter()
    }

    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<Managed<U>, E> {
        match self {
            Managed::Unmanaged => Ok(Managed::Unmanaged),
            Managed::Managed(items) => items
                .into_iter()
                .map(f)
                .collect::<Result<Vec<_>, E>>()
                .map(Managed::Managed),
        }
    }
}

/// Complete desired state for one hypervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredState {
    pub networks: Managed<NetworkSpec>,
    pub pools: Managed<StoragePoolSpec>,
    pub domains: Managed<DomainSpec>,
}

impl DesiredState {
    /// Desired state with every kind unmanaged.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_networks(mut self, networks: Vec<NetworkSpec>) -> Self {
        self.networks = Managed::Managed(networks);
        self
    }

    pub fn with_pools(mut self, pools: Vec<StoragePoolSpec>) -> Self {
        self.pools = Managed::Managed(pools);
        self
    }

    pub fn with_domains(mut self, domains: Vec<DomainSpec>) -> Self {
        self.domains = Managed::Managed(domains);
        self
    }

    /// Run every validation rule, collecting all errors.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let errors = validate::validate(self);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(errors))
        }
    }

    pub fn network(&self, name: &str) -> Option<&NetworkSpec> {
        self.networks.iter().find(|n| n.name == name)
    }

    pub fn pool(&self, name: &str) -> Option<&StoragePoolSpec> {
        self.pools.iter().find(|p| p.name == name)
    }

    pub fn volume(&self, pool: &str, volume: &str) -> Option<&VolumeEntry> {
        self.pool(pool).and_then(|p| p.volume(volume))
    }

    /// Copy of `domain` with every attachment's driver format filled in from
    /// the referenced volume.
    pub fn resolve_formats(&self, domain: &DomainSpec) -> DomainSpec {
        let mut resolved = domain.clone();
        for attachment in resolved.disks.iter_mut().chain(resolved.cdroms.iter_mut()) {
            if attachment.format.is_none() {
                attachment.format = self
                    .volume(&attachment.pool, &attachment.volume)
                    .map(|entry| entry.volume.format);
            }
        }
        resolved
    }
}

/// Topology file layout: like [`DesiredState`] but domains may use profiles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyFile {
    pub networks: Managed<NetworkSpec>,
    pub pools: Managed<StoragePoolSpec>,
    pub domains: Managed<DomainDecl>,
}

impl TopologyFile {
    /// Expand profile declarations into full domain specs.
    pub fn into_desired_state(self) -> Result<DesiredState, ProfileError> {
        Ok(DesiredState {
            networks: self.networks,
            pools: self.pools,
            domains: self.domains.try_map(DomainDecl::into_spec)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_serde_shape() {
        let unmanaged: Managed<NetworkSpec> = serde_json::from_str(r#""unmanaged""#).unwrap();
        assert_eq!(unmanaged, Managed::Unmanaged);

        let empty: Managed<NetworkSpec> = serde_json::from_str(r#"{"managed": []}"#).unwrap();
        assert_eq!(empty, Managed::Managed(vec![]));
        assert!(empty.is_managed());
        assert_eq!(empty.items().map(|i| i.len()), Some(0));
    }

    #[test]
    fn test_missing_kind_is_unmanaged() {
        let state: DesiredState = serde_json::from_str(r#"{"domains": {"managed": []}}"#).unwrap();
        assert!(!state.networks.is_managed());
        assert!(!state.pools.is_managed());
        assert!(state.domains.is_managed());
    }

    #[test]
    fn test_resolve_formats() {
        let state = DesiredState::new().with_pools(vec![StoragePoolSpec::dir("p", "/images")
            .with_volume(VolumeEntry::present(VolumeSpec::new(
                "root",
                Capacity::gib(10),
                VolumeFormat::Raw,
            )))]);
        let domain = DomainSpec::new("vm").with_disk(DiskAttachment::new("p", "root"));

        let resolved = state.resolve_formats(&domain);
        assert_eq!(resolved.disks[0].format, Some(VolumeFormat::Raw));
        // Source spec left untouched
        assert_eq!(domain.disks[0].format, None);
    }

    #[test]
    fn test_topology_file_expands_profiles() {
        let file: TopologyFile = serde_json::from_str(
            r#"{
                "networks": "unmanaged",
                "domains": {"managed": [
                    {"profile": "server", "name": "srv", "pool": "p", "disk": "srv-root"}
                ]}
            }"#,
        )
        .unwrap();
        let state = file.into_desired_state().unwrap();
        let domains = state.domains.items().unwrap();
        assert_eq!(domains.len(), 1);
        assert!(domains[0].tpm);
    }
}
