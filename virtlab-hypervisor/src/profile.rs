//! Domain profiles for lab machines.
//!
//! A profile is a named preset that expands into a complete [`DomainSpec`].
//! Profiles differ only in memory size and default install media; everything
//! else is shared:
//!
//! - modern (UEFI, secure-boot capable) firmware with a TPM 2.0 device
//! - one primary disk from the given pool
//! - one virtio interface on the primary lab network
//! - the share mounts supplied by the caller
//!
//! ```rust
//! use virtlab_hypervisor::profile::{expand, ProfileParams};
//! use virtlab_hypervisor::NetworkInterface;
//!
//! let params = ProfileParams::new("srv-1", "lab-pool", "srv-1-root");
//! let domain = expand("server", &params)
//!     .unwrap()
//!     .with_interface(NetworkInterface::new("storage"));
//! assert_eq!(domain.interfaces.len(), 2);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::*;

/// Network every profile attaches its first interface to.
pub const PRIMARY_NETWORK: &str = "lab";

/// Errors raised while expanding a profile.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("unknown profile '{0}' (expected one of: server, client)")]
    UnknownProfile(String),
}

/// Named domain profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Headless server
    Server,
    /// Desktop client
    Client,
}

impl Profile {
    /// Look up a profile by name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "server" => Some(Profile::Server),
            "client" | "workstation" => Some(Profile::Client),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Profile::Server => "server",
            Profile::Client => "client",
        }
    }

    /// Default memory size.
    pub fn memory(&self) -> Capacity {
        match self {
            Profile::Server => Capacity::gib(4),
            Profile::Client => Capacity::gib(2),
        }
    }

    /// Default install media volume name.
    pub fn install_media(&self) -> &'static str {
        match self {
            Profile::Server => "server-install.iso",
            Profile::Client => "client-install.iso",
        }
    }
}

fn default_network() -> String {
    PRIMARY_NETWORK.to_string()
}

/// Parameters for [`expand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileParams {
    /// Domain name
    pub name: String,
    /// Memory override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Capacity>,
    /// Pool holding the primary disk
    pub pool: String,
    /// Primary disk volume name
    pub disk: String,
    /// Install media volume name override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_media: Option<String>,
    /// Pool holding the install media (defaults to `pool`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_pool: Option<String>,
    /// Primary lab network
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub mounts: Vec<ShareMount>,
    #[serde(default)]
    pub power: PowerPolicy,
}

impl ProfileParams {
    pub fn new(name: impl Into<String>, pool: impl Into<String>, disk: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            memory: None,
            pool: pool.into(),
            disk: disk.into(),
            install_media: None,
            media_pool: None,
            network: default_network(),
            mounts: Vec::new(),
            power: PowerPolicy::default(),
        }
    }

    pub fn with_memory(mut self, memory: Capacity) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_install_media(mut self, volume: impl Into<String>) -> Self {
        self.install_media = Some(volume.into());
        self
    }

    pub fn with_mount(mut self, mount: ShareMount) -> Self {
        self.mounts.push(mount);
        self
    }
}

/// Expand a named profile into a complete domain definition.
pub fn expand(profile_name: &str, params: &ProfileParams) -> Result<DomainSpec, ProfileError> {
    let profile = Profile::from_name(profile_name)
        .ok_or_else(|| ProfileError::UnknownProfile(profile_name.to_string()))?;
    Ok(expand_profile(profile, params))
}

/// Expand a known profile.
pub fn expand_profile(profile: Profile, params: &ProfileParams) -> DomainSpec {
    let install_media = params
        .install_media
        .clone()
        .unwrap_or_else(|| profile.install_media().to_string());
    let media_pool = params.media_pool.clone().unwrap_or_else(|| params.pool.clone());

    let mut domain = DomainSpec::new(params.name.clone())
        .with_memory(params.memory.unwrap_or_else(|| profile.memory()))
        .with_vcpus(2)
        .with_firmware(FirmwareMode::Modern)
        .with_tpm(true)
        .with_disk(DiskAttachment::new(params.pool.clone(), params.disk.clone()))
        .with_cdrom(DiskAttachment::new(media_pool, install_media))
        .with_interface(NetworkInterface::new(params.network.clone()).with_model(NicModel::Virtio))
        .with_power(params.power);

    for mount in &params.mounts {
        domain = domain.with_mount(mount.clone());
    }

    domain
}

/// A profile reference as written in a topology file.
///
/// `interfaces` are appended after the profile's primary interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDecl {
    pub profile: String,
    #[serde(flatten)]
    pub params: ProfileParams,
    #[serde(default)]
    pub interfaces: Vec<NetworkInterface>,
}

impl ProfileDecl {
    pub fn expand(&self) -> Result<DomainSpec, ProfileError> {
        let mut domain = expand(&self.profile, &self.params)?;
        for interface in &self.interfaces {
            domain = domain.with_interface(interface.clone());
        }
        Ok(domain)
    }
}

/// A domain declared either through a profile or as a full spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DomainDecl {
    Profile(ProfileDecl),
    Spec(DomainSpec),
}

impl DomainDecl {
    pub fn into_spec(self) -> Result<DomainSpec, ProfileError> {
        match self {
            DomainDecl::Profile(decl) => decl.expand(),
            DomainDecl::Spec(spec) => Ok(spec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_profile() {
        let params = ProfileParams::new("srv-1", "lab-pool", "srv-1-root");
        let domain = expand("server", &params).unwrap();

        assert_eq!(domain.name, "srv-1");
        assert_eq!(domain.memory, Capacity::gib(4));
        assert_eq!(domain.firmware, FirmwareMode::Modern);
        assert!(domain.tpm);
        assert_eq!(domain.disks, vec![DiskAttachment::new("lab-pool", "srv-1-root")]);
        assert_eq!(domain.cdroms, vec![DiskAttachment::new("lab-pool", "server-install.iso")]);
        assert_eq!(domain.interfaces, vec![NetworkInterface::new(PRIMARY_NETWORK)]);
        assert!(domain.mounts.is_empty());
    }

    #[test]
    fn test_client_profile_differs_in_memory_and_media() {
        let params = ProfileParams::new("ws-1", "lab-pool", "ws-1-root");
        let server = expand("server", &params).unwrap();
        let client = expand("client", &params).unwrap();

        assert_eq!(client.memory, Capacity::gib(2));
        assert_eq!(client.cdroms[0].volume, "client-install.iso");
        assert_eq!(client.firmware, server.firmware);
        assert_eq!(client.interfaces, server.interfaces);
        assert_eq!(client.disks, server.disks);
    }

    #[test]
    fn test_overrides() {
        let params = ProfileParams::new("srv-1", "lab-pool", "root")
            .with_memory(Capacity::gib(8))
            .with_install_media("custom.iso")
            .with_mount(ShareMount::new("/srv/share", "share"));
        let domain = expand("server", &params).unwrap();

        assert_eq!(domain.memory, Capacity::gib(8));
        assert_eq!(domain.cdroms[0].volume, "custom.iso");
        assert_eq!(domain.mounts.len(), 1);
    }

    #[test]
    fn test_unknown_profile() {
        let params = ProfileParams::new("x", "p", "d");
        assert_eq!(
            expand("database", &params),
            Err(ProfileError::UnknownProfile("database".to_string()))
        );
    }

    #[test]
    fn test_added_interface_yields_two_in_order() {
        let params = ProfileParams::new("srv-1", "lab-pool", "root");
        let domain = expand("server", &params)
            .unwrap()
            .with_interface(NetworkInterface::new("storage").with_model(NicModel::E1000e));

        assert_eq!(domain.interfaces.len(), 2);
        assert_eq!(domain.interfaces[0].network, PRIMARY_NETWORK);
        assert_eq!(domain.interfaces[1].network, "storage");
        assert_eq!(domain.interfaces[1].model, NicModel::E1000e);
    }

    #[test]
    fn test_profile_decl_appends_interfaces() {
        let decl: DomainDecl = serde_json::from_str(
            r#"{
                "profile": "client",
                "name": "ws-1",
                "pool": "lab-pool",
                "disk": "ws-1-root",
                "interfaces": [{"network": "mgmt"}]
            }"#,
        )
        .unwrap();
        let domain = decl.into_spec().unwrap();

        let networks: Vec<_> = domain.interfaces.iter().map(|i| i.network.as_str()).collect();
        assert_eq!(networks, vec![PRIMARY_NETWORK, "mgmt"]);
    }

    #[test]
    fn test_full_spec_decl() {
        let decl: DomainDecl = serde_json::from_str(
            r#"{"name": "raw-vm", "memory": {"value": 512, "unit": "MiB"}, "vcpus": 1}"#,
        )
        .unwrap();
        let domain = decl.into_spec().unwrap();
        assert_eq!(domain.memory, Capacity::mib(512));
        assert_eq!(domain.firmware, FirmwareMode::Legacy);
    }
}
