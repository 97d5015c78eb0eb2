//! Type definitions for the lab topology: networks, storage and domains.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ResourceKind;

/// Namespace for identifiers derived from resource names.
const IDENTIFIER_NAMESPACE: Uuid = Uuid::from_u128(0x8f3c_61d2_4b7e_4f0a_9c55_2e1d_7a90_b3c4);

/// Derive a stable identifier for a resource from its kind and name.
///
/// Used when the topology does not pin a UUID, so repeated applies render the
/// same definition.
pub fn derive_uuid(kind: ResourceKind, name: &str) -> String {
    Uuid::new_v5(&IDENTIFIER_NAMESPACE, format!("{}/{}", kind, name).as_bytes()).to_string()
}

/// Derive the MAC address of a domain's interface at `index`.
///
/// libvirt generates a random MAC for every interface defined without one,
/// on every define. Rendering a derived address keeps adapters stable across
/// redefinitions.
pub fn derive_mac(domain_identifier: &str, index: usize) -> String {
    let id = Uuid::new_v5(
        &IDENTIFIER_NAMESPACE,
        format!("mac/{}/{}", domain_identifier, index).as_bytes(),
    );
    let bytes = id.as_bytes();
    // 52:54:00 is the locally administered prefix QEMU uses
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

// =============================================================================
// QUANTITIES
// =============================================================================

/// Size unit for memory and volume capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SizeUnit {
    B,
    KiB,
    MiB,
    #[default]
    GiB,
    TiB,
}

impl SizeUnit {
    /// Number of bytes in one unit.
    pub fn multiplier(&self) -> u64 {
        match self {
            SizeUnit::B => 1,
            SizeUnit::KiB => 1 << 10,
            SizeUnit::MiB => 1 << 20,
            SizeUnit::GiB => 1 << 30,
            SizeUnit::TiB => 1 << 40,
        }
    }
}

/// A quantity with a unit, e.g. `20 GiB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Capacity {
    pub value: u64,
    #[serde(default)]
    pub unit: SizeUnit,
}

impl Capacity {
    pub fn new(value: u64, unit: SizeUnit) -> Self {
        Self { value, unit }
    }

    pub fn mib(value: u64) -> Self {
        Self::new(value, SizeUnit::MiB)
    }

    pub fn gib(value: u64) -> Self {
        Self::new(value, SizeUnit::GiB)
    }

    /// Size in bytes (saturating).
    pub fn bytes(&self) -> u64 {
        self.value.saturating_mul(self.unit.multiplier())
    }

    /// Size in KiB, rounded down.
    pub fn kib(&self) -> u64 {
        self.bytes() / 1024
    }
}

// =============================================================================
// NETWORKS
// =============================================================================

/// Forwarding mode of a virtual network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    #[default]
    Nat,
    Route,
    Isolated,
}

/// DHCP address range (inclusive on both ends).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl DhcpRange {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let addr = u32::from(addr);
        u32::from(self.start) <= addr && addr <= u32::from(self.end)
    }
}

/// A libvirt virtual network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    /// Pinned UUID; derived from the name when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub forward: ForwardMode,
    /// Host bridge device, e.g. `virbr10`
    pub bridge: String,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp: Option<DhcpRange>,
}

impl NetworkSpec {
    pub fn new(
        name: impl Into<String>,
        bridge: impl Into<String>,
        gateway: Ipv4Addr,
        netmask: Ipv4Addr,
    ) -> Self {
        Self {
            name: name.into(),
            uuid: None,
            forward: ForwardMode::default(),
            bridge: bridge.into(),
            gateway,
            netmask,
            dhcp: None,
        }
    }

    pub fn with_forward(mut self, forward: ForwardMode) -> Self {
        self.forward = forward;
        self
    }

    pub fn with_dhcp(mut self, start: Ipv4Addr, end: Ipv4Addr) -> Self {
        self.dhcp = Some(DhcpRange::new(start, end));
        self
    }

    /// UUID used in the rendered definition.
    pub fn identifier(&self) -> String {
        self.uuid.clone().unwrap_or_else(|| derive_uuid(ResourceKind::Network, &self.name))
    }

    /// Whether `addr` lies in this network's subnet.
    pub fn subnet_contains(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(addr) & mask == u32::from(self.gateway) & mask
    }
}

// =============================================================================
// STORAGE
// =============================================================================

/// Storage pool type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Directory of image files
    #[default]
    Dir,
    /// Pre-formatted block device mounted at the target
    Fs,
    /// LVM volume group
    Logical,
}

impl PoolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::Dir => "dir",
            PoolKind::Fs => "fs",
            PoolKind::Logical => "logical",
        }
    }
}

/// On-disk volume format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VolumeFormat {
    #[default]
    Qcow2,
    Raw,
    Iso,
}

impl VolumeFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeFormat::Qcow2 => "qcow2",
            VolumeFormat::Raw => "raw",
            VolumeFormat::Iso => "iso",
        }
    }

    /// Parse a libvirt format type name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "qcow2" => Some(VolumeFormat::Qcow2),
            "raw" => Some(VolumeFormat::Raw),
            "iso" => Some(VolumeFormat::Iso),
            _ => None,
        }
    }

    /// Format name as understood by the QEMU disk driver.
    pub fn driver_type(&self) -> &'static str {
        match self {
            VolumeFormat::Qcow2 => "qcow2",
            VolumeFormat::Raw | VolumeFormat::Iso => "raw",
        }
    }
}

/// A volume inside a storage pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    #[serde(default)]
    pub capacity: Capacity,
    #[serde(default)]
    pub format: VolumeFormat,
}

impl VolumeSpec {
    pub fn new(name: impl Into<String>, capacity: Capacity, format: VolumeFormat) -> Self {
        Self {
            name: name.into(),
            capacity,
            format,
        }
    }
}

fn default_present() -> bool {
    true
}

/// A volume entry in a pool's volume list.
///
/// `present: false` is an explicit request to delete the volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeEntry {
    #[serde(default = "default_present")]
    pub present: bool,
    #[serde(flatten)]
    pub volume: VolumeSpec,
}

impl VolumeEntry {
    pub fn present(volume: VolumeSpec) -> Self {
        Self { present: true, volume }
    }

    /// Entry requesting deletion of the named volume.
    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            present: false,
            volume: VolumeSpec::new(name, Capacity::default(), VolumeFormat::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.volume.name
    }
}

/// A libvirt storage pool and the volumes it should (or should not) hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePoolSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub kind: PoolKind,
    /// Target path, e.g. `/var/lib/libvirt/images/lab`
    pub target: String,
    /// Source device for `fs` pools, volume group for `logical` pools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeEntry>,
}

impl StoragePoolSpec {
    pub fn dir(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: None,
            kind: PoolKind::Dir,
            target: target.into(),
            source: None,
            volumes: Vec::new(),
        }
    }

    pub fn with_volume(mut self, entry: VolumeEntry) -> Self {
        self.volumes.push(entry);
        self
    }

    pub fn identifier(&self) -> String {
        self.uuid.clone().unwrap_or_else(|| derive_uuid(ResourceKind::Pool, &self.name))
    }

    pub fn volume(&self, name: &str) -> Option<&VolumeEntry> {
        self.volumes.iter().find(|v| v.name() == name)
    }
}

// =============================================================================
// DOMAINS
// =============================================================================

/// Firmware mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareMode {
    /// SeaBIOS
    #[default]
    Legacy,
    /// UEFI (OVMF) with secure-boot capable firmware
    Modern,
}

/// Network interface model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NicModel {
    #[default]
    Virtio,
    E1000,
    E1000e,
    Rtl8139,
}

impl NicModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicModel::Virtio => "virtio",
            NicModel::E1000 => "e1000",
            NicModel::E1000e => "e1000e",
            NicModel::Rtl8139 => "rtl8139",
        }
    }
}

/// A volume attached to a domain as a disk or CD-ROM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskAttachment {
    pub pool: String,
    pub volume: String,
    /// Driver format; taken from the referenced volume when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<VolumeFormat>,
}

impl DiskAttachment {
    pub fn new(pool: impl Into<String>, volume: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            volume: volume.into(),
            format: None,
        }
    }
}

/// A network interface. Order within a domain is the guest's adapter order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub network: String,
    #[serde(default)]
    pub model: NicModel,
    /// Fixed MAC address (derived from the domain identifier when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Address the guest is statically configured with on this network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
}

impl NetworkInterface {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            model: NicModel::default(),
            mac: None,
            address: None,
        }
    }

    pub fn with_model(mut self, model: NicModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_address(mut self, address: Ipv4Addr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }
}

/// A host directory shared into the guest over virtiofs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareMount {
    pub host_path: String,
    pub mount_tag: String,
    #[serde(default)]
    pub readonly: bool,
}

impl ShareMount {
    pub fn new(host_path: impl Into<String>, mount_tag: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            mount_tag: mount_tag.into(),
            readonly: false,
        }
    }
}

/// Whether the reconciler controls a domain's power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PowerPolicy {
    /// Leave the domain in whatever state it is in
    #[default]
    Unmanaged,
    /// Start the domain if it is not running
    Running,
    /// Gracefully shut the domain down if it is running
    Stopped,
}

/// A fully specified virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub memory: Capacity,
    pub vcpus: u32,
    #[serde(default)]
    pub firmware: FirmwareMode,
    #[serde(default)]
    pub tpm: bool,
    #[serde(default)]
    pub disks: Vec<DiskAttachment>,
    /// Install media, attached as read-only CD-ROMs after the disks
    #[serde(default)]
    pub cdroms: Vec<DiskAttachment>,
    #[serde(default)]
    pub interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub mounts: Vec<ShareMount>,
    #[serde(default)]
    pub power: PowerPolicy,
}

impl DomainSpec {
    /// Create a domain with 2 GiB of memory, one vCPU and no devices.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: None,
            memory: Capacity::gib(2),
            vcpus: 1,
            firmware: FirmwareMode::default(),
            tpm: false,
            disks: Vec::new(),
            cdroms: Vec::new(),
            interfaces: Vec::new(),
            mounts: Vec::new(),
            power: PowerPolicy::default(),
        }
    }

    pub fn with_memory(mut self, memory: Capacity) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    pub fn with_firmware(mut self, firmware: FirmwareMode) -> Self {
        self.firmware = firmware;
        self
    }

    pub fn with_tpm(mut self, tpm: bool) -> Self {
        self.tpm = tpm;
        self
    }

    pub fn with_disk(mut self, disk: DiskAttachment) -> Self {
        self.disks.push(disk);
        self
    }

    pub fn with_cdrom(mut self, cdrom: DiskAttachment) -> Self {
        self.cdroms.push(cdrom);
        self
    }

    /// Append a network interface after the existing ones.
    pub fn with_interface(mut self, interface: NetworkInterface) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn with_mount(mut self, mount: ShareMount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_power(mut self, power: PowerPolicy) -> Self {
        self.power = power;
        self
    }

    pub fn identifier(&self) -> String {
        self.uuid.clone().unwrap_or_else(|| derive_uuid(ResourceKind::Domain, &self.name))
    }

    /// Every disk and CD-ROM attachment, disks first.
    pub fn attachments(&self) -> impl Iterator<Item = &DiskAttachment> {
        self.disks.iter().chain(self.cdroms.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_conversion() {
        assert_eq!(Capacity::gib(20).bytes(), 20 * 1024 * 1024 * 1024);
        assert_eq!(Capacity::mib(4096).kib(), 4096 * 1024);
        assert_eq!(Capacity::new(u64::MAX, SizeUnit::TiB).bytes(), u64::MAX);
    }

    #[test]
    fn test_subnet_membership() {
        let net = NetworkSpec::new(
            "lab",
            "virbr10",
            Ipv4Addr::new(10, 10, 0, 1),
            Ipv4Addr::new(255, 255, 255, 0),
        );
        assert!(net.subnet_contains(Ipv4Addr::new(10, 10, 0, 200)));
        assert!(!net.subnet_contains(Ipv4Addr::new(10, 10, 1, 2)));
    }

    #[test]
    fn test_derived_identifier_is_stable() {
        let a = DomainSpec::new("server-1");
        let b = DomainSpec::new("server-1");
        assert_eq!(a.identifier(), b.identifier());
        assert_ne!(a.identifier(), DomainSpec::new("server-2").identifier());
        // Same name, different kind
        assert_ne!(
            derive_uuid(ResourceKind::Domain, "lab"),
            derive_uuid(ResourceKind::Network, "lab")
        );
    }

    #[test]
    fn test_derived_mac() {
        let id = DomainSpec::new("web").identifier();
        let mac = derive_mac(&id, 0);
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
        assert_eq!(mac, derive_mac(&id, 0));
        assert_ne!(mac, derive_mac(&id, 1));
        assert_ne!(mac, derive_mac(&DomainSpec::new("db").identifier(), 0));
    }

    #[test]
    fn test_volume_entry_defaults_to_present() {
        let entry: VolumeEntry = serde_json::from_str(
            r#"{"name": "root", "capacity": {"value": 20, "unit": "GiB"}}"#,
        )
        .unwrap();
        assert!(entry.present);
        assert_eq!(entry.name(), "root");
        assert_eq!(entry.volume.format, VolumeFormat::Qcow2);
    }

    #[test]
    fn test_single_interface_is_not_a_list() {
        // A bare mapping where a list is expected must be rejected, not coerced.
        let result: std::result::Result<DomainSpec, _> = serde_json::from_str(
            r#"{"name": "vm", "memory": {"value": 2}, "vcpus": 1,
                "interfaces": {"network": "lab"}}"#,
        );
        assert!(result.is_err());
    }
}
