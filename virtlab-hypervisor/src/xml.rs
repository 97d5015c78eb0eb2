//! XML generation for libvirt network, storage pool, volume and domain definitions.
//!
//! Every builder is a pure function of its spec: the same spec always renders
//! the same document, which lets the reconciler diff by comparing documents.

use std::borrow::Cow;

use quick_xml::escape::escape;

use crate::types::*;

/// OVMF firmware image with secure boot support.
pub const OVMF_SECBOOT_CODE: &str = "/usr/share/OVMF/OVMF_CODE.secboot.fd";
/// Variable store template matching [`OVMF_SECBOOT_CODE`].
pub const OVMF_SECBOOT_VARS: &str = "/usr/share/OVMF/OVMF_VARS.secboot.fd";
/// Directory for per-domain UEFI variable stores.
pub const NVRAM_DIR: &str = "/var/lib/libvirt/qemu/nvram";

fn esc(value: &str) -> Cow<'_, str> {
    escape(value)
}

/// Render a network definition.
pub fn render_network(spec: &NetworkSpec) -> String {
    NetworkXmlBuilder::new(spec).build()
}

/// Render a storage pool definition (volumes are rendered separately).
pub fn render_pool(spec: &StoragePoolSpec) -> String {
    PoolXmlBuilder::new(spec).build()
}

/// Render a volume definition for a pool of the given kind.
pub fn render_volume(kind: PoolKind, spec: &VolumeSpec) -> String {
    VolumeXmlBuilder::new(kind, spec).build()
}

/// Render a domain definition.
///
/// Attachments without a format get a driver without a `type`; callers
/// normally pass the result of [`DesiredState::resolve_formats`](crate::DesiredState::resolve_formats).
pub fn render_domain(spec: &DomainSpec) -> String {
    DomainXmlBuilder::new(spec).build()
}

// =============================================================================
// NETWORK
// =============================================================================

/// Builder for libvirt network XML.
pub struct NetworkXmlBuilder<'a> {
    spec: &'a NetworkSpec,
}

impl<'a> NetworkXmlBuilder<'a> {
    pub fn new(spec: &'a NetworkSpec) -> Self {
        Self { spec }
    }

    pub fn build(&self) -> String {
        let spec = self.spec;
        let mut xml = String::from("<network>\n");
        xml.push_str(&format!("  <name>{}</name>\n", esc(&spec.name)));
        xml.push_str(&format!("  <uuid>{}</uuid>\n", spec.identifier().to_lowercase()));

        match spec.forward {
            ForwardMode::Nat => xml.push_str("  <forward mode='nat'/>\n"),
            ForwardMode::Route => xml.push_str("  <forward mode='route'/>\n"),
            // No forward element: guests only reach each other and the host
            ForwardMode::Isolated => {}
        }

        xml.push_str(&format!(
            "  <bridge name='{}' stp='on' delay='0'/>\n",
            esc(&spec.bridge)
        ));

        match &spec.dhcp {
            Some(range) => {
                xml.push_str(&format!(
                    "  <ip address='{}' netmask='{}'>\n    <dhcp>\n      <range start='{}' end='{}'/>\n    </dhcp>\n  </ip>\n",
                    spec.gateway, spec.netmask, range.start, range.end
                ));
            }
            None => {
                xml.push_str(&format!(
                    "  <ip address='{}' netmask='{}'/>\n",
                    spec.gateway, spec.netmask
                ));
            }
        }

        xml.push_str("</network>\n");
        xml
    }
}

// =============================================================================
// STORAGE
// =============================================================================

/// Builder for libvirt storage pool XML.
pub struct PoolXmlBuilder<'a> {
    spec: &'a StoragePoolSpec,
}

impl<'a> PoolXmlBuilder<'a> {
    pub fn new(spec: &'a StoragePoolSpec) -> Self {
        Self { spec }
    }

    pub fn build(&self) -> String {
        let spec = self.spec;
        let mut xml = format!("<pool type='{}'>\n", spec.kind.as_str());
        xml.push_str(&format!("  <name>{}</name>\n", esc(&spec.name)));
        xml.push_str(&format!("  <uuid>{}</uuid>\n", spec.identifier().to_lowercase()));

        match (spec.kind, &spec.source) {
            (PoolKind::Logical, Some(source)) => xml.push_str(&format!(
                "  <source>\n    <name>{}</name>\n    <format type='lvm2'/>\n  </source>\n",
                esc(source)
            )),
            (PoolKind::Fs, Some(source)) => xml.push_str(&format!(
                "  <source>\n    <device path='{}'/>\n    <format type='auto'/>\n  </source>\n",
                esc(source)
            )),
            _ => {}
        }

        xml.push_str(&format!(
            "  <target>\n    <path>{}</path>\n  </target>\n",
            esc(&spec.target)
        ));
        xml.push_str("</pool>\n");
        xml
    }
}

/// Builder for libvirt storage volume XML.
pub struct VolumeXmlBuilder<'a> {
    kind: PoolKind,
    spec: &'a VolumeSpec,
}

impl<'a> VolumeXmlBuilder<'a> {
    pub fn new(kind: PoolKind, spec: &'a VolumeSpec) -> Self {
        Self { kind, spec }
    }

    pub fn build(&self) -> String {
        let mut xml = String::from("<volume>\n");
        xml.push_str(&format!("  <name>{}</name>\n", esc(&self.spec.name)));
        xml.push_str(&format!(
            "  <capacity unit='bytes'>{}</capacity>\n",
            self.spec.capacity.bytes()
        ));
        // Logical volumes have no file format
        if self.kind != PoolKind::Logical {
            xml.push_str(&format!(
                "  <target>\n    <format type='{}'/>\n  </target>\n",
                self.spec.format.as_str()
            ));
        }
        xml.push_str("</volume>\n");
        xml
    }
}

// =============================================================================
// DOMAIN
// =============================================================================

/// Builder for libvirt domain XML.
pub struct DomainXmlBuilder<'a> {
    spec: &'a DomainSpec,
}

impl<'a> DomainXmlBuilder<'a> {
    pub fn new(spec: &'a DomainSpec) -> Self {
        Self { spec }
    }

    /// Build the domain XML string.
    pub fn build(&self) -> String {
        let spec = self.spec;
        let mut xml = String::new();

        xml.push_str(&format!(
            r#"<domain type='kvm'>
  <name>{}</name>
  <uuid>{}</uuid>
  <memory unit='KiB'>{}</memory>
  <vcpu placement='static'>{}</vcpu>
"#,
            esc(&spec.name),
            spec.identifier().to_lowercase(),
            spec.memory.kib(),
            spec.vcpus
        ));

        xml.push_str(&self.build_memory_backing());
        xml.push_str(&self.build_os_section());
        xml.push_str(&self.build_features_section());
        xml.push_str("  <cpu mode='host-passthrough' check='none' migratable='on'/>\n");
        xml.push_str("  <clock offset='utc'>\n    <timer name='rtc' tickpolicy='catchup'/>\n    <timer name='pit' tickpolicy='delay'/>\n    <timer name='hpet' present='no'/>\n  </clock>\n");
        xml.push_str(
            r#"  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
"#,
        );

        xml.push_str("  <devices>\n");
        xml.push_str(&self.build_disks());
        xml.push_str(&self.build_cdroms());
        xml.push_str(&self.build_interfaces());
        xml.push_str(&self.build_filesystems());
        xml.push_str(&self.build_tpm());
        xml.push_str(&self.build_console());
        xml.push_str(&self.build_graphics());
        xml.push_str(&self.build_channels());
        xml.push_str("  </devices>\n");

        xml.push_str("</domain>\n");
        xml
    }

    /// virtiofs requires shared guest memory.
    fn build_memory_backing(&self) -> String {
        if self.spec.mounts.is_empty() {
            return String::new();
        }
        "  <memoryBacking>\n    <source type='memfd'/>\n    <access mode='shared'/>\n  </memoryBacking>\n"
            .to_string()
    }

    fn build_os_section(&self) -> String {
        let mut xml = String::from("  <os>\n    <type arch='x86_64' machine='q35'>hvm</type>\n");

        if self.spec.firmware == FirmwareMode::Modern {
            xml.push_str(&format!(
                "    <loader readonly='yes' secure='yes' type='pflash'>{}</loader>\n",
                OVMF_SECBOOT_CODE
            ));
            xml.push_str(&format!(
                "    <nvram template='{}'>{}/{}_VARS.fd</nvram>\n",
                OVMF_SECBOOT_VARS,
                NVRAM_DIR,
                esc(&self.spec.name)
            ));
        }

        if !self.spec.disks.is_empty() {
            xml.push_str("    <boot dev='hd'/>\n");
        }
        if !self.spec.cdroms.is_empty() {
            xml.push_str("    <boot dev='cdrom'/>\n");
        }

        xml.push_str("  </os>\n");
        xml
    }

    fn build_features_section(&self) -> String {
        let mut xml = String::from("  <features>\n    <acpi/>\n    <apic/>\n");
        // Secure boot firmware refuses to run without SMM
        if self.spec.firmware == FirmwareMode::Modern {
            xml.push_str("    <smm state='on'/>\n");
        }
        xml.push_str("  </features>\n");
        xml
    }

    fn build_disks(&self) -> String {
        let mut xml = String::new();

        for (i, disk) in self.spec.disks.iter().enumerate() {
            xml.push_str(&format!(
                r#"    <disk type='volume' device='disk'>
      {}
      <source pool='{}' volume='{}'/>
      <target dev='vd{}' bus='virtio'/>
    </disk>
"#,
                driver(disk),
                esc(&disk.pool),
                esc(&disk.volume),
                device_suffix(i)
            ));
        }

        xml
    }

    fn build_cdroms(&self) -> String {
        let mut xml = String::new();

        for (i, cdrom) in self.spec.cdroms.iter().enumerate() {
            xml.push_str(&format!(
                r#"    <disk type='volume' device='cdrom'>
      {}
      <source pool='{}' volume='{}'/>
      <target dev='sd{}' bus='sata'/>
      <readonly/>
    </disk>
"#,
                driver(cdrom),
                esc(&cdrom.pool),
                esc(&cdrom.volume),
                device_suffix(i)
            ));
        }

        xml
    }

    /// Interfaces in declared order; the guest enumerates adapters in this order.
    ///
    /// Interfaces without a fixed MAC get one derived from the domain
    /// identifier and their position.
    fn build_interfaces(&self) -> String {
        let mut xml = String::new();
        let identifier = self.spec.identifier();

        for (i, interface) in self.spec.interfaces.iter().enumerate() {
            let mac = interface
                .mac
                .as_ref()
                .map(|m| m.to_lowercase())
                .unwrap_or_else(|| derive_mac(&identifier, i));

            xml.push_str(&format!(
                r#"    <interface type='network'>
      <mac address='{}'/>
      <source network='{}'/>
      <model type='{}'/>
    </interface>
"#,
                mac,
                esc(&interface.network),
                interface.model.as_str()
            ));
        }

        xml
    }

    fn build_filesystems(&self) -> String {
        let mut xml = String::new();

        for mount in &self.spec.mounts {
            xml.push_str(&format!(
                r#"    <filesystem type='mount' accessmode='passthrough'>
      <driver type='virtiofs'/>
      <source dir='{}'/>
      <target dir='{}'/>
{}    </filesystem>
"#,
                esc(&mount.host_path),
                esc(&mount.mount_tag),
                if mount.readonly { "      <readonly/>\n" } else { "" }
            ));
        }

        xml
    }

    fn build_tpm(&self) -> String {
        if !self.spec.tpm {
            return String::new();
        }
        "    <tpm model='tpm-crb'>\n      <backend type='emulator' version='2.0'/>\n    </tpm>\n"
            .to_string()
    }

    fn build_console(&self) -> String {
        r#"    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
"#
        .to_string()
    }

    fn build_graphics(&self) -> String {
        r#"    <graphics type='vnc' autoport='yes' listen='127.0.0.1'/>
    <video>
      <model type='virtio' heads='1' primary='yes'/>
    </video>
"#
        .to_string()
    }

    fn build_channels(&self) -> String {
        // QEMU guest agent channel, used by in-guest automation
        r#"    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
"#
        .to_string()
    }
}

fn driver(attachment: &DiskAttachment) -> String {
    match attachment.format {
        Some(format) => format!("<driver name='qemu' type='{}'/>", format.driver_type()),
        None => "<driver name='qemu'/>".to_string(),
    }
}

/// Device name suffix: a, b, ..., z, aa, ab, ...
fn device_suffix(index: usize) -> String {
    let mut n = index;
    let mut suffix = Vec::new();
    loop {
        suffix.push(b'a' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    suffix.reverse();
    String::from_utf8_lossy(&suffix).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn lab_network() -> NetworkSpec {
        NetworkSpec::new(
            "lab",
            "virbr10",
            Ipv4Addr::new(10, 10, 0, 1),
            Ipv4Addr::new(255, 255, 255, 0),
        )
    }

    #[test]
    fn test_network_xml() {
        let spec = lab_network().with_dhcp(Ipv4Addr::new(10, 10, 0, 100), Ipv4Addr::new(10, 10, 0, 199));
        let xml = render_network(&spec);

        assert!(xml.contains("<name>lab</name>"));
        assert!(xml.contains("<forward mode='nat'/>"));
        assert!(xml.contains("<bridge name='virbr10' stp='on' delay='0'/>"));
        assert!(xml.contains("<ip address='10.10.0.1' netmask='255.255.255.0'>"));
        assert!(xml.contains("<range start='10.10.0.100' end='10.10.0.199'/>"));
    }

    #[test]
    fn test_isolated_network_has_no_forward() {
        let spec = lab_network().with_forward(ForwardMode::Isolated);
        let xml = render_network(&spec);
        assert!(!xml.contains("<forward"));
        assert!(!xml.contains("<dhcp>"));
    }

    #[test]
    fn test_pool_and_volume_xml() {
        let pool = StoragePoolSpec::dir("lab-pool", "/var/lib/libvirt/images/lab");
        let xml = render_pool(&pool);
        assert!(xml.starts_with("<pool type='dir'>"));
        assert!(xml.contains("<path>/var/lib/libvirt/images/lab</path>"));

        let volume = VolumeSpec::new("root", Capacity::gib(1), VolumeFormat::Qcow2);
        let xml = render_volume(PoolKind::Dir, &volume);
        assert!(xml.contains("<capacity unit='bytes'>1073741824</capacity>"));
        assert!(xml.contains("<format type='qcow2'/>"));

        let xml = render_volume(PoolKind::Logical, &volume);
        assert!(!xml.contains("<format"));
    }

    #[test]
    fn test_logical_pool_source() {
        let mut pool = StoragePoolSpec::dir("vg", "/dev/labvg");
        pool.kind = PoolKind::Logical;
        pool.source = Some("labvg".to_string());
        let xml = render_pool(&pool);
        assert!(xml.starts_with("<pool type='logical'>"));
        assert!(xml.contains("<name>labvg</name>"));
    }

    #[test]
    fn test_modern_firmware_and_tpm() {
        let spec = DomainSpec::new("srv")
            .with_firmware(FirmwareMode::Modern)
            .with_tpm(true);
        let xml = render_domain(&spec);

        assert!(xml.contains(OVMF_SECBOOT_CODE));
        assert!(xml.contains("secure='yes'"));
        assert!(xml.contains("/var/lib/libvirt/qemu/nvram/srv_VARS.fd"));
        assert!(xml.contains("<smm state='on'/>"));
        assert!(xml.contains("<tpm model='tpm-crb'>"));
    }

    #[test]
    fn test_legacy_firmware() {
        let spec = DomainSpec::new("old").with_disk(DiskAttachment::new("p", "root"));
        let xml = render_domain(&spec);
        assert!(!xml.contains("<loader"));
        assert!(!xml.contains("<smm"));
        assert!(!xml.contains("<tpm"));
        assert!(xml.contains("<boot dev='hd'/>"));
    }

    #[test]
    fn test_domain_devices() {
        let mut disk = DiskAttachment::new("p", "root");
        disk.format = Some(VolumeFormat::Qcow2);
        let mut media = DiskAttachment::new("p", "install.iso");
        media.format = Some(VolumeFormat::Iso);

        let spec = DomainSpec::new("vm")
            .with_memory(Capacity::gib(4))
            .with_vcpus(2)
            .with_disk(disk)
            .with_cdrom(media)
            .with_mount(ShareMount::new("/srv/share", "share"));
        let xml = render_domain(&spec);

        assert!(xml.contains("<memory unit='KiB'>4194304</memory>"));
        assert!(xml.contains("<vcpu placement='static'>2</vcpu>"));
        assert!(xml.contains("<driver name='qemu' type='qcow2'/>"));
        assert!(xml.contains("<source pool='p' volume='root'/>"));
        assert!(xml.contains("<target dev='vda' bus='virtio'/>"));
        assert!(xml.contains("<driver name='qemu' type='raw'/>"));
        assert!(xml.contains("<target dev='sda' bus='sata'/>"));
        assert!(xml.contains("<driver type='virtiofs'/>"));
        assert!(xml.contains("<target dir='share'/>"));
        assert!(xml.contains("<access mode='shared'/>"));
    }

    #[test]
    fn test_interfaces_keep_declared_order() {
        let spec = DomainSpec::new("vm")
            .with_interface(NetworkInterface::new("zeta"))
            .with_interface(NetworkInterface::new("alpha").with_model(NicModel::E1000e));
        let xml = render_domain(&spec);

        let zeta = xml.find("network='zeta'").unwrap();
        let alpha = xml.find("network='alpha'").unwrap();
        assert!(zeta < alpha);
        assert!(xml.contains("<model type='e1000e'/>"));
    }

    #[test]
    fn test_interface_macs_are_stable() {
        let one = DomainSpec::new("vm").with_interface(NetworkInterface::new("lab"));
        let two = one
            .clone()
            .with_interface(NetworkInterface::new("mgmt").with_mac("52:54:00:AA:BB:CC"));

        let first = derive_mac(&one.identifier(), 0);
        assert!(render_domain(&one).contains(&format!("<mac address='{}'/>", first)));

        // Appending keeps the first adapter's address
        let xml = render_domain(&two);
        assert!(xml.contains(&format!("<mac address='{}'/>", first)));
        assert!(xml.contains("<mac address='52:54:00:aa:bb:cc'/>"));
    }

    #[test]
    fn test_escaping() {
        let spec = DomainSpec::new("a&b").with_mount(ShareMount::new("/srv/it's", "tag"));
        let xml = render_domain(&spec);
        assert!(xml.contains("<name>a&amp;b</name>"));
        assert!(xml.contains("dir='/srv/it&apos;s'"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let spec = DomainSpec::new("vm").with_interface(NetworkInterface::new("lab"));
        assert_eq!(render_domain(&spec), render_domain(&spec.clone()));
    }

    #[test]
    fn test_device_suffix() {
        assert_eq!(device_suffix(0), "a");
        assert_eq!(device_suffix(25), "z");
        assert_eq!(device_suffix(26), "aa");
        assert_eq!(device_suffix(27), "ab");
    }
}
