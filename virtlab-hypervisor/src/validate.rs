//! Desired-state validation.
//!
//! Validation is pure and runs every rule to completion, so a caller sees all
//! problems in one pass. The reconciler refuses to make any hypervisor call
//! while this returns a non-empty list.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use uuid::Uuid;

use crate::desired::DesiredState;
use crate::error::{ResourceKind, ValidationError};
use crate::types::*;

/// Validate a desired state, returning every error found in declaration order.
pub fn validate(state: &DesiredState) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    check_identity(
        ResourceKind::Network,
        state.networks.iter().map(|n| (n.name.as_str(), n.uuid.as_deref(), n.identifier())),
        &mut errors,
    );
    check_identity(
        ResourceKind::Pool,
        state.pools.iter().map(|p| (p.name.as_str(), p.uuid.as_deref(), p.identifier())),
        &mut errors,
    );
    check_identity(
        ResourceKind::Domain,
        state.domains.iter().map(|d| (d.name.as_str(), d.uuid.as_deref(), d.identifier())),
        &mut errors,
    );

    for network in state.networks.iter() {
        check_network(network, &mut errors);
    }
    for pool in state.pools.iter() {
        check_pool(pool, &mut errors);
    }
    for domain in state.domains.iter() {
        check_domain(state, domain, &mut errors);
    }
    check_static_addresses(state, &mut errors);

    errors
}

/// Names must be non-empty and unique; pinned UUIDs must parse and be unique.
fn check_identity<'a>(
    kind: ResourceKind,
    items: impl Iterator<Item = (&'a str, Option<&'a str>, String)>,
    errors: &mut Vec<ValidationError>,
) {
    let mut names: HashSet<&str> = HashSet::new();
    let mut uuids: HashMap<Uuid, &str> = HashMap::new();

    for (name, pinned, identifier) in items {
        if name.trim().is_empty() {
            errors.push(ValidationError::EmptyName { kind });
        } else if !names.insert(name) {
            errors.push(ValidationError::DuplicateName { kind, name: name.to_string() });
            continue;
        }

        let parsed = match Uuid::parse_str(&identifier) {
            Ok(uuid) => uuid,
            Err(_) => {
                errors.push(ValidationError::InvalidUuid {
                    kind,
                    name: name.to_string(),
                    uuid: pinned.unwrap_or_default().to_string(),
                });
                continue;
            }
        };
        if let Some(other) = uuids.insert(parsed, name) {
            errors.push(ValidationError::DuplicateUuid {
                kind,
                name: name.to_string(),
                uuid: parsed.to_string(),
                other: other.to_string(),
            });
        }
    }
}

fn check_network(network: &NetworkSpec, errors: &mut Vec<ValidationError>) {
    let mask = u32::from(network.netmask);
    if mask.leading_ones() + mask.trailing_zeros() != 32 || mask == 0 {
        errors.push(ValidationError::InvalidNetmask {
            network: network.name.clone(),
            netmask: network.netmask,
        });
        // Subnet checks are meaningless without a usable mask
        return;
    }

    let Some(range) = network.dhcp else {
        return;
    };
    let invalid = |reason: String| ValidationError::InvalidRange {
        network: network.name.clone(),
        reason,
    };

    if u32::from(range.start) > u32::from(range.end) {
        errors.push(invalid(format!("DHCP start {} is after end {}", range.start, range.end)));
    }
    for bound in [range.start, range.end] {
        if !network.subnet_contains(bound) {
            errors.push(invalid(format!(
                "DHCP bound {} is outside {}/{}",
                bound, network.gateway, network.netmask
            )));
        }
    }
    if range.contains(network.gateway) {
        errors.push(invalid(format!("gateway {} lies inside the DHCP range", network.gateway)));
    }
}

fn check_pool(pool: &StoragePoolSpec, errors: &mut Vec<ValidationError>) {
    if pool.target.trim().is_empty() {
        errors.push(ValidationError::InvalidPool {
            pool: pool.name.clone(),
            reason: "target path is empty".to_string(),
        });
    }
    match (pool.kind, &pool.source) {
        (PoolKind::Logical, None) => errors.push(ValidationError::InvalidPool {
            pool: pool.name.clone(),
            reason: "logical pools need a source volume group".to_string(),
        }),
        (PoolKind::Fs, None) => errors.push(ValidationError::InvalidPool {
            pool: pool.name.clone(),
            reason: "fs pools need a source device".to_string(),
        }),
        _ => {}
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for entry in &pool.volumes {
        let name = entry.name();
        if name.trim().is_empty() {
            errors.push(ValidationError::EmptyName { kind: ResourceKind::Volume });
            continue;
        }
        if !seen.insert(name) {
            errors.push(ValidationError::DuplicateVolume {
                pool: pool.name.clone(),
                volume: name.to_string(),
            });
            continue;
        }
        if entry.present && entry.volume.capacity.bytes() == 0 {
            errors.push(ValidationError::ZeroCapacity {
                pool: pool.name.clone(),
                volume: name.to_string(),
            });
        }
    }
}

fn check_domain(state: &DesiredState, domain: &DomainSpec, errors: &mut Vec<ValidationError>) {
    let invalid = |reason: &str| ValidationError::InvalidDomain {
        domain: domain.name.clone(),
        reason: reason.to_string(),
    };

    if domain.vcpus == 0 {
        errors.push(invalid("vcpus must be at least 1"));
    }
    if domain.memory.kib() == 0 {
        errors.push(invalid("memory must be at least 1 KiB"));
    }

    for interface in &domain.interfaces {
        if state.network(&interface.network).is_none() {
            errors.push(ValidationError::UnresolvedNetwork {
                domain: domain.name.clone(),
                network: interface.network.clone(),
            });
        }
        if let Some(mac) = &interface.mac {
            if !is_valid_mac(mac) {
                errors.push(invalid(&format!("invalid MAC address '{}'", mac)));
            }
        }
    }

    for attachment in domain.attachments() {
        check_attachment(state, domain, attachment, errors);
    }

    let mut tags: HashSet<&str> = HashSet::new();
    for mount in &domain.mounts {
        let invalid_mount = |reason: String| ValidationError::InvalidMount {
            domain: domain.name.clone(),
            reason,
        };
        if !mount.host_path.starts_with('/') {
            errors.push(invalid_mount(format!("host path '{}' is not absolute", mount.host_path)));
        }
        if mount.mount_tag.trim().is_empty() {
            errors.push(invalid_mount("mount tag is empty".to_string()));
        } else if !tags.insert(mount.mount_tag.as_str()) {
            errors.push(invalid_mount(format!("duplicate mount tag '{}'", mount.mount_tag)));
        }
    }
}

fn check_attachment(
    state: &DesiredState,
    domain: &DomainSpec,
    attachment: &DiskAttachment,
    errors: &mut Vec<ValidationError>,
) {
    let Some(pool) = state.pool(&attachment.pool) else {
        errors.push(ValidationError::UnresolvedPool {
            domain: domain.name.clone(),
            pool: attachment.pool.clone(),
        });
        return;
    };
    let Some(entry) = pool.volume(&attachment.volume) else {
        errors.push(ValidationError::UnresolvedVolume {
            domain: domain.name.clone(),
            pool: attachment.pool.clone(),
            volume: attachment.volume.clone(),
        });
        return;
    };

    if !entry.present {
        errors.push(ValidationError::VolumeMarkedAbsent {
            domain: domain.name.clone(),
            pool: attachment.pool.clone(),
            volume: attachment.volume.clone(),
        });
    } else if let Some(declared) = attachment.format {
        if declared != entry.volume.format {
            errors.push(ValidationError::FormatMismatch {
                domain: domain.name.clone(),
                pool: attachment.pool.clone(),
                volume: attachment.volume.clone(),
                declared: declared.as_str().to_string(),
                actual: entry.volume.format.as_str().to_string(),
            });
        }
    }
}

/// Static addresses must sit in their network's subnet, outside its DHCP
/// range, and be unique per network.
fn check_static_addresses(state: &DesiredState, errors: &mut Vec<ValidationError>) {
    let mut assigned: HashMap<(&str, Ipv4Addr), &str> = HashMap::new();

    for domain in state.domains.iter() {
        for interface in &domain.interfaces {
            let (Some(address), Some(network)) = (interface.address, state.network(&interface.network))
            else {
                continue;
            };
            let invalid = |reason: String| ValidationError::InvalidStaticAddress {
                network: network.name.clone(),
                domain: domain.name.clone(),
                address,
                reason,
            };

            if !network.subnet_contains(address) {
                errors.push(invalid(format!(
                    "outside {}/{}",
                    network.gateway, network.netmask
                )));
                continue;
            }
            if address == network.gateway {
                errors.push(invalid("equal to the gateway".to_string()));
                continue;
            }
            if network.dhcp.is_some_and(|range| range.contains(address)) {
                errors.push(ValidationError::DhcpOverlap {
                    network: network.name.clone(),
                    domain: domain.name.clone(),
                    address,
                });
            }
            if let Some(other) = assigned.insert((network.name.as_str(), address), domain.name.as_str()) {
                errors.push(invalid(format!("already assigned to {}", other)));
            }
        }
    }
}

fn is_valid_mac(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab_network() -> NetworkSpec {
        NetworkSpec::new(
            "lab",
            "virbr10",
            Ipv4Addr::new(10, 10, 0, 1),
            Ipv4Addr::new(255, 255, 255, 0),
        )
        .with_dhcp(Ipv4Addr::new(10, 10, 0, 100), Ipv4Addr::new(10, 10, 0, 199))
    }

    fn lab_pool() -> StoragePoolSpec {
        StoragePoolSpec::dir("lab-pool", "/var/lib/libvirt/images/lab")
            .with_volume(VolumeEntry::present(VolumeSpec::new(
                "root",
                Capacity::gib(20),
                VolumeFormat::Qcow2,
            )))
            .with_volume(VolumeEntry::absent("old"))
    }

    fn vm() -> DomainSpec {
        DomainSpec::new("vm")
            .with_disk(DiskAttachment::new("lab-pool", "root"))
            .with_interface(NetworkInterface::new("lab"))
    }

    fn state(domains: Vec<DomainSpec>) -> DesiredState {
        DesiredState::new()
            .with_networks(vec![lab_network()])
            .with_pools(vec![lab_pool()])
            .with_domains(domains)
    }

    #[test]
    fn test_valid_state() {
        assert!(validate(&state(vec![vm()])).is_empty());
    }

    #[test]
    fn test_reports_all_errors() {
        let broken = DomainSpec::new("vm")
            .with_vcpus(0)
            .with_interface(NetworkInterface::new("missing-net"))
            .with_disk(DiskAttachment::new("lab-pool", "nope"))
            .with_disk(DiskAttachment::new("other-pool", "root"));
        let errors = validate(&state(vec![broken, vm(), vm()]));

        assert!(errors.contains(&ValidationError::UnresolvedNetwork {
            domain: "vm".to_string(),
            network: "missing-net".to_string(),
        }));
        assert!(errors.contains(&ValidationError::UnresolvedVolume {
            domain: "vm".to_string(),
            pool: "lab-pool".to_string(),
            volume: "nope".to_string(),
        }));
        assert!(errors.contains(&ValidationError::UnresolvedPool {
            domain: "vm".to_string(),
            pool: "other-pool".to_string(),
        }));
        assert!(errors.contains(&ValidationError::DuplicateName {
            kind: ResourceKind::Domain,
            name: "vm".to_string(),
        }));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidDomain { .. })));
    }

    #[test]
    fn test_unmanaged_networks_do_not_resolve() {
        let state = DesiredState::new().with_pools(vec![lab_pool()]).with_domains(vec![vm()]);
        let errors = validate(&state);
        assert_eq!(
            errors,
            vec![ValidationError::UnresolvedNetwork {
                domain: "vm".to_string(),
                network: "lab".to_string(),
            }]
        );
    }

    #[test]
    fn test_dhcp_overlap() {
        let mut domain = vm();
        domain.interfaces[0] = NetworkInterface::new("lab").with_address(Ipv4Addr::new(10, 10, 0, 150));
        let errors = validate(&state(vec![domain]));
        assert_eq!(
            errors,
            vec![ValidationError::DhcpOverlap {
                network: "lab".to_string(),
                domain: "vm".to_string(),
                address: Ipv4Addr::new(10, 10, 0, 150),
            }]
        );
    }

    #[test]
    fn test_static_address_rules() {
        let mut a = vm();
        a.interfaces[0].address = Some(Ipv4Addr::new(10, 10, 0, 10));
        let mut b = vm();
        b.name = "vm-b".to_string();
        b.interfaces[0].address = Some(Ipv4Addr::new(10, 10, 0, 10));
        let mut c = vm();
        c.name = "vm-c".to_string();
        c.interfaces[0].address = Some(Ipv4Addr::new(192, 168, 1, 10));
        let mut d = vm();
        d.name = "vm-d".to_string();
        d.interfaces[0].address = Some(Ipv4Addr::new(10, 10, 0, 1));

        let errors = validate(&state(vec![a, b, c, d]));
        assert_eq!(errors.len(), 3);
        assert!(errors
            .iter()
            .all(|e| matches!(e, ValidationError::InvalidStaticAddress { .. })));
    }

    #[test]
    fn test_invalid_dhcp_range() {
        let network = NetworkSpec::new(
            "lab",
            "virbr10",
            Ipv4Addr::new(10, 10, 0, 1),
            Ipv4Addr::new(255, 255, 255, 0),
        )
        .with_dhcp(Ipv4Addr::new(10, 10, 0, 200), Ipv4Addr::new(10, 10, 1, 10));
        let errors = validate(&DesiredState::new().with_networks(vec![network]));
        // start > end is fine numerically here, but the end is outside the subnet
        assert_eq!(errors.len(), 1);

        let reversed = lab_network().with_dhcp(Ipv4Addr::new(10, 10, 0, 50), Ipv4Addr::new(10, 10, 0, 20));
        let errors = validate(&DesiredState::new().with_networks(vec![reversed]));
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ValidationError::InvalidRange { .. }));

        let gateway_inside = lab_network().with_dhcp(Ipv4Addr::new(10, 10, 0, 1), Ipv4Addr::new(10, 10, 0, 20));
        let errors = validate(&DesiredState::new().with_networks(vec![gateway_inside]));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_netmask_must_be_contiguous() {
        let mut network = lab_network();
        network.netmask = Ipv4Addr::new(255, 0, 255, 0);
        let errors = validate(&DesiredState::new().with_networks(vec![network]));
        assert!(matches!(errors[..], [ValidationError::InvalidNetmask { .. }]));
    }

    #[test]
    fn test_volume_rules() {
        let pool = lab_pool()
            .with_volume(VolumeEntry::present(VolumeSpec::new("root", Capacity::gib(1), VolumeFormat::Raw)))
            .with_volume(VolumeEntry::present(VolumeSpec::new("empty", Capacity::gib(0), VolumeFormat::Raw)));
        let errors = validate(&DesiredState::new().with_pools(vec![pool]));
        assert_eq!(
            errors,
            vec![
                ValidationError::DuplicateVolume {
                    pool: "lab-pool".to_string(),
                    volume: "root".to_string(),
                },
                ValidationError::ZeroCapacity {
                    pool: "lab-pool".to_string(),
                    volume: "empty".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_reference_to_absent_volume() {
        let domain = vm().with_disk(DiskAttachment::new("lab-pool", "old"));
        let errors = validate(&state(vec![domain]));
        assert!(matches!(errors[..], [ValidationError::VolumeMarkedAbsent { .. }]));
    }

    #[test]
    fn test_format_mismatch() {
        let mut domain = vm();
        domain.disks[0].format = Some(VolumeFormat::Raw);
        let errors = validate(&state(vec![domain]));
        assert!(matches!(errors[..], [ValidationError::FormatMismatch { .. }]));
    }

    #[test]
    fn test_mount_rules() {
        let domain = vm()
            .with_mount(ShareMount::new("relative/path", "share"))
            .with_mount(ShareMount::new("/srv/a", "share"))
            .with_mount(ShareMount::new("/srv/b", " "));
        let errors = validate(&state(vec![domain]));
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|e| matches!(e, ValidationError::InvalidMount { .. })));
    }

    #[test]
    fn test_uuid_rules() {
        let mut a = lab_network();
        a.uuid = Some("not-a-uuid".to_string());
        let mut b = lab_network();
        b.name = "lab-2".to_string();
        b.uuid = Some("c7a5fdbd-cdaf-9455-926a-d65c16db1809".to_string());
        let mut c = lab_network();
        c.name = "lab-3".to_string();
        c.uuid = b.uuid.clone();

        let errors = validate(&DesiredState::new().with_networks(vec![a, b, c]));
        assert!(matches!(
            errors[..],
            [ValidationError::InvalidUuid { .. }, ValidationError::DuplicateUuid { .. }]
        ));
    }

    #[test]
    fn test_mac_validation() {
        assert!(is_valid_mac("52:54:00:ab:cd:ef"));
        assert!(!is_valid_mac("52:54:00:ab:cd"));
        assert!(!is_valid_mac("52:54:00:ab:cd:zz"));
    }
}
