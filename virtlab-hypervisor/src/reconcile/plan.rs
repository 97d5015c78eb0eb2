//! Pure planning helpers: set differences and live-definition inspection.

use std::collections::{BTreeSet, HashSet};

use crate::document::Document;
use crate::error::{HypervisorError, Result};

use super::report::UpdateDetail;

/// Create, compare and delete sets for one managed kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindPlan {
    /// Desired but not live, in desired order
    pub create: Vec<String>,
    /// Desired and live; updated only if the definitions differ
    pub compare: Vec<String>,
    /// Live but not desired, in live order
    pub delete: Vec<String>,
}

impl KindPlan {
    pub fn new<'a>(desired: impl IntoIterator<Item = &'a str>, live: &[String]) -> Self {
        let live_names: HashSet<&str> = live.iter().map(String::as_str).collect();
        let mut plan = KindPlan::default();
        let mut desired_names = HashSet::new();

        for name in desired {
            desired_names.insert(name);
            if live_names.contains(name) {
                plan.compare.push(name.to_string());
            } else {
                plan.create.push(name.to_string());
            }
        }

        plan.delete = live
            .iter()
            .filter(|name| !desired_names.contains(name.as_str()))
            .cloned()
            .collect();
        plan
    }

    pub fn exists(&self, name: &str) -> bool {
        self.compare.iter().any(|n| n == name)
    }
}

/// Classify the update of a domain whose definitions differ.
///
/// An update that keeps every live interface in place and only adds new ones
/// after them is reported as appended interfaces; anything else is a full
/// definition update.
pub fn classify_domain_update(desired_xml: &str, live_xml: &str) -> UpdateDetail {
    let (desired, live) = match (Document::parse(desired_xml), Document::parse(live_xml)) {
        (Ok(desired), Ok(live)) => (desired, live),
        _ => return UpdateDetail::Definition,
    };

    let desired_ifaces = desired.interfaces();
    let live_ifaces = live.interfaces();

    let prefix_kept = live_ifaces.len() < desired_ifaces.len()
        && desired_ifaces
            .iter()
            .zip(&live_ifaces)
            .all(|(d, l)| d.covered_by(l));
    let rest_unchanged = desired.without("interface").covered_by(&live.without("interface"));

    if prefix_kept && rest_unchanged {
        UpdateDetail::InterfacesAppended {
            count: desired_ifaces.len() - live_ifaces.len(),
        }
    } else {
        UpdateDetail::Definition
    }
}

/// Networks, pools and volumes referenced by a live domain definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainReferences {
    pub networks: BTreeSet<String>,
    pub pools: BTreeSet<String>,
    /// Attached volumes as `pool/volume`
    pub volumes: BTreeSet<String>,
}

impl DomainReferences {
    pub fn parse(xml: &str) -> Result<Self> {
        let doc = Document::parse(xml)?;
        let mut refs = DomainReferences::default();

        let Some(devices) = doc.root().child("devices") else {
            return Ok(refs);
        };

        for iface in devices.children_named("interface") {
            if let Some(network) = iface.child("source").and_then(|s| s.attr("network")) {
                refs.networks.insert(network.to_string());
            }
        }
        for disk in devices.children_named("disk") {
            let Some(source) = disk.child("source") else {
                continue;
            };
            if let Some(pool) = source.attr("pool") {
                refs.pools.insert(pool.to_string());
                if let Some(volume) = source.attr("volume") {
                    refs.volumes.insert(format!("{}/{}", pool, volume));
                }
            }
        }
        Ok(refs)
    }

    /// Add the references of another definition of the same domain.
    pub fn merge(&mut self, other: DomainReferences) {
        self.networks.extend(other.networks);
        self.pools.extend(other.pools);
        self.volumes.extend(other.volumes);
    }
}

/// Capacity and format of a live volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeState {
    pub capacity_bytes: u64,
    pub format: Option<String>,
}

impl VolumeState {
    pub fn parse(xml: &str) -> Result<Self> {
        let doc = Document::parse(xml)?;
        let capacity = doc
            .root()
            .child("capacity")
            .ok_or_else(|| HypervisorError::XmlError("volume has no capacity".to_string()))?;

        let value: u64 = capacity.text.parse().map_err(|_| {
            HypervisorError::XmlError(format!("invalid volume capacity '{}'", capacity.text))
        })?;
        let multiplier = unit_multiplier(capacity.attr("unit").unwrap_or("bytes")).ok_or_else(|| {
            HypervisorError::XmlError(format!(
                "unknown capacity unit '{}'",
                capacity.attr("unit").unwrap_or_default()
            ))
        })?;

        Ok(Self {
            capacity_bytes: value.saturating_mul(multiplier),
            format: doc
                .root()
                .find(&["target", "format"])
                .and_then(|f| f.attr("type"))
                .map(str::to_string),
        })
    }
}

/// Libvirt scaled-integer units.
fn unit_multiplier(unit: &str) -> Option<u64> {
    Some(match unit {
        "b" | "B" | "bytes" => 1,
        "K" | "KiB" => 1 << 10,
        "M" | "MiB" => 1 << 20,
        "G" | "GiB" => 1 << 30,
        "T" | "TiB" => 1 << 40,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plan_alpha_beta_gamma() {
        let plan = KindPlan::new(["alpha", "beta"], &names(&["alpha", "gamma"]));
        assert_eq!(plan.create, names(&["beta"]));
        assert_eq!(plan.compare, names(&["alpha"]));
        assert_eq!(plan.delete, names(&["gamma"]));
        assert!(plan.exists("alpha"));
        assert!(!plan.exists("beta"));
    }

    #[test]
    fn test_plan_empty_desired_deletes_everything() {
        let plan = KindPlan::new(std::iter::empty(), &names(&["a", "b"]));
        assert!(plan.create.is_empty());
        assert_eq!(plan.delete, names(&["a", "b"]));
    }

    const ONE_IFACE: &str = "<domain><memory unit='KiB'>1024</memory><devices><interface type='network'><source network='lab'/></interface></devices></domain>";
    const TWO_IFACES: &str = "<domain><memory unit='KiB'>1024</memory><devices><interface type='network'><source network='lab'/></interface><interface type='network'><source network='mgmt'/></interface></devices></domain>";

    #[test]
    fn test_classify_append() {
        assert_eq!(
            classify_domain_update(TWO_IFACES, ONE_IFACE),
            UpdateDetail::InterfacesAppended { count: 1 }
        );
    }

    #[test]
    fn test_classify_removal_and_other_changes() {
        assert_eq!(classify_domain_update(ONE_IFACE, TWO_IFACES), UpdateDetail::Definition);

        let grown = TWO_IFACES.replace(">1024<", ">2048<");
        assert_eq!(classify_domain_update(&grown, ONE_IFACE), UpdateDetail::Definition);

        let reordered = TWO_IFACES.replace("'lab'", "'tmp'").replace("'mgmt'", "'lab'");
        assert_eq!(classify_domain_update(&reordered, ONE_IFACE), UpdateDetail::Definition);
    }

    #[test]
    fn test_domain_references() {
        let refs = DomainReferences::parse(
            "<domain><devices><disk type='volume' device='disk'><source pool='lab-pool' volume='root'/></disk><interface type='network'><source network='lab'/></interface><interface type='bridge'><source bridge='br0'/></interface></devices></domain>",
        )
        .unwrap();
        assert_eq!(refs.networks.into_iter().collect::<Vec<_>>(), vec!["lab".to_string()]);
        assert_eq!(refs.pools.into_iter().collect::<Vec<_>>(), vec!["lab-pool".to_string()]);
        assert_eq!(refs.volumes.into_iter().collect::<Vec<_>>(), vec!["lab-pool/root".to_string()]);
    }

    #[test]
    fn test_merge_references() {
        let mut persistent = DomainReferences::parse(
            "<domain><devices><disk type='volume'><source pool='p' volume='new'/></disk></devices></domain>",
        )
        .unwrap();
        let running = DomainReferences::parse(
            "<domain><devices><disk type='volume'><source pool='p' volume='old'/></disk></devices></domain>",
        )
        .unwrap();
        persistent.merge(running);
        assert_eq!(
            persistent.volumes.into_iter().collect::<Vec<_>>(),
            vec!["p/new".to_string(), "p/old".to_string()]
        );
        assert_eq!(persistent.pools.len(), 1);
    }

    #[test]
    fn test_volume_state_units() {
        let state = VolumeState::parse(
            "<volume><name>v</name><capacity unit='G'>2</capacity><target><format type='qcow2'/></target></volume>",
        )
        .unwrap();
        assert_eq!(state.capacity_bytes, 2 << 30);
        assert_eq!(state.format.as_deref(), Some("qcow2"));

        let state = VolumeState::parse("<volume><capacity>512</capacity></volume>").unwrap();
        assert_eq!(state.capacity_bytes, 512);
        assert_eq!(state.format, None);

        assert!(VolumeState::parse("<volume><capacity unit='parsec'>1</capacity></volume>").is_err());
    }
}
