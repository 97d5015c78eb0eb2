//! Topology file loading.

use anyhow::{Context, Result};
use std::path::Path;

use virtlab_hypervisor::{DesiredState, TopologyFile};

/// Read a topology file. `.json` files are parsed as JSON, anything else as YAML.
pub fn load<P: AsRef<Path>>(path: P) -> Result<TopologyFile> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read topology file: {}", path.display()))?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse topology file: {}", path.display()))
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse topology file: {}", path.display()))
    }
}

/// Load a topology file and expand its profiles.
///
/// Every failure here is a rejection of the input, reported before the
/// hypervisor is contacted.
pub fn desired_state<P: AsRef<Path>>(path: P) -> std::result::Result<DesiredState, String> {
    let topology = load(path).map_err(|e| format!("{:#}", e))?;
    topology.into_desired_state().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            "networks: unmanaged\npools:\n  managed: []\ndomains:\n  managed:\n    - profile: client\n      name: desk\n      pool: images\n      disk: desk-root\n"
        )
        .unwrap();

        let topology = load(file.path()).unwrap();
        assert!(!topology.networks.is_managed());
        assert_eq!(topology.pools.items().map(|p| p.len()), Some(0));

        let desired = topology.into_desired_state().unwrap();
        let desk = desired.domains.iter().next().unwrap();
        assert_eq!(desk.name, "desk");
        assert_eq!(desk.interfaces.len(), 1);
    }

    #[test]
    fn test_load_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"networks": {{"managed": []}}}}"#).unwrap();

        let topology = load(file.path()).unwrap();
        assert!(topology.networks.is_managed());
        assert!(!topology.domains.is_managed());
    }

    #[test]
    fn test_single_mapping_where_list_expected_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            "domains:\n  managed:\n    - name: vm\n      memory: {{ value: 1, unit: GiB }}\n      vcpus: 1\n      interfaces:\n        network: lab\n"
        )
        .unwrap();

        assert!(load(file.path()).is_err());
    }

    #[test]
    fn test_malformed_topology_is_a_rejection() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(file, "networks: [unterminated\n").unwrap();

        let message = desired_state(file.path()).unwrap_err();
        assert!(message.contains("Failed to parse topology file"), "{}", message);
    }

    #[test]
    fn test_unknown_profile_is_a_rejection() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            "domains:\n  managed:\n    - profile: mainframe\n      name: big\n      pool: images\n      disk: big-root\n"
        )
        .unwrap();

        let message = desired_state(file.path()).unwrap_err();
        assert!(message.contains("unknown profile 'mainframe'"), "{}", message);
    }
}
