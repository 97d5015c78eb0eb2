//! Error types for the hypervisor client and reconciliation engine.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of hypervisor resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Network,
    Pool,
    Volume,
    Domain,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Pool => "pool",
            ResourceKind::Volume => "volume",
            ResourceKind::Domain => "domain",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by a [`HypervisorClient`](crate::HypervisorClient).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    /// Failed to connect to the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// Resource was not found.
    #[error("{kind} not found: {name}")]
    NotFound { kind: ResourceKind, name: String },

    /// A resource with the same name but a conflicting identity exists.
    #[error("Conflicting {kind} definition for {name}: {reason}")]
    Conflict { kind: ResourceKind, name: String, reason: String },

    /// Failed to define a resource.
    #[error("Failed to define {kind}: {reason}")]
    DefineFailed { kind: ResourceKind, reason: String },

    /// Failed to undefine a resource.
    #[error("Failed to undefine {kind} {name}: {reason}")]
    UndefineFailed { kind: ResourceKind, name: String, reason: String },

    /// Failed to start a resource.
    #[error("Failed to start {kind} {name}: {reason}")]
    StartFailed { kind: ResourceKind, name: String, reason: String },

    /// Failed to stop a resource.
    #[error("Failed to stop {kind} {name}: {reason}")]
    StopFailed { kind: ResourceKind, name: String, reason: String },

    /// The requested change cannot be applied in place.
    #[error("Unsupported change: {0}")]
    Unsupported(String),

    /// Query failed.
    #[error("Failed to query: {0}")]
    QueryFailed(String),

    /// XML generation/parsing error.
    #[error("XML error: {0}")]
    XmlError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

/// A single desired-state validation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{kind} has an empty name")]
    EmptyName { kind: ResourceKind },

    #[error("duplicate {kind} name: {name}")]
    DuplicateName { kind: ResourceKind, name: String },

    #[error("{kind} {name}: invalid uuid '{uuid}'")]
    InvalidUuid { kind: ResourceKind, name: String, uuid: String },

    #[error("{kind} {name}: uuid {uuid} already used by {other}")]
    DuplicateUuid { kind: ResourceKind, name: String, uuid: String, other: String },

    #[error("pool {pool}: duplicate volume name {volume}")]
    DuplicateVolume { pool: String, volume: String },

    #[error("pool {pool}: volume {volume} has zero capacity")]
    ZeroCapacity { pool: String, volume: String },

    #[error("pool {pool}: {reason}")]
    InvalidPool { pool: String, reason: String },

    #[error("network {network}: netmask {netmask} is not contiguous")]
    InvalidNetmask { network: String, netmask: Ipv4Addr },

    #[error("network {network}: invalid range: {reason}")]
    InvalidRange { network: String, reason: String },

    #[error("network {network}: static address {address} of domain {domain} lies inside the DHCP range")]
    DhcpOverlap { network: String, domain: String, address: Ipv4Addr },

    #[error("network {network}: static address {address} of domain {domain} is invalid: {reason}")]
    InvalidStaticAddress { network: String, domain: String, address: Ipv4Addr, reason: String },

    #[error("domain {domain}: references unknown network {network}")]
    UnresolvedNetwork { domain: String, network: String },

    #[error("domain {domain}: references unknown pool {pool}")]
    UnresolvedPool { domain: String, pool: String },

    #[error("domain {domain}: references unknown volume {pool}/{volume}")]
    UnresolvedVolume { domain: String, pool: String, volume: String },

    #[error("domain {domain}: references volume {pool}/{volume} which is marked for deletion")]
    VolumeMarkedAbsent { domain: String, pool: String, volume: String },

    #[error("domain {domain}: disk {pool}/{volume} declared as {declared} but the volume is {actual}")]
    FormatMismatch { domain: String, pool: String, volume: String, declared: String, actual: String },

    #[error("domain {domain}: {reason}")]
    InvalidDomain { domain: String, reason: String },

    #[error("domain {domain}: invalid share mount: {reason}")]
    InvalidMount { domain: String, reason: String },
}

/// Every validation error found in one desired-state submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s)", self.0.len())?;
        for error in &self.0 {
            write!(f, "\n  - {}", error)?;
        }
        Ok(())
    }
}

/// Errors that abort a reconciliation before any mutation.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("desired state rejected: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("reconciliation cancelled before it started")]
    Cancelled,
}
