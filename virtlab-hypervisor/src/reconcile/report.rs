//! Structured result of one apply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ResourceKind;

/// Failure reason prefix for resources skipped because something they
/// reference failed.
pub const DEPENDENCY_FAILED: &str = "dependency_failed";

/// Failure reason for resources not started because the apply was cancelled.
pub const CANCELLED: &str = "cancelled";

/// What an update changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateDetail {
    /// Definition replaced
    Definition,
    /// Only new interfaces appended after the existing ones
    InterfacesAppended { count: usize },
    /// Volume grown in place
    Resized { from_bytes: u64, to_bytes: u64 },
    /// Definition unchanged, network or pool started
    Activated,
    /// Definition unchanged, domain power state changed
    PowerChanged { running: bool },
}

/// Result for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created,
    Updated { detail: UpdateDetail },
    Unchanged,
    Deleted,
    SkippedUnmanaged,
    Failed { operation: String, reason: String },
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }

    /// Whether the live state was changed.
    pub fn is_change(&self) -> bool {
        matches!(self, Outcome::Created | Outcome::Updated { .. } | Outcome::Deleted)
    }
}

/// Report line for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub kind: ResourceKind,
    /// Resource name; volumes are `pool/volume`
    pub name: String,
    pub outcome: Outcome,
    /// Whether any hypervisor call was made for this resource
    pub started: bool,
}

impl ResourceReport {
    pub fn new(kind: ResourceKind, name: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            kind,
            name: name.into(),
            outcome,
            started: true,
        }
    }

    pub fn skipped(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            started: false,
            ..Self::new(kind, name, Outcome::SkippedUnmanaged)
        }
    }

    pub fn failed(
        kind: ResourceKind,
        name: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            kind,
            name,
            Outcome::Failed {
                operation: operation.into(),
                reason: reason.into(),
            },
        )
    }

    /// Failure recorded without any call having been made.
    pub fn not_started(
        kind: ResourceKind,
        name: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            started: false,
            ..Self::failed(kind, name, operation, reason)
        }
    }

    pub fn cancelled(kind: ResourceKind, name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::not_started(kind, name, operation, CANCELLED)
    }

    pub fn dependency_failed(
        kind: ResourceKind,
        name: impl Into<String>,
        operation: impl Into<String>,
        dependency: &str,
    ) -> Self {
        Self::not_started(
            kind,
            name,
            operation,
            format!("{}: {}", DEPENDENCY_FAILED, dependency),
        )
    }

    pub fn is_failed(&self) -> bool {
        self.outcome.is_failed()
    }
}

/// Per-outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Result of one apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub resources: Vec<ResourceReport>,
    /// True when no resource failed
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ApplyReport {
    pub fn new(resources: Vec<ResourceReport>, started_at: DateTime<Utc>) -> Self {
        let success = !resources.iter().any(ResourceReport::is_failed);
        Self {
            resources,
            success,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Report line for a resource.
    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<&ResourceReport> {
        self.resources.iter().find(|r| r.kind == kind && r.name == name)
    }

    pub fn outcome(&self, kind: ResourceKind, name: &str) -> Option<&Outcome> {
        self.get(kind, name).map(|r| &r.outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ResourceReport> {
        self.resources.iter().filter(|r| r.is_failed())
    }

    /// Resources whose live state was changed.
    pub fn changes(&self) -> impl Iterator<Item = &ResourceReport> {
        self.resources.iter().filter(|r| r.outcome.is_change())
    }

    pub fn summary(&self) -> ReportSummary {
        self.resources
            .iter()
            .fold(ReportSummary::default(), |mut summary, r| {
                match r.outcome {
                    Outcome::Created => summary.created += 1,
                    Outcome::Updated { .. } => summary.updated += 1,
                    Outcome::Unchanged => summary.unchanged += 1,
                    Outcome::Deleted => summary.deleted += 1,
                    Outcome::SkippedUnmanaged => summary.skipped += 1,
                    Outcome::Failed { .. } => summary.failed += 1,
                }
                summary
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_json_shape() {
        let json = serde_json::to_value(Outcome::Created).unwrap();
        assert_eq!(json, serde_json::json!("created"));

        let json = serde_json::to_value(Outcome::SkippedUnmanaged).unwrap();
        assert_eq!(json, serde_json::json!("skipped_unmanaged"));

        let json = serde_json::to_value(Outcome::Updated {
            detail: UpdateDetail::InterfacesAppended { count: 1 },
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"updated": {"detail": {"interfaces_appended": {"count": 1}}}})
        );

        let json = serde_json::to_value(Outcome::Failed {
            operation: "define".to_string(),
            reason: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json["failed"]["operation"], "define");
    }

    #[test]
    fn test_success_and_summary() {
        let report = ApplyReport::new(
            vec![
                ResourceReport::new(ResourceKind::Network, "lab", Outcome::Created),
                ResourceReport::skipped(ResourceKind::Pool, "default"),
                ResourceReport::dependency_failed(ResourceKind::Domain, "vm", "define", "network lab"),
            ],
            Utc::now(),
        );

        assert!(!report.success);
        let summary = report.summary();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(report.changes().count(), 1);

        let vm = report.get(ResourceKind::Domain, "vm").unwrap();
        assert!(!vm.started);
        assert!(matches!(&vm.outcome, Outcome::Failed { reason, .. } if reason.starts_with(DEPENDENCY_FAILED)));
    }

    #[test]
    fn test_empty_report_succeeds() {
        assert!(ApplyReport::new(Vec::new(), Utc::now()).success);
    }
}
