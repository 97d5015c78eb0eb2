//! # virtlab Hypervisor
//!
//! Declarative lab topologies for a single libvirt host.
//!
//! A topology of networks, storage pools (with volumes) and domains is
//! validated, rendered into libvirt XML and reconciled against the live
//! hypervisor:
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ DesiredState │──▶│  validate()  │──▶│  Reconciler  │
//! │  (profiles)  │   │  all errors  │   │ plan + apply │
//! └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                              │
//!                                 ┌────────────┴────────────┐
//!                                 ▼                         ▼
//!                       ┌───────────────────┐     ┌───────────────────┐
//!                       │  LibvirtBackend   │     │    MockBackend    │
//!                       │   (via libvirt)   │     │    (in memory)    │
//!                       └───────────────────┘     └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use virtlab_hypervisor::{expand, DesiredState, MockBackend, ProfileParams, Reconciler};
//!
//! #[tokio::main]
//! async fn main() {
//!     let vm = expand("server", &ProfileParams::new("web", "images", "web-root")).unwrap();
//!     let desired = DesiredState::new().with_domains(vec![vm]);
//!
//!     let reconciler = Reconciler::new(Arc::new(MockBackend::new()));
//!     let report = reconciler.apply(&desired).await.unwrap();
//!     assert!(report.success);
//! }
//! ```

pub mod desired;
pub mod document;
pub mod error;
pub mod libvirt;
pub mod mock;
pub mod profile;
pub mod reconcile;
pub mod traits;
pub mod types;
pub mod validate;
pub mod xml;

pub use desired::{DesiredState, Managed, TopologyFile};
pub use document::{definitions_match, Document, Element};
pub use error::{
    HypervisorError, ReconcileError, ResourceKind, Result, ValidationError, ValidationErrors,
};
pub use mock::{MockBackend, MockCall, MockOp};
pub use profile::{expand, DomainDecl, Profile, ProfileDecl, ProfileError, ProfileParams};
pub use reconcile::{
    ApplyOptions, ApplyReport, Outcome, ReportSummary, Reconciler, ResourceReport, UpdateDetail,
};
pub use traits::{ClientCapabilities, HypervisorClient};
pub use types::*;
pub use validate::validate;
pub use xml::{render_domain, render_network, render_pool, render_volume};

#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtBackend;
