//! Reconciliation engine.
//!
//! One apply is a single pass:
//!
//! 1. validate the desired state (nothing is called when it is rejected)
//! 2. networks and pools, with their volumes, through a bounded worker pool
//! 3. barrier
//! 4. domains, then deletion of domains no longer desired
//! 5. deletion of volumes marked absent, then of pools and networks no longer
//!    desired, guarded against live domains that still reference them
//!
//! Live state is listed at the start of every apply and never cached.

pub mod plan;
pub mod report;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use plan::{classify_domain_update, DomainReferences, KindPlan, VolumeState};
pub use report::{
    ApplyReport, Outcome, ReportSummary, ResourceReport, UpdateDetail, CANCELLED, DEPENDENCY_FAILED,
};

use crate::desired::{DesiredState, Managed};
use crate::error::{HypervisorError, ReconcileError, ResourceKind, Result};
use crate::traits::HypervisorClient;
use crate::types::{DomainSpec, NetworkSpec, PoolKind, PowerPolicy, StoragePoolSpec, VolumeEntry};
use crate::xml;

/// Default bound on concurrent network/pool work.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Options for one apply.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Maximum number of resources reconciled at once
    pub max_parallel: usize,
    /// Checked before each resource's work starts; in-flight calls finish
    pub cancel: CancellationToken,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            cancel: CancellationToken::new(),
        }
    }
}

impl ApplyOptions {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A failed step within one resource's work.
struct StepError {
    operation: &'static str,
    error: HypervisorError,
}

type StepResult<T> = std::result::Result<T, StepError>;

trait During<T> {
    /// Tag an error with the operation that was attempted.
    fn during(self, operation: &'static str) -> StepResult<T>;
}

impl<T> During<T> for Result<T> {
    fn during(self, operation: &'static str) -> StepResult<T> {
        self.map_err(|error| StepError { operation, error })
    }
}

trait Named {
    fn name(&self) -> &str;
}

impl Named for NetworkSpec {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for StoragePoolSpec {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for DomainSpec {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Networks, pools and volumes that failed before the domain phase.
///
/// A volume only counts when it may not exist: its create failed, or its pool
/// could not be listed. A failed update leaves the volume usable.
#[derive(Debug, Default)]
struct FailedDependencies {
    networks: HashSet<String>,
    pools: HashSet<String>,
    volumes: HashSet<String>,
}

impl FailedDependencies {
    fn from_reports(reports: &[ResourceReport]) -> Self {
        let mut failed = Self::default();
        for report in reports {
            let Outcome::Failed { operation, .. } = &report.outcome else {
                continue;
            };
            let set = match report.kind {
                ResourceKind::Network => &mut failed.networks,
                ResourceKind::Pool => &mut failed.pools,
                ResourceKind::Volume if operation == "create" || operation == "list" => {
                    &mut failed.volumes
                }
                ResourceKind::Volume | ResourceKind::Domain => continue,
            };
            set.insert(report.name.clone());
        }
        failed
    }

    /// First failed resource the domain references.
    fn blocking(&self, domain: &DomainSpec) -> Option<String> {
        if let Some(iface) = domain.interfaces.iter().find(|i| self.networks.contains(&i.network)) {
            return Some(format!("network {}", iface.network));
        }
        domain.attachments().find_map(|a| {
            let volume = format!("{}/{}", a.pool, a.volume);
            if self.pools.contains(&a.pool) {
                Some(format!("pool {}", a.pool))
            } else if self.volumes.contains(&volume) {
                Some(format!("volume {}", volume))
            } else {
                None
            }
        })
    }
}

/// References held by the live domains at delete time, from both their
/// persistent and running definitions.
struct LiveReferences(Vec<(String, DomainReferences)>);

impl LiveReferences {
    /// A live domain still referencing the network, pool or `pool/volume`.
    fn referencing(&self, kind: ResourceKind, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(_, refs)| match kind {
                ResourceKind::Network => refs.networks.contains(name),
                ResourceKind::Pool => refs.pools.contains(name),
                ResourceKind::Volume => refs.volumes.contains(name),
                ResourceKind::Domain => false,
            })
            .map(|(domain, _)| domain.as_str())
    }
}

/// Work items of the infrastructure phase.
enum InfraUnit<'a> {
    Network(&'a NetworkSpec, bool),
    Pool(&'a StoragePoolSpec, bool),
}

fn with_activation(outcome: Outcome, activated: bool) -> Outcome {
    match outcome {
        Outcome::Unchanged if activated => Outcome::Updated {
            detail: UpdateDetail::Activated,
        },
        other => other,
    }
}

fn volume_name(pool: &StoragePoolSpec, entry: &VolumeEntry) -> String {
    format!("{}/{}", pool.name, entry.name())
}

fn volume_operation(entry: &VolumeEntry) -> &'static str {
    if entry.present {
        "create"
    } else {
        "delete"
    }
}

fn operation_for(exists: bool) -> &'static str {
    if exists {
        "update"
    } else {
        "create"
    }
}

/// Turn a step result into a report line.
fn finish(kind: ResourceKind, name: &str, result: StepResult<Outcome>) -> ResourceReport {
    match result {
        Ok(outcome) => ResourceReport::new(kind, name, outcome),
        Err(StepError { operation, error }) => {
            warn!(kind = %kind, name = %name, operation, error = %error, "Resource failed");
            ResourceReport::failed(kind, name, operation, error.to_string())
        }
    }
}

/// Applies desired state against one hypervisor.
pub struct Reconciler {
    client: Arc<dyn HypervisorClient>,
    options: ApplyOptions,
}

impl Reconciler {
    pub fn new(client: Arc<dyn HypervisorClient>) -> Self {
        Self {
            client,
            options: ApplyOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// Bring the hypervisor into agreement with `desired`.
    ///
    /// Returns an error only when nothing was attempted: the desired state
    /// failed validation, or the apply was cancelled before it began.
    /// Per-resource failures are reported in the [`ApplyReport`].
    #[instrument(skip(self, desired))]
    pub async fn apply(&self, desired: &DesiredState) -> std::result::Result<ApplyReport, ReconcileError> {
        if let Err(errors) = desired.validate() {
            warn!(errors = errors.0.len(), "Desired state rejected");
            return Err(errors.into());
        }
        if self.options.cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }

        let started_at = Utc::now();
        let capabilities = self.client.capabilities();
        info!(backend = %capabilities.name, max_parallel = self.options.max_parallel, "Starting apply");

        let mut resources = Vec::new();

        // Networks and pools
        let network_plan = self
            .plan_kind(ResourceKind::Network, &desired.networks, &mut resources)
            .await;
        let pool_plan = self
            .plan_kind(ResourceKind::Pool, &desired.pools, &mut resources)
            .await;

        let mut units = Vec::new();
        if let Some(plan) = &network_plan {
            units.extend(
                desired
                    .networks
                    .iter()
                    .map(|spec| InfraUnit::Network(spec, plan.exists(&spec.name))),
            );
        }
        if let Some(plan) = &pool_plan {
            units.extend(
                desired
                    .pools
                    .iter()
                    .map(|spec| InfraUnit::Pool(spec, plan.exists(&spec.name))),
            );
        }

        // Collecting the whole stream is the barrier before domains
        let infra = self.run_bounded(units, |unit| self.reconcile_infra(unit)).await;
        resources.extend(infra.into_iter().flatten());
        debug!("Infrastructure phase complete");

        // Domains
        let failed = FailedDependencies::from_reports(&resources);
        let domain_plan = self
            .plan_kind(ResourceKind::Domain, &desired.domains, &mut resources)
            .await;

        if let Some(plan) = &domain_plan {
            let units: Vec<(&DomainSpec, bool)> = desired
                .domains
                .iter()
                .map(|spec| (spec, plan.exists(&spec.name)))
                .collect();
            let domains = self
                .run_bounded(units, |(spec, exists)| {
                    self.reconcile_domain(desired, spec, exists, &failed)
                })
                .await;
            resources.extend(domains);

            let deleted = self
                .run_bounded(plan.delete.clone(), |name| self.delete_domain(name))
                .await;
            resources.extend(deleted);
        }

        // Volumes marked absent, then pools and networks no longer desired.
        // Pools that failed already reported their volumes.
        let volume_pools: Vec<&StoragePoolSpec> = match &pool_plan {
            Some(_) => desired
                .pools
                .iter()
                .filter(|pool| !failed.pools.contains(&pool.name))
                .filter(|pool| pool.volumes.iter().any(|entry| !entry.present))
                .collect(),
            None => Vec::new(),
        };
        let mut deletes: Vec<(ResourceKind, String)> = Vec::new();
        if let Some(plan) = &pool_plan {
            deletes.extend(plan.delete.iter().map(|n| (ResourceKind::Pool, n.clone())));
        }
        if let Some(plan) = &network_plan {
            deletes.extend(plan.delete.iter().map(|n| (ResourceKind::Network, n.clone())));
        }
        resources.extend(self.delete_infrastructure(volume_pools, deletes).await);

        let report = ApplyReport::new(resources, started_at);
        let summary = report.summary();
        info!(
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            deleted = summary.deleted,
            skipped = summary.skipped,
            failed = summary.failed,
            "Apply finished"
        );
        Ok(report)
    }

    /// Run `work` over `items` with bounded concurrency, keeping input order.
    async fn run_bounded<I, F, Fut>(&self, items: Vec<I>, work: F) -> Vec<Fut::Output>
    where
        F: Fn(I) -> Fut,
        Fut: Future,
    {
        let mut results: Vec<(usize, Fut::Output)> = stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| {
                let fut = work(item);
                async move { (index, fut.await) }
            })
            .buffer_unordered(self.options.max_parallel.max(1))
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, output)| output).collect()
    }

    // =========================================================================
    // Planning
    // =========================================================================

    async fn list(&self, kind: ResourceKind) -> Result<Vec<String>> {
        match kind {
            ResourceKind::Network => self.client.list_networks().await,
            ResourceKind::Pool => self.client.list_pools().await,
            ResourceKind::Domain => self.client.list_domains().await,
            ResourceKind::Volume => Err(HypervisorError::Internal(
                "volumes are listed per pool".to_string(),
            )),
        }
    }

    /// Plan a managed kind, or report the live resources of an unmanaged one.
    ///
    /// Returns `None` when there is nothing further to do for the kind.
    async fn plan_kind<T: Named>(
        &self,
        kind: ResourceKind,
        desired: &Managed<T>,
        resources: &mut Vec<ResourceReport>,
    ) -> Option<KindPlan> {
        let live = self.list(kind).await;

        let Some(items) = desired.items() else {
            match live {
                Ok(names) => {
                    debug!(kind = %kind, count = names.len(), "Kind is unmanaged");
                    resources.extend(names.into_iter().map(|n| ResourceReport::skipped(kind, n)));
                }
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Failed to list unmanaged kind");
                    resources.push(ResourceReport::failed(kind, "*", "list", e.to_string()));
                }
            }
            return None;
        };

        match live {
            Ok(names) => Some(KindPlan::new(items.iter().map(Named::name), &names)),
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to list live resources");
                resources.extend(
                    items
                        .iter()
                        .map(|item| ResourceReport::failed(kind, item.name(), "list", e.to_string())),
                );
                None
            }
        }
    }

    // =========================================================================
    // Shared steps
    // =========================================================================

    async fn define(&self, kind: ResourceKind, xml: &str) -> Result<()> {
        match kind {
            ResourceKind::Network => self.client.define_network(xml).await,
            ResourceKind::Pool => self.client.define_pool(xml).await,
            ResourceKind::Domain => self.client.define_domain(xml).await,
            ResourceKind::Volume => Err(HypervisorError::Internal(
                "volumes are created, not defined".to_string(),
            )),
        }
    }

    async fn definition(&self, kind: ResourceKind, name: &str) -> Result<String> {
        match kind {
            ResourceKind::Network => self.client.network_definition(name).await,
            ResourceKind::Pool => self.client.pool_definition(name).await,
            ResourceKind::Domain => self.client.domain_definition(name).await,
            ResourceKind::Volume => Err(HypervisorError::Internal(
                "volume definitions are read per pool".to_string(),
            )),
        }
    }

    async fn is_active(&self, kind: ResourceKind, name: &str) -> Result<bool> {
        match kind {
            ResourceKind::Network => self.client.is_network_active(name).await,
            ResourceKind::Pool => self.client.is_pool_active(name).await,
            ResourceKind::Domain => self.client.is_domain_active(name).await,
            ResourceKind::Volume => Err(HypervisorError::Internal(
                "volumes have no active state".to_string(),
            )),
        }
    }

    /// Define the resource if it is missing or its live definition differs.
    async fn define_if_changed(
        &self,
        kind: ResourceKind,
        name: &str,
        xml: &str,
        exists: bool,
    ) -> StepResult<Outcome> {
        if !exists {
            self.define(kind, xml).await.during("define")?;
            info!(kind = %kind, name = %name, "Created");
            return Ok(Outcome::Created);
        }

        let live = self.definition(kind, name).await.during("read")?;
        if self.client.definitions_match(xml, &live) {
            debug!(kind = %kind, name = %name, "Definition unchanged");
            return Ok(Outcome::Unchanged);
        }

        let detail = if kind == ResourceKind::Domain {
            classify_domain_update(xml, &live)
        } else {
            UpdateDetail::Definition
        };
        self.define(kind, xml).await.during("define")?;
        info!(kind = %kind, name = %name, detail = ?detail, "Updated");
        Ok(Outcome::Updated { detail })
    }

    /// Start a network or pool if it is not active. Returns whether it was started.
    async fn ensure_active(&self, kind: ResourceKind, name: &str) -> StepResult<bool> {
        if self.is_active(kind, name).await.during("query")? {
            return Ok(false);
        }
        let started = match kind {
            ResourceKind::Network => self.client.start_network(name).await,
            _ => self.client.start_pool(name).await,
        };
        started.during("start")?;
        info!(kind = %kind, name = %name, "Started");
        Ok(true)
    }

    // =========================================================================
    // Networks and pools
    // =========================================================================

    async fn reconcile_infra(&self, unit: InfraUnit<'_>) -> Vec<ResourceReport> {
        match unit {
            InfraUnit::Network(spec, exists) => vec![self.reconcile_network(spec, exists).await],
            InfraUnit::Pool(spec, exists) => self.reconcile_pool(spec, exists).await,
        }
    }

    #[instrument(skip(self, spec), fields(network = %spec.name))]
    async fn reconcile_network(&self, spec: &NetworkSpec, exists: bool) -> ResourceReport {
        let kind = ResourceKind::Network;
        if self.options.cancel.is_cancelled() {
            return ResourceReport::cancelled(kind, &spec.name, operation_for(exists));
        }
        let xml = xml::render_network(spec);
        finish(kind, &spec.name, self.define_and_start(kind, &spec.name, &xml, exists).await)
    }

    async fn define_and_start(
        &self,
        kind: ResourceKind,
        name: &str,
        xml: &str,
        exists: bool,
    ) -> StepResult<Outcome> {
        let outcome = self.define_if_changed(kind, name, xml, exists).await?;
        let started = self.ensure_active(kind, name).await?;
        Ok(with_activation(outcome, started))
    }

    #[instrument(skip(self, spec), fields(pool = %spec.name))]
    async fn reconcile_pool(&self, spec: &StoragePoolSpec, exists: bool) -> Vec<ResourceReport> {
        let kind = ResourceKind::Pool;
        if self.options.cancel.is_cancelled() {
            let mut reports = vec![ResourceReport::cancelled(kind, &spec.name, operation_for(exists))];
            reports.extend(spec.volumes.iter().map(|entry| {
                ResourceReport::cancelled(ResourceKind::Volume, volume_name(spec, entry), volume_operation(entry))
            }));
            return reports;
        }

        let xml = xml::render_pool(spec);
        let pool = finish(kind, &spec.name, self.define_and_start(kind, &spec.name, &xml, exists).await);

        if pool.is_failed() {
            let dependency = format!("pool {}", spec.name);
            let mut reports = vec![pool];
            reports.extend(spec.volumes.iter().map(|entry| {
                ResourceReport::dependency_failed(
                    ResourceKind::Volume,
                    volume_name(spec, entry),
                    volume_operation(entry),
                    &dependency,
                )
            }));
            return reports;
        }

        let mut reports = vec![pool];
        reports.extend(self.reconcile_volumes(spec).await);
        reports
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Create or update the present volumes of a pool, one at a time.
    ///
    /// Live volumes not listed in the pool are left alone. Volumes marked
    /// absent are deleted after the domain phase.
    async fn reconcile_volumes(&self, pool: &StoragePoolSpec) -> Vec<ResourceReport> {
        let entries: Vec<&VolumeEntry> = pool.volumes.iter().filter(|e| e.present).collect();
        if entries.is_empty() {
            return Vec::new();
        }
        if self.options.cancel.is_cancelled() {
            return entries
                .iter()
                .map(|entry| {
                    ResourceReport::cancelled(ResourceKind::Volume, volume_name(pool, entry), volume_operation(entry))
                })
                .collect();
        }

        let live = match self.client.list_volumes(&pool.name).await {
            Ok(live) => live,
            Err(e) => {
                warn!(pool = %pool.name, error = %e, "Failed to list volumes");
                return entries
                    .iter()
                    .map(|entry| ResourceReport::failed(ResourceKind::Volume, volume_name(pool, entry), "list", e.to_string()))
                    .collect();
            }
        };
        let live: HashSet<&str> = live.iter().map(String::as_str).collect();

        let mut reports = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = volume_name(pool, entry);
            let exists = live.contains(entry.name());
            if self.options.cancel.is_cancelled() {
                reports.push(ResourceReport::cancelled(ResourceKind::Volume, name, operation_for(exists)));
                continue;
            }
            let result = if exists {
                self.update_volume(pool, entry).await
            } else {
                self.create_volume(pool, entry).await
            };
            reports.push(finish(ResourceKind::Volume, &name, result));
        }
        reports
    }

    async fn create_volume(&self, pool: &StoragePoolSpec, entry: &VolumeEntry) -> StepResult<Outcome> {
        let volume = &entry.volume;
        let xml = xml::render_volume(pool.kind, volume);
        self.client.create_volume(&pool.name, &xml).await.during("create")?;
        info!(pool = %pool.name, volume = %volume.name, "Volume created");
        Ok(Outcome::Created)
    }

    /// Bring an existing volume in line; only growing in place is supported.
    async fn update_volume(&self, pool: &StoragePoolSpec, entry: &VolumeEntry) -> StepResult<Outcome> {
        let volume = &entry.volume;
        let desired_xml = xml::render_volume(pool.kind, volume);
        let live_xml = self
            .client
            .volume_definition(&pool.name, &volume.name)
            .await
            .during("read")?;

        if self.client.definitions_match(&desired_xml, &live_xml) {
            return Ok(Outcome::Unchanged);
        }

        let live = VolumeState::parse(&live_xml).during("read")?;
        let desired_bytes = volume.capacity.bytes();
        let unsupported = |reason: String| StepError {
            operation: "update",
            error: HypervisorError::Unsupported(reason),
        };

        if pool.kind != PoolKind::Logical {
            if let Some(format) = live.format.as_deref().filter(|f| *f != volume.format.as_str()) {
                return Err(unsupported(format!(
                    "volume {}/{} is {} and cannot be converted to {}",
                    pool.name,
                    volume.name,
                    format,
                    volume.format.as_str()
                )));
            }
        }
        if desired_bytes <= live.capacity_bytes {
            return Err(unsupported(format!(
                "volume {}/{} has {} bytes; only growing is supported (desired {} bytes)",
                pool.name, volume.name, live.capacity_bytes, desired_bytes
            )));
        }
        if !self.client.capabilities().supports_volume_resize {
            return Err(unsupported(format!(
                "{} cannot resize volume {}/{} in place",
                self.client.capabilities().name,
                pool.name,
                volume.name
            )));
        }

        self.client
            .resize_volume(&pool.name, &volume.name, desired_bytes)
            .await
            .during("resize")?;
        info!(
            pool = %pool.name,
            volume = %volume.name,
            from_bytes = live.capacity_bytes,
            to_bytes = desired_bytes,
            "Volume resized"
        );
        Ok(Outcome::Updated {
            detail: UpdateDetail::Resized {
                from_bytes: live.capacity_bytes,
                to_bytes: desired_bytes,
            },
        })
    }

    // =========================================================================
    // Domains
    // =========================================================================

    #[instrument(skip(self, desired, spec, failed), fields(domain = %spec.name))]
    async fn reconcile_domain(
        &self,
        desired: &DesiredState,
        spec: &DomainSpec,
        exists: bool,
        failed: &FailedDependencies,
    ) -> ResourceReport {
        let kind = ResourceKind::Domain;
        let operation = operation_for(exists);

        if self.options.cancel.is_cancelled() {
            return ResourceReport::cancelled(kind, &spec.name, operation);
        }
        if let Some(dependency) = failed.blocking(spec) {
            warn!(dependency = %dependency, "Skipping domain, dependency failed");
            return ResourceReport::dependency_failed(kind, &spec.name, operation, &dependency);
        }

        let xml = xml::render_domain(&desired.resolve_formats(spec));
        finish(kind, &spec.name, self.define_and_power(spec, &xml, exists).await)
    }

    async fn define_and_power(&self, spec: &DomainSpec, xml: &str, exists: bool) -> StepResult<Outcome> {
        let outcome = self
            .define_if_changed(ResourceKind::Domain, &spec.name, xml, exists)
            .await?;
        let power = self.apply_power(&spec.name, spec.power).await?;
        Ok(match (outcome, power) {
            (Outcome::Unchanged, Some(running)) => Outcome::Updated {
                detail: UpdateDetail::PowerChanged { running },
            },
            (outcome, _) => outcome,
        })
    }

    /// Apply the power policy. Returns the new state when it was changed.
    async fn apply_power(&self, name: &str, policy: PowerPolicy) -> StepResult<Option<bool>> {
        let want_running = match policy {
            PowerPolicy::Unmanaged => return Ok(None),
            PowerPolicy::Running => true,
            PowerPolicy::Stopped => false,
        };

        let running = self.client.is_domain_active(name).await.during("query")?;
        if running == want_running {
            return Ok(None);
        }

        if want_running {
            self.client.start_domain(name).await.during("start")?;
            info!(domain = %name, "Domain started");
        } else {
            self.client.shutdown_domain(name).await.during("shutdown")?;
            info!(domain = %name, "Domain shutdown requested");
        }
        Ok(Some(want_running))
    }

    #[instrument(skip(self))]
    async fn delete_domain(&self, name: String) -> ResourceReport {
        let kind = ResourceKind::Domain;
        if self.options.cancel.is_cancelled() {
            return ResourceReport::cancelled(kind, name, "delete");
        }
        let result = self
            .client
            .undefine_domain(&name)
            .await
            .during("delete")
            .map(|()| {
                info!(domain = %name, "Domain undefined");
                Outcome::Deleted
            });
        finish(kind, &name, result)
    }

    // =========================================================================
    // Infrastructure deletion
    // =========================================================================

    /// Re-read every live domain and collect what it references. A running
    /// domain also holds on to what its running definition references.
    async fn live_references(&self) -> Result<LiveReferences> {
        let mut references = Vec::new();
        for domain in self.client.list_domains().await? {
            let xml = self.client.domain_definition(&domain).await?;
            let mut refs = DomainReferences::parse(&xml)?;
            if self.client.is_domain_active(&domain).await? {
                let running = self.client.running_domain_definition(&domain).await?;
                refs.merge(DomainReferences::parse(&running)?);
            }
            references.push((domain, refs));
        }
        Ok(LiveReferences(references))
    }

    async fn delete_infrastructure(
        &self,
        volume_pools: Vec<&StoragePoolSpec>,
        deletes: Vec<(ResourceKind, String)>,
    ) -> Vec<ResourceReport> {
        let mut targets: Vec<(ResourceKind, String)> = volume_pools
            .iter()
            .flat_map(|pool| {
                pool.volumes
                    .iter()
                    .filter(|entry| !entry.present)
                    .map(move |entry| (ResourceKind::Volume, volume_name(pool, entry)))
            })
            .collect();
        targets.extend(deletes.iter().cloned());
        if targets.is_empty() {
            return Vec::new();
        }

        if self.options.cancel.is_cancelled() {
            return targets
                .into_iter()
                .map(|(kind, name)| ResourceReport::cancelled(kind, name, "delete"))
                .collect();
        }

        let references = match self.live_references().await {
            Ok(references) => references,
            Err(e) => {
                warn!(error = %e, "Failed to read live domain references");
                return targets
                    .into_iter()
                    .map(|(kind, name)| {
                        ResourceReport::not_started(
                            kind,
                            name,
                            "delete",
                            format!("cannot check live domain references: {}", e),
                        )
                    })
                    .collect();
            }
        };

        let mut reports: Vec<ResourceReport> = self
            .run_bounded(volume_pools, |pool| self.delete_volumes(pool, &references))
            .await
            .into_iter()
            .flatten()
            .collect();
        reports.extend(
            self.run_bounded(deletes, |(kind, name)| self.delete_unreferenced(kind, name, &references))
                .await,
        );
        reports
    }

    /// Delete the volumes a pool marks absent, one at a time.
    #[instrument(skip(self, pool, references), fields(pool = %pool.name))]
    async fn delete_volumes(&self, pool: &StoragePoolSpec, references: &LiveReferences) -> Vec<ResourceReport> {
        let kind = ResourceKind::Volume;
        let entries: Vec<&VolumeEntry> = pool.volumes.iter().filter(|e| !e.present).collect();

        let live = match self.client.list_volumes(&pool.name).await {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "Failed to list volumes");
                return entries
                    .iter()
                    .map(|entry| ResourceReport::failed(kind, volume_name(pool, entry), "list", e.to_string()))
                    .collect();
            }
        };

        let mut reports = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = volume_name(pool, entry);
            if self.options.cancel.is_cancelled() {
                reports.push(ResourceReport::cancelled(kind, name, "delete"));
                continue;
            }
            if !live.iter().any(|v| v == entry.name()) {
                reports.push(ResourceReport::new(kind, name, Outcome::Unchanged));
                continue;
            }
            if let Some(domain) = references.referencing(kind, &name) {
                warn!(volume = %name, domain = %domain, "Refusing to delete, still attached");
                reports.push(ResourceReport::not_started(
                    kind,
                    &name,
                    "delete",
                    format!("still referenced by live domain {}", domain),
                ));
                continue;
            }

            let result = self
                .client
                .delete_volume(&pool.name, entry.name())
                .await
                .during("delete")
                .map(|()| {
                    info!(volume = %name, "Volume deleted");
                    Outcome::Deleted
                });
            reports.push(finish(kind, &name, result));
        }
        reports
    }

    #[instrument(skip(self, references))]
    async fn delete_unreferenced(
        &self,
        kind: ResourceKind,
        name: String,
        references: &LiveReferences,
    ) -> ResourceReport {
        if self.options.cancel.is_cancelled() {
            return ResourceReport::cancelled(kind, name, "delete");
        }
        if let Some(domain) = references.referencing(kind, &name) {
            warn!(domain = %domain, "Refusing to delete, still referenced");
            return ResourceReport::not_started(
                kind,
                &name,
                "delete",
                format!("still referenced by live domain {}", domain),
            );
        }
        let result = self.stop_and_undefine(kind, &name).await;
        finish(kind, &name, result)
    }

    async fn stop_and_undefine(&self, kind: ResourceKind, name: &str) -> StepResult<Outcome> {
        if self.is_active(kind, name).await.during("query")? {
            let stopped = match kind {
                ResourceKind::Network => self.client.stop_network(name).await,
                _ => self.client.stop_pool(name).await,
            };
            stopped.during("stop")?;
        }
        let undefined = match kind {
            ResourceKind::Network => self.client.undefine_network(name).await,
            _ => self.client.undefine_pool(name).await,
        };
        undefined.during("delete")?;
        info!(kind = %kind, name = %name, "Deleted");
        Ok(Outcome::Deleted)
    }
}
