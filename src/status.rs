//! Per-mapping sync outcomes and their Prometheus exposition.

use chrono::{DateTime, Utc};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::sync::{AdminMetrics, GroupMapping, SyncMetrics};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MappingLabels {
    pub source_group: String,
    pub target_team: String,
}

impl From<&GroupMapping> for MappingLabels {
    fn from(mapping: &GroupMapping) -> Self {
        Self {
            source_group: mapping.source_group.clone(),
            target_team: mapping.target_team.clone(),
        }
    }
}

struct SyncMetricFamilies {
    users_added: Family<MappingLabels, Counter>,
    users_removed: Family<MappingLabels, Counter>,
    users_skipped: Family<MappingLabels, Counter>,
    errors: Family<MappingLabels, Counter>,
    duration_seconds: Family<MappingLabels, Histogram>,
    last_success_timestamp: Family<MappingLabels, Gauge>,
    last_success: Family<MappingLabels, Gauge>,
    admin_granted: Counter,
    admin_revoked: Counter,
    admin_errors: Counter,
    admin_last_success: Gauge,
}

impl SyncMetricFamilies {
    fn new() -> Self {
        Self {
            users_added: Family::default(),
            users_removed: Family::default(),
            users_skipped: Family::default(),
            errors: Family::default(),
            duration_seconds: Family::new_with_constructor(|| {
                Histogram::new([0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0].into_iter())
            }),
            last_success_timestamp: Family::default(),
            last_success: Family::default(),
            admin_granted: Counter::default(),
            admin_revoked: Counter::default(),
            admin_errors: Counter::default(),
            admin_last_success: Gauge::default(),
        }
    }

    fn register(&self, registry: &mut Registry) {
        registry.register(
            "team_sync_users_added",
            "Users added to target teams",
            self.users_added.clone(),
        );
        registry.register(
            "team_sync_users_removed",
            "Users removed from target teams",
            self.users_removed.clone(),
        );
        registry.register(
            "team_sync_users_skipped",
            "Users skipped because no target account exists",
            self.users_skipped.clone(),
        );
        registry.register(
            "team_sync_errors",
            "Errors encountered while syncing",
            self.errors.clone(),
        );
        registry.register(
            "team_sync_duration_seconds",
            "Duration of a mapping sync in seconds",
            self.duration_seconds.clone(),
        );
        registry.register(
            "team_sync_last_success_timestamp",
            "Unix time of the last successful sync",
            self.last_success_timestamp.clone(),
        );
        registry.register(
            "team_sync_last_success",
            "Whether the last sync succeeded (1) or failed (0)",
            self.last_success.clone(),
        );
        registry.register(
            "team_sync_admin_granted",
            "Server admin flags granted",
            self.admin_granted.clone(),
        );
        registry.register(
            "team_sync_admin_revoked",
            "Server admin flags revoked",
            self.admin_revoked.clone(),
        );
        registry.register(
            "team_sync_admin_errors",
            "Errors encountered while syncing admin flags",
            self.admin_errors.clone(),
        );
        registry.register(
            "team_sync_admin_last_success",
            "Whether the last admin flag sync succeeded (1) or aborted (0)",
            self.admin_last_success.clone(),
        );
    }
}

/// Latest known state of one mapping, as reported by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct MappingStatus {
    pub source_group: String,
    pub target_team: String,
    pub success: bool,
    pub last_run: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub added: u64,
    pub removed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Latest outcome of the admin flag pass.
#[derive(Debug, Clone, Serialize)]
pub struct AdminStatus {
    pub success: bool,
    pub last_run: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub granted: u64,
    pub revoked: u64,
    pub errors: u64,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct SyncStatus {
    registry: Registry,
    metrics: SyncMetricFamilies,
    mappings: RwLock<BTreeMap<String, MappingStatus>>,
    admin: RwLock<Option<AdminStatus>>,
    started_at: DateTime<Utc>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatus {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = SyncMetricFamilies::new();
        metrics.register(&mut registry);

        Self {
            registry,
            metrics,
            mappings: RwLock::new(BTreeMap::new()),
            admin: RwLock::new(None),
            started_at: Utc::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub async fn record_success(&self, mapping: &GroupMapping, result: &SyncMetrics) {
        let labels = MappingLabels::from(mapping);
        let now = Utc::now();

        self.metrics.users_added.get_or_create(&labels).inc_by(result.added);
        self.metrics.users_removed.get_or_create(&labels).inc_by(result.removed);
        self.metrics.users_skipped.get_or_create(&labels).inc_by(result.skipped);
        self.metrics.errors.get_or_create(&labels).inc_by(result.errors);
        self.metrics
            .duration_seconds
            .get_or_create(&labels)
            .observe(result.duration.as_secs_f64());
        self.metrics
            .last_success_timestamp
            .get_or_create(&labels)
            .set(now.timestamp());
        self.metrics.last_success.get_or_create(&labels).set(1);

        let status = MappingStatus {
            source_group: mapping.source_group.clone(),
            target_team: mapping.target_team.clone(),
            success: true,
            last_run: now,
            last_success: Some(now),
            added: result.added,
            removed: result.removed,
            skipped: result.skipped,
            errors: result.errors,
            duration_seconds: result.duration.as_secs_f64(),
            last_error: None,
        };
        self.mappings.write().await.insert(mapping.to_string(), status);
    }

    /// A mapping whose pass aborted. Counts as one error and keeps the
    /// previous last-success time.
    pub async fn record_failure(&self, mapping: &GroupMapping, error: &str, duration: Duration) {
        let labels = MappingLabels::from(mapping);
        let now = Utc::now();

        self.metrics.errors.get_or_create(&labels).inc();
        self.metrics
            .duration_seconds
            .get_or_create(&labels)
            .observe(duration.as_secs_f64());
        self.metrics.last_success.get_or_create(&labels).set(0);

        let mut mappings = self.mappings.write().await;
        let last_success = mappings
            .get(&mapping.to_string())
            .and_then(|previous| previous.last_success);

        mappings.insert(
            mapping.to_string(),
            MappingStatus {
                source_group: mapping.source_group.clone(),
                target_team: mapping.target_team.clone(),
                success: false,
                last_run: now,
                last_success,
                added: 0,
                removed: 0,
                skipped: 0,
                errors: 1,
                duration_seconds: duration.as_secs_f64(),
                last_error: Some(error.to_string()),
            },
        );
    }

    pub async fn record_admin_success(&self, result: &AdminMetrics) {
        let now = Utc::now();
        self.metrics.admin_granted.inc_by(result.granted);
        self.metrics.admin_revoked.inc_by(result.revoked);
        self.metrics.admin_errors.inc_by(result.errors);
        self.metrics.admin_last_success.set(1);

        *self.admin.write().await = Some(AdminStatus {
            success: true,
            last_run: now,
            last_success: Some(now),
            granted: result.granted,
            revoked: result.revoked,
            errors: result.errors,
            duration_seconds: result.duration.as_secs_f64(),
            last_error: None,
        });
    }

    /// An admin pass aborted before changing any flag.
    pub async fn record_admin_failure(&self, error: &str, duration: Duration) {
        self.metrics.admin_errors.inc();
        self.metrics.admin_last_success.set(0);

        let mut admin = self.admin.write().await;
        let last_success = admin.as_ref().and_then(|previous| previous.last_success);
        *admin = Some(AdminStatus {
            success: false,
            last_run: Utc::now(),
            last_success,
            granted: 0,
            revoked: 0,
            errors: 1,
            duration_seconds: duration.as_secs_f64(),
            last_error: Some(error.to_string()),
        });
    }

    pub async fn snapshot(&self) -> Vec<MappingStatus> {
        self.mappings.read().await.values().cloned().collect()
    }

    pub async fn admin_snapshot(&self) -> Option<AdminStatus> {
        self.admin.read().await.clone()
    }

    /// True until some mapping's or the admin pass's latest run failed.
    pub async fn is_healthy(&self) -> bool {
        let admin_ok = self.admin.read().await.as_ref().map_or(true, |a| a.success);
        admin_ok && self.mappings.read().await.values().all(|m| m.success)
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
