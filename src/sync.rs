//! Membership reconciliation between the source and target directories.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::directory::{
    normalize_email, DirectoryMember, MembershipSet, SourceDirectory, SyncPlan, TargetDirectory,
};
use crate::error::{ApiError, ApiResult};
use crate::status::SyncStatus;

/// One source group reconciled into one target team.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupMapping {
    #[serde(rename = "okta_group", alias = "source_group")]
    pub source_group: String,
    #[serde(rename = "grafana_team", alias = "target_team")]
    pub target_team: String,
}

impl GroupMapping {
    pub fn new(source_group: impl Into<String>, target_team: impl Into<String>) -> Self {
        Self {
            source_group: source_group.into(),
            target_team: target_team.into(),
        }
    }
}

impl fmt::Display for GroupMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source_group, self.target_team)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Compute and log the plan without mutating the target.
    pub dry_run: bool,
    /// Create missing target accounts instead of skipping them.
    pub provision_users: bool,
}

/// Outcome of one mapping pass. `duration` covers fetches and mutations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMetrics {
    pub added: u64,
    pub removed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminMetrics {
    pub granted: u64,
    pub revoked: u64,
    pub errors: u64,
    pub duration: Duration,
}

/// Summary of a full pass over every mapping.
#[derive(Debug, Default)]
pub struct PassReport {
    pub succeeded: Vec<(GroupMapping, SyncMetrics)>,
    pub failed: Vec<(GroupMapping, String)>,
    pub admin: Option<AdminMetrics>,
    pub admin_error: Option<String>,
}

impl PassReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.admin_error.is_none()
    }
}

enum AddOutcome {
    Added,
    Skipped,
}

pub struct SyncEngine {
    source: Arc<dyn SourceDirectory>,
    target: Arc<dyn TargetDirectory>,
    options: SyncOptions,
    status: Arc<SyncStatus>,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn SourceDirectory>,
        target: Arc<dyn TargetDirectory>,
        options: SyncOptions,
    ) -> Self {
        Self {
            source,
            target,
            options,
            status: Arc::new(SyncStatus::new()),
        }
    }

    pub fn with_status(mut self, status: Arc<SyncStatus>) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> Arc<SyncStatus> {
        self.status.clone()
    }

    pub fn options(&self) -> SyncOptions {
        self.options
    }

    /// Reconcile one mapping. Resolution and listing failures abort the
    /// mapping; per-member failures are counted in `errors` and never raised.
    pub async fn sync_mapping(&self, mapping: &GroupMapping) -> ApiResult<SyncMetrics> {
        let started = Instant::now();
        let mut metrics = SyncMetrics::default();
        let dry_run = self.options.dry_run;

        tracing::info!(mapping = %mapping, dry_run, "Syncing mapping");

        let group_id = self.source.find_group_by_name(&mapping.source_group).await?;
        let source: MembershipSet = self
            .source
            .list_group_members(&group_id)
            .await?
            .into_iter()
            .collect();

        let team_id = if dry_run {
            let existing = self.target.find_team(&mapping.target_team).await?;
            if existing.is_none() {
                tracing::info!("[dry-run] Would create team {}", mapping.target_team);
            }
            existing
        } else {
            Some(self.target.get_or_create_team(&mapping.target_team).await?)
        };

        let target: MembershipSet = match &team_id {
            Some(id) => self
                .target
                .list_team_members(id)
                .await?
                .into_iter()
                .collect(),
            None => MembershipSet::new(),
        };

        let plan = SyncPlan::compute(&source, &target);
        tracing::info!(
            mapping = %mapping,
            source_members = source.len(),
            target_members = target.len(),
            to_add = plan.to_add.len(),
            to_remove = plan.to_remove.len(),
            "Computed membership plan"
        );

        for email in &plan.to_add {
            if dry_run {
                tracing::info!("[dry-run] Would add {} to {}", email, mapping.target_team);
                metrics.added += 1;
                continue;
            }
            let (Some(member), Some(team_id)) = (source.get(email), team_id.as_deref()) else {
                continue;
            };

            match self.add_one(team_id, member).await {
                Ok(AddOutcome::Added) => {
                    tracing::info!("Added {} to {}", email, mapping.target_team);
                    metrics.added += 1;
                }
                Ok(AddOutcome::Skipped) => metrics.skipped += 1,
                Err(error) => {
                    tracing::error!(mapping = %mapping, email = %email, error = %error, "Failed to add member");
                    metrics.errors += 1;
                }
            }
        }

        for email in &plan.to_remove {
            if dry_run {
                tracing::info!("[dry-run] Would remove {} from {}", email, mapping.target_team);
                metrics.removed += 1;
                continue;
            }
            let (Some(member), Some(team_id)) = (target.get(email), team_id.as_deref()) else {
                continue;
            };

            match self.target.remove_member(team_id, &member.id).await {
                Ok(()) => {
                    tracing::info!("Removed {} from {}", email, mapping.target_team);
                    metrics.removed += 1;
                }
                Err(error) => {
                    tracing::error!(mapping = %mapping, email = %email, error = %error, "Failed to remove member");
                    metrics.errors += 1;
                }
            }
        }

        metrics.duration = started.elapsed();
        tracing::info!(
            mapping = %mapping,
            added = metrics.added,
            removed = metrics.removed,
            skipped = metrics.skipped,
            errors = metrics.errors,
            duration_ms = metrics.duration.as_millis() as u64,
            "Mapping sync finished"
        );
        Ok(metrics)
    }

    async fn add_one(&self, team_id: &str, member: &DirectoryMember) -> ApiResult<AddOutcome> {
        let lookup = if self.options.provision_users {
            self.target
                .get_or_create_user(&member.email, &member.display_name)
                .await
                .map(Some)
        } else {
            self.target.find_user(&member.email).await
        };

        let user = match lookup {
            Ok(Some(user)) => user,
            Ok(None) | Err(ApiError::NotFound(_)) => {
                tracing::warn!(
                    "No target account for {}, skipping until it is provisioned",
                    member.email
                );
                return Ok(AddOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        self.target.add_member(team_id, &user.id).await?;
        Ok(AddOutcome::Added)
    }

    /// Set the admin flag on every target user to membership in the union of
    /// `admin_groups`. Any unreadable admin group aborts before changes.
    pub async fn sync_admins(&self, admin_groups: &[String]) -> ApiResult<AdminMetrics> {
        let started = Instant::now();
        let mut metrics = AdminMetrics::default();
        if admin_groups.is_empty() {
            return Ok(metrics);
        }

        let mut admins = BTreeSet::new();
        for group in admin_groups {
            let group_id = self.source.find_group_by_name(group).await?;
            let members = self.source.list_group_members(&group_id).await?;
            tracing::debug!("Admin group {} has {} members", group, members.len());
            admins.extend(members.iter().map(|m| normalize_email(&m.email)));
        }

        let users = self.target.list_users().await?;
        tracing::info!(
            admins = admins.len(),
            users = users.len(),
            "Reconciling admin flags"
        );

        for user in users {
            let should_be_admin = admins.contains(&user.member.email_key());
            if user.is_admin == should_be_admin {
                continue;
            }

            if self.options.dry_run {
                tracing::info!(
                    "[dry-run] Would set admin flag of {}: {} -> {}",
                    user.member.email,
                    user.is_admin,
                    should_be_admin
                );
            } else if let Err(error) = self
                .target
                .set_admin_flag(&user.member.id, should_be_admin)
                .await
            {
                tracing::error!(email = %user.member.email, error = %error, "Failed to update admin flag");
                metrics.errors += 1;
                continue;
            } else {
                tracing::info!(
                    "Admin flag of {}: {} -> {}",
                    user.member.email,
                    user.is_admin,
                    should_be_admin
                );
            }

            if should_be_admin {
                metrics.granted += 1;
            } else {
                metrics.revoked += 1;
            }
        }

        metrics.duration = started.elapsed();
        Ok(metrics)
    }

    /// Sync every mapping in order, then the admin flags. A failing mapping
    /// never prevents the others from running.
    pub async fn run_pass(&self, mappings: &[GroupMapping], admin_groups: &[String]) -> PassReport {
        let mut report = PassReport::default();

        for mapping in mappings {
            let started = Instant::now();
            match self.sync_mapping(mapping).await {
                Ok(metrics) => {
                    self.status.record_success(mapping, &metrics).await;
                    report.succeeded.push((mapping.clone(), metrics));
                }
                Err(error) => {
                    tracing::error!(mapping = %mapping, error = %error, "Mapping sync failed");
                    self.status
                        .record_failure(mapping, &error.to_string(), started.elapsed())
                        .await;
                    report.failed.push((mapping.clone(), error.to_string()));
                }
            }
        }

        if !admin_groups.is_empty() {
            let started = Instant::now();
            match self.sync_admins(admin_groups).await {
                Ok(metrics) => {
                    self.status.record_admin_success(&metrics).await;
                    tracing::info!(
                        granted = metrics.granted,
                        revoked = metrics.revoked,
                        errors = metrics.errors,
                        "Admin flag sync finished"
                    );
                    report.admin = Some(metrics);
                }
                Err(error) => {
                    tracing::error!(error = %error, "Admin flag sync aborted");
                    self.status
                        .record_admin_failure(&error.to_string(), started.elapsed())
                        .await;
                    report.admin_error = Some(error.to_string());
                }
            }
        }

        tracing::info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Sync pass complete"
        );
        report
    }
}
