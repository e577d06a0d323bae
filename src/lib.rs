//! Reconciles identity-provider group membership into application teams.
//!
//! Okta groups are the source of truth; Grafana teams and the Grafana server
//! admin flag are brought in line with them on every pass.

pub mod config;
pub mod credentials;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod grafana;
pub mod jwk;
pub mod okta;
pub mod retry;
pub mod server;
pub mod status;
pub mod sync;
pub mod token;

pub use directory::{DirectoryMember, MembershipSet, SyncPlan};
pub use error::{ApiError, ApiResult};
pub use sync::{GroupMapping, SyncEngine, SyncMetrics, SyncOptions};
