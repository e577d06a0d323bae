//! Source directory client for the Okta management API.

use async_trait::async_trait;
use futures::TryStreamExt;
use serde::Deserialize;

use crate::directory::{DirectoryMember, SourceDirectory};
use crate::error::{ApiError, ApiResult};
use crate::gateway::{Gateway, Pagination};

/// Largest page size the groups endpoints accept.
const PAGE_LIMIT: &str = "200";

/// Base URL for an Okta org domain such as `acme.okta.com`.
pub fn base_url(domain: &str) -> String {
    if domain.starts_with("http://") || domain.starts_with("https://") {
        domain.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", domain.trim_end_matches('/'))
    }
}

/// The org authorization server's token endpoint.
pub fn token_endpoint(base_url: &str) -> String {
    format!("{}/oauth2/v1/token", base_url.trim_end_matches('/'))
}

#[derive(Debug, Deserialize)]
struct OktaGroup {
    id: String,
    profile: OktaGroupProfile,
}

#[derive(Debug, Deserialize)]
struct OktaGroupProfile {
    name: String,
}

#[derive(Debug, Deserialize)]
struct OktaUser {
    id: String,
    #[serde(default)]
    profile: OktaUserProfile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OktaUserProfile {
    email: Option<String>,
    login: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    display_name: Option<String>,
}

impl OktaUserProfile {
    fn display_name(&self) -> String {
        if let Some(name) = self.display_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.trim().to_string();
        }

        let full = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !full.is_empty() {
            return full;
        }

        self.login
            .clone()
            .or_else(|| self.email.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct OktaClient {
    gateway: Gateway,
}

impl OktaClient {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl SourceDirectory for OktaClient {
    async fn find_group_by_name(&self, name: &str) -> ApiResult<String> {
        tracing::debug!("Searching Okta group: {}", name);

        let url = self
            .gateway
            .endpoint_with_query("/api/v1/groups", &[("q", name), ("limit", PAGE_LIMIT)])?;
        let groups: Vec<OktaGroup> = self
            .gateway
            .paginate(url, Pagination::LinkHeader)
            .try_collect()
            .await?;

        // `q` is a prefix search; only the exact name counts.
        let mut matches = groups.into_iter().filter(|g| g.profile.name == name);
        match (matches.next(), matches.next()) {
            (Some(group), None) => {
                tracing::debug!("Found Okta group {} ({})", name, group.id);
                Ok(group.id)
            }
            (Some(_), Some(_)) => Err(ApiError::NotFound(format!(
                "ambiguous group name {:?}: several groups share it",
                name
            ))),
            (None, _) => Err(ApiError::NotFound(format!("group {:?}", name))),
        }
    }

    async fn list_group_members(&self, group_id: &str) -> ApiResult<Vec<DirectoryMember>> {
        let url = self.gateway.endpoint_with_query(
            &format!("/api/v1/groups/{}/users", group_id),
            &[("limit", PAGE_LIMIT)],
        )?;
        let users: Vec<OktaUser> = self
            .gateway
            .paginate(url, Pagination::LinkHeader)
            .try_collect()
            .await?;

        let total = users.len();
        let members: Vec<DirectoryMember> = users
            .into_iter()
            .filter_map(|user| {
                let display_name = user.profile.display_name();
                match user.profile.email.filter(|e| !e.trim().is_empty()) {
                    Some(email) => Some(DirectoryMember::new(user.id, email, display_name)),
                    None => {
                        tracing::warn!(
                            "Okta user {} in group {} has no email, ignoring",
                            user.id,
                            group_id
                        );
                        None
                    }
                }
            })
            .collect();

        tracing::info!(
            "Fetched {} members of Okta group {} ({} without email)",
            members.len(),
            group_id,
            total - members.len()
        );
        Ok(members)
    }
}
