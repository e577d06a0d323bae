use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::error::ApiResult;
use crate::token::TokenManager;

/// Supplies the `Authorization` header value for directory API calls.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Full header value, e.g. `Bearer eyJ...` or `SSWS 00a...`.
    async fn authorization(&self) -> ApiResult<String>;

    /// Called when the API answered 401 to `rejected`. Returns true if a
    /// different credential can be produced on the next `authorization` call.
    async fn reject(&self, rejected: &str) -> bool;
}

/// A long-lived API token sent with a fixed scheme.
pub struct StaticCredential {
    scheme: &'static str,
    token: String,
}

impl StaticCredential {
    /// Okta API token (`Authorization: SSWS <token>`).
    pub fn ssws(token: impl Into<String>) -> Self {
        Self {
            scheme: "SSWS",
            token: token.into(),
        }
    }

    /// Bearer token, used for Grafana service account keys.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            scheme: "Bearer",
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredential")
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn authorization(&self) -> ApiResult<String> {
        Ok(format!("{} {}", self.scheme, self.token))
    }

    async fn reject(&self, _rejected: &str) -> bool {
        false
    }
}

#[async_trait]
impl CredentialProvider for TokenManager {
    async fn authorization(&self) -> ApiResult<String> {
        Ok(format!("Bearer {}", self.get_token().await?))
    }

    async fn reject(&self, rejected: &str) -> bool {
        let token = rejected.strip_prefix("Bearer ").unwrap_or(rejected);
        self.invalidate(token).await;
        true
    }
}

#[async_trait]
impl<T: CredentialProvider + ?Sized> CredentialProvider for Arc<T> {
    async fn authorization(&self) -> ApiResult<String> {
        (**self).authorization().await
    }

    async fn reject(&self, rejected: &str) -> bool {
        (**self).reject(rejected).await
    }
}
