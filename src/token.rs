//! OAuth 2.0 client-credentials token manager.
//!
//! Tokens are cached until `expires_at - safety_margin`. The cache lock is held
//! across acquisition, so concurrent callers wait for the in-flight request
//! instead of issuing their own.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Tokens are replaced this long before they actually expire.
pub const DEFAULT_SAFETY_MARGIN_SECS: i64 = 60;

const ASSERTION_LIFETIME_SECS: i64 = 300;
const TOKEN_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Claims of a `private_key_jwt` client assertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Signs client assertions with the configured private key.
pub struct AssertionSigner {
    key: EncodingKey,
    algorithm: Algorithm,
    key_id: Option<String>,
}

impl AssertionSigner {
    /// Load a PEM private key. RSA algorithms take PKCS#1 or PKCS#8 keys,
    /// EC algorithms take PKCS#8.
    pub fn from_pem(pem: &[u8], algorithm: Algorithm, key_id: Option<String>) -> ApiResult<Self> {
        let key = match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => EncodingKey::from_rsa_pem(pem),
            Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(pem),
            other => {
                return Err(ApiError::Authentication(format!(
                    "{:?} is not an asymmetric signing algorithm",
                    other
                )))
            }
        }
        .map_err(|e| ApiError::Authentication(format!("Invalid signing key: {}", e)))?;

        Ok(Self {
            key,
            algorithm,
            key_id,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    /// Build a fresh assertion for `client_id` addressed to `audience`.
    pub fn sign(&self, client_id: &str, audience: &str) -> ApiResult<String> {
        let now = Utc::now();
        let claims = AssertionClaims {
            iss: client_id.to_string(),
            sub: client_id.to_string(),
            aud: audience.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(ASSERTION_LIFETIME_SECS)).timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let mut header = Header::new(self.algorithm);
        header.kid = self.key_id.clone();

        encode(&header, &claims, &self.key)
            .map_err(|e| ApiError::Authentication(format!("Failed to sign client assertion: {}", e)))
    }
}

impl fmt::Debug for AssertionSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssertionSigner")
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// How the client proves its identity to the token endpoint.
pub enum ClientAuthentication {
    ClientSecretBasic { client_secret: String },
    ClientSecretPost { client_secret: String },
    PrivateKeyJwt(AssertionSigner),
}

impl ClientAuthentication {
    pub fn method_name(&self) -> &'static str {
        match self {
            ClientAuthentication::ClientSecretBasic { .. } => "client_secret_basic",
            ClientAuthentication::ClientSecretPost { .. } => "client_secret_post",
            ClientAuthentication::PrivateKeyJwt(_) => "private_key_jwt",
        }
    }
}

impl fmt::Debug for ClientAuthentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientAuthentication::PrivateKeyJwt(signer) => {
                f.debug_tuple("PrivateKeyJwt").field(signer).finish()
            }
            other => write!(f, "{}(<redacted>)", other.method_name()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub granted_scopes: BTreeSet<String>,
}

impl CachedToken {
    /// Usable if `now < expires_at - margin`.
    pub fn is_fresh(&self, margin: Duration) -> bool {
        Utc::now() < self.expires_at - margin
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug)]
pub struct TokenManager {
    http_client: reqwest::Client,
    token_url: String,
    client_id: String,
    scopes: Vec<String>,
    auth: ClientAuthentication,
    safety_margin: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenManager {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        scopes: Vec<String>,
        auth: ClientAuthentication,
    ) -> ApiResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(TOKEN_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ApiError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            scopes,
            auth,
            safety_margin: Duration::seconds(DEFAULT_SAFETY_MARGIN_SECS),
            cached: Mutex::new(None),
        })
    }

    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    pub fn auth_method(&self) -> &'static str {
        self.auth.method_name()
    }

    /// Return a usable access token, acquiring a new one when the cached token
    /// is missing or inside the safety margin.
    pub async fn get_token(&self) -> ApiResult<String> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.is_fresh(self.safety_margin) {
                return Ok(token.access_token.clone());
            }
            tracing::debug!("Cached token expires at {}, refreshing", token.expires_at);
        }

        let token = self.acquire_token().await?;
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }

    /// Drop the cached token if it is the one the API rejected. A token that
    /// was already replaced by a concurrent refresh is kept.
    pub async fn invalidate(&self, rejected: &str) {
        let mut cached = self.cached.lock().await;
        if cached
            .as_ref()
            .is_some_and(|token| token.access_token == rejected)
        {
            tracing::info!("Discarding rejected access token");
            *cached = None;
        }
    }

    /// Snapshot of the current cache entry.
    pub async fn cached_token(&self) -> Option<CachedToken> {
        self.cached.lock().await.clone()
    }

    async fn acquire_token(&self) -> ApiResult<CachedToken> {
        let scope = self.scopes.join(" ");
        let mut params: Vec<(&str, String)> = vec![
            ("grant_type", "client_credentials".to_string()),
            ("scope", scope),
        ];

        let mut request = self.http_client.post(&self.token_url);

        match &self.auth {
            ClientAuthentication::ClientSecretBasic { client_secret } => {
                request = request.basic_auth(&self.client_id, Some(client_secret));
            }
            ClientAuthentication::ClientSecretPost { client_secret } => {
                params.push(("client_id", self.client_id.clone()));
                params.push(("client_secret", client_secret.clone()));
            }
            ClientAuthentication::PrivateKeyJwt(signer) => {
                let assertion = signer.sign(&self.client_id, &self.token_url)?;
                params.push(("client_assertion_type", CLIENT_ASSERTION_TYPE.to_string()));
                params.push(("client_assertion", assertion));
            }
        }

        tracing::debug!(
            method = self.auth.method_name(),
            "Requesting access token from {}",
            self.token_url
        );

        let resp = request
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| ApiError::Authentication(format!("Token request failed: {}", e)))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ApiError::Authentication(format!("Token response unreadable: {}", e)))?;

        if !status.is_success() {
            let detail = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(desc) => format!("{}: {}", err.error, desc),
                    None => err.error,
                },
                Err(_) => body,
            };
            return Err(ApiError::Authentication(format!(
                "Token endpoint returned {}: {}",
                status, detail
            )));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| ApiError::Authentication(format!("Malformed token response: {}", e)))?;

        let expires_at = Some(parsed.expires_in)
            .filter(|secs| *secs > 0)
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| {
                ApiError::Authentication(
                    "Malformed token response: expires_in out of range".to_string(),
                )
            })?;
        let granted_scopes: BTreeSet<String> = parsed
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default();

        tracing::info!(
            "Acquired access token, expires at {}, scopes: [{}]",
            expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
            granted_scopes.iter().cloned().collect::<Vec<_>>().join(" ")
        );

        Ok(CachedToken {
            access_token: parsed.access_token,
            expires_at,
            granted_scopes,
        })
    }
}
