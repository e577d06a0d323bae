use jsonwebtoken::Algorithm;
use regex::{Captures, Regex};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::credentials::{CredentialProvider, StaticCredential};
use crate::okta;
use crate::sync::{GroupMapping, SyncOptions};
use crate::token::{AssertionSigner, ClientAuthentication, TokenManager};

pub const MIN_INTERVAL_SECONDS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub okta: OktaConfig,
    #[serde(default)]
    pub grafana: GrafanaConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OktaAuthMethod {
    ApiToken,
    Oauth,
}

impl FromStr for OktaAuthMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "api_token" => Ok(OktaAuthMethod::ApiToken),
            "oauth" => Ok(OktaAuthMethod::Oauth),
            other => Err(invalid(format!(
                "okta.auth_method must be api_token or oauth, got {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OktaConfig {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub auth_method: Option<OktaAuthMethod>,
    #[serde(default)]
    pub oauth: Option<OAuthConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    ClientSecretBasic,
    ClientSecretPost,
    #[default]
    PrivateKeyJwt,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub token_endpoint_auth_method: ClientAuthMethod,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub key_id: Option<String>,
    #[serde(default = "default_signing_algorithm")]
    pub signing_algorithm: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            token_endpoint_auth_method: ClientAuthMethod::default(),
            client_secret: None,
            private_key_path: None,
            key_id: None,
            signing_algorithm: default_signing_algorithm(),
            scopes: default_scopes(),
        }
    }
}

impl OAuthConfig {
    pub fn algorithm(&self) -> Result<Algorithm, ConfigError> {
        let algorithm = Algorithm::from_str(&self.signing_algorithm.to_uppercase())
            .map_err(|_| invalid(format!("unknown signing algorithm {}", self.signing_algorithm)))?;
        match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::ES256
            | Algorithm::ES384 => Ok(algorithm),
            _ => Err(invalid(format!(
                "okta.oauth.signing_algorithm must be RS256, RS384, RS512, ES256 or ES384, got {}",
                self.signing_algorithm
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GrafanaConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub provision_users: bool,
    #[serde(default)]
    pub mappings: Vec<GroupMapping>,
    #[serde(default)]
    pub admin_groups: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            dry_run: false,
            provision_users: false,
            mappings: Vec::new(),
            admin_groups: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            dry_run: self.dry_run,
            provision_users: self.provision_users,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

impl MetricsConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_interval() -> u64 {
    300
}

fn default_signing_algorithm() -> String {
    "RS256".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["okta.groups.read".to_string(), "okta.users.read".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}

fn default_metrics_port() -> u32 {
    8000
}

impl Config {
    /// Load `path`, after reading a `.env` file from the working directory if present.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content, |key| std::env::var(key).ok())
    }

    /// Parse YAML, expand `${VAR}` placeholders, apply environment overrides
    /// and validate. `env` stands in for the process environment.
    pub fn from_yaml<F>(content: &str, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut raw: serde_yaml::Value = serde_yaml::from_str(content)?;
        expand_placeholders(&mut raw, &env);

        let mut config: Config = if raw.is_null() {
            Config::default()
        } else {
            serde_yaml::from_value(raw)?
        };
        config.apply_env(&env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, env: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env("OKTA_DOMAIN") {
            self.okta.domain = v;
        }
        if let Some(v) = env("OKTA_API_TOKEN") {
            self.okta.api_token = Some(v);
        }
        if let Some(v) = env("OKTA_AUTH_METHOD") {
            self.okta.auth_method = Some(v.parse()?);
        }

        let oauth_keys = [
            "OKTA_CLIENT_ID",
            "OKTA_CLIENT_SECRET",
            "OKTA_PRIVATE_KEY_PATH",
            "OKTA_KEY_ID",
        ];
        if oauth_keys.iter().any(|key| env(key).is_some()) {
            let oauth = self.okta.oauth.get_or_insert_with(OAuthConfig::default);
            if let Some(v) = env("OKTA_CLIENT_ID") {
                oauth.client_id = v;
            }
            if let Some(v) = env("OKTA_CLIENT_SECRET") {
                oauth.client_secret = Some(v);
            }
            if let Some(v) = env("OKTA_PRIVATE_KEY_PATH") {
                oauth.private_key_path = Some(PathBuf::from(v));
            }
            if let Some(v) = env("OKTA_KEY_ID") {
                oauth.key_id = Some(v);
            }
        }

        if let Some(v) = env("GRAFANA_URL") {
            self.grafana.url = v;
        }
        if let Some(v) = env("GRAFANA_API_KEY") {
            self.grafana.api_key = v;
        }

        if let Some(v) = env("SYNC_INTERVAL_SECONDS") {
            self.sync.interval_seconds = v
                .trim()
                .parse()
                .map_err(|_| invalid(format!("SYNC_INTERVAL_SECONDS is not a number: {}", v)))?;
        }
        if let Some(v) = env("SYNC_DRY_RUN") {
            self.sync.dry_run = parse_flag(&v);
        }

        if let Some(v) = env("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env("LOG_FORMAT") {
            self.logging.format = match v.trim().to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => return Err(invalid(format!("LOG_FORMAT must be json or text, got {}", other))),
            };
        }

        if let Some(v) = env("METRICS_ENABLED") {
            self.metrics.enabled = parse_flag(&v);
        }
        if let Some(v) = env("METRICS_HOST") {
            self.metrics.host = v;
        }
        if let Some(v) = env("METRICS_PORT") {
            self.metrics.port = v
                .trim()
                .parse()
                .map_err(|_| invalid(format!("METRICS_PORT is not a number: {}", v)))?;
        }

        Ok(())
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        let domain = self
            .okta
            .domain
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        if domain.is_empty() {
            return Err(invalid("okta.domain is required"));
        }
        self.okta.domain = domain;

        match self.okta.resolved_auth_method() {
            OktaAuthMethod::ApiToken => {
                if self.okta.api_token.as_deref().map_or(true, |t| t.trim().is_empty()) {
                    return Err(invalid("okta.api_token is required"));
                }
            }
            OktaAuthMethod::Oauth => {
                let oauth = self
                    .okta
                    .oauth
                    .as_ref()
                    .ok_or_else(|| invalid("okta.oauth is required when auth_method is oauth"))?;
                if oauth.client_id.trim().is_empty() {
                    return Err(invalid("okta.oauth.client_id is required"));
                }
                match oauth.token_endpoint_auth_method {
                    ClientAuthMethod::ClientSecretBasic | ClientAuthMethod::ClientSecretPost => {
                        if oauth.client_secret.as_deref().map_or(true, str::is_empty) {
                            return Err(invalid(
                                "okta.oauth.client_secret is required for client_secret_* methods",
                            ));
                        }
                    }
                    ClientAuthMethod::PrivateKeyJwt => {
                        if oauth.private_key_path.is_none() {
                            return Err(invalid(
                                "okta.oauth.private_key_path is required for private_key_jwt",
                            ));
                        }
                        oauth.algorithm()?;
                    }
                }
                if oauth.scopes.is_empty() {
                    return Err(invalid("okta.oauth.scopes must not be empty"));
                }
            }
        }

        let url = self.grafana.url.trim().trim_end_matches('/');
        if url.is_empty() {
            return Err(invalid("grafana.url is required"));
        }
        self.grafana.url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("https://{}", url)
        };
        if self.grafana.api_key.trim().is_empty() {
            return Err(invalid("grafana.api_key is required"));
        }

        if self.sync.interval_seconds < MIN_INTERVAL_SECONDS {
            return Err(invalid(format!(
                "sync.interval_seconds must be at least {}",
                MIN_INTERVAL_SECONDS
            )));
        }
        if self.sync.mappings.is_empty() {
            return Err(invalid("at least one sync mapping is required"));
        }
        for mapping in &self.sync.mappings {
            if mapping.source_group.trim().is_empty() {
                return Err(invalid("mapping okta_group must not be empty"));
            }
            if mapping.target_team.trim().is_empty() {
                return Err(invalid("mapping grafana_team must not be empty"));
            }
        }

        self.logging.level = match self.logging.level.trim().to_lowercase().as_str() {
            level @ ("trace" | "debug" | "info" | "warn" | "error") => level.to_string(),
            "warning" => "warn".to_string(),
            "critical" => "error".to_string(),
            other => {
                return Err(invalid(format!(
                    "logging.level must be one of trace, debug, info, warn, error, got {}",
                    other
                )))
            }
        };

        if !(1..=65535).contains(&self.metrics.port) {
            return Err(invalid(format!(
                "metrics.port must be between 1 and 65535, got {}",
                self.metrics.port
            )));
        }

        Ok(())
    }
}

impl OktaConfig {
    /// Explicit `auth_method`, else OAuth when an `oauth` section exists.
    pub fn resolved_auth_method(&self) -> OktaAuthMethod {
        match (self.auth_method, &self.oauth) {
            (Some(method), _) => method,
            (None, Some(_)) if self.api_token.is_none() => OktaAuthMethod::Oauth,
            _ => OktaAuthMethod::ApiToken,
        }
    }

    pub fn base_url(&self) -> String {
        okta::base_url(&self.domain)
    }

    /// Build the credential provider for the Okta API. Reads the private key
    /// file for `private_key_jwt`.
    pub fn credential_provider(&self) -> Result<Arc<dyn CredentialProvider>, ConfigError> {
        match self.resolved_auth_method() {
            OktaAuthMethod::ApiToken => Ok(Arc::new(StaticCredential::ssws(
                self.api_token.clone().unwrap_or_default(),
            ))),
            OktaAuthMethod::Oauth => {
                let oauth = self
                    .oauth
                    .as_ref()
                    .ok_or_else(|| invalid("okta.oauth is required when auth_method is oauth"))?;
                Ok(Arc::new(oauth.token_manager(&okta::token_endpoint(&self.base_url()))?))
            }
        }
    }
}

impl OAuthConfig {
    pub fn token_manager(&self, token_url: &str) -> Result<TokenManager, ConfigError> {
        let secret = || self.client_secret.clone().unwrap_or_default();
        let auth = match self.token_endpoint_auth_method {
            ClientAuthMethod::ClientSecretBasic => ClientAuthentication::ClientSecretBasic {
                client_secret: secret(),
            },
            ClientAuthMethod::ClientSecretPost => ClientAuthentication::ClientSecretPost {
                client_secret: secret(),
            },
            ClientAuthMethod::PrivateKeyJwt => {
                let path = self
                    .private_key_path
                    .as_ref()
                    .ok_or_else(|| invalid("okta.oauth.private_key_path is required"))?;
                let pem = std::fs::read(path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                let signer = AssertionSigner::from_pem(&pem, self.algorithm()?, self.key_id.clone())
                    .map_err(|e| invalid(format!("{}: {}", path.display(), e)))?;
                ClientAuthentication::PrivateKeyJwt(signer)
            }
        };

        TokenManager::new(token_url, self.client_id.clone(), self.scopes.clone(), auth)
            .map_err(|e| invalid(format!("okta.oauth: {}", e)))
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

lazy_static::lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\$\{([^}]+)\}").unwrap();
}

/// Replace `${VAR}` in every string value. Unset variables become empty.
fn expand_placeholders<F>(value: &mut serde_yaml::Value, env: &F)
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        serde_yaml::Value::String(s) if s.contains("${") => {
            let expanded = PLACEHOLDER
                .replace_all(s.as_str(), |caps: &Captures| env(&caps[1]).unwrap_or_default())
                .into_owned();
            *s = expanded;
        }
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                expand_placeholders(item, env);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                expand_placeholders(item, env);
            }
        }
        _ => {}
    }
}
