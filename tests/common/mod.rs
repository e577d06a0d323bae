#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::{MockServer, Request, Respond, ResponseTemplate};

use team_sync::credentials::{CredentialProvider, StaticCredential};
use team_sync::gateway::Gateway;
use team_sync::grafana::GrafanaClient;
use team_sync::okta::OktaClient;
use team_sync::retry::RetryPolicy;

pub fn okta_client(server: &MockServer, credentials: Arc<dyn CredentialProvider>) -> OktaClient {
    let gateway = Gateway::new("okta", &server.uri(), credentials)
        .unwrap()
        .with_retry_policy(RetryPolicy::immediate(3));
    OktaClient::new(gateway)
}

pub fn grafana_client(server: &MockServer) -> GrafanaClient {
    let gateway = Gateway::new(
        "grafana",
        &server.uri(),
        Arc::new(StaticCredential::bearer("glsa_test")),
    )
    .unwrap()
    .with_retry_policy(RetryPolicy::immediate(3));
    GrafanaClient::new(gateway)
}

pub fn okta_group(id: &str, name: &str) -> Value {
    json!({"id": id, "profile": {"name": name}})
}

pub fn okta_user(id: &str, email: &str) -> Value {
    json!({
        "id": id,
        "status": "ACTIVE",
        "profile": {
            "email": email,
            "login": email,
            "firstName": "Test",
            "lastName": id,
        }
    })
}

pub fn grafana_user(id: i64, email: &str) -> Value {
    json!({"userId": id, "email": email, "login": email, "name": email})
}

/// Answers `/api/org/users/lookup?query=<email>` with a single user whose id
/// is derived from the queried address, so every lookup succeeds.
pub struct LookupResponder;

pub fn user_id_for(email: &str) -> i64 {
    email
        .to_lowercase()
        .trim_start_matches("user")
        .split('@')
        .next()
        .and_then(|n| n.parse::<i64>().ok())
        .map(|n| 1000 + n)
        .unwrap_or(1)
}

impl Respond for LookupResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let query = request
            .url
            .query_pairs()
            .find(|(k, _)| k == "query")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();
        ResponseTemplate::new(200).set_body_json(json!([grafana_user(user_id_for(&query), &query)]))
    }
}
