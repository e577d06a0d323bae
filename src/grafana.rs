//! Target directory client for the Grafana HTTP API.

use async_trait::async_trait;
use futures::TryStreamExt;
use rand::{distributions::Alphanumeric, Rng};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::pin::pin;

use crate::directory::{DirectoryMember, TargetDirectory, TargetUser};
use crate::error::{ApiError, ApiResult};
use crate::gateway::{Gateway, Pagination};

const TEAM_PAGE_SIZE: u32 = 100;
const USER_PAGE_SIZE: u32 = 100;
const LOOKUP_LIMIT: usize = 100;
const PASSWORD_LENGTH: usize = 32;

#[derive(Debug, Deserialize)]
struct Team {
    id: i64,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeamCreated {
    team_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrgUser {
    user_id: i64,
    #[serde(default)]
    email: String,
    #[serde(default)]
    login: String,
    #[serde(default)]
    name: String,
}

impl OrgUser {
    fn into_member(self) -> DirectoryMember {
        let display_name = if self.name.is_empty() {
            self.login
        } else {
            self.name
        };
        DirectoryMember::new(self.user_id.to_string(), self.email, display_name)
    }

    fn has_address(&self, email: &str) -> bool {
        self.email.eq_ignore_ascii_case(email) || self.login.eq_ignore_ascii_case(email)
    }

    /// Member for a lookup hit, keeping the queried address when the account has none.
    fn into_lookup_member(self, email: &str) -> DirectoryMember {
        let mut member = self.into_member();
        if member.email.is_empty() {
            member.email = email.to_string();
        }
        member
    }
}

#[derive(Debug, Deserialize)]
struct UserCreated {
    id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchUser {
    id: i64,
    #[serde(default)]
    email: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    login: String,
    #[serde(default)]
    is_admin: bool,
}

/// Grafana ids are numeric; send them as JSON numbers when they are.
fn id_value(id: &str) -> serde_json::Value {
    match id.parse::<i64>() {
        Ok(n) => json!(n),
        Err(_) => json!(id),
    }
}

fn generate_password() -> String {
    let mut rng = rand::thread_rng();
    (0..PASSWORD_LENGTH)
        .map(|_| rng.sample(Alphanumeric) as char)
        .collect()
}

#[derive(Debug)]
pub struct GrafanaClient {
    gateway: Gateway,
}

impl GrafanaClient {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    async fn search_team(&self, name: &str) -> ApiResult<Option<String>> {
        let url = self
            .gateway
            .endpoint_with_query("/api/teams/search", &[("name", name)])?;
        let teams: Vec<Team> = self
            .gateway
            .paginate(
                url,
                Pagination::PageNumber {
                    per_page: TEAM_PAGE_SIZE,
                    items_field: "teams",
                },
            )
            .try_collect()
            .await?;

        Ok(teams
            .into_iter()
            .find(|team| team.name == name)
            .map(|team| team.id.to_string()))
    }

    async fn create_team(&self, name: &str) -> ApiResult<String> {
        let url = self.gateway.endpoint("/api/teams")?;
        let created: TeamCreated = self
            .gateway
            .request(Method::POST, url, Some(&json!({ "name": name })))
            .await?
            .json()?;
        Ok(created.team_id.to_string())
    }

    async fn create_user(&self, email: &str, display_name: &str) -> ApiResult<String> {
        let url = self.gateway.endpoint("/api/admin/users")?;
        let name = if display_name.is_empty() {
            email
        } else {
            display_name
        };
        let body = json!({
            "name": name,
            "email": email,
            "login": email,
            "password": generate_password(),
        });
        let created: UserCreated = self
            .gateway
            .request(Method::POST, url, Some(&body))
            .await?
            .json()?;
        Ok(created.id.to_string())
    }
}

#[async_trait]
impl TargetDirectory for GrafanaClient {
    async fn find_team(&self, name: &str) -> ApiResult<Option<String>> {
        self.search_team(name).await
    }

    async fn get_or_create_team(&self, name: &str) -> ApiResult<String> {
        if let Some(id) = self.search_team(name).await? {
            tracing::debug!("Found Grafana team {} ({})", name, id);
            return Ok(id);
        }

        match self.create_team(name).await {
            Ok(id) => {
                tracing::info!("Created Grafana team {} ({})", name, id);
                Ok(id)
            }
            Err(ApiError::Conflict(msg)) => {
                tracing::debug!("Team {} created concurrently, resolving again", name);
                self.search_team(name)
                    .await?
                    .ok_or_else(|| ApiError::Conflict(msg))
            }
            Err(e) => Err(e),
        }
    }

    async fn list_team_members(&self, team_id: &str) -> ApiResult<Vec<DirectoryMember>> {
        let url = self
            .gateway
            .endpoint(&format!("/api/teams/{}/members", team_id))?;
        let members: Vec<OrgUser> = self.gateway.get_json(url).await?;

        Ok(members
            .into_iter()
            .filter(|m| !m.email.is_empty())
            .map(OrgUser::into_member)
            .collect())
    }

    async fn add_member(&self, team_id: &str, user_id: &str) -> ApiResult<()> {
        let url = self
            .gateway
            .endpoint(&format!("/api/teams/{}/members", team_id))?;
        let body = json!({ "userId": id_value(user_id) });

        match self.gateway.request(Method::POST, url, Some(&body)).await {
            Ok(_) => Ok(()),
            Err(ApiError::Conflict(_)) => {
                tracing::debug!("User {} already in team {}", user_id, team_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_member(&self, team_id: &str, user_id: &str) -> ApiResult<()> {
        let url = self
            .gateway
            .endpoint(&format!("/api/teams/{}/members/{}", team_id, user_id))?;

        match self.gateway.request(Method::DELETE, url, None).await {
            Ok(_) => Ok(()),
            Err(ApiError::NotFound(_)) => {
                tracing::debug!("User {} already absent from team {}", user_id, team_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn find_user(&self, email: &str) -> ApiResult<Option<DirectoryMember>> {
        let limit = LOOKUP_LIMIT.to_string();
        let url = self.gateway.endpoint_with_query(
            "/api/org/users/lookup",
            &[("query", email), ("limit", limit.as_str())],
        )?;
        let users: Vec<OrgUser> = self.gateway.get_json(url).await?;
        let truncated = users.len() >= LOOKUP_LIMIT;

        if let Some(user) = users.into_iter().find(|u| u.has_address(email)) {
            return Ok(Some(user.into_lookup_member(email)));
        }
        if !truncated {
            return Ok(None);
        }

        // The lookup matches substrings and caps its result; walk the full search.
        tracing::debug!("Lookup for {} hit its limit, searching all org users", email);
        let url = self
            .gateway
            .endpoint_with_query("/api/org/users/search", &[("query", email)])?;
        let mut users = pin!(self.gateway.paginate::<OrgUser>(
            url,
            Pagination::PageNumber {
                per_page: USER_PAGE_SIZE,
                items_field: "orgUsers",
            },
        ));
        while let Some(user) = users.try_next().await? {
            if user.has_address(email) {
                return Ok(Some(user.into_lookup_member(email)));
            }
        }
        Ok(None)
    }

    async fn get_or_create_user(
        &self,
        email: &str,
        display_name: &str,
    ) -> ApiResult<DirectoryMember> {
        if let Some(user) = self.find_user(email).await? {
            return Ok(user);
        }

        match self.create_user(email, display_name).await {
            Ok(id) => {
                tracing::info!("Created Grafana user {} ({})", email, id);
                Ok(DirectoryMember::new(id, email, display_name))
            }
            Err(ApiError::Conflict(_)) => self.find_user(email).await?.ok_or_else(|| {
                ApiError::NotFound(format!("user {} reported as existing but not found", email))
            }),
            Err(e) => Err(e),
        }
    }

    async fn list_users(&self) -> ApiResult<Vec<TargetUser>> {
        let url = self.gateway.endpoint("/api/users/search")?;
        let users: Vec<SearchUser> = self
            .gateway
            .paginate(
                url,
                Pagination::PageNumber {
                    per_page: USER_PAGE_SIZE,
                    items_field: "users",
                },
            )
            .try_collect()
            .await?;

        Ok(users
            .into_iter()
            .filter(|u| !u.email.is_empty())
            .map(|u| {
                let display_name = if u.name.is_empty() { u.login } else { u.name };
                TargetUser {
                    member: DirectoryMember::new(u.id.to_string(), u.email, display_name),
                    is_admin: u.is_admin,
                }
            })
            .collect())
    }

    async fn set_admin_flag(&self, user_id: &str, is_admin: bool) -> ApiResult<()> {
        let url = self
            .gateway
            .endpoint(&format!("/api/admin/users/{}/permissions", user_id))?;
        self.gateway
            .request(
                Method::PUT,
                url,
                Some(&json!({ "isGrafanaAdmin": is_admin })),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredential;
    use crate::retry::RetryPolicy;
    use std::sync::Arc;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GrafanaClient {
        let gateway = Gateway::new(
            "grafana",
            &server.uri(),
            Arc::new(StaticCredential::bearer("glsa_key")),
        )
        .unwrap()
        .with_retry_policy(RetryPolicy::immediate(3));
        GrafanaClient::new(gateway)
    }

    #[test]
    fn test_id_value() {
        assert_eq!(id_value("42"), json!(42));
        assert_eq!(id_value("abc"), json!("abc"));
    }

    #[test]
    fn test_generated_password() {
        let a = generate_password();
        assert_eq!(a.len(), PASSWORD_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, generate_password());
    }

    #[tokio::test]
    async fn test_existing_team_is_reused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/teams/search"))
            .and(query_param("name", "Eng"))
            .and(header("authorization", "Bearer glsa_key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalCount": 2,
                "teams": [{"id": 3, "name": "Eng Leads"}, {"id": 4, "name": "Eng"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/teams"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        assert_eq!(client(&server).get_or_create_team("Eng").await.unwrap(), "4");
    }

    #[tokio::test]
    async fn test_missing_team_is_created() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/teams/search"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"totalCount": 0, "teams": []})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/teams"))
            .and(body_json(json!({"name": "Eng"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"message": "Team created", "teamId": 12})),
            )
            .expect(1)
            .mount(&server)
            .await;

        assert_eq!(client(&server).get_or_create_team("Eng").await.unwrap(), "12");
    }

    #[tokio::test]
    async fn test_create_conflict_resolves_by_search() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/teams/search"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"totalCount": 0, "teams": []})),
            )
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/teams/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalCount": 1,
                "teams": [{"id": 9, "name": "Eng"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/teams"))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(json!({"message": "Team name taken"})),
            )
            .mount(&server)
            .await;

        assert_eq!(client(&server).get_or_create_team("Eng").await.unwrap(), "9");
    }

    #[tokio::test]
    async fn test_team_members_are_normalized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/teams/4/members"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"orgId": 1, "teamId": 4, "userId": 7, "email": "b@x.com", "login": "b", "name": "Bee"},
                {"orgId": 1, "teamId": 4, "userId": 8, "email": "", "login": "sa-1"}
            ])))
            .mount(&server)
            .await;

        let members = client(&server).list_team_members("4").await.unwrap();
        assert_eq!(members, vec![DirectoryMember::new("7", "b@x.com", "Bee")]);
    }

    #[tokio::test]
    async fn test_add_member_sends_numeric_id_and_tolerates_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/teams/4/members"))
            .and(body_json(json!({"userId": 7})))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).add_member("4", "7").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_absent_member_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/teams/4/members/7"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).remove_member("4", "7").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_forbidden_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let result = client(&server).remove_member("4", "7").await;
        assert!(matches!(result, Err(ApiError::Authorization(_))));
    }

    #[tokio::test]
    async fn test_find_user_matches_case_insensitively() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/org/users/lookup"))
            .and(query_param("query", "Ada@X.io"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"userId": 2, "email": "adam@x.io", "login": "adam"},
                {"userId": 3, "email": "ada@x.io", "login": "ada", "name": "Ada"}
            ])))
            .mount(&server)
            .await;

        let user = client(&server).find_user("Ada@X.io").await.unwrap().unwrap();
        assert_eq!(user.id, "3");
        assert_eq!(user.display_name, "Ada");
    }

    #[tokio::test]
    async fn test_find_user_searches_past_a_full_lookup() {
        let server = MockServer::start().await;
        let near_misses: Vec<_> = (0..LOOKUP_LIMIT)
            .map(|i| json!({"userId": i, "email": format!("{}bob@x.io", i), "login": format!("bob{}", i)}))
            .collect();
        Mock::given(method("GET"))
            .and(path("/api/org/users/lookup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(near_misses)))
            .expect(1)
            .mount(&server)
            .await;

        let page = |users: serde_json::Value| {
            ResponseTemplate::new(200).set_body_json(json!({
                "totalCount": 101,
                "orgUsers": users,
                "page": 1,
                "perPage": 100,
            }))
        };
        Mock::given(method("GET"))
            .and(path("/api/org/users/search"))
            .and(query_param("query", "bob@x.io"))
            .and(query_param("page", "1"))
            .respond_with(page(json!(near_misses)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/org/users/search"))
            .and(query_param("page", "2"))
            .respond_with(page(json!([{"userId": 500, "email": "Bob@x.io", "login": "bob"}])))
            .mount(&server)
            .await;

        let user = client(&server).find_user("bob@x.io").await.unwrap().unwrap();
        assert_eq!(user.id, "500");
    }

    #[tokio::test]
    async fn test_find_user_stops_after_short_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/org/users/lookup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"userId": 2, "email": "bobby@x.io", "login": "bobby"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/org/users/search"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        assert!(client(&server).find_user("bob@x.io").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_or_create_user_creates_missing_account() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/org/users/lookup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/admin/users"))
            .and(body_partial_json(json!({
                "email": "new@x.io", "login": "new@x.io", "name": "New Person"
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": 31, "message": "User created"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let user = client(&server)
            .get_or_create_user("new@x.io", "New Person")
            .await
            .unwrap();
        assert_eq!(user, DirectoryMember::new("31", "new@x.io", "New Person"));
    }

    #[tokio::test]
    async fn test_list_users_walks_pages() {
        let server = MockServer::start().await;
        let users: Vec<_> = (1..=150)
            .map(|i| json!({"id": i, "email": format!("u{}@x.io", i), "login": format!("u{}", i), "isAdmin": i == 1}))
            .collect();
        Mock::given(method("GET"))
            .and(path("/api/users/search"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalCount": 150, "users": &users[..100], "page": 1, "perPage": 100
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/users/search"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalCount": 150, "users": &users[100..], "page": 2, "perPage": 100
            })))
            .mount(&server)
            .await;

        let all = client(&server).list_users().await.unwrap();
        assert_eq!(all.len(), 150);
        assert!(all[0].is_admin);
        assert!(!all[1].is_admin);
        assert_eq!(all[1].member.display_name, "u2");
    }

    #[tokio::test]
    async fn test_set_admin_flag() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/admin/users/7/permissions"))
            .and(body_json(json!({"isGrafanaAdmin": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message": "ok"})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).set_admin_flag("7", true).await.unwrap();
    }
}
