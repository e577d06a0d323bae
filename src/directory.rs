//! Directory abstractions the sync engine works against.
//!
//! Membership is compared by email, case-insensitively: every set is keyed by
//! the lowercased address, and the set operations never look at ids.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

use crate::error::ApiResult;

/// A person as seen by either directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryMember {
    /// Directory-specific identifier (Okta user id, Grafana numeric user id).
    pub id: String,
    pub email: String,
    pub display_name: String,
}

impl DirectoryMember {
    pub fn new(
        id: impl Into<String>,
        email: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            display_name: display_name.into(),
        }
    }

    pub fn email_key(&self) -> String {
        normalize_email(&self.email)
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Members keyed by lowercased email. Inserting an email that differs only in
/// case replaces the earlier entry.
#[derive(Debug, Clone, Default)]
pub struct MembershipSet {
    members: HashMap<String, DirectoryMember>,
}

impl MembershipSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, member: DirectoryMember) {
        self.members.insert(member.email_key(), member);
    }

    pub fn get(&self, email: &str) -> Option<&DirectoryMember> {
        self.members.get(&normalize_email(email))
    }

    pub fn contains(&self, email: &str) -> bool {
        self.members.contains_key(&normalize_email(email))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn emails(&self) -> BTreeSet<String> {
        self.members.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirectoryMember> {
        self.members.values()
    }
}

impl FromIterator<DirectoryMember> for MembershipSet {
    fn from_iter<I: IntoIterator<Item = DirectoryMember>>(iter: I) -> Self {
        let mut set = MembershipSet::new();
        for member in iter {
            set.insert(member);
        }
        set
    }
}

/// Emails to add to and remove from a target team.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub to_add: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
}

impl SyncPlan {
    /// `to_add = source - target`, `to_remove = target - source`.
    pub fn compute(source: &MembershipSet, target: &MembershipSet) -> Self {
        let source = source.emails();
        let target = target.emails();
        Self {
            to_add: source.difference(&target).cloned().collect(),
            to_remove: target.difference(&source).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// A target-directory account with its server-admin flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUser {
    pub member: DirectoryMember,
    pub is_admin: bool,
}

/// Where desired membership is read from.
#[async_trait]
pub trait SourceDirectory: Send + Sync {
    /// Resolve a group name to its id. The name must match exactly.
    async fn find_group_by_name(&self, name: &str) -> ApiResult<String>;

    async fn list_group_members(&self, group_id: &str) -> ApiResult<Vec<DirectoryMember>>;
}

/// Where membership is enforced.
#[async_trait]
pub trait TargetDirectory: Send + Sync {
    /// Look up a team by exact name without creating it.
    async fn find_team(&self, name: &str) -> ApiResult<Option<String>>;

    /// Find the team by exact name, creating it when absent. Returns the team id.
    async fn get_or_create_team(&self, name: &str) -> ApiResult<String>;

    async fn list_team_members(&self, team_id: &str) -> ApiResult<Vec<DirectoryMember>>;

    async fn add_member(&self, team_id: &str, user_id: &str) -> ApiResult<()>;

    async fn remove_member(&self, team_id: &str, user_id: &str) -> ApiResult<()>;

    /// Look up an existing account by email, case-insensitively.
    async fn find_user(&self, email: &str) -> ApiResult<Option<DirectoryMember>>;

    /// Return the account for `email`, creating it when absent.
    async fn get_or_create_user(&self, email: &str, display_name: &str)
        -> ApiResult<DirectoryMember>;

    async fn list_users(&self) -> ApiResult<Vec<TargetUser>>;

    async fn set_admin_flag(&self, user_id: &str, is_admin: bool) -> ApiResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(email: &str) -> DirectoryMember {
        DirectoryMember::new(email, email, email)
    }

    fn set(emails: &[&str]) -> MembershipSet {
        emails.iter().map(|e| member(e)).collect()
    }

    #[test]
    fn test_membership_is_case_insensitive() {
        let mut members = MembershipSet::new();
        members.insert(DirectoryMember::new("1", "Alice@Example.com", "Alice"));
        members.insert(DirectoryMember::new("2", "alice@example.com", "Alice Again"));

        assert_eq!(members.len(), 1);
        assert!(members.contains("ALICE@example.COM"));
        assert_eq!(members.get("alice@example.com").unwrap().id, "2");
    }

    #[test]
    fn test_plan_difference() {
        let source = set(&["a@x.io", "b@x.io", "c@x.io"]);
        let target = set(&["B@x.io", "d@x.io"]);

        let plan = SyncPlan::compute(&source, &target);
        assert_eq!(
            plan.to_add,
            ["a@x.io", "c@x.io"].iter().map(|s| s.to_string()).collect()
        );
        assert_eq!(
            plan.to_remove,
            ["d@x.io"].iter().map(|s| s.to_string()).collect()
        );
    }

    #[test]
    fn test_plan_is_empty_when_equal_up_to_case() {
        let source = set(&["A@x.io", "b@x.io"]);
        let target = set(&["a@X.io", "B@x.io"]);
        assert!(SyncPlan::compute(&source, &target).is_empty());
    }

    #[test]
    fn test_plan_against_empty_sides() {
        let empty = MembershipSet::new();
        let some = set(&["a@x.io"]);

        assert_eq!(SyncPlan::compute(&some, &empty).to_add.len(), 1);
        assert_eq!(SyncPlan::compute(&empty, &some).to_remove.len(), 1);
        assert!(SyncPlan::compute(&empty, &empty).is_empty());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    const EMAIL: &str = "[a-zA-Z]{1,6}@[a-zA-Z]{1,4}\\.(io|COM|com)";

    fn members(emails: &[String]) -> MembershipSet {
        emails
            .iter()
            .map(|e| DirectoryMember::new(e.clone(), e.clone(), e.clone()))
            .collect()
    }

    proptest! {
        /// Property: applying the plan to the target yields exactly the source
        #[test]
        fn prop_plan_reconstructs_source(
            shared in prop::collection::vec(EMAIL, 0..15),
            only_source in prop::collection::vec(EMAIL, 0..15),
            only_target in prop::collection::vec(EMAIL, 0..15),
        ) {
            let source_emails: Vec<String> = shared.iter().chain(&only_source).cloned().collect();
            // Same identities as the source side, spelled in another case.
            let target_emails: Vec<String> = shared
                .iter()
                .map(|e| e.to_uppercase())
                .chain(only_target.iter().cloned())
                .collect();

            let source = members(&source_emails);
            let target = members(&target_emails);
            let plan = SyncPlan::compute(&source, &target);

            prop_assert!(plan.to_add.is_disjoint(&plan.to_remove));

            let mut applied: BTreeSet<String> = target
                .emails()
                .difference(&plan.to_remove)
                .cloned()
                .collect();
            applied.extend(plan.to_add.iter().cloned());
            prop_assert_eq!(applied, source.emails());
        }

        /// Property: a set compared with itself in any case needs no changes
        #[test]
        fn prop_plan_ignores_case(emails in prop::collection::vec(EMAIL, 0..20)) {
            let lower: Vec<String> = emails.iter().map(|e| e.to_lowercase()).collect();
            let plan = SyncPlan::compute(&members(&emails), &members(&lower));
            prop_assert!(plan.is_empty());
        }
    }
}
