//! Domain models and the two store traits the rest of the core depends
//! on: `CaseStore` (cases, guilds) and `PermissionStore` (ranks,
//! assignments, commands) — split so the permission engine never needs
//! to depend on case persistence.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discord embed field limits cap how much reason text we keep around.
pub const MAX_REASON_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseType {
    Ban,
    TempBan,
    Unban,
    Kick,
    Timeout,
    Untimeout,
    Warn,
    Jail,
    Unjail,
    PollBan,
    PollUnban,
    SnippetBan,
    SnippetUnban,
}

impl CaseType {
    /// Coarse operation class used to key circuit breakers and timeout
    /// profiles.
    pub fn operation_class(self) -> crate::retry::OperationClass {
        use crate::retry::OperationClass;
        match self {
            CaseType::Ban | CaseType::TempBan | CaseType::Unban | CaseType::Kick => {
                OperationClass::BanKick
            }
            CaseType::Timeout | CaseType::Untimeout => OperationClass::Timeout,
            CaseType::PollBan | CaseType::PollUnban | CaseType::SnippetBan | CaseType::SnippetUnban => {
                OperationClass::Messages
            }
            CaseType::Warn | CaseType::Jail | CaseType::Unjail => OperationClass::ApiOther,
        }
    }

    /// Removal actions attempt a DM before the Discord action, since the
    /// user will no longer share a guild with the bot afterward.
    pub fn is_removal_action(self) -> bool {
        matches!(self, CaseType::Ban | CaseType::TempBan | CaseType::Kick)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            CaseType::Ban => "Ban",
            CaseType::TempBan => "Temp Ban",
            CaseType::Unban => "Unban",
            CaseType::Kick => "Kick",
            CaseType::Timeout => "Timeout",
            CaseType::Untimeout => "Untimeout",
            CaseType::Warn => "Warn",
            CaseType::Jail => "Jail",
            CaseType::Unjail => "Unjail",
            CaseType::PollBan => "Poll Ban",
            CaseType::PollUnban => "Poll Unban",
            CaseType::SnippetBan => "Snippet Ban",
            CaseType::SnippetUnban => "Snippet Unban",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Guild {
    pub guild_id: i64,
    pub joined_at: DateTime<Utc>,
    pub case_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct GuildConfig {
    pub guild_id: i64,
    pub mod_log_channel_id: Option<i64>,
    pub audit_log_channel_id: Option<i64>,
    pub join_log_channel_id: Option<i64>,
    pub private_log_channel_id: Option<i64>,
    pub report_log_channel_id: Option<i64>,
    pub dev_log_channel_id: Option<i64>,
    pub jail_channel_id: Option<i64>,
    pub general_channel_id: Option<i64>,
    pub starboard_channel_id: Option<i64>,
    pub jail_role_id: Option<i64>,
    pub quarantine_role_id: Option<i64>,
    pub base_staff_role_id: Option<i64>,
    pub base_member_role_id: Option<i64>,
    pub command_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PermissionRank {
    pub guild_id: i64,
    pub rank: i32,
    pub name: String,
    pub description: Option<String>,
    pub color: Option<i32>,
    pub enabled: bool,
}

/// The eight default ranks seeded by `initialize_guild`.
pub const DEFAULT_RANKS: [(i32, &str); 8] = [
    (0, "Member"),
    (1, "Trusted"),
    (2, "Junior Moderator"),
    (3, "Moderator"),
    (4, "Senior Moderator"),
    (5, "Administrator"),
    (6, "Head Administrator"),
    (7, "Server Owner"),
];

#[derive(Debug, Clone)]
pub struct PermissionAssignment {
    pub guild_id: i64,
    pub rank: i32,
    pub role_id: i64,
}

#[derive(Debug, Clone)]
pub struct PermissionCommand {
    pub guild_id: i64,
    pub command_name: String,
    pub required_rank: i32,
    pub description: Option<String>,
}

/// Commands that may never be configured via `set_command_permission`.
pub const RESTRICTED_COMMANDS: [&str; 4] = ["eval", "e", "jsk", "jishaku"];

pub fn is_restricted_command(name: &str) -> bool {
    RESTRICTED_COMMANDS
        .iter()
        .any(|r| r.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone)]
pub struct Case {
    pub case_id: uuid::Uuid,
    pub guild_id: i64,
    pub case_number: i64,
    pub case_type: CaseType,
    pub case_user_id: i64,
    pub case_moderator_id: i64,
    pub case_reason: String,
    pub case_status: bool,
    pub case_created_at: DateTime<Utc>,
    pub case_expires_at: Option<DateTime<Utc>>,
    pub case_user_roles: Vec<i64>,
    pub mod_log_message_id: Option<i64>,
    pub audit_log_message_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct CaseUpdate {
    pub reason: Option<String>,
    pub status: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NewCase {
    pub guild_id: i64,
    pub user_id: i64,
    pub moderator_id: i64,
    pub case_type: CaseType,
    pub reason: String,
    pub status: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub user_roles: Vec<i64>,
}

impl NewCase {
    pub fn bounded_reason(&self) -> String {
        let mut reason = self.reason.clone();
        let mut end = MAX_REASON_LEN.min(reason.len());
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
        reason
    }
}

#[async_trait]
pub trait CaseStore: Send + Sync {
    /// Not idempotent: duplicate calls produce duplicate case numbers. The
    /// coordinator avoids duplication via the per-user lock.
    async fn create_case(&self, new_case: NewCase) -> Result<Case, crate::error::StoreError>;

    async fn get_case_by_id(&self, case_id: uuid::Uuid) -> Result<Option<Case>, crate::error::StoreError>;

    async fn get_case_by_number(
        &self,
        guild_id: i64,
        number: i64,
    ) -> Result<Option<Case>, crate::error::StoreError>;

    async fn get_cases_by_user(
        &self,
        guild_id: i64,
        user_id: i64,
    ) -> Result<Vec<Case>, crate::error::StoreError>;

    async fn get_latest_case_by_user(
        &self,
        guild_id: i64,
        user_id: i64,
    ) -> Result<Option<Case>, crate::error::StoreError>;

    async fn update_case_by_number(
        &self,
        guild_id: i64,
        number: i64,
        update: CaseUpdate,
    ) -> Result<Option<Case>, crate::error::StoreError>;

    async fn update_mod_log_message_id(
        &self,
        case_id: uuid::Uuid,
        message_id: i64,
    ) -> Result<(), crate::error::StoreError>;

    async fn update_audit_log_message_id(
        &self,
        case_id: uuid::Uuid,
        message_id: i64,
    ) -> Result<(), crate::error::StoreError>;

    async fn get_guild_config(&self, guild_id: i64) -> Result<GuildConfig, crate::error::StoreError>;
}

#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn initialize_guild(&self, guild_id: i64) -> Result<(), crate::error::StoreError>;

    async fn get_ranks(&self, guild_id: i64) -> Result<Vec<PermissionRank>, crate::error::StoreError>;

    async fn get_assignments(
        &self,
        guild_id: i64,
    ) -> Result<Vec<PermissionAssignment>, crate::error::StoreError>;

    async fn get_command(
        &self,
        guild_id: i64,
        command_name: &str,
    ) -> Result<Option<PermissionCommand>, crate::error::StoreError>;

    async fn set_command_permission(
        &self,
        guild_id: i64,
        command_name: &str,
        required_rank: i32,
        description: Option<String>,
    ) -> Result<PermissionCommand, crate::error::StoreError>;

    async fn assign_rank(
        &self,
        guild_id: i64,
        rank: i32,
        role_id: i64,
    ) -> Result<(), crate::error::StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restricted_commands_are_case_insensitive() {
        assert!(is_restricted_command("Eval"));
        assert!(is_restricted_command("JSK"));
        assert!(is_restricted_command("jishaku"));
        assert!(!is_restricted_command("ban"));
    }

    #[test]
    fn reason_is_bounded() {
        let new_case = NewCase {
            guild_id: 1,
            user_id: 2,
            moderator_id: 3,
            case_type: CaseType::Ban,
            reason: "x".repeat(2000),
            status: true,
            expires_at: None,
            user_roles: vec![],
        };
        assert_eq!(new_case.bounded_reason().len(), MAX_REASON_LEN);
    }

    #[test]
    fn reason_truncation_respects_char_boundaries() {
        // "a" repeated up to the boundary, then a 4-byte emoji straddling
        // MAX_REASON_LEN, to make sure truncation never splits a codepoint.
        let mut reason = "a".repeat(MAX_REASON_LEN - 2);
        reason.push('😀');
        reason.push_str(&"b".repeat(50));
        let new_case = NewCase {
            guild_id: 1,
            user_id: 2,
            moderator_id: 3,
            case_type: CaseType::Ban,
            reason,
            status: true,
            expires_at: None,
            user_roles: vec![],
        };
        let bounded = new_case.bounded_reason();
        assert!(bounded.len() <= MAX_REASON_LEN);
        assert!(bounded.is_char_boundary(bounded.len()));
    }

    #[test]
    fn removal_actions_are_classified() {
        assert!(CaseType::Ban.is_removal_action());
        assert!(CaseType::TempBan.is_removal_action());
        assert!(CaseType::Kick.is_removal_action());
        assert!(!CaseType::Warn.is_removal_action());
        assert!(!CaseType::Jail.is_removal_action());
    }
}
