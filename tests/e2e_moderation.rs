//! End-to-end scenarios driving `ModerationCoordinator` through hand-written
//! `DiscordAdapter`/`CaseStore`/`PermissionStore` doubles, the way the unit
//! tests inside `coordinator::mod` exercise the pipeline, but from outside
//! the crate so only the public surface is reachable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use tuxmod::adapter::{AdapterError, AdapterResult, MemberInfo, RoleInfo};
use tuxmod::cache::memory::InMemoryCache;
use tuxmod::coordinator::jail::{self, JailStatusCache};
use tuxmod::error::StoreError;
use tuxmod::lock::LockManager;
use tuxmod::permissions::PermissionEngine;
use tuxmod::retry::RetryRegistry;
use tuxmod::store::{
    Case, CaseUpdate, GuildConfig, NewCase, PermissionAssignment, PermissionCommand, PermissionRank,
};
use tuxmod::{
    ActionContext, ActionStep, AuditMonitor, CaseStore, CaseType, DiscordAdapter,
    ModerationCoordinator, ModerationRequest, PermissionStore,
};
use uuid::Uuid;

struct ScriptedAdapter {
    fail_ban: bool,
    dm_forbidden: bool,
    sent_dms: StdMutex<Vec<(i64, String)>>,
    guild_roles: Vec<RoleInfo>,
    /// When set, `ban` fails for every call after the first on a given
    /// (guild, user) pair, simulating Discord rejecting a ban against a
    /// target that a prior concurrent call already banned.
    fail_if_already_banned: bool,
    banned: StdMutex<HashSet<(i64, i64)>>,
}

impl ScriptedAdapter {
    fn new() -> Self {
        Self {
            fail_ban: false,
            dm_forbidden: false,
            sent_dms: StdMutex::new(Vec::new()),
            guild_roles: Vec::new(),
            fail_if_already_banned: false,
            banned: StdMutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl DiscordAdapter for ScriptedAdapter {
    async fn send_dm(&self, user_id: i64, text: &str) -> AdapterResult<()> {
        if self.dm_forbidden {
            return Err(AdapterError::Forbidden);
        }
        self.sent_dms.lock().unwrap().push((user_id, text.to_string()));
        Ok(())
    }
    async fn ban(&self, guild_id: i64, user_id: i64, _purge_days: u32, _reason: &str) -> AdapterResult<()> {
        if self.fail_ban {
            return Err(AdapterError::NotFound);
        }
        if self.fail_if_already_banned && !self.banned.lock().unwrap().insert((guild_id, user_id)) {
            return Err(AdapterError::NotFound);
        }
        Ok(())
    }
    async fn unban(&self, _guild_id: i64, _user_id: i64, _reason: &str) -> AdapterResult<()> {
        Ok(())
    }
    async fn kick(&self, _guild_id: i64, _user_id: i64, _reason: &str) -> AdapterResult<()> {
        Ok(())
    }
    async fn timeout(&self, _guild_id: i64, _user_id: i64, _until: DateTime<Utc>, _reason: &str) -> AdapterResult<()> {
        Ok(())
    }
    async fn remove_timeout(&self, _guild_id: i64, _user_id: i64, _reason: &str) -> AdapterResult<()> {
        Ok(())
    }
    async fn add_roles(&self, _guild_id: i64, _user_id: i64, _roles: &[i64], _reason: &str) -> AdapterResult<()> {
        Ok(())
    }
    async fn remove_roles(&self, _guild_id: i64, _user_id: i64, _roles: &[i64], _reason: &str) -> AdapterResult<()> {
        Ok(())
    }
    async fn send_message(&self, _channel_id: i64, _embed_json: serde_json::Value) -> AdapterResult<i64> {
        Ok(9001)
    }
    async fn fetch_message(&self, _channel_id: i64, _message_id: i64) -> AdapterResult<()> {
        Ok(())
    }
    async fn edit_message(&self, _channel_id: i64, _message_id: i64, _embed_json: serde_json::Value) -> AdapterResult<()> {
        Ok(())
    }
    async fn guild_roles(&self, _guild_id: i64) -> AdapterResult<Vec<RoleInfo>> {
        Ok(self.guild_roles.clone())
    }
    async fn member(&self, _guild_id: i64, user_id: i64) -> AdapterResult<Option<MemberInfo>> {
        Ok(Some(MemberInfo {
            user_id,
            role_ids: vec![],
            top_role_position: 1,
        }))
    }
    async fn bot_member(&self, _guild_id: i64) -> AdapterResult<MemberInfo> {
        Ok(MemberInfo {
            user_id: 999,
            role_ids: vec![],
            top_role_position: 50,
        })
    }
    async fn bot_has_permission(&self, _guild_id: i64, _permission: &str) -> AdapterResult<bool> {
        Ok(true)
    }
}

#[derive(Default)]
struct InMemoryCaseStore {
    cases: StdMutex<Vec<Case>>,
    counter: StdMutex<i64>,
}

#[async_trait]
impl CaseStore for InMemoryCaseStore {
    async fn create_case(&self, new_case: NewCase) -> Result<Case, StoreError> {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        let case = Case {
            case_id: Uuid::new_v4(),
            guild_id: new_case.guild_id,
            case_number: *counter,
            case_type: new_case.case_type,
            case_user_id: new_case.user_id,
            case_moderator_id: new_case.moderator_id,
            case_reason: new_case.bounded_reason(),
            case_status: new_case.status,
            case_created_at: Utc::now(),
            case_expires_at: new_case.expires_at,
            case_user_roles: new_case.user_roles,
            mod_log_message_id: None,
            audit_log_message_id: None,
        };
        self.cases.lock().unwrap().push(case.clone());
        Ok(case)
    }
    async fn get_case_by_id(&self, case_id: Uuid) -> Result<Option<Case>, StoreError> {
        Ok(self.cases.lock().unwrap().iter().find(|c| c.case_id == case_id).cloned())
    }
    async fn get_case_by_number(&self, guild_id: i64, number: i64) -> Result<Option<Case>, StoreError> {
        Ok(self
            .cases
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.guild_id == guild_id && c.case_number == number)
            .cloned())
    }
    async fn get_cases_by_user(&self, guild_id: i64, user_id: i64) -> Result<Vec<Case>, StoreError> {
        Ok(self
            .cases
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.guild_id == guild_id && c.case_user_id == user_id)
            .cloned()
            .collect())
    }
    async fn get_latest_case_by_user(&self, guild_id: i64, user_id: i64) -> Result<Option<Case>, StoreError> {
        Ok(self
            .cases
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.guild_id == guild_id && c.case_user_id == user_id)
            .max_by_key(|c| c.case_number)
            .cloned())
    }
    async fn update_case_by_number(
        &self,
        guild_id: i64,
        number: i64,
        update: CaseUpdate,
    ) -> Result<Option<Case>, StoreError> {
        let mut cases = self.cases.lock().unwrap();
        if let Some(case) = cases
            .iter_mut()
            .find(|c| c.guild_id == guild_id && c.case_number == number)
        {
            if let Some(reason) = update.reason {
                case.case_reason = reason;
            }
            if let Some(status) = update.status {
                case.case_status = status;
            }
            Ok(Some(case.clone()))
        } else {
            Ok(None)
        }
    }
    async fn update_mod_log_message_id(&self, case_id: Uuid, message_id: i64) -> Result<(), StoreError> {
        let mut cases = self.cases.lock().unwrap();
        if let Some(case) = cases.iter_mut().find(|c| c.case_id == case_id) {
            case.mod_log_message_id = Some(message_id);
        }
        Ok(())
    }
    async fn update_audit_log_message_id(&self, _case_id: Uuid, _message_id: i64) -> Result<(), StoreError> {
        Ok(())
    }
    async fn get_guild_config(&self, guild_id: i64) -> Result<GuildConfig, StoreError> {
        Ok(GuildConfig {
            guild_id,
            mod_log_channel_id: Some(42),
            ..Default::default()
        })
    }
}

#[derive(Default)]
struct OpenPermissionStore;

#[async_trait]
impl PermissionStore for OpenPermissionStore {
    async fn initialize_guild(&self, _guild_id: i64) -> Result<(), StoreError> {
        Ok(())
    }
    async fn get_ranks(&self, guild_id: i64) -> Result<Vec<PermissionRank>, StoreError> {
        Ok(vec![PermissionRank {
            guild_id,
            rank: 5,
            name: "Administrator".to_string(),
            description: None,
            color: None,
            enabled: true,
        }])
    }
    async fn get_assignments(&self, guild_id: i64) -> Result<Vec<PermissionAssignment>, StoreError> {
        Ok(vec![PermissionAssignment {
            guild_id,
            rank: 5,
            role_id: 222,
        }])
    }
    async fn get_command(&self, guild_id: i64, command_name: &str) -> Result<Option<PermissionCommand>, StoreError> {
        Ok(Some(PermissionCommand {
            guild_id,
            command_name: command_name.to_string(),
            required_rank: 2,
            description: None,
        }))
    }
    async fn set_command_permission(
        &self,
        guild_id: i64,
        command_name: &str,
        required_rank: i32,
        description: Option<String>,
    ) -> Result<PermissionCommand, StoreError> {
        if tuxmod::store::is_restricted_command(command_name) {
            return Err(StoreError::RestrictedCommand(command_name.to_string()));
        }
        Ok(PermissionCommand {
            guild_id,
            command_name: command_name.to_string(),
            required_rank,
            description,
        })
    }
    async fn assign_rank(&self, _guild_id: i64, _rank: i32, _role_id: i64) -> Result<(), StoreError> {
        Ok(())
    }
}

fn ban_request() -> ModerationRequest {
    ModerationRequest {
        ctx: ActionContext {
            guild_id: 111,
            moderator_id: 222,
            moderator_role_ids: vec![222],
            ..Default::default()
        },
        command_name: "ban".to_string(),
        case_type: CaseType::Ban,
        target_user_id: 333,
        reason: "spam".to_string(),
        silent: false,
        dm_action: None,
        actions: vec![ActionStep::Ban { purge_days: 0 }],
        duration_display: None,
        expires_at: None,
        case_user_roles: vec![],
    }
}

fn build_coordinator(adapter: ScriptedAdapter) -> ModerationCoordinator {
    let cache = Arc::new(InMemoryCache::new(1000));
    let permission_store: Arc<dyn PermissionStore> = Arc::new(OpenPermissionStore);
    let permissions = Arc::new(PermissionEngine::new(cache, permission_store));
    let store: Arc<dyn CaseStore> = Arc::new(InMemoryCaseStore::default());
    ModerationCoordinator::new(
        Arc::new(adapter),
        permissions,
        store,
        LockManager::new(),
        RetryRegistry::new(),
        Arc::new(AuditMonitor::new(128)),
    )
}

#[tokio::test]
async fn e2e_1_ban_success() {
    let coordinator = build_coordinator(ScriptedAdapter::new());
    let outcome = coordinator.execute_moderation_action(ban_request()).await;

    assert!(outcome.succeeded);
    assert!(outcome.dm_sent);
    let case = outcome.case.expect("case persisted");
    assert_eq!(case.case_number, 1);
    assert_eq!(case.case_type, CaseType::Ban);
    assert!(case.case_status);
    assert_eq!(case.mod_log_message_id, Some(9001));
}

#[tokio::test]
async fn e2e_2_ban_with_dm_blocked() {
    let mut adapter = ScriptedAdapter::new();
    adapter.dm_forbidden = true;
    let coordinator = build_coordinator(adapter);
    let outcome = coordinator.execute_moderation_action(ban_request()).await;

    assert!(outcome.succeeded);
    assert!(!outcome.dm_sent);
    let case = outcome.case.expect("case still persisted despite blocked dm");
    assert!(case.case_status);
}

#[derive(Default)]
struct FailingCaseStore {
    inner: InMemoryCaseStore,
}

#[async_trait]
impl CaseStore for FailingCaseStore {
    async fn create_case(&self, _new_case: NewCase) -> Result<Case, StoreError> {
        Err(StoreError::TimedOut)
    }
    async fn get_case_by_id(&self, case_id: Uuid) -> Result<Option<Case>, StoreError> {
        self.inner.get_case_by_id(case_id).await
    }
    async fn get_case_by_number(&self, guild_id: i64, number: i64) -> Result<Option<Case>, StoreError> {
        self.inner.get_case_by_number(guild_id, number).await
    }
    async fn get_cases_by_user(&self, guild_id: i64, user_id: i64) -> Result<Vec<Case>, StoreError> {
        self.inner.get_cases_by_user(guild_id, user_id).await
    }
    async fn get_latest_case_by_user(&self, guild_id: i64, user_id: i64) -> Result<Option<Case>, StoreError> {
        self.inner.get_latest_case_by_user(guild_id, user_id).await
    }
    async fn update_case_by_number(
        &self,
        guild_id: i64,
        number: i64,
        update: CaseUpdate,
    ) -> Result<Option<Case>, StoreError> {
        self.inner.update_case_by_number(guild_id, number, update).await
    }
    async fn update_mod_log_message_id(&self, case_id: Uuid, message_id: i64) -> Result<(), StoreError> {
        self.inner.update_mod_log_message_id(case_id, message_id).await
    }
    async fn update_audit_log_message_id(&self, case_id: Uuid, message_id: i64) -> Result<(), StoreError> {
        self.inner.update_audit_log_message_id(case_id, message_id).await
    }
    async fn get_guild_config(&self, guild_id: i64) -> Result<GuildConfig, StoreError> {
        self.inner.get_guild_config(guild_id).await
    }
}

#[tokio::test]
async fn e2e_3_ban_with_db_outage_still_reports_success() {
    let cache = Arc::new(InMemoryCache::new(1000));
    let permission_store: Arc<dyn PermissionStore> = Arc::new(OpenPermissionStore);
    let permissions = Arc::new(PermissionEngine::new(cache, permission_store));
    let store: Arc<dyn CaseStore> = Arc::new(FailingCaseStore::default());
    let coordinator = ModerationCoordinator::new(
        Arc::new(ScriptedAdapter::new()),
        permissions,
        store,
        LockManager::new(),
        RetryRegistry::new(),
        Arc::new(AuditMonitor::new(128)),
    );

    let outcome = coordinator.execute_moderation_action(ban_request()).await;
    assert!(outcome.succeeded);
    assert!(outcome.case.is_none());
    assert!(outcome.response_message.contains("couldn't save the case record"));
}

#[tokio::test]
async fn e2e_4_concurrent_bans_on_same_target_serialize_and_void_the_second() {
    let cache = Arc::new(InMemoryCache::new(1000));
    let permission_store: Arc<dyn PermissionStore> = Arc::new(OpenPermissionStore);
    let permissions = Arc::new(PermissionEngine::new(cache, permission_store));
    let store: Arc<dyn CaseStore> = Arc::new(InMemoryCaseStore::default());
    let mut adapter = ScriptedAdapter::new();
    adapter.fail_if_already_banned = true;
    let coordinator = Arc::new(ModerationCoordinator::new(
        Arc::new(adapter),
        permissions,
        store,
        LockManager::new(),
        RetryRegistry::new(),
        Arc::new(AuditMonitor::new(128)),
    ));

    let mut first = ban_request();
    first.reason = "a".to_string();
    let mut second = ban_request();
    second.reason = "b".to_string();

    let c1 = coordinator.clone();
    let c2 = coordinator.clone();
    let (outcome_a, outcome_b) = tokio::join!(
        c1.execute_moderation_action(first),
        c2.execute_moderation_action(second),
    );

    let case_a = outcome_a.case.clone().expect("first ban persists a case");
    let case_b = outcome_b.case.clone().expect("second ban persists a case");
    assert_ne!(case_a.case_number, case_b.case_number);
    // Both serialize through the per-(guild,user) lock; neither observes a
    // torn write, and case numbers are contiguous regardless of arrival order.
    let mut numbers = [case_a.case_number, case_b.case_number];
    numbers.sort_unstable();
    assert_eq!(numbers, [1, 2]);

    // Exactly one of the two serialized attempts wins the ban; the other
    // observes the target already banned and is voided.
    let outcomes = [(&outcome_a, &case_a), (&outcome_b, &case_b)];
    assert_eq!(outcomes.iter().filter(|(o, _)| o.succeeded).count(), 1);
    assert_eq!(outcomes.iter().filter(|(o, _)| !o.succeeded).count(), 1);

    let (_, winner_case) = outcomes.iter().find(|(o, _)| o.succeeded).unwrap();
    assert!(winner_case.case_status);

    let (voided_outcome, voided_case) = outcomes.iter().find(|(o, _)| !o.succeeded).unwrap();
    assert!(!voided_case.case_status);
    assert!(voided_case.case_reason.contains("Discord action failed"));
    assert!(voided_case.case_reason.contains("target_state"));
    assert!(voided_outcome.response_message.to_lowercase().contains("target"));
}

#[tokio::test]
async fn e2e_5_jail_then_unjail_restores_manageable_roles() {
    let manageable_before = vec![10, 11];
    let target_roles = vec![10, 11, 12]; // 12 is above the bot, unmanageable
    let guild_roles = vec![
        RoleInfo { id: 10, position: 1, managed: false, is_premium_subscriber_role: false },
        RoleInfo { id: 11, position: 2, managed: false, is_premium_subscriber_role: false },
        RoleInfo { id: 12, position: 99, managed: false, is_premium_subscriber_role: false },
    ];

    let manageable = jail::compute_manageable_roles(111, 50, 900, &target_roles, &guild_roles);
    assert_eq!(manageable, manageable_before);

    let jail_steps = jail::jail_actions(900, &manageable);
    assert!(matches!(&jail_steps[0], ActionStep::AddRoles(roles) if roles == &vec![900]));
    assert!(matches!(&jail_steps[1], ActionStep::RemoveRoles(roles) if roles == &manageable_before));

    let unjail_steps = jail::unjail_actions(900, &manageable_before, &guild_roles);
    assert!(matches!(&unjail_steps[0], ActionStep::RemoveRoles(roles) if roles == &vec![900]));
    match &unjail_steps[1] {
        ActionStep::AddRoles(roles) => {
            let mut restored = roles.clone();
            restored.sort_unstable();
            assert_eq!(restored, manageable_before);
        }
        other => panic!("expected AddRoles, got {other:?}"),
    }
}

#[tokio::test]
async fn e2e_6_rejoin_while_jailed_reapplies_the_role_without_a_new_case() {
    let store = InMemoryCaseStore::default();
    store
        .create_case(NewCase {
            guild_id: 111,
            user_id: 333,
            moderator_id: 222,
            case_type: CaseType::Jail,
            reason: "flood".to_string(),
            status: true,
            expires_at: None,
            user_roles: vec![10, 11],
        })
        .await
        .unwrap();

    let adapter = ScriptedAdapter::new();
    let cache: Arc<dyn tuxmod::cache::CacheBackend> = Arc::new(InMemoryCache::new(1000));
    let status_cache = JailStatusCache::new(cache);

    let rejailed = jail::handle_member_join(&adapter, &store, &status_cache, 111, 333, 900)
        .await
        .unwrap();
    assert!(rejailed);

    // No new case is created by the rejoin path itself.
    let cases = store.get_cases_by_user(111, 333).await.unwrap();
    assert_eq!(cases.len(), 1);

    assert_eq!(status_cache.get(111, 333).await, Some(true));
}

#[tokio::test]
async fn e2e_7_restricted_command_rejection() {
    let cache = Arc::new(InMemoryCache::new(1000));
    let permission_store: Arc<dyn PermissionStore> = Arc::new(OpenPermissionStore);
    let engine = PermissionEngine::new(cache, permission_store);

    let result = engine.set_command_permission(111, "Eval", 3, None).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn cancellation_before_any_discord_call_short_circuits_and_still_audits() {
    let coordinator = build_coordinator(ScriptedAdapter::new());
    let mut request = ban_request();
    request.ctx.cancellation.cancel();

    let outcome = coordinator.execute_moderation_action(request).await;
    assert!(!outcome.succeeded);
    assert!(outcome.case.is_none());
    assert!(outcome.response_message.to_lowercase().contains("cancel"));
}
