//! Jail, unjail, and rejoin handling. Jail is an ordinary moderation
//! action whose Discord side effects are computed here: snapshot the
//! target's manageable roles, assign the jail role, strip the rest.

use crate::adapter::{DiscordAdapter, RoleInfo};
use crate::cache::{CacheBackend, TypedCache};
use crate::coordinator::ActionStep;
use crate::error::ModerationError;
use crate::store::{Case, CaseStore, CaseType};
use std::sync::Arc;
use std::time::Duration;

/// A role is manageable if the bot can freely add/remove it: assignable
/// below the bot's own top role, not @everyone, not the jail role itself,
/// not bot-managed (integration roles), and not the premium-subscriber
/// (booster) role.
pub fn compute_manageable_roles(
    guild_id: i64,
    bot_top_role_position: i32,
    jail_role_id: i64,
    target_role_ids: &[i64],
    guild_roles: &[RoleInfo],
) -> Vec<i64> {
    let _ = guild_id;
    target_role_ids
        .iter()
        .copied()
        .filter(|&role_id| role_id != jail_role_id)
        .filter(|role_id| {
            guild_roles
                .iter()
                .find(|r| r.id == *role_id)
                .map(|r| {
                    r.position < bot_top_role_position && !r.managed && !r.is_premium_subscriber_role
                })
                .unwrap_or(false)
        })
        .collect()
}

/// Builds the (snapshot-implicit) action sequence for a jail: add the
/// jail role, then strip every manageable role the target currently
/// holds. The snapshot itself travels in `ModerationRequest::case_user_roles`
/// so it can be persisted with the case.
pub fn jail_actions(jail_role_id: i64, manageable_roles: &[i64]) -> Vec<ActionStep> {
    let mut actions = vec![ActionStep::AddRoles(vec![jail_role_id])];
    if !manageable_roles.is_empty() {
        actions.push(ActionStep::RemoveRoles(manageable_roles.to_vec()));
    }
    actions
}

/// Builds the unjail action sequence: remove the jail role, restore the
/// roles from the snapshot that still exist in the guild.
pub fn unjail_actions(jail_role_id: i64, snapshot_roles: &[i64], current_guild_roles: &[RoleInfo]) -> Vec<ActionStep> {
    let still_present: Vec<i64> = snapshot_roles
        .iter()
        .copied()
        .filter(|id| current_guild_roles.iter().any(|r| r.id == *id))
        .collect();

    let mut actions = vec![ActionStep::RemoveRoles(vec![jail_role_id])];
    if !still_present.is_empty() {
        actions.push(ActionStep::AddRoles(still_present));
    }
    actions
}

const JAIL_STATUS_TTL: Duration = Duration::from_secs(300);

/// Fronts the "is this user currently jailed" lookup so a rejoin burst
/// does not hit the case store once per join.
pub struct JailStatusCache {
    cache: Arc<dyn CacheBackend>,
}

impl JailStatusCache {
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self { cache }
    }

    fn key(guild_id: i64, user_id: i64) -> String {
        format!("tux:jail_status:{guild_id}:{user_id}")
    }

    pub async fn get(&self, guild_id: i64, user_id: i64) -> Option<bool> {
        self.cache
            .get_json::<bool>(&Self::key(guild_id, user_id))
            .await
            .ok()
            .flatten()
    }

    pub async fn set(&self, guild_id: i64, user_id: i64, jailed: bool) {
        let _ = self
            .cache
            .set_json(&Self::key(guild_id, user_id), &jailed, Some(JAIL_STATUS_TTL))
            .await;
    }
}

/// Driven by the gateway adapter's member-join event: if the user's most
/// recent case in this guild is an unresolved JAIL (not followed by an
/// UNJAIL), re-applies the jail role immediately.
pub async fn handle_member_join(
    adapter: &dyn DiscordAdapter,
    store: &dyn CaseStore,
    status_cache: &JailStatusCache,
    guild_id: i64,
    user_id: i64,
    jail_role_id: i64,
) -> Result<bool, ModerationError> {
    if let Some(false) = status_cache.get(guild_id, user_id).await {
        return Ok(false);
    }

    let latest: Option<Case> = store.get_latest_case_by_user(guild_id, user_id).await?;
    let is_jailed = matches!(latest.as_ref(), Some(c) if c.case_type == CaseType::Jail);
    status_cache.set(guild_id, user_id, is_jailed).await;

    if !is_jailed {
        return Ok(false);
    }

    adapter
        .add_roles(
            guild_id,
            user_id,
            &[jail_role_id],
            "Re-jail on rejoin (was jailed before leaving)",
        )
        .await
        .map_err(|e| ModerationError::Infrastructure { reason: e.to_string() })?;

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(id: i64, position: i32, managed: bool, premium: bool) -> RoleInfo {
        RoleInfo {
            id,
            position,
            managed,
            is_premium_subscriber_role: premium,
        }
    }

    #[test]
    fn manageable_roles_exclude_jail_role_managed_and_premium() {
        let guild_roles = vec![
            role(10, 1, false, false),  // manageable
            role(20, 2, true, false),   // bot-managed, excluded
            role(30, 3, false, true),   // booster role, excluded
            role(40, 99, false, false), // above bot, excluded
        ];
        let jail_role_id = 50;
        let target_roles = vec![10, 20, 30, 40, jail_role_id];

        let manageable = compute_manageable_roles(1, 50, jail_role_id, &target_roles, &guild_roles);
        assert_eq!(manageable, vec![10]);
    }

    #[test]
    fn unjail_only_restores_roles_still_present_in_guild() {
        let current_roles = vec![role(10, 1, false, false)];
        let snapshot = vec![10, 20]; // 20 no longer exists
        let actions = unjail_actions(99, &snapshot, &current_roles);
        assert_eq!(actions.len(), 2);
        match &actions[1] {
            ActionStep::AddRoles(roles) => assert_eq!(roles, &vec![10]),
            _ => panic!("expected AddRoles"),
        }
    }

    #[test]
    fn jail_actions_skip_role_removal_when_nothing_manageable() {
        let actions = jail_actions(99, &[]);
        assert_eq!(actions.len(), 1);
    }
}
