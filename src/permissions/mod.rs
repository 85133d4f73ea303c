//! Dynamic per-guild permission checking, grounded in
//! `original_source/src/tux/database/controllers/permissions.py` for the
//! cache-key shape, TTL constants, and the user-rank resolution algorithm.

pub mod model;

use crate::cache::{CacheBackend, TypedCache};
use crate::error::ModerationError;
use crate::store::{is_restricted_command, PermissionStore};
use std::sync::Arc;
use std::time::Duration;

/// All three permission caches share this TTL.
pub const CACHE_TTL: Duration = Duration::from_secs(7200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied {
        required_rank: i32,
        user_rank: i32,
        command_name: String,
    },
    NotConfigured {
        command_name: String,
    },
}

pub struct PermissionEngine {
    cache: Arc<dyn CacheBackend>,
    store: Arc<dyn PermissionStore>,
}

fn ancestors(command_name: &str) -> Vec<String> {
    // "a b c" -> ["a b c", "a b", "a"]: right-to-left ancestor walk.
    let parts: Vec<&str> = command_name.split(' ').collect();
    (1..=parts.len())
        .rev()
        .map(|n| parts[..n].join(" "))
        .collect()
}

impl PermissionEngine {
    pub fn new(cache: Arc<dyn CacheBackend>, store: Arc<dyn PermissionStore>) -> Self {
        Self { cache, store }
    }

    pub async fn initialize_guild(&self, guild_id: i64) -> Result<(), ModerationError> {
        self.store.initialize_guild(guild_id).await?;
        Ok(())
    }

    fn command_cache_key(guild_id: i64, command_name: &str) -> String {
        format!("perm:cmd:{guild_id}:{command_name}")
    }

    fn ranks_cache_key(guild_id: i64) -> String {
        format!("perm:ranks:{guild_id}")
    }

    fn assignments_cache_key(guild_id: i64) -> String {
        format!("perm:assignments:{guild_id}")
    }

    fn user_rank_cache_key(guild_id: i64, user_id: i64, role_ids: &[i64]) -> String {
        let mut sorted = role_ids.to_vec();
        sorted.sort_unstable();
        format!("perm:user_rank:{guild_id}:{user_id}:{sorted:?}")
    }

    /// Finds the controlling `PermissionCommand`, preferring the most
    /// specific configured entry over a parent. A cache entry distinguishes "cached absent"
    /// (`Some(None)`) from "cache miss" (`None`) so a command known to have
    /// no configuration anywhere in its ancestor chain does not re-hit the
    /// store on every call.
    async fn resolve_command(
        &self,
        guild_id: i64,
        command_name: &str,
    ) -> Result<Option<(String, i32)>, ModerationError> {
        for candidate in ancestors(command_name) {
            let key = Self::command_cache_key(guild_id, &candidate);
            if let Some(cached) = self
                .cache
                .get_json::<Option<i32>>(&key)
                .await
                .unwrap_or(None)
            {
                if let Some(rank) = cached {
                    return Ok(Some((candidate, rank)));
                }
                continue;
            }

            let command = self.store.get_command(guild_id, &candidate).await?;
            match command {
                Some(cmd) => {
                    let _ = self
                        .cache
                        .set_json(&key, &Some(cmd.required_rank), Some(CACHE_TTL))
                        .await;
                    return Ok(Some((candidate, cmd.required_rank)));
                }
                None => {
                    let _ = self
                        .cache
                        .set_json::<Option<i32>>(&key, &None, Some(CACHE_TTL))
                        .await;
                }
            }
        }
        Ok(None)
    }

    /// Step 2: intersects the user's roles with assigned roles in the
    /// guild, returning the maximum rank (0 if none assigned).
    async fn resolve_user_rank(
        &self,
        guild_id: i64,
        user_id: i64,
        user_role_ids: &[i64],
    ) -> Result<i32, ModerationError> {
        let cache_key = Self::user_rank_cache_key(guild_id, user_id, user_role_ids);
        if let Ok(Some(rank)) = self.cache.get_json::<i32>(&cache_key).await {
            return Ok(rank);
        }

        let assignments_key = Self::assignments_cache_key(guild_id);
        let assignments = match self
            .cache
            .get_json::<Vec<model::CachedAssignment>>(&assignments_key)
            .await
            .unwrap_or(None)
        {
            Some(cached) => cached,
            None => {
                let fetched = self.store.get_assignments(guild_id).await?;
                let cached: Vec<model::CachedAssignment> =
                    fetched.iter().map(model::CachedAssignment::from).collect();
                let _ = self
                    .cache
                    .set_json(&assignments_key, &cached, Some(CACHE_TTL))
                    .await;
                cached
            }
        };

        let ranks_key = Self::ranks_cache_key(guild_id);
        let ranks = match self
            .cache
            .get_json::<Vec<model::CachedRank>>(&ranks_key)
            .await
            .unwrap_or(None)
        {
            Some(cached) => cached,
            None => {
                let fetched = self.store.get_ranks(guild_id).await?;
                let cached: Vec<model::CachedRank> =
                    fetched.iter().map(model::CachedRank::from).collect();
                let _ = self.cache.set_json(&ranks_key, &cached, Some(CACHE_TTL)).await;
                cached
            }
        };

        let max_rank = assignments
            .iter()
            .filter(|a| user_role_ids.contains(&a.role_id))
            .filter_map(|a| ranks.iter().find(|r| r.rank == a.rank).map(|r| r.rank))
            .max()
            .unwrap_or(0);

        let _ = self.cache.set_json(&cache_key, &max_rank, Some(CACHE_TTL)).await;
        Ok(max_rank)
    }

    /// Resolves command permission: find the controlling command entry,
    /// resolve the caller's rank, and compare.
    pub async fn check(
        &self,
        guild_id: i64,
        user_id: i64,
        user_role_ids: &[i64],
        command_name: &str,
    ) -> Result<Decision, ModerationError> {
        let resolved = self.resolve_command(guild_id, command_name).await?;
        let Some((_, required_rank)) = resolved else {
            return Ok(Decision::NotConfigured {
                command_name: command_name.to_string(),
            });
        };

        let user_rank = self
            .resolve_user_rank(guild_id, user_id, user_role_ids)
            .await?;

        if user_rank >= required_rank {
            Ok(Decision::Allowed)
        } else {
            Ok(Decision::Denied {
                required_rank,
                user_rank,
                command_name: command_name.to_string(),
            })
        }
    }

    /// Configures a command's required rank, rejecting the restricted set,
    /// and invalidating the command cache and every ancestor cache key
    /// *after* the store write commits.
    pub async fn set_command_permission(
        &self,
        guild_id: i64,
        command_name: &str,
        required_rank: i32,
        description: Option<String>,
    ) -> Result<(), ModerationError> {
        if is_restricted_command(command_name) {
            return Err(crate::error::StoreError::RestrictedCommand(command_name.to_string()).into());
        }

        self.store
            .set_command_permission(guild_id, command_name, required_rank, description)
            .await?;

        for candidate in ancestors(command_name) {
            let _ = self
                .cache
                .delete(&Self::command_cache_key(guild_id, &candidate))
                .await;
        }
        Ok(())
    }

    /// Assigns a role to a rank, invalidating the assignments cache (which
    /// also implicitly invalidates every `user_rank` key, since those keys
    /// embed the role tuple and naturally miss once assignments change).
    pub async fn assign_rank(
        &self,
        guild_id: i64,
        rank: i32,
        role_id: i64,
    ) -> Result<(), ModerationError> {
        self.store.assign_rank(guild_id, rank, role_id).await?;
        let _ = self.cache.delete(&Self::assignments_cache_key(guild_id)).await;
        Ok(())
    }
}
