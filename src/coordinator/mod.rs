//! The seven-phase moderation pipeline: validate, authorize, check bot
//! capability, acquire the per-user lock and send a pre-action DM for
//! removal actions, execute the Discord action(s), send a post-action DM
//! for non-removal actions, then persist the case and post the mod-log
//! entry.

pub mod jail;

use crate::adapter::{AdapterError, AdapterResult, DiscordAdapter};
use crate::audit::{AuditEvent, AuditMonitor};
use crate::embed;
use crate::error::ModerationError;
use crate::lock::LockManager;
use crate::permissions::{Decision, PermissionEngine};
use crate::retry::{self, OperationClass, RetryRegistry};
use crate::store::{Case, CaseStore, CaseType, NewCase};
use crate::timeout::{DeadlineProfile, TimeoutHarness};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// One Discord call a moderation request issues, in the order it must run.
#[derive(Debug, Clone)]
pub enum ActionStep {
    Ban { purge_days: u32 },
    Unban,
    Kick,
    Timeout { until: DateTime<Utc> },
    RemoveTimeout,
    AddRoles(Vec<i64>),
    RemoveRoles(Vec<i64>),
}

#[derive(Debug, Clone)]
pub struct ActionContext {
    pub guild_id: i64,
    pub moderator_id: i64,
    pub moderator_role_ids: Vec<i64>,
    /// Cooperative cancellation handle observed at every suspension point
    /// in the pipeline (lock acquire, each Discord call, the case-store
    /// transaction, the mod-log send).
    pub cancellation: CancellationToken,
}

impl Default for ActionContext {
    fn default() -> Self {
        Self {
            guild_id: 0,
            moderator_id: 0,
            moderator_role_ids: Vec::new(),
            cancellation: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModerationRequest {
    pub ctx: ActionContext,
    pub command_name: String,
    pub case_type: CaseType,
    pub target_user_id: i64,
    pub reason: String,
    pub silent: bool,
    pub dm_action: Option<String>,
    pub actions: Vec<ActionStep>,
    pub duration_display: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Roles snapshotted for jail/unjail actions; empty for everything else.
    pub case_user_roles: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct ModerationOutcome {
    pub response_message: String,
    pub response_embed: Option<serde_json::Value>,
    pub case: Option<Case>,
    pub dm_sent: bool,
    pub succeeded: bool,
}

/// The Discord permission bit the bot must hold to perform `case_type`.
fn required_bot_permission(case_type: CaseType) -> &'static str {
    match case_type {
        CaseType::Ban | CaseType::TempBan | CaseType::Unban => "ban_members",
        CaseType::Kick => "kick_members",
        CaseType::Timeout | CaseType::Untimeout => "moderate_members",
        CaseType::Jail | CaseType::Unjail => "manage_roles",
        CaseType::Warn => "send_messages",
        CaseType::PollBan | CaseType::PollUnban | CaseType::SnippetBan | CaseType::SnippetUnban => {
            "manage_roles"
        }
    }
}

pub struct ModerationCoordinator {
    adapter: Arc<dyn DiscordAdapter>,
    permissions: Arc<PermissionEngine>,
    store: Arc<dyn CaseStore>,
    locks: LockManager,
    retry_registry: RetryRegistry,
    audit: Arc<AuditMonitor>,
}

impl ModerationCoordinator {
    pub fn new(
        adapter: Arc<dyn DiscordAdapter>,
        permissions: Arc<PermissionEngine>,
        store: Arc<dyn CaseStore>,
        locks: LockManager,
        retry_registry: RetryRegistry,
        audit: Arc<AuditMonitor>,
    ) -> Self {
        Self {
            adapter,
            permissions,
            store,
            locks,
            retry_registry,
            audit,
        }
    }

    /// Races `fut` against the request's cancellation token, turning a
    /// cancellation into `ModerationError::Cancelled` instead of letting
    /// the future run to completion.
    async fn guard<T, Fut>(&self, token: &CancellationToken, fut: Fut) -> Result<T, ModerationError>
    where
        Fut: Future<Output = Result<T, ModerationError>>,
    {
        if token.is_cancelled() {
            return Err(ModerationError::Cancelled { reason: "cancelled".to_string() });
        }
        tokio::select! {
            _ = token.cancelled() => Err(ModerationError::Cancelled { reason: "cancelled".to_string() }),
            result = fut => result,
        }
    }

    /// Runs one Discord action under its class's retry/circuit-breaker
    /// policy, with each individual attempt bounded by `api_budget`.
    async fn run_step(
        &self,
        class: OperationClass,
        profile: &DeadlineProfile,
        guild_id: i64,
        user_id: i64,
        reason: &str,
        step: &ActionStep,
    ) -> Result<(), ModerationError> {
        let adapter = self.adapter.clone();
        let step = step.clone();
        let reason = reason.to_string();
        let api_budget = profile.api_budget;

        retry::execute_with_retry(class, &self.retry_registry, &self.audit, move || {
            let adapter = adapter.clone();
            let step = step.clone();
            let reason = reason.clone();
            async move {
                let call: std::pin::Pin<Box<dyn std::future::Future<Output = AdapterResult<()>> + Send>> =
                    match &step {
                        ActionStep::Ban { purge_days } => {
                            Box::pin(adapter.ban(guild_id, user_id, *purge_days, &reason))
                        }
                        ActionStep::Unban => Box::pin(adapter.unban(guild_id, user_id, &reason)),
                        ActionStep::Kick => Box::pin(adapter.kick(guild_id, user_id, &reason)),
                        ActionStep::Timeout { until } => {
                            Box::pin(adapter.timeout(guild_id, user_id, *until, &reason))
                        }
                        ActionStep::RemoveTimeout => {
                            Box::pin(adapter.remove_timeout(guild_id, user_id, &reason))
                        }
                        ActionStep::AddRoles(roles) => {
                            Box::pin(adapter.add_roles(guild_id, user_id, roles, &reason))
                        }
                        ActionStep::RemoveRoles(roles) => {
                            Box::pin(adapter.remove_roles(guild_id, user_id, roles, &reason))
                        }
                    };
                match tokio::time::timeout(api_budget, call).await {
                    Ok(result) => result,
                    Err(_) => Err(AdapterError::TimedOut),
                }
            }
        })
        .await
    }

    #[instrument(skip(self, request), fields(guild_id = request.ctx.guild_id, user_id = request.target_user_id, case_type = ?request.case_type))]
    pub async fn execute_moderation_action(&self, request: ModerationRequest) -> ModerationOutcome {
        let start = Instant::now();
        let class = request.case_type.operation_class();
        let profile = DeadlineProfile::for_class(class);
        let dm_action = request
            .dm_action
            .clone()
            .unwrap_or_else(|| request.case_type.display_name().to_lowercase());

        // The pipeline's Discord/DB calls are not safe to restart mid-flight
        // (`CaseStore::create_case` is explicitly non-idempotent), so the
        // overall deadline can't be enforced by re-running phases on
        // elapse. Instead, a non-critical class is granted its fully
        // extended budget up front (`extended_total` at `max_extend_attempts`)
        // and that single deadline is folded into the same cooperative
        // cancellation token `guard` already observes at every suspension
        // point, rather than force-dropping the pipeline outside them.
        let overall_deadline = if profile.graceful_degradation {
            profile.extended_total(profile.max_extend_attempts)
        } else {
            profile.operation_total
        };

        let external_token = request.ctx.cancellation.clone();
        let op_token = CancellationToken::new();
        if external_token.is_cancelled() {
            // Deterministic short-circuit: don't rely on the spawned timer
            // task getting polled before `run_phases`'s own guard checks.
            op_token.cancel();
        }
        let timer_token = op_token.clone();
        let timer_external = external_token.clone();
        let timer_task = tokio::spawn(async move {
            tokio::select! {
                _ = timer_external.cancelled() => {}
                _ = tokio::time::sleep(overall_deadline) => {}
            }
            timer_token.cancel();
        });

        let mut request = request;
        request.ctx.cancellation = op_token;

        let mut dm_sent = false;
        let mut case: Option<Case> = None;
        let mut error_message: Option<String> = None;

        let outcome = self
            .run_phases(&request, &profile, class, &dm_action, &mut dm_sent, &mut case)
            .await;
        timer_task.abort();

        let (response_message, response_embed, succeeded) = match &outcome {
            Ok((message, embed)) => (message.clone(), embed.clone(), true),
            Err(err) => {
                error_message = Some(err.user_facing_message());
                (err.user_facing_message(), None, false)
            }
        };

        self.audit.record_event(AuditEvent {
            timestamp: Utc::now(),
            operation_type: class,
            guild_id: request.ctx.guild_id,
            user_id: request.target_user_id,
            moderator_id: request.ctx.moderator_id,
            case_type: request.case_type,
            success: succeeded,
            response_time: start.elapsed(),
            dm_sent,
            case_created: case.is_some(),
            case_number: case.as_ref().map(|c| c.case_number),
            error_message,
        });

        ModerationOutcome {
            response_message,
            response_embed,
            case,
            dm_sent,
            succeeded,
        }
    }

    /// Phases 2 through 7, returning the final response text/embed or the
    /// classified error that short-circuited the pipeline.
    async fn run_phases(
        &self,
        request: &ModerationRequest,
        profile: &DeadlineProfile,
        class: OperationClass,
        dm_action: &str,
        dm_sent: &mut bool,
        case_out: &mut Option<Case>,
    ) -> Result<(String, Option<serde_json::Value>), ModerationError> {
        let guild_id = request.ctx.guild_id;
        let user_id = request.target_user_id;
        let token = request.ctx.cancellation.clone();

        // Phase 2 — Authorization.
        let decision = self
            .guard(
                &token,
                self.permissions.check(
                    guild_id,
                    request.ctx.moderator_id,
                    &request.ctx.moderator_role_ids,
                    &request.command_name,
                ),
            )
            .await?;
        match decision {
            Decision::Allowed => {}
            Decision::Denied {
                required_rank,
                user_rank,
                command_name,
            } => {
                return Err(ModerationError::Authorization {
                    required: required_rank,
                    current: user_rank,
                    command: command_name,
                });
            }
            Decision::NotConfigured { command_name } => {
                return Err(ModerationError::Authorization {
                    required: 0,
                    current: 0,
                    command: command_name,
                });
            }
        }

        // Phase 3 — Bot capability.
        let required_permission = required_bot_permission(request.case_type);
        let has_permission = self
            .adapter
            .bot_has_permission(guild_id, required_permission)
            .await
            .map_err(|e| ModerationError::Infrastructure { reason: e.to_string() })?;
        if !has_permission {
            return Err(ModerationError::BotCapability {
                permission: required_permission.to_string(),
            });
        }

        let bot_member = self
            .adapter
            .bot_member(guild_id)
            .await
            .map_err(|e| ModerationError::Infrastructure { reason: e.to_string() })?;
        if let Some(target_member) = self
            .adapter
            .member(guild_id, user_id)
            .await
            .map_err(|e| ModerationError::Infrastructure { reason: e.to_string() })?
        {
            if bot_member.top_role_position <= target_member.top_role_position {
                return Err(ModerationError::BotCapability {
                    permission: "role position above target".to_string(),
                });
            }
        }

        // Phase 4 — Preparation: acquire the per-user lock, send the
        // pre-action DM for removal actions.
        let _lock = self
            .guard(&token, async { Ok(self.locks.acquire(guild_id, user_id).await) })
            .await?;
        if _lock.contended {
            self.audit.record_lock_contention();
        }

        let removal = request.case_type.is_removal_action();
        let dm_text = format!("You have been {} in a server you are a member of.", dm_action);
        if removal && !request.silent {
            *dm_sent = self
                .guard(
                    &token,
                    async { Ok(TimeoutHarness::run_dm(profile, self.adapter.send_dm(user_id, &dm_text)).await) },
                )
                .await?
                .map(|r| r.is_ok())
                .unwrap_or(false);
        }

        // Phase 5 — Action execution.
        for step in &request.actions {
            let attempt = self
                .guard(&token, self.run_step(class, profile, guild_id, user_id, &request.reason, step))
                .await;
            if let Err(err) = attempt {
                let voided_reason = format!("[Discord action failed: {}] {}", err.kind(), request.reason);
                let voided = self.persist_voided_case(request, &voided_reason).await;
                *case_out = voided;
                return Err(err);
            }
        }

        // Phase 6 — Post-action DM (non-removal).
        if !removal && !request.silent {
            *dm_sent = self
                .guard(
                    &token,
                    async { Ok(TimeoutHarness::run_dm(profile, self.adapter.send_dm(user_id, &dm_text)).await) },
                )
                .await?
                .map(|r| r.is_ok())
                .unwrap_or(false);
        }

        // Phase 7 — Persistence and audit surface.
        let new_case = NewCase {
            guild_id,
            user_id,
            moderator_id: request.ctx.moderator_id,
            case_type: request.case_type,
            reason: request.reason.clone(),
            status: true,
            expires_at: request.expires_at,
            user_roles: request.case_user_roles.clone(),
        };

        let create_result = self
            .guard(&token, async {
                TimeoutHarness::run_budgeted(profile.database_budget, self.store.create_case(new_case))
                    .await
                    .and_then(|r| r.map_err(|e| e.into()))
            })
            .await;

        let case = match create_result {
            Ok(case) => case,
            Err(err) => {
                // The Discord action already happened; the user is told so
                // and persistence failure is logged critically rather than
                // surfaced as a denial.
                error!(error = %err, "case persistence failed after a successful Discord action");
                *case_out = None;
                return Ok((
                    format!(
                        "{} applied to <@{}>, but I couldn't save the case record: {}",
                        request.case_type.display_name(),
                        user_id,
                        err.user_facing_message()
                    ),
                    None,
                ));
            }
        };

        // The case row is already committed; cancellation past this point
        // only skips the best-effort mod-log post, never the case number.
        if !token.is_cancelled() {
            let mod_log_message_id = self
                .guard(&token, async { Ok(self.post_mod_log(guild_id, &case).await) })
                .await
                .unwrap_or(None);
            if let Some(message_id) = mod_log_message_id {
                let updated = self
                    .guard(&token, async {
                        self.store
                            .update_mod_log_message_id(case.case_id, message_id)
                            .await
                            .map_err(Into::into)
                    })
                    .await;
                if let Err(e) = updated {
                    warn!(error = %e, "failed to persist mod-log message id");
                }
            }
        }

        *case_out = Some(case.clone());
        let response_embed = serde_json::to_value(embed::moderator_response_embed(&case, *dm_sent)).ok();
        let response_message = format!(
            "Case #{}: {} applied to <@{}>.",
            case.case_number,
            case.case_type.display_name(),
            user_id
        );
        info!(case_number = case.case_number, "moderation action completed");
        Ok((response_message, Some(response_embed)))
    }

    async fn persist_voided_case(&self, request: &ModerationRequest, voided_reason: &str) -> Option<Case> {
        let new_case = NewCase {
            guild_id: request.ctx.guild_id,
            user_id: request.target_user_id,
            moderator_id: request.ctx.moderator_id,
            case_type: request.case_type,
            reason: voided_reason.to_string(),
            status: false,
            expires_at: request.expires_at,
            user_roles: request.case_user_roles.clone(),
        };
        match self.store.create_case(new_case).await {
            Ok(case) => Some(case),
            Err(e) => {
                error!(error = %e, "failed to persist voided case after Discord action failure");
                None
            }
        }
    }

    async fn post_mod_log(&self, guild_id: i64, case: &Case) -> Option<i64> {
        let config = self.store.get_guild_config(guild_id).await.ok()?;
        let channel_id = config.mod_log_channel_id?;
        let embed_json = serde_json::to_value(embed::case_embed(case)).ok()?;
        self.adapter.send_message(channel_id, embed_json).await.ok()
    }
}

/// Wraps a `Duration` budget for call sites that only need the constant,
/// without pulling in the full `DeadlineProfile`.
pub fn api_budget_for(class: OperationClass) -> Duration {
    DeadlineProfile::for_class(class).api_budget
}
