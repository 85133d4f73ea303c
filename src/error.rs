//! Error taxonomy for the moderation core.
//!
//! `ModerationError` is the kind-level classification the coordinator
//! reasons about; it never leaks adapter-specific types (see
//! `adapter::AdapterError` for the Discord-facing sum type it is derived
//! from).

use thiserror::Error;

/// One of the error kinds a moderation phase can terminate with.
#[derive(Debug, Error, Clone)]
pub enum ModerationError {
    #[error("moderator lacks required rank {required} (has {current}) for `{command}`")]
    Authorization {
        required: i32,
        current: i32,
        command: String,
    },

    #[error("bot is missing the `{permission}` permission or role precedence in this guild")]
    BotCapability { permission: String },

    #[error("target state prevents this action: {reason}")]
    TargetState { reason: String },

    #[error("transient failure after retries: {reason}")]
    Transient { reason: String },

    #[error("retries exhausted for this operation: {reason}")]
    RetryExhausted { reason: String },

    #[error("circuit breaker open for operation class `{class}`, try again later")]
    CircuitOpen { class: String },

    #[error("invariant violated: {reason}")]
    Invariant { reason: String },

    #[error("infrastructure unavailable: {reason}")]
    Infrastructure { reason: String },

    #[error("operation cancelled: {reason}")]
    Cancelled { reason: String },
}

impl ModerationError {
    /// The coarse kind name used in structured logging and audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            ModerationError::Authorization { .. } => "authorization",
            ModerationError::BotCapability { .. } => "bot_capability",
            ModerationError::TargetState { .. } => "target_state",
            ModerationError::Transient { .. } => "transient",
            ModerationError::RetryExhausted { .. } => "retry_exhausted",
            ModerationError::CircuitOpen { .. } => "circuit_open",
            ModerationError::Invariant { .. } => "invariant",
            ModerationError::Infrastructure { .. } => "infrastructure",
            ModerationError::Cancelled { .. } => "cancelled",
        }
    }

    /// Whether a second attempt is worth making for this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModerationError::Transient { .. })
    }

    /// The message shown to the invoking moderator.
    pub fn user_facing_message(&self) -> String {
        match self {
            ModerationError::Authorization {
                required, current, ..
            } => format!(
                "You need rank {required} to run this command (you have rank {current})."
            ),
            ModerationError::BotCapability { permission } => {
                format!("I'm missing the `{permission}` permission (or my role is too low) to do that.")
            }
            ModerationError::TargetState { reason } => reason.clone(),
            ModerationError::Transient { .. } => {
                "Discord is having trouble right now, please try again.".to_string()
            }
            ModerationError::RetryExhausted { .. } => {
                "That action kept failing after several retries. Please try again later.".to_string()
            }
            ModerationError::CircuitOpen { .. } => {
                "This action is temporarily disabled after repeated failures. Try again in a bit."
                    .to_string()
            }
            ModerationError::Invariant { .. } => {
                "Something went wrong internally. This has been logged.".to_string()
            }
            ModerationError::Infrastructure { .. } => {
                "The action succeeded on Discord, but I couldn't save the case record. Please note it manually if needed."
                    .to_string()
            }
            ModerationError::Cancelled { .. } => {
                "The action was cancelled before it could finish.".to_string()
            }
        }
    }
}

/// Errors surfaced by the `CaseStore`/`PermissionStore` implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("case-number collision detected for guild {guild_id}")]
    CaseNumberCollision { guild_id: i64 },

    #[error("restricted command `{0}` may not be configured")]
    RestrictedCommand(String),

    #[error("operation timed out")]
    TimedOut,
}

impl From<StoreError> for ModerationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CaseNumberCollision { guild_id } => ModerationError::Invariant {
                reason: format!("case-number collision in guild {guild_id}"),
            },
            StoreError::RestrictedCommand(cmd) => ModerationError::Invariant {
                reason: format!("attempted to configure restricted command `{cmd}`"),
            },
            StoreError::TimedOut => ModerationError::Cancelled {
                reason: "store operation timed out".to_string(),
            },
            StoreError::Database(e) => ModerationError::Infrastructure {
                reason: e.to_string(),
            },
        }
    }
}
