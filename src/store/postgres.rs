//! `sqlx`/Postgres-backed `CaseStore` + `PermissionStore`.
//!
//! Case-number allocation uses `UPDATE guild SET case_count = case_count + 1
//! RETURNING case_count` followed by the `INSERT` in the same transaction,
//! at `SERIALIZABLE` isolation, so concurrent case creation in one guild
//! can never produce duplicate case numbers. Schema bootstrap follows
//! `filament`'s `ensure_db_schema` pattern: an advisory-locked transaction
//! running idempotent `CREATE TABLE IF NOT EXISTS` statements, not a
//! migration framework.

use super::{
    Case, CaseStore, CaseType, CaseUpdate, GuildConfig, NewCase, PermissionAssignment,
    PermissionCommand, PermissionRank, PermissionStore, DEFAULT_RANKS,
};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

/// Arbitrary 63-bit constant used as the Postgres advisory-lock key while
/// applying the schema, so concurrent start-ups don't race each other.
const SCHEMA_INIT_LOCK_ID: i64 = 0x7475_786d_6f64_2130;

pub struct PgCaseStore {
    pool: PgPool,
}

impl PgCaseStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_INIT_LOCK_ID)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS guild (
                guild_id BIGINT PRIMARY KEY,
                joined_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                case_count BIGINT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS guild_config (
                guild_id BIGINT PRIMARY KEY REFERENCES guild(guild_id),
                mod_log_channel_id BIGINT,
                audit_log_channel_id BIGINT,
                join_log_channel_id BIGINT,
                private_log_channel_id BIGINT,
                report_log_channel_id BIGINT,
                dev_log_channel_id BIGINT,
                jail_channel_id BIGINT,
                general_channel_id BIGINT,
                starboard_channel_id BIGINT,
                jail_role_id BIGINT,
                quarantine_role_id BIGINT,
                base_staff_role_id BIGINT,
                base_member_role_id BIGINT,
                command_prefix TEXT
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS permission_rank (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                guild_id BIGINT NOT NULL REFERENCES guild(guild_id),
                rank INT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                color INT,
                enabled BOOLEAN NOT NULL DEFAULT true,
                UNIQUE (guild_id, rank)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS permission_assignment (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                guild_id BIGINT NOT NULL REFERENCES guild(guild_id),
                rank INT NOT NULL,
                role_id BIGINT NOT NULL,
                UNIQUE (guild_id, role_id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS permission_command (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                guild_id BIGINT NOT NULL REFERENCES guild(guild_id),
                command_name TEXT NOT NULL,
                required_rank INT NOT NULL,
                description TEXT,
                UNIQUE (guild_id, command_name)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS case_record (
                case_id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                guild_id BIGINT NOT NULL REFERENCES guild(guild_id),
                case_number BIGINT NOT NULL,
                case_type TEXT NOT NULL,
                case_user_id BIGINT NOT NULL,
                case_moderator_id BIGINT NOT NULL,
                case_reason TEXT NOT NULL,
                case_status BOOLEAN NOT NULL,
                case_created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                case_expires_at TIMESTAMPTZ,
                case_user_roles BIGINT[] NOT NULL DEFAULT '{}',
                mod_log_message_id BIGINT,
                audit_log_message_id BIGINT,
                UNIQUE (guild_id, case_number)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Upserts the `guild`/`guild_config` rows the same way the bot's
    /// `GuildConfig::get_guild` lazily creates a Mongo document on first
    /// access, so a guild is created on its first case rather than needing
    /// an explicit provisioning step.
    async fn ensure_guild<'e, E>(executor: E, guild_id: i64) -> Result<(), StoreError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query(
            "INSERT INTO guild (guild_id) VALUES ($1) ON CONFLICT (guild_id) DO NOTHING",
        )
        .bind(guild_id)
        .execute(executor)
        .await?;
        Ok(())
    }

    fn row_to_case(row: &sqlx::postgres::PgRow) -> Result<Case, StoreError> {
        let case_type_str: String = row.try_get("case_type")?;
        let case_type = case_type_from_str(&case_type_str);
        Ok(Case {
            case_id: row.try_get("case_id")?,
            guild_id: row.try_get("guild_id")?,
            case_number: row.try_get("case_number")?,
            case_type,
            case_user_id: row.try_get("case_user_id")?,
            case_moderator_id: row.try_get("case_moderator_id")?,
            case_reason: row.try_get("case_reason")?,
            case_status: row.try_get("case_status")?,
            case_created_at: row.try_get("case_created_at")?,
            case_expires_at: row.try_get("case_expires_at")?,
            case_user_roles: row.try_get("case_user_roles")?,
            mod_log_message_id: row.try_get("mod_log_message_id")?,
            audit_log_message_id: row.try_get("audit_log_message_id")?,
        })
    }
}

fn case_type_as_str(case_type: CaseType) -> &'static str {
    match case_type {
        CaseType::Ban => "ban",
        CaseType::TempBan => "temp_ban",
        CaseType::Unban => "unban",
        CaseType::Kick => "kick",
        CaseType::Timeout => "timeout",
        CaseType::Untimeout => "untimeout",
        CaseType::Warn => "warn",
        CaseType::Jail => "jail",
        CaseType::Unjail => "unjail",
        CaseType::PollBan => "poll_ban",
        CaseType::PollUnban => "poll_unban",
        CaseType::SnippetBan => "snippet_ban",
        CaseType::SnippetUnban => "snippet_unban",
    }
}

fn case_type_from_str(s: &str) -> CaseType {
    match s {
        "ban" => CaseType::Ban,
        "temp_ban" => CaseType::TempBan,
        "unban" => CaseType::Unban,
        "kick" => CaseType::Kick,
        "timeout" => CaseType::Timeout,
        "untimeout" => CaseType::Untimeout,
        "warn" => CaseType::Warn,
        "jail" => CaseType::Jail,
        "unjail" => CaseType::Unjail,
        "poll_ban" => CaseType::PollBan,
        "poll_unban" => CaseType::PollUnban,
        "snippet_ban" => CaseType::SnippetBan,
        "snippet_unban" => CaseType::SnippetUnban,
        other => unreachable!("unknown case_type in store: {other}"),
    }
}

#[async_trait]
impl CaseStore for PgCaseStore {
    async fn create_case(&self, new_case: NewCase) -> Result<Case, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        Self::ensure_guild(&mut *tx, new_case.guild_id).await?;

        let case_number: i64 = sqlx::query_scalar(
            "UPDATE guild SET case_count = case_count + 1 WHERE guild_id = $1 RETURNING case_count",
        )
        .bind(new_case.guild_id)
        .fetch_one(&mut *tx)
        .await?;

        let reason = new_case.bounded_reason();
        let row = sqlx::query(
            r#"
            INSERT INTO case_record
                (guild_id, case_number, case_type, case_user_id, case_moderator_id,
                 case_reason, case_status, case_expires_at, case_user_roles)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(new_case.guild_id)
        .bind(case_number)
        .bind(case_type_as_str(new_case.case_type))
        .bind(new_case.user_id)
        .bind(new_case.moderator_id)
        .bind(&reason)
        .bind(new_case.status)
        .bind(new_case.expires_at)
        .bind(&new_case.user_roles)
        .fetch_one(&mut *tx)
        .await?;

        let case = Self::row_to_case(&row)?;
        tx.commit().await?;
        Ok(case)
    }

    async fn get_case_by_id(&self, case_id: uuid::Uuid) -> Result<Option<Case>, StoreError> {
        let row = sqlx::query("SELECT * FROM case_record WHERE case_id = $1")
            .bind(case_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_case).transpose()
    }

    async fn get_case_by_number(&self, guild_id: i64, number: i64) -> Result<Option<Case>, StoreError> {
        let row = sqlx::query("SELECT * FROM case_record WHERE guild_id = $1 AND case_number = $2")
            .bind(guild_id)
            .bind(number)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_case).transpose()
    }

    async fn get_cases_by_user(&self, guild_id: i64, user_id: i64) -> Result<Vec<Case>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM case_record WHERE guild_id = $1 AND case_user_id = $2 ORDER BY case_number DESC",
        )
        .bind(guild_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_case).collect()
    }

    async fn get_latest_case_by_user(
        &self,
        guild_id: i64,
        user_id: i64,
    ) -> Result<Option<Case>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM case_record WHERE guild_id = $1 AND case_user_id = $2 \
             ORDER BY case_number DESC LIMIT 1",
        )
        .bind(guild_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_case).transpose()
    }

    async fn update_case_by_number(
        &self,
        guild_id: i64,
        number: i64,
        update: CaseUpdate,
    ) -> Result<Option<Case>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE case_record
            SET case_reason = COALESCE($3, case_reason),
                case_status = COALESCE($4, case_status)
            WHERE guild_id = $1 AND case_number = $2
            RETURNING *
            "#,
        )
        .bind(guild_id)
        .bind(number)
        .bind(update.reason)
        .bind(update.status)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_case).transpose()
    }

    async fn update_mod_log_message_id(
        &self,
        case_id: uuid::Uuid,
        message_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE case_record SET mod_log_message_id = $2 WHERE case_id = $1")
            .bind(case_id)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_audit_log_message_id(
        &self,
        case_id: uuid::Uuid,
        message_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE case_record SET audit_log_message_id = $2 WHERE case_id = $1")
            .bind(case_id)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_guild_config(&self, guild_id: i64) -> Result<GuildConfig, StoreError> {
        Self::ensure_guild(&self.pool, guild_id).await?;
        let row = sqlx::query("SELECT * FROM guild_config WHERE guild_id = $1")
            .bind(guild_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(GuildConfig {
                guild_id: row.try_get("guild_id")?,
                mod_log_channel_id: row.try_get("mod_log_channel_id")?,
                audit_log_channel_id: row.try_get("audit_log_channel_id")?,
                join_log_channel_id: row.try_get("join_log_channel_id")?,
                private_log_channel_id: row.try_get("private_log_channel_id")?,
                report_log_channel_id: row.try_get("report_log_channel_id")?,
                dev_log_channel_id: row.try_get("dev_log_channel_id")?,
                jail_channel_id: row.try_get("jail_channel_id")?,
                general_channel_id: row.try_get("general_channel_id")?,
                starboard_channel_id: row.try_get("starboard_channel_id")?,
                jail_role_id: row.try_get("jail_role_id")?,
                quarantine_role_id: row.try_get("quarantine_role_id")?,
                base_staff_role_id: row.try_get("base_staff_role_id")?,
                base_member_role_id: row.try_get("base_member_role_id")?,
                command_prefix: row.try_get("command_prefix")?,
            }),
            None => Ok(GuildConfig {
                guild_id,
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl PermissionStore for PgCaseStore {
    async fn initialize_guild(&self, guild_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::ensure_guild(&mut *tx, guild_id).await?;
        for (rank, name) in DEFAULT_RANKS {
            sqlx::query(
                "INSERT INTO permission_rank (guild_id, rank, name) VALUES ($1, $2, $3) \
                 ON CONFLICT (guild_id, rank) DO NOTHING",
            )
            .bind(guild_id)
            .bind(rank)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_ranks(&self, guild_id: i64) -> Result<Vec<PermissionRank>, StoreError> {
        let rows = sqlx::query("SELECT * FROM permission_rank WHERE guild_id = $1 ORDER BY rank")
            .bind(guild_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(PermissionRank {
                    guild_id: row.try_get("guild_id")?,
                    rank: row.try_get("rank")?,
                    name: row.try_get("name")?,
                    description: row.try_get("description")?,
                    color: row.try_get("color")?,
                    enabled: row.try_get("enabled")?,
                })
            })
            .collect()
    }

    async fn get_assignments(&self, guild_id: i64) -> Result<Vec<PermissionAssignment>, StoreError> {
        let rows = sqlx::query("SELECT * FROM permission_assignment WHERE guild_id = $1")
            .bind(guild_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(PermissionAssignment {
                    guild_id: row.try_get("guild_id")?,
                    rank: row.try_get("rank")?,
                    role_id: row.try_get("role_id")?,
                })
            })
            .collect()
    }

    async fn get_command(
        &self,
        guild_id: i64,
        command_name: &str,
    ) -> Result<Option<PermissionCommand>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM permission_command WHERE guild_id = $1 AND command_name = $2",
        )
        .bind(guild_id)
        .bind(command_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(PermissionCommand {
                guild_id: row.try_get("guild_id")?,
                command_name: row.try_get("command_name")?,
                required_rank: row.try_get("required_rank")?,
                description: row.try_get("description")?,
            })
        })
        .transpose()
    }

    async fn set_command_permission(
        &self,
        guild_id: i64,
        command_name: &str,
        required_rank: i32,
        description: Option<String>,
    ) -> Result<PermissionCommand, StoreError> {
        if super::is_restricted_command(command_name) {
            return Err(StoreError::RestrictedCommand(command_name.to_string()));
        }
        Self::ensure_guild(&self.pool, guild_id).await?;
        let row = sqlx::query(
            r#"
            INSERT INTO permission_command (guild_id, command_name, required_rank, description)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (guild_id, command_name)
            DO UPDATE SET required_rank = EXCLUDED.required_rank, description = EXCLUDED.description
            RETURNING *
            "#,
        )
        .bind(guild_id)
        .bind(command_name)
        .bind(required_rank)
        .bind(description)
        .fetch_one(&self.pool)
        .await?;
        Ok(PermissionCommand {
            guild_id: row.try_get("guild_id")?,
            command_name: row.try_get("command_name")?,
            required_rank: row.try_get("required_rank")?,
            description: row.try_get("description")?,
        })
    }

    async fn assign_rank(&self, guild_id: i64, rank: i32, role_id: i64) -> Result<(), StoreError> {
        Self::ensure_guild(&self.pool, guild_id).await?;
        sqlx::query(
            r#"
            INSERT INTO permission_assignment (guild_id, rank, role_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (guild_id, role_id) DO UPDATE SET rank = EXCLUDED.rank
            "#,
        )
        .bind(guild_id)
        .bind(rank)
        .bind(role_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_type_round_trips_through_its_string_form() {
        for ct in [
            CaseType::Ban,
            CaseType::TempBan,
            CaseType::Unban,
            CaseType::Kick,
            CaseType::Timeout,
            CaseType::Untimeout,
            CaseType::Warn,
            CaseType::Jail,
            CaseType::Unjail,
            CaseType::PollBan,
            CaseType::PollUnban,
            CaseType::SnippetBan,
            CaseType::SnippetUnban,
        ] {
            assert_eq!(case_type_from_str(case_type_as_str(ct)), ct);
        }
    }
}
