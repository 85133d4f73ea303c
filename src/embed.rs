//! Mod-log and moderator-response embed builders, built on
//! `twilight-util::builder::embed::EmbedBuilder`.

use crate::store::{Case, CaseType};
use chrono::Utc;
use twilight_model::channel::message::Embed;
use twilight_model::util::Timestamp;
use twilight_util::builder::embed::{EmbedBuilder, EmbedFieldBuilder, EmbedFooterBuilder};

fn color_for(case_type: CaseType) -> u32 {
    if case_type.is_removal_action() {
        0x2ecc71 // green: undoes a prior restriction
    } else {
        match case_type {
            CaseType::Ban | CaseType::Kick => 0xe74c3c,
            CaseType::Timeout | CaseType::Jail | CaseType::Warn => 0xf39c12,
            _ => 0x3498db,
        }
    }
}

fn timestamp_now() -> Option<Timestamp> {
    Timestamp::from_secs(Utc::now().timestamp()).ok()
}

/// Builds the embed posted to a guild's configured mod-log channel for a
/// newly created case.
pub fn case_embed(case: &Case) -> Embed {
    let mut title = format!("Case #{} — {}", case.case_number, case.case_type.display_name());
    let mut color = color_for(case.case_type);
    if !case.case_status {
        title = format!("{} (voided)", title);
        color = 0x7f8c8d;
    }

    let reason = if case.case_reason.is_empty() {
        "No reason provided"
    } else {
        case.case_reason.as_str()
    };

    let mut builder = EmbedBuilder::new()
        .color(color)
        .title(title)
        .field(EmbedFieldBuilder::new("User", format!("<@{}>", case.case_user_id)).inline())
        .field(EmbedFieldBuilder::new("Moderator", format!("<@{}>", case.case_moderator_id)).inline())
        .field(EmbedFieldBuilder::new("Reason", reason));

    if let Some(expires_at) = case.case_expires_at {
        builder = builder.field(EmbedFieldBuilder::new(
            "Expires",
            format!("<t:{}:R>", expires_at.timestamp()),
        ));
    }

    builder = builder.footer(EmbedFooterBuilder::new(format!("Case ID {}", case.case_id)));

    if let Some(ts) = timestamp_now() {
        builder = builder.timestamp(ts);
    }

    builder.build()
}

/// Builds the ephemeral response embed shown to the moderator who issued
/// the command.
pub fn moderator_response_embed(case: &Case, dm_sent: bool) -> Embed {
    let mut builder = EmbedBuilder::new()
        .color(color_for(case.case_type))
        .title(format!("{} applied", case.case_type.display_name()))
        .field(EmbedFieldBuilder::new("Case", format!("#{}", case.case_number)).inline())
        .field(EmbedFieldBuilder::new("User", format!("<@{}>", case.case_user_id)).inline())
        .field(EmbedFieldBuilder::new(
            "DM delivered",
            if dm_sent { "Yes" } else { "No (user may have DMs disabled)" },
        ));

    if let Some(ts) = timestamp_now() {
        builder = builder.timestamp(ts);
    }

    builder.build()
}

/// Builds an embed for a failed moderation attempt shown to the invoking
/// moderator, describing why the action did not go through.
pub fn failure_response_embed(case_type: CaseType, user_id: i64, message: &str) -> Embed {
    EmbedBuilder::new()
        .color(0xe74c3c)
        .title(format!("{} failed", case_type.display_name()))
        .field(EmbedFieldBuilder::new("User", format!("<@{}>", user_id)).inline())
        .field(EmbedFieldBuilder::new("Reason", message))
        .build()
}
