//! Feature predicates. Pure functions of a config snapshot and a timestamp.

use crate::config::BotConfig;

use chrono::{DateTime, Datelike as _, Timelike as _, Utc};

/// Conversation id the transport uses for status broadcasts.
pub const STATUS_BROADCAST: &str = "status@broadcast";

/// Suffix of group conversation ids.
pub const GROUP_SUFFIX: &str = "@g.us";

pub fn is_status_broadcast(conversation_id: &str) -> bool {
    conversation_id == STATUS_BROADCAST
}

pub fn is_group_conversation(conversation_id: &str) -> bool {
    conversation_id.ends_with(GROUP_SUFFIX)
}

pub fn auto_responder_enabled(config: &BotConfig) -> bool {
    config.features.auto_responder
}

pub fn group_chat_allowed(config: &BotConfig) -> bool {
    config.features.group_chat
}

pub fn contact_profiles_enabled(config: &BotConfig) -> bool {
    config.features.contact_profiles
}

pub fn media_handling_enabled(config: &BotConfig) -> bool {
    config.features.media_handling
}

/// Whether `event_type` should be delivered to the webhook.
pub fn webhook_wanted(config: &BotConfig, event_type: &str) -> bool {
    config.features.webhooks
        && config.webhook.enabled
        && config.webhook.events.iter().any(|event| event == event_type)
}

/// True when the bot may act at `now`. Always true unless business hours
/// are both switched on as a feature and configured.
pub fn within_business_hours(config: &BotConfig, now: DateTime<Utc>) -> bool {
    if !config.features.business_hours || !config.business_hours.enabled {
        return true;
    }

    let (weekday, time) = match config
        .business_hours
        .timezone
        .as_deref()
        .and_then(|name| name.parse::<chrono_tz::Tz>().ok())
    {
        Some(timezone) => {
            let local = now.with_timezone(&timezone);
            (local.weekday(), local.time())
        }
        None => {
            let local = now.with_timezone(&chrono::Local);
            (local.weekday(), local.time())
        }
    };

    let Some(hours) = config.business_hours.days.for_weekday(weekday) else {
        return false;
    };
    let Some((start, end)) = hours.parse() else {
        tracing::warn!(%weekday, start = %hours.start, end = %hours.end, "unparseable business hours, treating day as closed");
        return false;
    };

    // Compare at minute resolution so "18:00" closes at 18:00:00 sharp.
    let minute = time.hour() * 60 + time.minute();
    let start_minute = start.hour() * 60 + start.minute();
    let end_minute = end.hour() * 60 + end.minute();
    minute >= start_minute && minute < end_minute
}
