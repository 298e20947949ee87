//! Event aliases and the subscription types, versions and condition keys they
//! map to. Cost is derived from whether the event needs the target user's
//! authorization.

use twitch_core::{AdmissionError, Condition, TwitchError};

/// Subscribed for the client's own user once the first session is up.
pub const DEFAULT_EVENTS: &[&str] = &[
    "channel_update",
    "user_update",
    "stream_online",
    "stream_offline",
];

const AUTHORIZED: bool = true;
const PUBLIC: bool = false;

const MODERATOR: Option<&str> = Some("moderator_user_id");
const CHATTER: Option<&str> = Some("user_id");
const BROADCASTER_ID: Option<&str> = Some("broadcaster_id");
const BROADCASTER: Option<&str> = Some("broadcaster_user_id");
const RAID_TARGET: Option<&str> = Some("to_broadcaster_user_id");
const USER: Option<&str> = Some("user_id");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSpec {
    pub alias: &'static str,
    pub subscription_type: &'static str,
    pub version: &'static str,
    /// Condition key filled with the authenticated user's id
    pub client_key: Option<&'static str>,
    /// Condition key filled with the user being watched
    pub target_key: Option<&'static str>,
    pub requires_authorization: bool,
}

impl EventSpec {
    /// Events that need explicit user authorization are free; the rest
    /// consume one unit of the budget.
    pub fn cost(&self) -> u32 {
        if self.requires_authorization {
            0
        } else {
            1
        }
    }

    /// Build the subscription condition. `options` are merged first so the
    /// user keys always win.
    pub fn condition(
        &self,
        target_user_id: &str,
        client_user_id: Option<&str>,
        options: &Condition,
    ) -> Result<Condition, TwitchError> {
        let mut condition = options.clone();
        if let Some(key) = self.client_key {
            let user = client_user_id.ok_or_else(|| {
                TwitchError::Authorization(format!(
                    "event '{}' needs the authenticated user id",
                    self.alias
                ))
            })?;
            condition.insert(key.to_string(), user.to_string());
        }
        if let Some(key) = self.target_key {
            condition.insert(key.to_string(), target_user_id.to_string());
        }
        Ok(condition)
    }
}

const fn spec(
    alias: &'static str,
    subscription_type: &'static str,
    version: &'static str,
    client_key: Option<&'static str>,
    target_key: Option<&'static str>,
    requires_authorization: bool,
) -> EventSpec {
    EventSpec {
        alias,
        subscription_type,
        version,
        client_key,
        target_key,
        requires_authorization,
    }
}

static CATALOG: &[EventSpec] = &[
    spec("automod_message_hold", "automod.message.hold", "2", MODERATOR, BROADCASTER, AUTHORIZED),
    spec(
        "automod_message_update",
        "automod.message.update",
        "2",
        MODERATOR,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec(
        "automod_settings_update",
        "automod.settings.update",
        "1",
        MODERATOR,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec("automod_terms_update", "automod.terms.update", "1", MODERATOR, BROADCASTER, AUTHORIZED),
    spec("bits_use", "channel.bits.use", "1", None, BROADCASTER, AUTHORIZED),
    spec("channel_update", "channel.update", "2", None, BROADCASTER, PUBLIC),
    spec("follow", "channel.follow", "2", MODERATOR, BROADCASTER, AUTHORIZED),
    spec("ad_break_begin", "channel.ad_break.begin", "1", None, BROADCASTER, AUTHORIZED),
    spec("chat_clear", "channel.chat.clear", "1", CHATTER, BROADCASTER, AUTHORIZED),
    spec(
        "chat_clear_user_messages",
        "channel.chat.clear_user_messages",
        "1",
        CHATTER,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec("chat_message", "channel.chat.message", "1", CHATTER, BROADCASTER, AUTHORIZED),
    spec(
        "chat_message_delete",
        "channel.chat.message_delete",
        "1",
        CHATTER,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec("chat_notification", "channel.chat.notification", "1", CHATTER, BROADCASTER, AUTHORIZED),
    spec(
        "chat_settings_update",
        "channel.chat_settings.update",
        "1",
        CHATTER,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec(
        "chat_user_message_hold",
        "channel.chat.user_message_hold",
        "1",
        CHATTER,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec(
        "chat_user_message_update",
        "channel.chat.user_message_update",
        "1",
        CHATTER,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec("shared_chat_begin", "channel.shared_chat.begin", "1", None, BROADCASTER, PUBLIC),
    spec("shared_chat_update", "channel.shared_chat.update", "1", None, BROADCASTER, PUBLIC),
    spec("shared_chat_end", "channel.shared_chat.end", "1", None, BROADCASTER, PUBLIC),
    spec("subscribe", "channel.subscribe", "1", None, BROADCASTER, AUTHORIZED),
    spec("subscription_end", "channel.subscription.end", "1", None, BROADCASTER, AUTHORIZED),
    spec("subscription_gift", "channel.subscription.gift", "1", None, BROADCASTER, AUTHORIZED),
    spec(
        "subscription_message",
        "channel.subscription.message",
        "1",
        None,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec("cheer", "channel.cheer", "1", None, BROADCASTER, AUTHORIZED),
    spec("raid", "channel.raid", "1", None, RAID_TARGET, PUBLIC),
    spec("ban", "channel.ban", "1", None, BROADCASTER, AUTHORIZED),
    spec("unban", "channel.unban", "1", None, BROADCASTER, AUTHORIZED),
    spec(
        "unban_request_create",
        "channel.unban_request.create",
        "1",
        MODERATOR,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec(
        "unban_request_resolve",
        "channel.unban_request.resolve",
        "1",
        MODERATOR,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec("moderate", "channel.moderate", "2", MODERATOR, BROADCASTER, AUTHORIZED),
    spec("moderator_add", "channel.moderator.add", "1", None, BROADCASTER, AUTHORIZED),
    spec("moderator_remove", "channel.moderator.remove", "1", None, BROADCASTER, AUTHORIZED),
    spec(
        "points_automatic_reward_redemption_add",
        "channel.channel_points_automatic_reward_redemption.add",
        "2",
        None,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec(
        "points_reward_add",
        "channel.channel_points_custom_reward.add",
        "1",
        None,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec(
        "points_reward_update",
        "channel.channel_points_custom_reward.update",
        "1",
        None,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec(
        "points_reward_remove",
        "channel.channel_points_custom_reward.remove",
        "1",
        None,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec(
        "points_reward_redemption_add",
        "channel.channel_points_custom_reward_redemption.add",
        "1",
        None,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec(
        "points_reward_redemption_update",
        "channel.channel_points_custom_reward_redemption.update",
        "1",
        None,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec("poll_begin", "channel.poll.begin", "1", None, BROADCASTER, AUTHORIZED),
    spec("poll_progress", "channel.poll.progress", "1", None, BROADCASTER, AUTHORIZED),
    spec("poll_end", "channel.poll.end", "1", None, BROADCASTER, AUTHORIZED),
    spec("prediction_begin", "channel.prediction.begin", "1", None, BROADCASTER, AUTHORIZED),
    spec("prediction_progress", "channel.prediction.progress", "1", None, BROADCASTER, AUTHORIZED),
    spec("prediction_lock", "channel.prediction.lock", "1", None, BROADCASTER, AUTHORIZED),
    spec("prediction_end", "channel.prediction.end", "1", None, BROADCASTER, AUTHORIZED),
    spec(
        "suspicious_user_message",
        "channel.suspicious_user.message",
        "1",
        MODERATOR,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec(
        "suspicious_user_update",
        "channel.suspicious_user.update",
        "1",
        MODERATOR,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec("vip_add", "channel.vip.add", "1", None, BROADCASTER, AUTHORIZED),
    spec("vip_remove", "channel.vip.remove", "1", None, BROADCASTER, AUTHORIZED),
    spec(
        "warning_acknowledge",
        "channel.warning.acknowledge",
        "1",
        MODERATOR,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec("warning_send", "channel.warning.send", "1", MODERATOR, BROADCASTER, AUTHORIZED),
    spec(
        "charity_campaign_donate",
        "channel.charity_campaign.donate",
        "1",
        None,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec(
        "charity_campaign_start",
        "channel.charity_campaign.start",
        "1",
        None,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec(
        "charity_campaign_progress",
        "channel.charity_campaign.progress",
        "1",
        None,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec(
        "charity_campaign_stop",
        "channel.charity_campaign.stop",
        "1",
        None,
        BROADCASTER,
        AUTHORIZED,
    ),
    spec("goal_begin", "channel.goal.begin", "1", None, BROADCASTER, AUTHORIZED),
    spec("goal_progress", "channel.goal.progress", "1", None, BROADCASTER, AUTHORIZED),
    spec("goal_end", "channel.goal.end", "1", None, BROADCASTER, AUTHORIZED),
    spec("hype_train_begin", "channel.hype_train.begin", "1", None, BROADCASTER, AUTHORIZED),
    spec("hype_train_progress", "channel.hype_train.progress", "1", None, BROADCASTER, AUTHORIZED),
    spec("hype_train_end", "channel.hype_train.end", "1", None, BROADCASTER, AUTHORIZED),
    spec("shield_mode_begin", "channel.shield_mode.begin", "1", MODERATOR, BROADCASTER, AUTHORIZED),
    spec("shield_mode_end", "channel.shield_mode.end", "1", MODERATOR, BROADCASTER, AUTHORIZED),
    spec("shoutout_create", "channel.shoutout.create", "1", MODERATOR, BROADCASTER, AUTHORIZED),
    spec("shoutout_received", "channel.shoutout.receive", "1", MODERATOR, BROADCASTER, AUTHORIZED),
    spec("stream_online", "stream.online", "1", None, BROADCASTER, PUBLIC),
    spec("stream_offline", "stream.offline", "1", None, BROADCASTER, PUBLIC),
    spec(
        "user_authorization_grant",
        "user.authorization.grant",
        "1",
        BROADCASTER_ID,
        None,
        AUTHORIZED,
    ),
    spec(
        "user_authorization_revoke",
        "user.authorization.revoke",
        "1",
        BROADCASTER_ID,
        None,
        AUTHORIZED,
    ),
    spec("user_update", "user.update", "1", None, USER, PUBLIC),
    spec("whisper_received", "user.whisper.message", "1", None, USER, AUTHORIZED),
];

pub fn all() -> &'static [EventSpec] {
    CATALOG
}

pub fn lookup(alias: &str) -> Result<&'static EventSpec, AdmissionError> {
    CATALOG
        .iter()
        .find(|spec| spec.alias == alias)
        .ok_or_else(|| AdmissionError::UnknownEvent(alias.to_string()))
}

pub fn by_type(subscription_type: &str) -> Option<&'static EventSpec> {
    CATALOG
        .iter()
        .find(|spec| spec.subscription_type == subscription_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use twitch_core::condition;

    #[test]
    fn aliases_and_types_are_unique() {
        let aliases: HashSet<_> = all().iter().map(|s| s.alias).collect();
        let types: HashSet<_> = all().iter().map(|s| s.subscription_type).collect();
        assert_eq!(aliases.len(), all().len());
        assert_eq!(types.len(), all().len());
    }

    #[test]
    fn cost_follows_authorization_requirement() {
        assert_eq!(lookup("follow").unwrap().cost(), 0);
        assert_eq!(lookup("chat_message").unwrap().cost(), 0);
        assert_eq!(lookup("stream_online").unwrap().cost(), 1);
        assert_eq!(lookup("raid").unwrap().cost(), 1);
        for alias in DEFAULT_EVENTS {
            assert!(lookup(alias).is_ok(), "default event {} missing", alias);
        }
    }

    #[test]
    fn follow_condition_uses_both_users() {
        let follow = lookup("follow").unwrap();
        let cond = follow.condition("100", Some("42"), &Condition::new()).unwrap();

        assert_eq!(follow.subscription_type, "channel.follow");
        assert_eq!(follow.version, "2");
        assert_eq!(
            cond,
            condition([("moderator_user_id", "42"), ("broadcaster_user_id", "100")])
        );
    }

    #[test]
    fn options_merge_without_overriding_user_keys() {
        let redemption = lookup("points_reward_redemption_add").unwrap();
        let options = condition([("reward_id", "r-1"), ("broadcaster_user_id", "spoofed")]);

        let cond = redemption.condition("100", None, &options).unwrap();

        assert_eq!(cond.get("reward_id").map(String::as_str), Some("r-1"));
        assert_eq!(cond.get("broadcaster_user_id").map(String::as_str), Some("100"));
    }

    #[test]
    fn client_keyed_event_needs_client_user() {
        let err = lookup("chat_message")
            .unwrap()
            .condition("100", None, &Condition::new())
            .unwrap_err();
        assert!(err.is_authorization());
    }

    #[test]
    fn unknown_alias_is_an_admission_error() {
        assert_eq!(
            lookup("telepathy").unwrap_err(),
            AdmissionError::UnknownEvent("telepathy".into())
        );
        assert_eq!(by_type("stream.offline").map(|s| s.alias), Some("stream_offline"));
    }
}
