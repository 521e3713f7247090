//! Request builders for a representative set of endpoints.
//!
//! Builders are pure: they render a [`Route`] (and a JSON body where the
//! endpoint takes one) and never touch the dispatcher. Bodiless endpoints
//! return the [`Route`]; endpoints with a body return a finished
//! [`ApiRequest`] because encoding and validation can fail.

use crate::bucket::Route;
use crate::error::ApiError;
use crate::request::{ApiRequest, Method};
use crate::snowflake::Snowflake;
use serde::Serialize;

pub const MAX_CHANNEL_NAME: usize = 100;
pub const MAX_TOPIC: usize = 1024;
pub const MAX_SLOWMODE_SECS: u32 = 21_600;
pub const MIN_BITRATE: u32 = 8_000;
pub const MAX_USER_LIMIT: u32 = 99;
pub const MAX_MESSAGE: usize = 2_000;

/// Option values rejected before a request is built.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("channel name must be 1..=100 characters, got {0}")]
    ChannelName(usize),
    #[error("topic must be at most 1024 characters, got {0}")]
    Topic(usize),
    #[error("slowmode must be at most 21600 seconds, got {0}")]
    Slowmode(u32),
    #[error("bitrate must be at least 8000, got {0}")]
    Bitrate(u32),
    #[error("user limit must be at most 99, got {0}")]
    UserLimit(u32),
    #[error("message content must be 1..=2000 characters, got {0}")]
    Content(usize),
    #[error("update has no fields set")]
    EmptyUpdate,
}

fn with_json<T: Serialize>(route: Route, body: &T) -> Result<ApiRequest, ApiError> {
    let mut request = route.request()?;
    request.descriptor = request.descriptor.json(body)?;
    Ok(request)
}

pub fn get_gateway() -> Route {
    Route::new(Method::Get, "/gateway")
}

pub fn get_current_user() -> Route {
    Route::new(Method::Get, "/users/@me")
}

pub fn get_user(user_id: Snowflake) -> Route {
    Route::new(Method::Get, "/users/{user_id}").param("user_id", user_id)
}

pub fn get_channel(channel_id: Snowflake) -> Route {
    Route::new(Method::Get, "/channels/{channel_id}").param("channel_id", channel_id)
}

pub fn delete_channel(channel_id: Snowflake) -> Route {
    Route::new(Method::Delete, "/channels/{channel_id}").param("channel_id", channel_id)
}

pub fn get_messages(channel_id: Snowflake, limit: u8) -> Route {
    Route::new(Method::Get, "/channels/{channel_id}/messages")
        .param("channel_id", channel_id)
        .query("limit", limit.clamp(1, 100))
}

#[derive(Serialize)]
struct MessageBody<'a> {
    content: &'a str,
}

pub fn create_message(channel_id: Snowflake, content: &str) -> Result<ApiRequest, ApiError> {
    let len = content.chars().count();
    if len == 0 || len > MAX_MESSAGE {
        return Err(ValidationError::Content(len).into());
    }
    let route =
        Route::new(Method::Post, "/channels/{channel_id}/messages").param("channel_id", channel_id);
    with_json(route, &MessageBody { content })
}

pub fn delete_message(channel_id: Snowflake, message_id: Snowflake) -> Route {
    Route::new(Method::Delete, "/channels/{channel_id}/messages/{message_id}")
        .param("channel_id", channel_id)
        .param("message_id", message_id)
}

/// Remove a recipient from a group DM.
pub fn remove_group_recipient(channel_id: Snowflake, user_id: Snowflake) -> Route {
    Route::new(Method::Delete, "/channels/{channel_id}/recipients/{user_id}")
        .param("channel_id", channel_id)
        .param("user_id", user_id)
}

pub fn get_guild(guild_id: Snowflake) -> Route {
    Route::new(Method::Get, "/guilds/{guild_id}").param("guild_id", guild_id)
}

pub fn get_guild_channels(guild_id: Snowflake) -> Route {
    Route::new(Method::Get, "/guilds/{guild_id}/channels").param("guild_id", guild_id)
}

pub fn get_invite(code: &str) -> Route {
    Route::new(Method::Get, "/invites/{invite_code}")
        .param("invite_code", code)
        .query("with_counts", true)
}

pub fn delete_invite(code: &str) -> Route {
    Route::new(Method::Delete, "/invites/{invite_code}").param("invite_code", code)
}

pub fn get_webhook(webhook_id: Snowflake) -> Route {
    Route::new(Method::Get, "/webhooks/{webhook_id}").param("webhook_id", webhook_id)
}

/// Execute a webhook with a token (no bot authorization needed).
pub fn execute_webhook(
    webhook_id: Snowflake,
    token: &str,
    content: &str,
) -> Result<ApiRequest, ApiError> {
    let len = content.chars().count();
    if len == 0 || len > MAX_MESSAGE {
        return Err(ValidationError::Content(len).into());
    }
    let route = Route::new(Method::Post, "/webhooks/{webhook_id}/{webhook_token}")
        .param("webhook_id", webhook_id)
        .param("webhook_token", token);
    with_json(route, &MessageBody { content })
}

/// Fields of a channel update. Each setter validates its value.
///
/// ```
/// use ratelane::endpoints::{ModifyChannel, ValidationError};
///
/// let update = ModifyChannel::new().name("general")?.slowmode(30)?;
/// assert!(!update.is_empty());
/// assert_eq!(ModifyChannel::new().bitrate(64), Err(ValidationError::Bitrate(64)));
/// # Ok::<(), ValidationError>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModifyChannel {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nsfw: Option<bool>,
    #[serde(rename = "rate_limit_per_user", skip_serializing_if = "Option::is_none")]
    slowmode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<Snowflake>,
}

impl ModifyChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        let len = name.chars().count();
        if len == 0 || len > MAX_CHANNEL_NAME {
            return Err(ValidationError::ChannelName(len));
        }
        self.name = Some(name);
        Ok(self)
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Result<Self, ValidationError> {
        let topic = topic.into();
        let len = topic.chars().count();
        if len > MAX_TOPIC {
            return Err(ValidationError::Topic(len));
        }
        self.topic = Some(topic);
        Ok(self)
    }

    pub fn position(mut self, position: u32) -> Self {
        self.position = Some(position);
        self
    }

    pub fn nsfw(mut self, nsfw: bool) -> Self {
        self.nsfw = Some(nsfw);
        self
    }

    /// Per-user message interval in seconds.
    pub fn slowmode(mut self, seconds: u32) -> Result<Self, ValidationError> {
        if seconds > MAX_SLOWMODE_SECS {
            return Err(ValidationError::Slowmode(seconds));
        }
        self.slowmode = Some(seconds);
        Ok(self)
    }

    /// Voice bitrate in bits per second.
    pub fn bitrate(mut self, bitrate: u32) -> Result<Self, ValidationError> {
        if bitrate < MIN_BITRATE {
            return Err(ValidationError::Bitrate(bitrate));
        }
        self.bitrate = Some(bitrate);
        Ok(self)
    }

    /// Voice user limit; 0 means unlimited.
    pub fn user_limit(mut self, limit: u32) -> Result<Self, ValidationError> {
        if limit > MAX_USER_LIMIT {
            return Err(ValidationError::UserLimit(limit));
        }
        self.user_limit = Some(limit);
        Ok(self)
    }

    pub fn parent(mut self, category: Snowflake) -> Self {
        self.parent_id = Some(category);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub fn modify_channel(channel_id: Snowflake, update: &ModifyChannel) -> Result<ApiRequest, ApiError> {
    if update.is_empty() {
        return Err(ValidationError::EmptyUpdate.into());
    }
    let route = Route::new(Method::Patch, "/channels/{channel_id}").param("channel_id", channel_id);
    with_json(route, update)
}
