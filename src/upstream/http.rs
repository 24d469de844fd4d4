use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use super::{
    ChannelDto, CommunityDto, EmojiDto, MemberDto, MessageDto, RoleDto, UpstreamSource, UserDto,
};
use crate::config::UpstreamConfig;
use crate::snowflake::Snowflake;
use crate::utils::SyncError;

/// REST client for the upstream read endpoints.
pub struct HttpUpstream {
    http: Client,
    api_url: Url,
    token: SecretString,
}

#[derive(Deserialize)]
struct ActiveThreads {
    #[serde(default)]
    threads: Vec<ChannelDto>,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to construct HTTP client")?;
        let api_url = Url::parse(&config.api_url)
            .with_context(|| format!("invalid upstream api url {}", config.api_url))?;

        Ok(Self {
            http,
            api_url,
            token: SecretString::from(config.token.clone()),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SyncError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Validation(format!("api url {} cannot be a base", self.api_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, SyncError> {
        debug!("upstream GET {}", url.path());
        let response = self
            .http
            .get(url.clone())
            .header(AUTHORIZATION, format!("Bot {}", self.token.expose_secret()))
            .send()
            .await
            .map_err(|e| SyncError::transient(format!("request to {} failed: {e}", url.path())))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_from(response.headers());
            return Err(classify_api_status(status, retry_after, url.path()));
        }

        response.json::<T>().await.map_err(|e| {
            if e.is_decode() {
                SyncError::Validation(format!("malformed payload from {}: {e}", url.path()))
            } else {
                SyncError::transient(format!("reading body from {} failed: {e}", url.path()))
            }
        })
    }
}

/// Parses a `Retry-After` header given in (possibly fractional) seconds.
pub(crate) fn retry_after_from(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn classify_api_status(status: StatusCode, retry_after: Option<Duration>, path: &str) -> SyncError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            warn!("rate limited on {}, retry after {:?}", path, retry_after);
            SyncError::TransientIo {
                message: format!("rate limited on {path}"),
                retry_after,
            }
        }
        StatusCode::NOT_FOUND => SyncError::not_found("upstream resource", path),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
            SyncError::PermanentIo(format!("access denied ({status}) on {path}"))
        }
        StatusCode::REQUEST_TIMEOUT => SyncError::transient(format!("timeout on {path}")),
        status if status.is_server_error() => {
            SyncError::transient(format!("upstream error {status} on {path}"))
        }
        status => SyncError::PermanentIo(format!("unexpected status {status} on {path}")),
    }
}

fn reaction_path_segment(emoji: &EmojiDto) -> String {
    match (emoji.id, emoji.name.as_deref()) {
        (Some(id), Some(name)) => format!("{name}:{id}"),
        (Some(id), None) => format!("_:{id}"),
        (None, name) => name.unwrap_or_default().to_string(),
    }
}

#[async_trait]
impl UpstreamSource for HttpUpstream {
    async fn fetch_community(&self, community_id: Snowflake) -> Result<CommunityDto, SyncError> {
        let id = community_id.to_string();
        self.get_json(self.endpoint(&["guilds", &id])?).await
    }

    async fn fetch_roles(&self, community_id: Snowflake) -> Result<Vec<RoleDto>, SyncError> {
        let id = community_id.to_string();
        self.get_json(self.endpoint(&["guilds", &id, "roles"])?)
            .await
    }

    async fn fetch_channels(
        &self,
        community_id: Snowflake,
    ) -> Result<Vec<ChannelDto>, SyncError> {
        let id = community_id.to_string();
        let mut channels: Vec<ChannelDto> = self
            .get_json(self.endpoint(&["guilds", &id, "channels"])?)
            .await?;
        let active: ActiveThreads = self
            .get_json(self.endpoint(&["guilds", &id, "threads", "active"])?)
            .await?;
        channels.extend(active.threads);
        Ok(channels)
    }

    async fn fetch_members(
        &self,
        community_id: Snowflake,
        after: Option<Snowflake>,
        limit: u32,
    ) -> Result<Vec<MemberDto>, SyncError> {
        let id = community_id.to_string();
        let mut url = self.endpoint(&["guilds", &id, "members"])?;
        url.query_pairs_mut().append_pair("limit", &limit.to_string());
        if let Some(after) = after {
            url.query_pairs_mut().append_pair("after", &after.to_string());
        }
        self.get_json(url).await
    }

    async fn fetch_messages(
        &self,
        channel_id: Snowflake,
        before: Option<Snowflake>,
        limit: u32,
    ) -> Result<Vec<MessageDto>, SyncError> {
        let id = channel_id.to_string();
        let mut url = self.endpoint(&["channels", &id, "messages"])?;
        url.query_pairs_mut().append_pair("limit", &limit.to_string());
        if let Some(before) = before {
            url.query_pairs_mut()
                .append_pair("before", &before.to_string());
        }
        self.get_json(url).await
    }

    async fn fetch_reaction_users(
        &self,
        channel_id: Snowflake,
        message_id: Snowflake,
        emoji: &EmojiDto,
        after: Option<Snowflake>,
        limit: u32,
    ) -> Result<Vec<UserDto>, SyncError> {
        let (channel, message) = (channel_id.to_string(), message_id.to_string());
        let emoji_segment = reaction_path_segment(emoji);
        let mut url = self.endpoint(&[
            "channels",
            &channel,
            "messages",
            &message,
            "reactions",
            &emoji_segment,
        ])?;
        url.query_pairs_mut().append_pair("limit", &limit.to_string());
        if let Some(after) = after {
            url.query_pairs_mut().append_pair("after", &after.to_string());
        }
        self.get_json(url).await
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn client() -> HttpUpstream {
        HttpUpstream::new(&UpstreamConfig {
            api_url: "https://example.test/api/v10".to_string(),
            token: "secret".to_string(),
            user_agent: "test".to_string(),
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn endpoint_appends_and_escapes_segments() {
        let upstream = client();
        let url = upstream
            .endpoint(&["channels", "1", "messages", "2", "reactions", "🔥"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.test/api/v10/channels/1/messages/2/reactions/%F0%9F%94%A5"
        );
    }

    #[test]
    fn rate_limits_are_transient_with_delay() {
        let err = classify_api_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(3)),
            "/x",
        );
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert!(classify_api_status(StatusCode::BAD_GATEWAY, None, "/x").is_retryable());
        assert!(!classify_api_status(StatusCode::FORBIDDEN, None, "/x").is_retryable());
        assert!(matches!(
            classify_api_status(StatusCode::NOT_FOUND, None, "/x"),
            SyncError::NotFound { .. }
        ));
    }

    #[test]
    fn retry_after_accepts_fractional_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("1.5"));
        assert_eq!(retry_after_from(&headers), Some(Duration::from_millis(1500)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after_from(&headers), None);
    }

    #[test]
    fn custom_emoji_path_uses_name_and_id() {
        let emoji = EmojiDto {
            id: Some(Snowflake::new(5)),
            name: Some("party".to_string()),
        };
        assert_eq!(reaction_path_segment(&emoji), "party:5");
    }
}
