// Shared counter behind a Redis REST bridge (Upstash-compatible).
//
// One reservation is a single MULTI/EXEC transaction:
//   INCR <key>
//   EXPIREAT <key> <next-midnight> NX
// so the increment is atomic across instances and the key disappears on its
// own once the UTC day is over.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use super::{CounterStore, QuotaError};

pub const DEFAULT_KEY_PREFIX: &str = "slotwise:quota";

pub struct RestCounterStore {
    http: reqwest::Client,
    endpoint: Url,
    token: String,
    prefix: String,
}

impl std::fmt::Debug for RestCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestCounterStore")
            .field("endpoint", &self.endpoint.as_str())
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RestCounterStore {
    pub fn new(base_url: &str, token: impl Into<String>, timeout: Duration) -> Result<Self, QuotaError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("slotwise/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Self::with_client(http, base_url, token)
    }

    pub fn with_client(
        http: reqwest::Client,
        base_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, QuotaError> {
        let mut endpoint = Url::parse(base_url)
            .map_err(|e| QuotaError::Store(format!("invalid counter URL {base_url}: {e}")))?;
        endpoint
            .path_segments_mut()
            .map_err(|()| QuotaError::Store(format!("invalid counter URL {base_url}")))?
            .pop_if_empty()
            .push("multi-exec");
        Ok(Self {
            http,
            endpoint,
            token: token.into(),
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, bucket: &str, day: &str) -> String {
        format!("{}:{bucket}:{day}", self.prefix)
    }
}

#[derive(Deserialize)]
struct Reply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl CounterStore for RestCounterStore {
    async fn increment(
        &self,
        bucket: &str,
        day: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<u64, QuotaError> {
        let key = self.key(bucket, day);
        let body = json!([
            ["INCR", key],
            ["EXPIREAT", key, expire_at.timestamp().to_string(), "NX"],
        ]);
        debug!("POST {} ({key})", self.endpoint);

        let resp = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(QuotaError::Store(format!("HTTP {}: {}", status.as_u16(), text.trim())));
        }

        let replies: Vec<Reply> = serde_json::from_str(&text)
            .map_err(|e| QuotaError::Store(format!("unexpected reply {text:?}: {e}")))?;
        if let Some(err) = replies.iter().find_map(|r| r.error.as_deref()) {
            return Err(QuotaError::Store(err.to_string()));
        }
        replies
            .first()
            .and_then(|r| r.result.as_ref())
            .and_then(reply_count)
            .ok_or_else(|| QuotaError::Store(format!("INCR returned no count: {text}")))
    }

    fn is_shared(&self) -> bool {
        true
    }
}

/// INCR replies are integers, but some bridges encode them as strings.
fn reply_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_and_key_layout() {
        let store =
            RestCounterStore::with_client(reqwest::Client::new(), "https://kv.example.com/", "t")
                .unwrap();
        assert_eq!(store.endpoint.as_str(), "https://kv.example.com/multi-exec");
        assert_eq!(store.key("audio", "2026-03-10"), "slotwise:quota:audio:2026-03-10");

        let store = store.with_prefix("staging");
        assert_eq!(store.key("audio", "2026-03-10"), "staging:audio:2026-03-10");
    }

    #[test]
    fn reply_count_accepts_numbers_and_strings() {
        assert_eq!(reply_count(&json!(3)), Some(3));
        assert_eq!(reply_count(&json!("7")), Some(7));
        assert_eq!(reply_count(&json!(null)), None);
        assert_eq!(reply_count(&json!(-1)), None);
    }
}
