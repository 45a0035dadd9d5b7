//! Client-wide settings.
//!
//! # Design
//! `ClientConfig` is a plain serde struct so it can be loaded from JSON.
//! Durations are written as integer milliseconds (`*_ms` keys); absent keys
//! take their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pool::PoolConfig;
use crate::types::{RedirectPolicy, Timeouts};
use crate::wire::DEFAULT_USER_AGENT;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connections per scheme/host/port/trust key.
    pub max_per_host: usize,
    pub max_total: usize,
    #[serde(rename = "max_idle_ms", with = "millis")]
    pub max_idle: Duration,
    #[serde(rename = "acquire_timeout_ms", with = "millis")]
    pub acquire_timeout: Duration,
    #[serde(rename = "connect_timeout_ms", with = "optional_millis")]
    pub connect_timeout: Option<Duration>,
    #[serde(rename = "read_timeout_ms", with = "optional_millis")]
    pub read_timeout: Option<Duration>,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub user_agent: String,
    /// `false` disables server certificate verification.
    pub verify: bool,
    pub keep_alive: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        let timeouts = Timeouts::default();
        let redirect = RedirectPolicy::default();
        ClientConfig {
            max_per_host: pool.max_per_key,
            max_total: pool.max_total,
            max_idle: pool.max_idle,
            acquire_timeout: pool.acquire_timeout,
            connect_timeout: timeouts.connect,
            read_timeout: timeouts.read,
            follow_redirects: redirect.follow,
            max_redirects: redirect.max_hops,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            verify: true,
            keep_alive: true,
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_per_key: self.max_per_host.max(1),
            max_total: self.max_total.max(1),
            max_idle: self.max_idle,
            acquire_timeout: self.acquire_timeout,
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: self.connect_timeout,
            read: self.read_timeout,
        }
    }

    pub fn redirect_policy(&self) -> RedirectPolicy {
        RedirectPolicy {
            follow: self.follow_redirects,
            max_hops: self.max_redirects,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
