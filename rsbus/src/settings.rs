use std::time::Duration;

use bytestring::ByteString;
use config::{Config, File};
use serde::Deserialize;

use crate::utils::deserialize_duration;

/// Root configuration consumed at broker construction.
///
/// ```toml
/// [[topics]]
/// name = "orders"
///
/// [[topics.subscriptions]]
/// name = "audit"
/// lock_duration = "PT1M"
/// max_delivery_count = 10
/// time_to_live = "P14D"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerSettings {
    #[serde(default)]
    pub topics: Vec<TopicSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicSettings {
    pub name: ByteString,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionSettings {
    pub name: ByteString,
    /// Exclusive claim window per delivery, ISO-8601 (`PT1M`).
    #[serde(default = "SubscriptionSettings::default_lock_duration", deserialize_with = "deserialize_duration")]
    pub lock_duration: Duration,
    /// Failed delivery attempts permitted before the message is dead-lettered.
    #[serde(default = "SubscriptionSettings::default_max_delivery_count")]
    pub max_delivery_count: u32,
    /// Message time-to-live, ISO-8601 (`P14D`). Stamped on enqueue.
    #[serde(default = "SubscriptionSettings::default_time_to_live", deserialize_with = "deserialize_duration")]
    pub time_to_live: Duration,
}

impl SubscriptionSettings {
    fn default_lock_duration() -> Duration {
        Duration::from_secs(60)
    }

    fn default_max_delivery_count() -> u32 {
        50
    }

    fn default_time_to_live() -> Duration {
        Duration::from_secs(14 * 24 * 3600)
    }
}

impl SubscriptionSettings {
    pub fn new(name: impl Into<ByteString>) -> Self {
        Self {
            name: name.into(),
            lock_duration: Self::default_lock_duration(),
            max_delivery_count: Self::default_max_delivery_count(),
            time_to_live: Self::default_time_to_live(),
        }
    }

    pub fn lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = max_delivery_count;
        self
    }

    pub fn time_to_live(mut self, time_to_live: Duration) -> Self {
        self.time_to_live = time_to_live;
        self
    }
}

impl TopicSettings {
    pub fn new(name: impl Into<ByteString>) -> Self {
        Self { name: name.into(), subscriptions: Vec::new() }
    }

    pub fn subscription(mut self, subscription: SubscriptionSettings) -> Self {
        self.subscriptions.push(subscription);
        self
    }
}

impl BrokerSettings {
    /// Loads settings from `<name>.toml` in the working directory, when
    /// present. Missing files yield the defaults.
    pub fn load(name: &str) -> crate::Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(name).required(false))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn topic(mut self, topic: TopicSettings) -> Self {
        self.topics.push(topic);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_defaults() {
        let cfg: SubscriptionSettings = serde_json::from_str(r#"{"name":"audit"}"#).unwrap();
        assert_eq!(cfg.lock_duration, Duration::from_secs(60));
        assert_eq!(cfg.max_delivery_count, 50);
        assert_eq!(cfg.time_to_live, Duration::from_secs(14 * 24 * 3600));
    }

    #[test]
    fn iso8601_fields() {
        let cfg: SubscriptionSettings = serde_json::from_str(
            r#"{"name":"audit","lock_duration":"PT30S","max_delivery_count":3,"time_to_live":"P1D"}"#,
        )
        .unwrap();
        assert_eq!(cfg.lock_duration, Duration::from_secs(30));
        assert_eq!(cfg.max_delivery_count, 3);
        assert_eq!(cfg.time_to_live, Duration::from_secs(86400));
    }
}
