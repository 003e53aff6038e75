//! Protocol timing and lock naming.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one presence context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceConfig {
    /// Length of one heartbeat round; peers have this long to answer a ping (default: 100ms)
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    /// Delay between winning the election lock and picking a winner (default: 200ms)
    #[serde(with = "millis")]
    pub election_delay: Duration,
    /// Advisory lock serializing elections across contexts
    pub election_lock: String,
    /// Advisory lock serializing leader announcements across contexts
    pub assert_lock: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            election_delay: Duration::from_millis(200),
            election_lock: "election".to_string(),
            assert_lock: "assert-leader".to_string(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
