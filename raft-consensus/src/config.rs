//! Timing and batching knobs for a Raft node.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RaftError;

/// Configuration shared by every background task of a node.
///
/// The heartbeat interval must stay strictly below the election timeout
/// floor, otherwise followers of a healthy leader time out between ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout.
    #[serde(with = "millis")]
    pub election_timeout_min: Duration,
    /// Upper bound (inclusive) of the randomized election timeout.
    #[serde(with = "millis")]
    pub election_timeout_max: Duration,
    /// Period of the leader's replication ticker.
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    /// Polling period of the apply loop. The loop is also woken whenever
    /// the commit index advances.
    #[serde(with = "millis")]
    pub apply_interval: Duration,
    /// Maximum number of entries carried by one AppendEntries request.
    pub max_entries_per_append: usize,
    /// Seed for the election timeout randomizer. `None` draws from entropy.
    pub rng_seed: Option<u64>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(450),
            heartbeat_interval: Duration::from_millis(100),
            apply_interval: Duration::from_millis(50),
            max_entries_per_append: 64,
            rng_seed: None,
        }
    }
}

impl RaftConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.election_timeout_min.is_zero() {
            return Err(RaftError::Config(
                "election timeout must be positive".to_string(),
            ));
        }
        if self.election_timeout_max < self.election_timeout_min {
            return Err(RaftError::Config(format!(
                "election timeout window is inverted: {:?} > {:?}",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval.is_zero()
            || self.heartbeat_interval >= self.election_timeout_min
        {
            return Err(RaftError::Config(format!(
                "heartbeat interval {:?} must be positive and below the election timeout floor {:?}",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.apply_interval.is_zero() {
            return Err(RaftError::Config(
                "apply interval must be positive".to_string(),
            ));
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftError::Config(
                "max_entries_per_append must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
