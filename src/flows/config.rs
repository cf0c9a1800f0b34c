//! Flow Configuration
//!
//! Defaults suit the in-process demo; deployments override them through
//! the environment.

use chrono::Duration;

use crate::game::payout::PayoutTable;

/// Seconds a game stays open for reveals unless configured otherwise.
pub const DEFAULT_REVEAL_WINDOW_SECS: i64 = 300;

/// Shortest reveal window a casino accepts in a commit proposal.
pub const DEFAULT_MIN_REVEAL_WINDOW_SECS: i64 = 60;

/// Notary conflicts tolerated before a flow gives up.
pub const DEFAULT_MAX_NOTARY_RETRIES: u32 = 3;

/// Settings shared by every flow a node runs.
#[derive(Clone, Debug)]
pub struct FlowConfig {
    /// Time between committing and the reveal deadline.
    pub reveal_window: Duration,
    /// Shortest time to the deadline we accept when countersigning a commit.
    pub min_reveal_window: Duration,
    /// Restarts allowed after notary conflicts.
    pub max_notary_retries: u32,
    /// Table the casino offers.
    pub paytable: PayoutTable,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            reveal_window: Duration::seconds(DEFAULT_REVEAL_WINDOW_SECS),
            min_reveal_window: Duration::seconds(DEFAULT_MIN_REVEAL_WINDOW_SECS),
            max_notary_retries: DEFAULT_MAX_NOTARY_RETRIES,
            paytable: PayoutTable::default(),
        }
    }
}

impl FlowConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let seconds = |key: &str| {
            lookup(key)
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::seconds)
        };
        Self {
            reveal_window: seconds("FAIR_SLOTS_REVEAL_WINDOW_SECS").unwrap_or(defaults.reveal_window),
            min_reveal_window: seconds("FAIR_SLOTS_MIN_REVEAL_WINDOW_SECS").unwrap_or(defaults.min_reveal_window),
            max_notary_retries: lookup("FAIR_SLOTS_MAX_NOTARY_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_notary_retries),
            paytable: defaults.paytable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = FlowConfig::from_lookup(lookup(&[]));
        assert_eq!(config.reveal_window, Duration::seconds(300));
        assert_eq!(config.min_reveal_window, Duration::seconds(60));
        assert_eq!(config.max_notary_retries, 3);
        assert_eq!(config.paytable, PayoutTable::default());
    }

    #[test]
    fn test_overrides() {
        let config = FlowConfig::from_lookup(lookup(&[
            ("FAIR_SLOTS_REVEAL_WINDOW_SECS", "45"),
            ("FAIR_SLOTS_MIN_REVEAL_WINDOW_SECS", "30"),
            ("FAIR_SLOTS_MAX_NOTARY_RETRIES", "0"),
        ]));
        assert_eq!(config.reveal_window, Duration::seconds(45));
        assert_eq!(config.min_reveal_window, Duration::seconds(30));
        assert_eq!(config.max_notary_retries, 0);
    }

    #[test]
    fn test_garbage_falls_back() {
        let config = FlowConfig::from_lookup(lookup(&[
            ("FAIR_SLOTS_REVEAL_WINDOW_SECS", "-5"),
            ("FAIR_SLOTS_MIN_REVEAL_WINDOW_SECS", "0"),
            ("FAIR_SLOTS_MAX_NOTARY_RETRIES", "lots"),
        ]));
        assert_eq!(config.reveal_window, Duration::seconds(300));
        assert_eq!(config.min_reveal_window, Duration::seconds(60));
        assert_eq!(config.max_notary_retries, 3);
    }
}
