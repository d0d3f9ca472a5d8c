//! Queue configuration.

use std::fmt;
use std::str::FromStr;

/// Rule for picking the next pending operation at each dispatch opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// Dispatch in insertion order.
    #[default]
    Fifo,
    /// Dispatch a uniformly random pending operation.
    Random,
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fifo => f.write_str("fifo"),
            Self::Random => f.write_str("random"),
        }
    }
}

/// Error returned when parsing an unknown selection policy name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown selection policy `{0}` (expected `fifo` or `random`)")]
pub struct ParsePolicyError(String);

impl FromStr for SelectionPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "random" => Ok(Self::Random),
            _ => Err(ParsePolicyError(s.to_string())),
        }
    }
}

/// Behavioural options for an [`OperationQueue`](crate::OperationQueue).
///
/// The concurrency limit is passed separately to the constructor because it
/// has no sensible default.
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    /// Emit lifecycle events (add, dispatch, finish, cancel, settle) at `info`
    /// level instead of `trace`.
    pub verbose_logging: bool,
    /// Dispatch order among pending operations.
    pub selection_policy: SelectionPolicy,
    /// Seed for the random selection policy. `None` seeds from the OS.
    pub random_seed: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_config_defaults() {
        let config = QueueConfig::default();
        assert!(!config.verbose_logging);
        assert_eq!(config.selection_policy, SelectionPolicy::Fifo);
        assert!(config.random_seed.is_none());
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!("fifo".parse::<SelectionPolicy>(), Ok(SelectionPolicy::Fifo));
        assert_eq!(" Random ".parse::<SelectionPolicy>(), Ok(SelectionPolicy::Random));
        assert!("lifo".parse::<SelectionPolicy>().is_err());
    }

    #[test]
    fn policy_display_round_trips() {
        for policy in [SelectionPolicy::Fifo, SelectionPolicy::Random] {
            assert_eq!(policy.to_string().parse::<SelectionPolicy>(), Ok(policy));
        }
    }
}
