//! Per-sample execution limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which budget a sample ran out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Token,
    Time,
    Message,
    WorkingTime,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitKind::Token => write!(f, "token"),
            LimitKind::Time => write!(f, "time"),
            LimitKind::Message => write!(f, "message"),
            LimitKind::WorkingTime => write!(f, "working_time"),
        }
    }
}

/// Resources consumed by one sample execution, as reported by the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleUsage {
    /// Total model tokens (input + output).
    pub tokens: u64,
    /// Messages exchanged with the model.
    pub messages: u64,
    /// Time spent working, excluding waits on shared resources.
    #[serde(with = "secs")]
    pub working_time: Duration,
}

/// Budgets a single sample may consume. `None` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleLimits {
    #[serde(default)]
    pub token_limit: Option<u64>,
    #[serde(default)]
    pub message_limit: Option<u64>,
    /// Wall-clock limit for the whole sample.
    #[serde(default, with = "opt_secs")]
    pub time_limit: Option<Duration>,
    #[serde(default, with = "opt_secs")]
    pub working_limit: Option<Duration>,
}

impl SampleLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_token_limit(mut self, tokens: u64) -> Self {
        self.token_limit = Some(tokens);
        self
    }

    pub fn with_message_limit(mut self, messages: u64) -> Self {
        self.message_limit = Some(messages);
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn with_working_limit(mut self, limit: Duration) -> Self {
        self.working_limit = Some(limit);
        self
    }

    /// Returns the first budget `usage` exceeds, with a human-readable detail.
    pub fn check_usage(&self, usage: &SampleUsage) -> Option<(LimitKind, String)> {
        if let Some(limit) = self.token_limit {
            if usage.tokens > limit {
                return Some((
                    LimitKind::Token,
                    format!("used {} tokens, limit {}", usage.tokens, limit),
                ));
            }
        }
        if let Some(limit) = self.message_limit {
            if usage.messages > limit {
                return Some((
                    LimitKind::Message,
                    format!("exchanged {} messages, limit {}", usage.messages, limit),
                ));
            }
        }
        if let Some(limit) = self.working_limit {
            if usage.working_time > limit {
                return Some((
                    LimitKind::WorkingTime,
                    format!(
                        "worked {:.1}s, limit {:.1}s",
                        usage.working_time.as_secs_f64(),
                        limit.as_secs_f64()
                    ),
                ));
            }
        }
        None
    }
}

/// Serde adapter storing a `Duration` as fractional seconds.
pub mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter storing an optional `Duration` as fractional seconds.
pub mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_trips() {
        let usage = SampleUsage {
            tokens: u64::MAX,
            messages: 10_000,
            working_time: Duration::from_secs(86_400),
        };
        assert!(SampleLimits::unlimited().check_usage(&usage).is_none());
    }

    #[test]
    fn test_check_usage_reports_first_violation() {
        let limits = SampleLimits::default()
            .with_token_limit(1000)
            .with_message_limit(5);
        let usage = SampleUsage {
            tokens: 1500,
            messages: 9,
            working_time: Duration::ZERO,
        };

        let (kind, detail) = limits.check_usage(&usage).unwrap();
        assert_eq!(kind, LimitKind::Token);
        assert!(detail.contains("1500"));

        let within = SampleUsage {
            tokens: 1000,
            messages: 5,
            ..usage
        };
        assert!(limits.check_usage(&within).is_none());
    }

    #[test]
    fn test_working_limit() {
        let limits = SampleLimits::default().with_working_limit(Duration::from_secs(60));
        let usage = SampleUsage {
            working_time: Duration::from_secs(61),
            ..Default::default()
        };
        assert_eq!(limits.check_usage(&usage).unwrap().0, LimitKind::WorkingTime);
    }

    #[test]
    fn test_limits_yaml_in_seconds() {
        let limits: SampleLimits =
            serde_yaml::from_str("token_limit: 500\ntime_limit: 90\nworking_limit: 1.5\n").unwrap();
        assert_eq!(limits.token_limit, Some(500));
        assert_eq!(limits.time_limit, Some(Duration::from_secs(90)));
        assert_eq!(limits.working_limit, Some(Duration::from_millis(1500)));
        assert_eq!(limits.message_limit, None);
    }

    #[test]
    fn test_limit_kind_display() {
        assert_eq!(LimitKind::Token.to_string(), "token");
        assert_eq!(LimitKind::WorkingTime.to_string(), "working_time");
    }
}
