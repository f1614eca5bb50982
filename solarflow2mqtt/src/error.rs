use chrono::NaiveTime;
use thiserror::Error;

use crate::state::Field;

/// Errors raised while decoding a frame received from the device.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("malformed payload on {topic}: {reason}")]
    Malformed { topic: String, reason: String },

    #[error("no decoder registered for topic {0}")]
    UnknownTopic(String),
}

impl DecodeError {
    pub(crate) fn malformed(topic: &str, reason: impl Into<String>) -> Self {
        DecodeError::Malformed {
            topic: topic.to_string(),
            reason: reason.into(),
        }
    }
}

/// Startup configuration errors. These are the only errors allowed to stop the process.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("morning cutoff and evening rampup must differ (both are {cutoff})")]
    InvalidTimeWindow { cutoff: NaiveTime, rampup: NaiveTime },

    #[error("cannot parse time of day '{0}', expected HH:MM or HH:MM:SS")]
    InvalidTime(String),

    #[error("controller policy {policy} requires '{key}'")]
    MissingTime { policy: &'static str, key: &'static str },

    #[error("max_output must be a positive number of watts, got {0}")]
    InvalidMaxOutput(f64),
}

/// Errors raised while turning an intent into a device command.
#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("{what} {value} is outside of [{min}, {max}]")]
    OutOfRange {
        what: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("cannot interpret '{value}' for {what}")]
    InvalidValue { what: &'static str, value: String },

    #[error("unknown {what} '{value}', expected one of [{options}]")]
    Unknown {
        what: &'static str,
        value: String,
        options: String,
    },

    #[error("{0:?} is not known yet")]
    MissingState(Field),
}

/// Reasons for refusing to act on the current state.
#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("{what} is stale (last update {age_secs}s ago)")]
    Stale { what: &'static str, age_secs: i64 },

    #[error("{0} has not been received yet")]
    Missing(&'static str),
}
