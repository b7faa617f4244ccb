//! Custom validation functions shared by the configuration sections.

use validator::ValidationError;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Validate that a given value is a power of two.
pub fn validate_power_of_two(value: usize) -> Result<(), ValidationError> {
    if value.is_power_of_two() {
        Ok(())
    } else {
        Err(ValidationError::new("must_be_power_of_two"))
    }
}

/// Topics we publish to must be concrete: non-empty and free of wildcards.
pub fn validate_publish_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() || topic.contains(['+', '#']) || topic.len() > usize::from(u16::MAX) {
        return Err(ValidationError::new("invalid_publish_topic"));
    }
    Ok(())
}

/// Accepts a bare level name. Directive strings belong in `RUST_LOG`.
pub fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    if LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
        Ok(())
    } else {
        Err(ValidationError::new("unknown_log_level"))
    }
}
