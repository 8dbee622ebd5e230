use crate::errors::{Error, Result};
use crate::model::ReadingIn;

const READING_TYPE_MAX_LEN: usize = 64;

/// Validates a reading before it is persisted. Both transports run the same
/// checks so a payload rejected over HTTP is also rejected over MQTT.
pub fn validate(reading: &ReadingIn) -> Result<()> {
    if reading.reading_type.is_empty() {
        return Err(Error::Validation(
            "reading_type cannot be empty".to_string(),
        ));
    }

    if reading.reading_type.len() > READING_TYPE_MAX_LEN {
        return Err(Error::Validation(format!(
            "reading_type exceeds {} characters",
            READING_TYPE_MAX_LEN
        )));
    }

    if !reading.value.is_finite() {
        return Err(Error::Validation(format!(
            "value {} is not a finite number",
            reading.value
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading(reading_type: &str, value: f64) -> ReadingIn {
        ReadingIn {
            reading_type: reading_type.to_string(),
            value,
            timestamp: Some(Utc::now()),
        }
    }

    #[test]
    fn test_valid_reading() {
        assert!(validate(&reading("temperature", 21.5)).is_ok());
    }

    #[test]
    fn test_empty_reading_type() {
        assert!(validate(&reading("", 21.5)).is_err());
    }

    #[test]
    fn test_oversized_reading_type() {
        assert!(validate(&reading(&"x".repeat(65), 1.0)).is_err());
    }

    #[test]
    fn test_non_finite_value() {
        assert!(validate(&reading("temperature", f64::NAN)).is_err());
        assert!(validate(&reading("temperature", f64::INFINITY)).is_err());
    }

    #[test]
    fn test_missing_timestamp_is_valid() {
        let r = ReadingIn {
            reading_type: "temperature".to_string(),
            value: 20.0,
            timestamp: None,
        };
        assert!(validate(&r).is_ok());
    }
}
