use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered IoT device. Each device belongs to exactly one user and
/// authenticates with a key that is only ever stored hashed.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub hashed_device_key: String,
    pub is_active: bool,
    pub last_seen: DateTime<Utc>,
}

/// A human account that owns devices. Account CRUD lives outside this
/// service; only login and ownership checks read this table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub hashed_password: String,
}

/// One telemetry reading as submitted by a device, over either transport.
/// `timestamp` is optional; the ingestion path fills in the current instant
/// when it is omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingIn {
    pub reading_type: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A stored telemetry record, as persisted and as returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DataPoint {
    pub id: i64,
    pub device_id: i64,
    pub reading_type: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// MQTT payload envelope: the token proves device identity, `data` carries
/// the same reading fields as the HTTP body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub token: String,
    pub data: ReadingIn,
}

/// Response body for `POST /device/token`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

impl TokenResponse {
    pub fn bearer(access_token: String) -> Self {
        Self {
            access_token,
            token_type: "bearer".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_timestamp_optional() {
        let reading: ReadingIn =
            serde_json::from_str(r#"{"reading_type":"temp","value":21.5}"#).unwrap();
        assert_eq!(reading.reading_type, "temp");
        assert!(reading.timestamp.is_none());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let json = r#"{"token":"abc.def.ghi","data":{"reading_type":"humidity","value":55.0,"timestamp":"2025-07-24T12:00:00Z"}}"#;
        let envelope: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.token, "abc.def.ghi");
        assert_eq!(envelope.data.value, 55.0);
        assert!(envelope.data.timestamp.is_some());
    }

    #[test]
    fn test_envelope_missing_token_rejected() {
        let json = r#"{"data":{"reading_type":"temp","value":1.0}}"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }
}
