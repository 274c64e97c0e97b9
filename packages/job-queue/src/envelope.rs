//! Job envelope: the serializable unit of work stored by the broker

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};

/// Maximum payload bytes echoed into log lines
const PAYLOAD_PREVIEW_LIMIT: usize = 256;

/// Tag identifying which handler runs a job
///
/// Tags written by a newer producer that this build does not know deserialize
/// as [`JobType::Unrecognized`] so the worker can fail them through the normal
/// retry path instead of dropping them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    InstallByArtist,
    InstallByAlbum,
    SetSignatures,
    Ping,
    Unrecognized(String),
}

impl JobType {
    /// Every job type this build knows how to produce
    pub const ALL: [JobType; 4] = [
        JobType::InstallByArtist,
        JobType::InstallByAlbum,
        JobType::SetSignatures,
        JobType::Ping,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::InstallByArtist => "install_by_artist",
            Self::InstallByAlbum => "install_by_album",
            Self::SetSignatures => "set_signatures",
            Self::Ping => "ping",
            Self::Unrecognized(tag) => tag,
        }
    }

    /// Environment variable suffix for per-type settings (e.g. `INSTALL_BY_ARTIST`)
    pub fn env_suffix(&self) -> String {
        self.as_str().to_ascii_uppercase()
    }
}

impl From<String> for JobType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "install_by_artist" => Self::InstallByArtist,
            "install_by_album" => Self::InstallByAlbum,
            "set_signatures" => Self::SetSignatures,
            "ping" => Self::Ping,
            _ => Self::Unrecognized(tag),
        }
    }
}

impl From<JobType> for String {
    fn from(job_type: JobType) -> Self {
        job_type.as_str().to_string()
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named sub-queue with a scheduling weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    #[default]
    Default,
    Critical,
    Low,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Default, Lane::Critical, Lane::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Critical => "critical",
            Self::Low => "low",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Default => 0,
            Self::Critical => 1,
            Self::Low => 2,
        }
    }
}

impl FromStr for Lane {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "critical" => Ok(Self::Critical),
            "low" => Ok(Self::Low),
            other => Err(QueueError::Configuration(format!("unknown lane '{}'", other))),
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as stored in the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: Uuid,

    #[serde(rename = "type")]
    pub job_type: JobType,

    /// Opaque handler-defined bytes
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,

    pub max_retries: u32,

    pub lane: Lane,

    /// Retries already scheduled for this job
    #[serde(default)]
    pub retried: u32,

    pub enqueued_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl JobEnvelope {
    pub fn new(job_type: JobType, payload: Vec<u8>, max_retries: u32, lane: Lane) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            payload,
            max_retries,
            lane,
            retried: 0,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    /// 1-based number of the attempt currently running (or about to run)
    pub fn attempt(&self) -> u32 {
        self.retried + 1
    }

    /// Whether a failure of the current attempt schedules another one
    pub fn can_retry(&self) -> bool {
        self.retried < self.max_retries
    }

    pub fn to_json(&self) -> QueueResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(id: &str, raw: &str) -> QueueResult<Self> {
        serde_json::from_str(raw).map_err(|e| QueueError::corrupt(id, e.to_string()))
    }

    /// Lossy, truncated rendering of the payload for log lines
    pub fn payload_preview(&self) -> String {
        let text = String::from_utf8_lossy(&self.payload);
        if text.len() <= PAYLOAD_PREVIEW_LIMIT {
            return text.into_owned();
        }
        let cut = text
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|i| *i <= PAYLOAD_PREVIEW_LIMIT)
            .last()
            .unwrap_or(0);
        format!("{}... (truncated)", &text[..cut])
    }
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("install_by_artist", JobType::InstallByArtist)]
    #[case("install_by_album", JobType::InstallByAlbum)]
    #[case("set_signatures", JobType::SetSignatures)]
    #[case("ping", JobType::Ping)]
    fn test_job_type_tags(#[case] tag: &str, #[case] expected: JobType) {
        assert_eq!(JobType::from(tag.to_string()), expected);
        assert_eq!(expected.as_str(), tag);
    }

    #[test]
    fn test_unknown_tag_is_preserved() {
        let job_type = JobType::from("reindex_everything".to_string());
        assert_eq!(
            job_type,
            JobType::Unrecognized("reindex_everything".to_string())
        );
        assert_eq!(job_type.to_string(), "reindex_everything");
    }

    #[test]
    fn test_env_suffix() {
        assert_eq!(JobType::InstallByArtist.env_suffix(), "INSTALL_BY_ARTIST");
    }

    #[test]
    fn test_lane_parsing() {
        assert_eq!("critical".parse::<Lane>().unwrap(), Lane::Critical);
        assert_eq!(" LOW ".parse::<Lane>().unwrap(), Lane::Low);
        assert!("urgent".parse::<Lane>().is_err());
        assert_eq!(Lane::default(), Lane::Default);
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = JobEnvelope::new(
            JobType::InstallByArtist,
            br#"{"artist_id":"A123"}"#.to_vec(),
            0,
            Lane::Critical,
        );
        let json: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "install_by_artist");
        assert_eq!(json["lane"], "critical");
        assert_eq!(json["max_retries"], 0);
        assert_eq!(json["payload"], "eyJhcnRpc3RfaWQiOiJBMTIzIn0=");
        assert!(json.get("last_error").is_none());
    }

    #[test]
    fn test_envelope_decodes_unknown_type() {
        let raw = r#"{
            "id": "6f1c6f55-8d51-4c52-9f0b-3f0d3c3b9a11",
            "type": "future_job",
            "payload": "",
            "max_retries": 2,
            "lane": "low",
            "enqueued_at": "2024-01-01T00:00:00Z"
        }"#;
        let envelope = JobEnvelope::from_json("6f1c", raw).unwrap();
        assert_eq!(envelope.job_type, JobType::Unrecognized("future_job".to_string()));
        assert_eq!(envelope.retried, 0);
        assert!(envelope.payload.is_empty());
    }

    #[test]
    fn test_corrupt_envelope() {
        let err = JobEnvelope::from_json("abc", "{not json").unwrap_err();
        assert!(matches!(err, QueueError::CorruptEnvelope { .. }));
    }

    #[test]
    fn test_retry_budget() {
        let mut envelope = JobEnvelope::new(JobType::SetSignatures, Vec::new(), 2, Lane::Default);
        assert_eq!(envelope.attempt(), 1);
        assert!(envelope.can_retry());
        envelope.retried = 2;
        assert_eq!(envelope.attempt(), 3);
        assert!(!envelope.can_retry());

        let install = JobEnvelope::new(JobType::InstallByAlbum, Vec::new(), 0, Lane::Default);
        assert!(!install.can_retry());
    }

    #[test]
    fn test_payload_preview_truncates() {
        let envelope = JobEnvelope::new(JobType::Ping, "x".repeat(1000).into_bytes(), 0, Lane::Low);
        let preview = envelope.payload_preview();
        assert!(preview.ends_with("... (truncated)"));
        assert!(preview.len() < 300);
    }
}
