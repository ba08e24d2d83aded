//! Event bus message schemas.
//!
//! Messages are published on one of four topics; the topic carries the
//! discriminant, so payloads are flat JSON objects without a type tag.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobStatus};

/// Logical channel on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A worker reserved the job
    Active,
    /// Progress percentage changed
    Progress,
    /// Terminal success
    Completed,
    /// Terminal failure
    Failed,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Active => "job-active",
            Topic::Progress => "job-progress",
            Topic::Completed => "job-completed",
            Topic::Failed => "job-failed",
        }
    }

    /// Parse from the wire topic name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "job-active" => Some(Topic::Active),
            "job-progress" => Some(Topic::Progress),
            "job-completed" => Some(Topic::Completed),
            "job-failed" => Some(Topic::Failed),
            _ => None,
        }
    }

    /// All topics, in lifecycle order.
    pub fn all() -> [Topic; 4] {
        [Topic::Active, Topic::Progress, Topic::Completed, Topic::Failed]
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `job-active` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveEvent {
    pub job_id: JobId,
}

/// `job-progress` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub progress: u8,
}

/// Result carried by a `job-completed` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedValue {
    /// Server-relative URLs of the generated thumbnails
    pub thumbnails: Vec<String>,
}

/// `job-completed` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedEvent {
    pub job_id: JobId,
    pub returnvalue: CompletedValue,
    pub status: JobStatus,
    pub progress: u8,
}

/// `job-failed` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEvent {
    pub job_id: JobId,
    pub error: String,
    pub status: JobStatus,
    pub progress: u8,
}

/// A job lifecycle event, discriminated by its topic.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Active(ActiveEvent),
    Progress(ProgressEvent),
    Completed(CompletedEvent),
    Failed(FailedEvent),
}

impl JobEvent {
    /// Build an `active` event.
    pub fn active(job_id: JobId) -> Self {
        JobEvent::Active(ActiveEvent { job_id })
    }

    /// Build a `progress` event; values are clamped to 100.
    pub fn progress(job_id: JobId, progress: u8) -> Self {
        JobEvent::Progress(ProgressEvent {
            job_id,
            progress: progress.min(100),
        })
    }

    /// Build a `completed` event carrying the thumbnail URLs.
    pub fn completed(job_id: JobId, thumbnails: Vec<String>) -> Self {
        JobEvent::Completed(CompletedEvent {
            job_id,
            returnvalue: CompletedValue { thumbnails },
            status: JobStatus::Completed,
            progress: 100,
        })
    }

    /// Build a `failed` event.
    pub fn failed(job_id: JobId, error: impl Into<String>) -> Self {
        JobEvent::Failed(FailedEvent {
            job_id,
            error: error.into(),
            status: JobStatus::Failed,
            progress: 0,
        })
    }

    /// The topic this event is published on.
    pub fn topic(&self) -> Topic {
        match self {
            JobEvent::Active(_) => Topic::Active,
            JobEvent::Progress(_) => Topic::Progress,
            JobEvent::Completed(_) => Topic::Completed,
            JobEvent::Failed(_) => Topic::Failed,
        }
    }

    /// The job this event concerns.
    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::Active(e) => &e.job_id,
            JobEvent::Progress(e) => &e.job_id,
            JobEvent::Completed(e) => &e.job_id,
            JobEvent::Failed(e) => &e.job_id,
        }
    }

    /// Serialize the payload for the wire.
    pub fn to_payload(&self) -> serde_json::Result<String> {
        match self {
            JobEvent::Active(e) => serde_json::to_string(e),
            JobEvent::Progress(e) => serde_json::to_string(e),
            JobEvent::Completed(e) => serde_json::to_string(e),
            JobEvent::Failed(e) => serde_json::to_string(e),
        }
    }

    /// Deserialize a payload received on `topic`.
    pub fn from_payload(topic: Topic, payload: &str) -> serde_json::Result<Self> {
        Ok(match topic {
            Topic::Active => JobEvent::Active(serde_json::from_str(payload)?),
            Topic::Progress => JobEvent::Progress(serde_json::from_str(payload)?),
            Topic::Completed => JobEvent::Completed(serde_json::from_str(payload)?),
            Topic::Failed => JobEvent::Failed(serde_json::from_str(payload)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_payload_shape() {
        let event = JobEvent::active(JobId::from_string("j1"));
        let json = event.to_payload().unwrap();
        assert_eq!(json, r#"{"jobId":"j1"}"#);
    }

    #[test]
    fn progress_payload_shape_and_clamp() {
        let event = JobEvent::progress(JobId::from_string("j1"), 140);
        let json = event.to_payload().unwrap();
        assert_eq!(json, r#"{"jobId":"j1","progress":100}"#);
    }

    #[test]
    fn completed_payload_shape() {
        let event = JobEvent::completed(
            JobId::from_string("j1"),
            vec!["/uploads/thumbnails/thumb_a.jpg".to_string()],
        );
        let json = event.to_payload().unwrap();
        assert!(json.contains(r#""returnvalue":{"thumbnails":["/uploads/thumbnails/thumb_a.jpg"]}"#));
        assert!(json.contains(r#""status":"completed""#));
        assert!(json.contains(r#""progress":100"#));
    }

    #[test]
    fn failed_payload_shape() {
        let event = JobEvent::failed(JobId::from_string("j1"), "input file not found");
        let json = event.to_payload().unwrap();
        assert!(json.contains(r#""error":"input file not found""#));
        assert!(json.contains(r#""status":"failed""#));
        assert!(json.contains(r#""progress":0"#));
    }

    #[test]
    fn payload_roundtrip_by_topic() {
        let events = [
            JobEvent::active(JobId::from_string("a")),
            JobEvent::progress(JobId::from_string("b"), 40),
            JobEvent::completed(JobId::from_string("c"), vec!["/u/t.jpg".into()]),
            JobEvent::failed(JobId::from_string("d"), "boom"),
        ];
        for event in events {
            let json = event.to_payload().unwrap();
            let parsed = JobEvent::from_payload(event.topic(), &json).unwrap();
            assert_eq!(parsed, event);
        }
    }

    #[test]
    fn topic_names() {
        assert_eq!(Topic::Active.as_str(), "job-active");
        assert_eq!(Topic::parse("job-completed"), Some(Topic::Completed));
        assert_eq!(Topic::parse("job-queued"), None);
    }
}
