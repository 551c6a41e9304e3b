//! Request/response shapes handed to and from transport adapters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::error::{DispatchError, ValidationError};
use crate::fleet::Position;
use crate::ingest::PositionEvent;

const DEFAULT_DEADLINE_MS: u64 = 500;

fn default_deadline_ms() -> u64 {
    DEFAULT_DEADLINE_MS
}

/// Inbound position update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    #[serde(alias = "cab_id")]
    pub agent_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub engaged: bool,
}

impl From<PositionReport> for PositionEvent {
    fn from(report: PositionReport) -> Self {
        PositionEvent {
            agent_id: report.agent_id,
            latitude: report.latitude,
            longitude: report.longitude,
            engaged: report.engaged,
        }
    }
}

/// Inbound "nearest available agent" query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchQuery {
    #[serde(alias = "start_latitude")]
    pub origin_latitude: f64,
    #[serde(alias = "start_longitude")]
    pub origin_longitude: f64,
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

impl DispatchQuery {
    pub fn origin(&self) -> Result<Position, ValidationError> {
        Position::validated(self.origin_latitude, self.origin_longitude)
    }

    pub fn budget(&self) -> Result<Duration, ValidationError> {
        if self.deadline_ms == 0 {
            return Err(ValidationError::ZeroDeadline);
        }
        Ok(Duration::from_millis(self.deadline_ms))
    }
}

/// Acknowledgement for an accepted update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAck {
    pub status: String,
}

impl UpdateAck {
    pub fn accepted() -> Self {
        UpdateAck {
            status: "accepted".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchFailure {
    NoAgentAvailable,
    Timeout,
    StoreUnavailable,
    InvalidRequest,
}

/// Outbound dispatch result: `{"agent_id": ...}` or `{"error": ...}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DispatchResponse {
    Assigned { agent_id: String },
    Failed { error: DispatchFailure },
}

impl DispatchResponse {
    pub fn failed(error: DispatchFailure) -> Self {
        DispatchResponse::Failed { error }
    }
}

impl From<&DispatchError> for DispatchFailure {
    fn from(err: &DispatchError) -> Self {
        match err {
            DispatchError::NotFound => DispatchFailure::NoAgentAvailable,
            DispatchError::Timeout => DispatchFailure::Timeout,
            DispatchError::Validation(_) => DispatchFailure::InvalidRequest,
            DispatchError::StoreUnavailable(_)
            | DispatchError::Store(_)
            | DispatchError::QueueFull
            | DispatchError::PipelineClosed => DispatchFailure::StoreUnavailable,
        }
    }
}

impl From<Result<String, DispatchError>> for DispatchResponse {
    fn from(result: Result<String, DispatchError>) -> Self {
        match result {
            Ok(agent_id) => DispatchResponse::Assigned { agent_id },
            Err(err) => DispatchResponse::failed(DispatchFailure::from(&err)),
        }
    }
}
