//! Fleet Model
//!
//! Positions, agent records, great-circle math and the grid index that
//! accelerates nearest-agent lookups.

pub mod geo;
pub mod grid;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::ValidationError;

pub use grid::{CellKey, NearestMatch, SpatialIndex};

/// A point on the globe, in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    /// Builds a position without range checks.
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Position {
            latitude,
            longitude,
        }
    }

    /// Builds a position, rejecting NaN/infinite or out-of-range coordinates.
    pub fn validated(latitude: f64, longitude: f64) -> Result<Self, ValidationError> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(ValidationError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(ValidationError::LatitudeOutOfRange(latitude));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(ValidationError::LongitudeOutOfRange(longitude));
        }
        Ok(Position::new(latitude, longitude))
    }
}

/// Last known state of one agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub position: Position,
    /// `false` means available for dispatch.
    pub engaged: bool,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(agent_id: impl Into<String>, position: Position, engaged: bool) -> Self {
        AgentRecord {
            agent_id: agent_id.into(),
            position,
            engaged,
            updated_at: Utc::now(),
        }
    }

    pub fn is_available(&self) -> bool {
        !self.engaged
    }
}
