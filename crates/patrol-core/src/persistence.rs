//! Contracts for the external persistence collaborators.
//!
//! The roster, the zone configuration, and the arrival log live outside the
//! pipeline; these traits are the only way the pipeline touches them.

use crate::types::{ArrivalEvent, RosterRow, Zone};

/// Error type returned by collaborator implementations.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

/// Source of registered identities.
pub trait RosterSource {
    /// All active identities with a non-null embedding, most recently
    /// registered first.
    fn active_identities(&self) -> Result<Vec<RosterRow>, CollaboratorError>;
}

/// Source of patrol-zone configuration.
pub trait ZoneSource {
    /// Active zones belonging to `camera_id`.
    fn zones_for_camera(&self, camera_id: &str) -> Result<Vec<Zone>, CollaboratorError>;
}

/// Append-only arrival log. Shared by all pipeline workers.
pub trait ArrivalSink: Send + Sync {
    fn insert_arrival(&self, event: &ArrivalEvent) -> Result<(), CollaboratorError>;
}
