//! In-memory guard roster, loaded once at startup.

use patrol_core::{CollaboratorError, Embedding, Identity, RosterSource};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("roster source unavailable: {0}")]
    Unavailable(CollaboratorError),
}

/// Registered guards and their embeddings. Read-only after load, so it is
/// shared freely across pipeline workers.
#[derive(Debug, Default)]
pub struct Roster {
    identities: Vec<Identity>,
    by_id: HashMap<String, usize>,
}

impl Roster {
    /// Fetch active identities from `source`.
    ///
    /// An unreachable source is fatal. Rows whose embedding does not decode to
    /// `embedding_dim` finite values are skipped with a warning.
    pub fn load(source: &dyn RosterSource, embedding_dim: usize) -> Result<Self, RosterError> {
        let rows = source.active_identities().map_err(RosterError::Unavailable)?;

        let mut identities = Vec::with_capacity(rows.len());
        for row in rows {
            match Embedding::from_le_bytes(&row.embedding_bytes, embedding_dim) {
                Ok(embedding) => identities.push(Identity {
                    id: row.id,
                    display_name: row.name,
                    embedding,
                    registered_at: row.registered_at,
                }),
                Err(e) => {
                    tracing::warn!(identity = %row.id, error = %e, "skipping roster entry");
                }
            }
        }

        let roster = Self::from_identities(identities);
        tracing::info!(identities = roster.len(), "roster loaded");
        for identity in roster.all() {
            tracing::info!(
                identity = %identity.id,
                name = %identity.display_name,
                registered_at = %identity.registered_at.format("%Y-%m-%d %H:%M:%S"),
                "roster entry"
            );
        }
        if roster.is_empty() {
            tracing::warn!("roster is empty; no arrivals can be recorded");
        }
        Ok(roster)
    }

    /// Build from already-decoded identities. Later duplicates of an id are
    /// dropped.
    pub fn from_identities(identities: Vec<Identity>) -> Self {
        let mut roster = Self::default();
        for identity in identities {
            if roster.by_id.contains_key(&identity.id) {
                tracing::warn!(identity = %identity.id, "duplicate roster id ignored");
                continue;
            }
            roster.by_id.insert(identity.id.clone(), roster.identities.len());
            roster.identities.push(identity);
        }
        roster
    }

    /// All identities, most recently registered first.
    pub fn all(&self) -> &[Identity] {
        &self.identities
    }

    pub fn get(&self, id: &str) -> Option<&Identity> {
        self.by_id.get(id).map(|&i| &self.identities[i])
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}
