//! patrol-store — SQLite persistence for the patrol monitor.
//!
//! Holds the guard roster, patrol-zone configuration, and the append-only
//! arrival log. Implements the `patrol-core` collaborator traits so the
//! pipeline never touches SQL directly.

pub mod schema;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use patrol_core::{
    ArrivalEvent, ArrivalSink, CollaboratorError, Embedding, Point, RosterRow, RosterSource, Zone,
    ZoneBounds, ZoneSource,
};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity already exists: {0}")]
    DuplicateIdentity(String),
    #[error("zone radius {radius} outside [{min}, {max}]")]
    InvalidRadius { radius: f64, min: f64, max: f64 },
}

/// Default database location: `$XDG_DATA_HOME/patrol/patrol.db`.
pub fn default_db_path() -> PathBuf {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("/var/lib"));
    base.join("patrol").join("patrol.db")
}

/// Identifier for a newly enrolled guard: `G` followed by a compact UTC
/// timestamp with milliseconds.
pub fn identity_id_for(at: DateTime<Utc>) -> String {
    format!("G{}", at.format("%Y%m%d%H%M%S%3f"))
}

fn identity_exists(conn: &Connection, id: &str) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM identities WHERE id = ?1", params![id], |r| r.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn insert_identity_row(
    conn: &Connection,
    id: &str,
    name: &str,
    embedding: &Embedding,
    registered_at: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO identities (id, name, embedding, registered_at, active) VALUES (?1, ?2, ?3, ?4, 1)",
        params![id, name, embedding.to_le_bytes(), registered_at],
    )?;
    tracing::info!(identity = %id, name = %name, "identity enrolled");
    Ok(())
}

/// A zone to be created. A missing radius takes the configured default.
#[derive(Debug, Clone)]
pub struct NewZone {
    pub camera_id: String,
    pub name: String,
    pub center: Point,
    pub radius: Option<f64>,
    pub description: Option<String>,
}

/// Filter for [`SqliteStore::query_arrivals`]. All fields optional.
#[derive(Debug, Clone, Default)]
pub struct ArrivalFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub identity_id: Option<String>,
    pub zone_id: Option<i64>,
    pub limit: Option<u32>,
}

/// One stored arrival joined with identity and zone names.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrivalRecord {
    pub id: i64,
    pub identity_id: String,
    pub identity_name: Option<String>,
    pub zone_id: i64,
    pub zone_name: Option<String>,
    pub arrived_at: DateTime<Utc>,
}

/// SQLite-backed store. One connection, serialized behind a mutex; shared by
/// every pipeline worker through the collaborator traits.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        schema::apply_pragmas(&conn, true)?;
        schema::apply_schema(&conn)?;
        tracing::debug!(path = %path.display(), "opened store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::apply_pragmas(&conn, false)?;
        schema::apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Enrol a guard. Fails if the id is taken.
    pub fn insert_identity(
        &self,
        id: &str,
        name: &str,
        embedding: &Embedding,
        registered_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        if identity_exists(&conn, id)? {
            return Err(StoreError::DuplicateIdentity(id.to_string()));
        }
        insert_identity_row(&conn, id, name, embedding, registered_at)
    }

    /// Enrol a guard under a fresh timestamp id and return the id.
    ///
    /// Enrolments within the same millisecond get a `-2`, `-3`, ... suffix.
    pub fn enroll_identity(
        &self,
        name: &str,
        embedding: &Embedding,
        registered_at: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let conn = self.conn.lock();
        let base = identity_id_for(registered_at);
        let mut id = base.clone();
        let mut n = 1u32;
        while identity_exists(&conn, &id)? {
            n += 1;
            id = format!("{base}-{n}");
        }
        insert_identity_row(&conn, &id, name, embedding, registered_at)?;
        Ok(id)
    }

    /// Mark a guard inactive; inactive guards are left out of the roster.
    pub fn deactivate_identity(&self, id: &str) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .lock()
            .execute("UPDATE identities SET active = 0 WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Create a zone, applying the default radius and clamping into the band.
    pub fn add_zone(&self, zone: &NewZone, bounds: &ZoneBounds) -> Result<Zone, StoreError> {
        if bounds.min_radius > bounds.max_radius {
            return Err(StoreError::InvalidRadius {
                radius: bounds.default_radius,
                min: bounds.min_radius,
                max: bounds.max_radius,
            });
        }
        let radius = bounds.normalize(zone.radius);
        if zone.radius.is_some_and(|r| r != radius) {
            tracing::warn!(requested = ?zone.radius, applied = radius, "zone radius clamped");
        }

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO zones (camera_id, name, x, y, radius, description, active) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
            params![
                zone.camera_id,
                zone.name,
                zone.center.x,
                zone.center.y,
                radius,
                zone.description
            ],
        )?;
        Ok(Zone {
            id: conn.last_insert_rowid(),
            camera_id: zone.camera_id.clone(),
            center: zone.center,
            radius,
            name: zone.name.clone(),
        })
    }

    /// Active zones for a camera, in creation order.
    pub fn list_zones(&self, camera_id: &str) -> Result<Vec<Zone>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, camera_id, name, x, y, radius FROM zones WHERE camera_id = ?1 AND active = 1 ORDER BY id",
        )?;
        let zones = stmt
            .query_map(params![camera_id], |row| {
                Ok(Zone {
                    id: row.get(0)?,
                    camera_id: row.get(1)?,
                    name: row.get(2)?,
                    center: Point::new(row.get(3)?, row.get(4)?),
                    radius: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(zones)
    }

    pub fn active_identities(&self) -> Result<Vec<RosterRow>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, embedding, registered_at FROM identities \
             WHERE active = 1 AND embedding IS NOT NULL \
             ORDER BY registered_at DESC, rowid DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RosterRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    embedding_bytes: row.get(2)?,
                    registered_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn insert_arrival(&self, event: &ArrivalEvent) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO arrivals (identity_id, zone_id, arrived_at) VALUES (?1, ?2, ?3)",
            params![event.identity_id, event.zone_id, event.timestamp],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Stored arrivals matching `filter`, newest first.
    pub fn query_arrivals(&self, filter: &ArrivalFilter) -> Result<Vec<ArrivalRecord>, StoreError> {
        let mut sql = String::from(
            "SELECT a.id, a.identity_id, i.name, a.zone_id, z.name, a.arrived_at \
             FROM arrivals a \
             LEFT JOIN identities i ON i.id = a.identity_id \
             LEFT JOIN zones z ON z.id = a.zone_id \
             WHERE 1 = 1",
        );
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(since) = filter.since {
            sql.push_str(" AND a.arrived_at >= ?");
            args.push(Box::new(since));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND a.arrived_at <= ?");
            args.push(Box::new(until));
        }
        if let Some(identity) = &filter.identity_id {
            sql.push_str(" AND a.identity_id = ?");
            args.push(Box::new(identity.clone()));
        }
        if let Some(zone) = filter.zone_id {
            sql.push_str(" AND a.zone_id = ?");
            args.push(Box::new(zone));
        }
        sql.push_str(" ORDER BY a.arrived_at DESC, a.id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(limit));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
                Ok(ArrivalRecord {
                    id: row.get(0)?,
                    identity_id: row.get(1)?,
                    identity_name: row.get(2)?,
                    zone_id: row.get(3)?,
                    zone_name: row.get(4)?,
                    arrived_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

impl RosterSource for SqliteStore {
    fn active_identities(&self) -> Result<Vec<RosterRow>, CollaboratorError> {
        Ok(SqliteStore::active_identities(self)?)
    }
}

impl ZoneSource for SqliteStore {
    fn zones_for_camera(&self, camera_id: &str) -> Result<Vec<Zone>, CollaboratorError> {
        Ok(self.list_zones(camera_id)?)
    }
}

impl ArrivalSink for SqliteStore {
    fn insert_arrival(&self, event: &ArrivalEvent) -> Result<(), CollaboratorError> {
        SqliteStore::insert_arrival(self, event)?;
        Ok(())
    }
}
