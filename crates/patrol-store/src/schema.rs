use rusqlite::Connection;

pub fn apply_pragmas(conn: &Connection, on_disk: bool) -> rusqlite::Result<()> {
    if on_disk {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "journal mode set");
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

pub fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS identities (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  embedding BLOB,
  registered_at TEXT NOT NULL,
  active INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_identities_registered ON identities(registered_at);

CREATE TABLE IF NOT EXISTS zones (
  id INTEGER PRIMARY KEY,
  camera_id TEXT NOT NULL,
  name TEXT NOT NULL,
  x REAL NOT NULL,
  y REAL NOT NULL,
  radius REAL NOT NULL,
  description TEXT,
  active INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_zones_camera ON zones(camera_id);

CREATE TABLE IF NOT EXISTS arrivals (
  id INTEGER PRIMARY KEY,
  identity_id TEXT NOT NULL REFERENCES identities(id),
  zone_id INTEGER NOT NULL REFERENCES zones(id),
  arrived_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_arrivals_time ON arrivals(arrived_at);
CREATE INDEX IF NOT EXISTS idx_arrivals_identity ON arrivals(identity_id);
"#,
    )
}
