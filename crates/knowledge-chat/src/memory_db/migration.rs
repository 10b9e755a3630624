//! Versioned schema upgrades for the chat database.

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::memory_db::schema::MIGRATIONS;

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)";

/// Bring `conn` up to the newest schema. Each script runs in its own
/// transaction together with its version row. Returns how many were applied.
pub fn migrate(conn: &mut Connection) -> anyhow::Result<usize> {
    conn.execute(VERSION_TABLE, [])?;
    let from = schema_version(conn)?;
    debug!("Chat database at schema version {}", from);

    let mut applied = 0;
    for (version, script) in MIGRATIONS.iter().filter(|(version, _)| *version > from) {
        let tx = conn.transaction()?;
        tx.execute_batch(script)
            .map_err(|e| anyhow::anyhow!("migration {} failed: {}", version, e))?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
        tx.commit()?;
        info!("Applied chat schema migration {}", version);
        applied += 1;
    }
    Ok(applied)
}

/// Highest applied migration, 0 for a fresh database.
pub fn schema_version(conn: &Connection) -> anyhow::Result<i32> {
    let version: Option<i32> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(migrate(&mut conn).unwrap(), MIGRATIONS.len());
        assert_eq!(schema_version(&conn).unwrap(), 2);

        assert_eq!(migrate(&mut conn).unwrap(), 0);
        assert_eq!(schema_version(&conn).unwrap(), 2);
    }
}
