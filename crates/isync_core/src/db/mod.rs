use std::collections::HashSet;
use std::path::Path;

use rusqlite::Connection;

use crate::error::{codes, AppError};

const MIGRATION_0001: (&str, &str) = (
    "0001_init.sql",
    include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../migrations/0001_init.sql"
    )),
);

fn migrations() -> Vec<(&'static str, &'static str)> {
    vec![MIGRATION_0001]
}

pub fn open(path: &Path) -> Result<Connection, AppError> {
    Connection::open(path).map_err(|e| {
        AppError::new(codes::DB_OPEN_FAILED, "Failed to open SQLite database")
            .with_details(e.to_string())
    })
}

pub fn open_in_memory() -> Result<Connection, AppError> {
    Connection::open_in_memory().map_err(|e| {
        AppError::new(
            codes::DB_OPEN_FAILED,
            "Failed to open in-memory SQLite database",
        )
        .with_details(e.to_string())
    })
}

/// Apply each migration exactly once, tracked by name in `_migrations`.
pub fn migrate(conn: &mut Connection) -> Result<(), AppError> {
    conn.execute_batch(
        r#"
      PRAGMA foreign_keys = ON;
      CREATE TABLE IF NOT EXISTS _migrations (
        name TEXT PRIMARY KEY NOT NULL,
        applied_at TEXT NOT NULL
      );
    "#,
    )
    .map_err(|e| {
        AppError::new(
            codes::DB_MIGRATION_FAILED,
            "Failed to ensure migrations table exists",
        )
        .with_details(e.to_string())
    })?;

    let applied: HashSet<String> = {
        let mut stmt = conn.prepare("SELECT name FROM _migrations").map_err(|e| {
            AppError::new(codes::DB_QUERY_FAILED, "Failed to query applied migrations")
                .with_details(e.to_string())
        })?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| {
                AppError::new(codes::DB_QUERY_FAILED, "Failed to read applied migrations")
                    .with_details(e.to_string())
            })?;

        let mut set = HashSet::new();
        for r in rows {
            let name = r.map_err(|e| {
                AppError::new(
                    codes::DB_QUERY_FAILED,
                    "Failed to read applied migration row",
                )
                .with_details(e.to_string())
            })?;
            set.insert(name);
        }
        set
    };

    for (name, sql) in migrations() {
        if applied.contains(name) {
            continue;
        }

        let tx = conn.transaction().map_err(|e| {
            AppError::new(codes::DB_TX_FAILED, "Failed to start migration transaction")
                .with_details(e.to_string())
        })?;

        tx.execute_batch(sql).map_err(|e| {
            AppError::new(
                codes::DB_MIGRATION_FAILED,
                format!("Migration {name} failed"),
            )
            .with_details(e.to_string())
        })?;

        tx.execute(
            "INSERT INTO _migrations(name, applied_at) VALUES (?1, strftime('%Y-%m-%dT%H:%M:%fZ','now'))",
            [name],
        )
        .map_err(|e| {
            AppError::new(
                codes::DB_MIGRATION_FAILED,
                format!("Failed to record migration {name}"),
            )
            .with_details(e.to_string())
        })?;

        tx.commit().map_err(|e| {
            AppError::new(
                codes::DB_TX_FAILED,
                "Failed to commit migration transaction",
            )
            .with_details(e.to_string())
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::OptionalExtension;

    #[test]
    fn migrations_create_expected_tables() {
        let mut conn = open_in_memory().expect("open");
        migrate(&mut conn).expect("migrate");

        for table in [
            "incidents",
            "incident_notes",
            "shadow_tickets",
            "pending_actions",
            "alert_fingerprints",
        ] {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name=?1")
                .unwrap();
            let name: Option<String> = stmt
                .query_row([table], |row| row.get(0))
                .optional()
                .unwrap();
            assert_eq!(name.as_deref(), Some(table));
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut conn = open_in_memory().expect("open");
        migrate(&mut conn).expect("first run");
        migrate(&mut conn).expect("second run");
    }

    #[test]
    fn migrations_survive_reopening_a_file_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.db");

        let mut conn = open(&path).expect("open");
        migrate(&mut conn).expect("migrate");
        drop(conn);

        let mut conn = open(&path).expect("reopen");
        migrate(&mut conn).expect("no-op rerun");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
