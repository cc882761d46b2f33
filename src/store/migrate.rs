//! Lightweight migration - additive schema evolution on store open
//!
//! Covers the cheap cases only: new tables are created, new columns are added
//! with `ALTER TABLE ADD COLUMN`. Anything else (changed column type, removed
//! column, removed table) is reported as [`Error::Migration`] so the caller's
//! delete-and-retry recovery can rebuild the store from scratch.

use super::ddl;
use crate::schema::Schema;
use crate::{Error, Result};
use rusqlite::Connection;
use std::collections::HashMap;

/// Bring the open store in line with `schema`, or fail with
/// [`Error::Migration`] if the difference is not additively bridgeable
pub fn migrate(conn: &Connection, schema: &Schema) -> Result<()> {
    let existing_tables = table_names(conn)?;

    for table in &existing_tables {
        if schema.entity(table).is_none() {
            return Err(Error::Migration(format!(
                "store holds table {table:?} with no entity in schema {:?}",
                schema.name
            )));
        }
    }

    for entity in &schema.entities {
        if !existing_tables.iter().any(|t| t == &entity.name) {
            tracing::info!("creating table for new entity {:?}", entity.name);
            conn.execute(&ddl::create_table_sql(entity), [])?;
            continue;
        }

        let columns = table_columns(conn, &entity.name)?;

        for field in &entity.fields {
            match columns.get(&field.name) {
                None => {
                    tracing::info!(
                        "adding column {:?} to table {:?}",
                        field.name,
                        entity.name
                    );
                    let stmt = format!(
                        "ALTER TABLE \"{}\" ADD COLUMN {}",
                        entity.name,
                        ddl::column_sql(field)
                    );
                    conn.execute(&stmt, [])?;
                }
                Some(declared) if declared != field.kind.sql_type() => {
                    return Err(Error::Migration(format!(
                        "column {:?} on table {:?} is declared {declared} but schema wants {}",
                        field.name,
                        entity.name,
                        field.kind.sql_type()
                    )));
                }
                Some(_) => {}
            }
        }

        for column in columns.keys() {
            if column != "id" && entity.field(column).is_none() {
                return Err(Error::Migration(format!(
                    "table {:?} holds column {column:?} with no field in schema",
                    entity.name
                )));
            }
        }
    }

    // Index creation is idempotent and safe to re-run after any ALTER
    for entity in &schema.entities {
        for stmt in ddl::index_statements(entity) {
            conn.execute(&stmt, [])?;
        }
    }

    Ok(())
}

/// Create the full schema fresh, without inspecting what is already there.
/// Used on the delete-and-retry recovery path against an empty store.
pub fn create_fresh(conn: &Connection, schema: &Schema) -> Result<()> {
    for stmt in ddl::all_schema_statements(schema) {
        conn.execute(&stmt, [])?;
    }
    Ok(())
}

fn table_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' \
         AND name NOT LIKE 'sqlite_%'",
    )?;

    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(names)
}

/// Column name -> declared type for a table
fn table_columns(conn: &Connection, table: &str) -> Result<HashMap<String, String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;

    let columns = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;

    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityDef, FieldDef, FieldKind};

    fn v1() -> Schema {
        Schema::new("Model").with_entity(
            EntityDef::new("person").with_field(FieldDef::new("name", FieldKind::Text)),
        )
    }

    #[test]
    fn test_migrate_creates_missing_table() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn, &v1()).unwrap();

        let columns = table_columns(&conn, "person").unwrap();
        assert!(columns.contains_key("id"));
        assert!(columns.contains_key("name"));
    }

    #[test]
    fn test_migrate_adds_new_column() {
        let conn = Connection::open_in_memory().unwrap();
        create_fresh(&conn, &v1()).unwrap();

        let v2 = Schema::new("Model").with_entity(
            EntityDef::new("person")
                .with_field(FieldDef::new("name", FieldKind::Text))
                .with_field(FieldDef::new("age", FieldKind::Integer)),
        );
        migrate(&conn, &v2).unwrap();

        let columns = table_columns(&conn, "person").unwrap();
        assert_eq!(columns.get("age").map(String::as_str), Some("INTEGER"));
    }

    #[test]
    fn test_migrate_rejects_changed_kind() {
        let conn = Connection::open_in_memory().unwrap();
        create_fresh(&conn, &v1()).unwrap();

        let changed = Schema::new("Model").with_entity(
            EntityDef::new("person").with_field(FieldDef::new("name", FieldKind::Integer)),
        );
        assert!(matches!(
            migrate(&conn, &changed),
            Err(Error::Migration(_))
        ));
    }

    #[test]
    fn test_migrate_rejects_removed_field() {
        let conn = Connection::open_in_memory().unwrap();
        let v2 = Schema::new("Model").with_entity(
            EntityDef::new("person")
                .with_field(FieldDef::new("name", FieldKind::Text))
                .with_field(FieldDef::new("age", FieldKind::Integer)),
        );
        create_fresh(&conn, &v2).unwrap();

        assert!(matches!(migrate(&conn, &v1()), Err(Error::Migration(_))));
    }

    #[test]
    fn test_migrate_rejects_orphan_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE legacy (id INTEGER PRIMARY KEY)", [])
            .unwrap();

        assert!(matches!(migrate(&conn, &v1()), Err(Error::Migration(_))));
    }
}
