//! SQLite-backed storage connection
//!
//! One `StoreConnection` exists per stack manager lifetime. It owns the
//! rusqlite connection, applies pragmas and schema DDL at open time, and
//! exposes row-level CRUD in terms of [`Record`]s and [`Filter`]s.

use crate::entity::{Record, RecordId, Value};
use crate::query::Filter;
use crate::schema::{EntityDef, FieldKind, Schema};
use crate::Result;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::path::Path;

use super::migrate;

/// The mediator between in-memory contexts and the on-disk store
pub struct StoreConnection {
    conn: Connection,
}

impl StoreConnection {
    /// Open (creating if absent) the store file and bring it in line with
    /// `schema`.
    ///
    /// With `allow_migration` set, an existing store is migrated additively;
    /// without it the DDL is applied as-is, which only succeeds against a
    /// fresh or matching store. WAL journaling is enabled, so the store
    /// directory will carry `-wal`/`-shm` side files while open.
    pub fn open(path: &Path, schema: &Schema, allow_migration: bool) -> Result<Self> {
        tracing::info!("opening store at {}", path.display());

        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;

        if allow_migration {
            migrate::migrate(&conn, schema)?;
        } else {
            migrate::create_fresh(&conn, schema)?;
        }

        Ok(Self { conn })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory(schema: &Schema) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        migrate::create_fresh(&conn, schema)?;
        Ok(Self { conn })
    }

    // ========== Row Operations ==========

    /// Insert a record's fields as a new row, returning the assigned rowid
    pub fn insert_record(&self, def: &EntityDef, record: &Record) -> Result<i64> {
        let mut columns = Vec::new();
        let mut values = Vec::new();

        for field in &def.fields {
            if let Some(value) = record.get(&field.name) {
                columns.push(format!("\"{}\"", field.name));
                values.push(value_to_sql(value));
            }
        }

        if columns.is_empty() {
            self.conn
                .execute(&format!("INSERT INTO \"{}\" DEFAULT VALUES", def.name), [])?;
        } else {
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT INTO \"{}\" ({}) VALUES ({})",
                def.name,
                columns.join(", "),
                placeholders
            );
            self.conn
                .execute(&sql, rusqlite::params_from_iter(values))?;
        }

        Ok(self.conn.last_insert_rowid())
    }

    /// Write a record's fields over an existing row
    pub fn update_record(&self, def: &EntityDef, rowid: i64, record: &Record) -> Result<()> {
        let mut assignments = Vec::new();
        let mut values = Vec::new();

        for field in &def.fields {
            if let Some(value) = record.get(&field.name) {
                assignments.push(format!("\"{}\" = ?", field.name));
                values.push(value_to_sql(value));
            }
        }

        if assignments.is_empty() {
            return Ok(());
        }

        values.push(rusqlite::types::Value::Integer(rowid));
        let sql = format!(
            "UPDATE \"{}\" SET {} WHERE id = ?",
            def.name,
            assignments.join(", ")
        );
        self.conn
            .execute(&sql, rusqlite::params_from_iter(values))?;

        Ok(())
    }

    /// Delete one row; cascades apply to referencing rows in the same
    /// statement
    pub fn delete_record(&self, def: &EntityDef, rowid: i64) -> Result<usize> {
        let count = self.conn.execute(
            &format!("DELETE FROM \"{}\" WHERE id = ?", def.name),
            [rowid],
        )?;
        Ok(count)
    }

    /// Fetch all rows of an entity matching an optional filter.
    ///
    /// `batch_size` is a row-batching hint (capacity reservation); it never
    /// restricts the returned set.
    pub fn select(
        &self,
        def: &EntityDef,
        filter: Option<&Filter>,
        batch_size: usize,
    ) -> Result<Vec<Record>> {
        let columns: Vec<String> = std::iter::once("id".to_string())
            .chain(def.fields.iter().map(|f| format!("\"{}\"", f.name)))
            .collect();

        let mut params = Vec::new();
        let mut sql = format!("SELECT {} FROM \"{}\"", columns.join(", "), def.name);
        if let Some(filter) = filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.to_sql(&mut params));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let bind = rusqlite::params_from_iter(params.iter().map(value_to_sql));

        let mut rows = stmt.query(bind)?;
        let mut records = Vec::with_capacity(batch_size.min(1024));
        while let Some(row) = rows.next()? {
            records.push(row_to_record(def, row)?);
        }

        Ok(records)
    }

    /// Count rows of an entity matching an optional filter
    pub fn count(&self, def: &EntityDef, filter: Option<&Filter>) -> Result<u64> {
        let mut params = Vec::new();
        let mut sql = format!("SELECT COUNT(*) FROM \"{}\"", def.name);
        if let Some(filter) = filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.to_sql(&mut params));
        }

        let bind = rusqlite::params_from_iter(params.iter().map(value_to_sql));
        let count: i64 = self.conn.query_row(&sql, bind, |row| row.get(0))?;
        Ok(count as u64)
    }

    // ========== Transactions ==========

    /// Begin a transaction for a batched flush
    pub fn begin_transaction(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    /// Commit the open transaction
    pub fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Roll the open transaction back
    pub fn rollback(&mut self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

/// Convert a field value into a SQLite bind value
fn value_to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Integer(n) => Sql::Integer(*n),
        Value::Real(f) => Sql::Real(*f),
        Value::Text(s) => Sql::Text(s.clone()),
        Value::Blob(b) => Sql::Blob(b.clone()),
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Uuid(u) => Sql::Text(u.to_string()),
        Value::Json(v) => Sql::Text(v.to_string()),
    }
}

fn row_to_record(def: &EntityDef, row: &rusqlite::Row) -> rusqlite::Result<Record> {
    let rowid: i64 = row.get(0)?;
    let mut record = Record::new(RecordId::Stored(rowid));

    for (offset, field) in def.fields.iter().enumerate() {
        let idx = offset + 1;
        let value = column_to_value(&field.kind, idx, row.get_ref(idx)?)?;
        record.set(field.name.clone(), value);
    }

    Ok(record)
}

/// Decode one column by its schema kind
fn column_to_value(kind: &FieldKind, idx: usize, vr: ValueRef) -> rusqlite::Result<Value> {
    let mismatch = || {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            vr.data_type(),
            format!("column does not decode as {kind}").into(),
        )
    };

    if matches!(vr, ValueRef::Null) {
        return Ok(Value::Null);
    }

    match (kind, vr) {
        (FieldKind::Text, ValueRef::Text(t)) => std::str::from_utf8(t)
            .map(|s| Value::Text(s.to_string()))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, vr.data_type(), e.into())),
        (FieldKind::Integer | FieldKind::Reference(_), ValueRef::Integer(n)) => {
            Ok(Value::Integer(n))
        }
        (FieldKind::Real, ValueRef::Real(f)) => Ok(Value::Real(f)),
        (FieldKind::Real, ValueRef::Integer(n)) => Ok(Value::Real(n as f64)),
        (FieldKind::Bool, ValueRef::Integer(n)) => Ok(Value::Bool(n != 0)),
        (FieldKind::Blob, ValueRef::Blob(b)) => Ok(Value::Blob(b.to_vec())),
        (FieldKind::Uuid, ValueRef::Text(t)) => {
            let s = std::str::from_utf8(t).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, vr.data_type(), e.into())
            })?;
            uuid::Uuid::parse_str(s).map(Value::Uuid).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, vr.data_type(), e.into())
            })
        }
        (FieldKind::Json, ValueRef::Text(t)) => serde_json::from_slice(t)
            .map(Value::Json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, vr.data_type(), e.into())),
        _ => Err(mismatch()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDef;

    fn model() -> Schema {
        Schema::new("Model")
            .with_entity(
                EntityDef::new("team").with_field(FieldDef::new("name", FieldKind::Text)),
            )
            .with_entity(
                EntityDef::new("person")
                    .with_field(FieldDef::new("name", FieldKind::Text))
                    .with_field(FieldDef::new("test_id", FieldKind::Integer))
                    .with_field(FieldDef::new("identifier", FieldKind::Uuid))
                    .with_field(FieldDef::new("payload", FieldKind::Json).optional())
                    .with_field(
                        FieldDef::new("team", FieldKind::Reference("team".into())).optional(),
                    ),
            )
    }

    fn person_record(name: &str, test_id: i64) -> Record {
        let mut record = Record::new(RecordId::Pending(0));
        record
            .set("name", name)
            .set("test_id", test_id)
            .set("identifier", uuid::Uuid::nil());
        record
    }

    #[test]
    fn test_insert_select_roundtrip() {
        let schema = model();
        let store = StoreConnection::open_in_memory(&schema).unwrap();
        let person = schema.entity("person").unwrap();

        let rowid = store
            .insert_record(person, &person_record("Bob", 19))
            .unwrap();
        assert!(rowid > 0);

        let records = store.select(person, None, 0).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, RecordId::Stored(rowid));
        assert_eq!(records[0].text("name").unwrap(), "Bob");
        assert_eq!(records[0].integer("test_id").unwrap(), 19);
        assert_eq!(records[0].uuid("identifier").unwrap(), uuid::Uuid::nil());
    }

    #[test]
    fn test_filtered_select_and_count() {
        let schema = model();
        let store = StoreConnection::open_in_memory(&schema).unwrap();
        let person = schema.entity("person").unwrap();

        for (name, test_id) in [("Bob", 19), ("Toby", 3), ("Bobby", 8)] {
            store
                .insert_record(person, &person_record(name, test_id))
                .unwrap();
        }

        let filter = Filter::contains_nocase("name", "bob");
        assert_eq!(store.count(person, Some(&filter)).unwrap(), 2);

        let records = store.select(person, Some(&filter), 0).unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(store.count(person, None).unwrap(), 3);
    }

    #[test]
    fn test_update_and_delete() {
        let schema = model();
        let store = StoreConnection::open_in_memory(&schema).unwrap();
        let person = schema.entity("person").unwrap();

        let rowid = store
            .insert_record(person, &person_record("Bob", 1))
            .unwrap();

        let mut changed = person_record("Robert", 1);
        changed.id = RecordId::Stored(rowid);
        store.update_record(person, rowid, &changed).unwrap();

        let records = store.select(person, None, 0).unwrap();
        assert_eq!(records[0].text("name").unwrap(), "Robert");

        assert_eq!(store.delete_record(person, rowid).unwrap(), 1);
        assert_eq!(store.count(person, None).unwrap(), 0);
    }

    #[test]
    fn test_reference_cascade_delete() {
        let schema = model();
        let store = StoreConnection::open_in_memory(&schema).unwrap();
        let team = schema.entity("team").unwrap();
        let person = schema.entity("person").unwrap();

        let mut team_record = Record::new(RecordId::Pending(0));
        team_record.set("name", "reds");
        let team_id = store.insert_record(team, &team_record).unwrap();

        let mut member = person_record("Bob", 1);
        member.set("team", team_id);
        store.insert_record(person, &member).unwrap();

        store.delete_record(team, team_id).unwrap();
        assert_eq!(store.count(person, None).unwrap(), 0);
    }

    #[test]
    fn test_json_field_roundtrip() {
        let schema = model();
        let store = StoreConnection::open_in_memory(&schema).unwrap();
        let person = schema.entity("person").unwrap();

        let mut record = person_record("Bob", 1);
        record.set("payload", serde_json::json!({"likes": ["fishing"]}));
        store.insert_record(person, &record).unwrap();

        let records = store.select(person, None, 0).unwrap();
        assert_eq!(
            records[0].json("payload").unwrap(),
            &serde_json::json!({"likes": ["fishing"]})
        );
    }

    #[test]
    fn test_open_creates_store_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Model.db");

        let schema = model();
        let store = StoreConnection::open(&path, &schema, true).unwrap();
        let person = schema.entity("person").unwrap();
        store
            .insert_record(person, &person_record("Bob", 1))
            .unwrap();

        assert!(path.exists());
    }
}
