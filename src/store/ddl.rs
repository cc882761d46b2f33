//! DDL generation - schema definitions rendered as SQL
//!
//! Every entity becomes one table with an `id INTEGER PRIMARY KEY` rowid and
//! one column per field. Reference fields carry an `ON DELETE CASCADE`
//! foreign key, so deleting a referenced row removes its dependents inside
//! the same transaction.

use crate::schema::{EntityDef, FieldDef, FieldKind, Schema};

/// SQL literal used as the column default for a field kind
fn sql_default(kind: &FieldKind) -> &'static str {
    match kind {
        FieldKind::Text => "''",
        FieldKind::Integer => "0",
        FieldKind::Real => "0.0",
        FieldKind::Bool => "0",
        FieldKind::Blob => "X''",
        FieldKind::Uuid => "'00000000-0000-0000-0000-000000000000'",
        FieldKind::Json => "'null'",
        FieldKind::Reference(_) => "NULL",
    }
}

/// Render one field as a column definition
pub fn column_sql(field: &FieldDef) -> String {
    let mut column = format!("\"{}\" {}", field.name, field.kind.sql_type());

    if let FieldKind::Reference(target) = &field.kind {
        // References are always optional; the FK applies cascade deletes
        column.push_str(&format!(
            " REFERENCES \"{target}\"(id) ON DELETE CASCADE"
        ));
        return column;
    }

    if !field.optional {
        column.push_str(&format!(" NOT NULL DEFAULT {}", sql_default(&field.kind)));
    }

    column
}

/// SQL to create the table for an entity
pub fn create_table_sql(entity: &EntityDef) -> String {
    let mut columns = vec!["id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
    columns.extend(entity.fields.iter().map(column_sql));

    format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (\n    {}\n)",
        entity.name,
        columns.join(",\n    ")
    )
}

/// SQL to create the secondary index for an indexed field
pub fn create_index_sql(entity: &EntityDef, field: &FieldDef) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS idx_{}_{} ON \"{}\"(\"{}\")",
        entity.name, field.name, entity.name, field.name
    )
}

/// All index statements for an entity
pub fn index_statements(entity: &EntityDef) -> Vec<String> {
    entity
        .fields
        .iter()
        .filter(|f| f.indexed)
        .map(|f| create_index_sql(entity, f))
        .collect()
}

/// All schema creation statements, tables first, then indexes
pub fn all_schema_statements(schema: &Schema) -> Vec<String> {
    let mut stmts: Vec<String> = schema.entities.iter().map(create_table_sql).collect();
    for entity in &schema.entities {
        stmts.extend(index_statements(entity));
    }
    stmts
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
                    .with_field(FieldDef::new("name", FieldKind::Text).indexed())
                    .with_field(FieldDef::new("nickname", FieldKind::Text).optional())
                    .with_field(
                        FieldDef::new("team", FieldKind::Reference("team".into())).optional(),
                    ),
            )
    }

    #[test]
    fn test_create_table_sql() {
        let schema = model();
        let sql = create_table_sql(schema.entity("person").unwrap());

        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"person\""));
        assert!(sql.contains("id INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("\"name\" TEXT NOT NULL DEFAULT ''"));
        assert!(sql.contains("\"nickname\" TEXT"));
        assert!(!sql.contains("\"nickname\" TEXT NOT NULL"));
        assert!(sql.contains("\"team\" INTEGER REFERENCES \"team\"(id) ON DELETE CASCADE"));
    }

    #[test]
    fn test_index_statements() {
        let schema = model();
        let indexes = index_statements(schema.entity("person").unwrap());

        assert_eq!(indexes.len(), 1);
        assert_eq!(
            indexes[0],
            "CREATE INDEX IF NOT EXISTS idx_person_name ON \"person\"(\"name\")"
        );
    }

    #[test]
    fn test_all_statements_tables_before_indexes() {
        let stmts = all_schema_statements(&model());
        assert_eq!(stmts.len(), 3);
        assert!(stmts[0].contains("\"team\""));
        assert!(stmts[1].contains("\"person\""));
        assert!(stmts[2].starts_with("CREATE INDEX"));
    }
}
