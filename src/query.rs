//! Query building blocks - filter predicates, sort descriptors, fetch options
//!
//! Deliberately small: equality/ordering comparisons, substring containment,
//! and boolean composition. Every predicate has two executions that must
//! agree: a parameterized SQL rendering for the store scan and an in-memory
//! evaluation for records still pending in a context working set.

use crate::entity::{Record, Value};
use crate::schema::{EntityDef, FieldKind};
use crate::{Error, Result};

/// A filter predicate over entity fields
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    Contains {
        field: String,
        needle: String,
        case_insensitive: bool,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ne(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt(field.into(), value.into())
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Le(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt(field.into(), value.into())
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ge(field.into(), value.into())
    }

    /// Case-sensitive substring containment on a text field
    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Filter::Contains {
            field: field.into(),
            needle: needle.into(),
            case_insensitive: false,
        }
    }

    /// Case-insensitive substring containment on a text field
    pub fn contains_nocase(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Filter::Contains {
            field: field.into(),
            needle: needle.into(),
            case_insensitive: true,
        }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// Check every referenced field against the entity definition.
    ///
    /// Field names flow into SQL identifiers, so an unknown field must be
    /// rejected before compilation rather than discovered by the engine.
    pub fn validate(&self, def: &EntityDef) -> Result<()> {
        match self {
            Filter::Eq(field, value)
            | Filter::Ne(field, value)
            | Filter::Lt(field, value)
            | Filter::Le(field, value)
            | Filter::Gt(field, value)
            | Filter::Ge(field, value) => {
                let field_def = def.require_field(field)?;
                if !field_def.kind.accepts(value) {
                    return Err(Error::ValueMismatch {
                        field: field.clone(),
                        expected: field_def.kind.as_str(),
                        actual: value.type_name(),
                    });
                }
                Ok(())
            }
            Filter::Contains { field, .. } => {
                let field_def = def.require_field(field)?;
                if field_def.kind != FieldKind::Text {
                    return Err(Error::ValueMismatch {
                        field: field.clone(),
                        expected: "text",
                        actual: field_def.kind.as_str(),
                    });
                }
                Ok(())
            }
            Filter::And(filters) | Filter::Or(filters) => {
                filters.iter().try_for_each(|f| f.validate(def))
            }
            Filter::Not(filter) => filter.validate(def),
        }
    }

    /// Render the predicate as a SQL expression, pushing bind values onto
    /// `params` in placeholder order
    pub fn to_sql(&self, params: &mut Vec<Value>) -> String {
        match self {
            Filter::Eq(field, Value::Null) => format!("\"{field}\" IS NULL"),
            Filter::Ne(field, Value::Null) => format!("\"{field}\" IS NOT NULL"),
            Filter::Eq(field, value) => {
                params.push(value.clone());
                format!("\"{field}\" = ?")
            }
            Filter::Ne(field, value) => {
                params.push(value.clone());
                format!("\"{field}\" <> ?")
            }
            Filter::Lt(field, value) => {
                params.push(value.clone());
                format!("\"{field}\" < ?")
            }
            Filter::Le(field, value) => {
                params.push(value.clone());
                format!("\"{field}\" <= ?")
            }
            Filter::Gt(field, value) => {
                params.push(value.clone());
                format!("\"{field}\" > ?")
            }
            Filter::Ge(field, value) => {
                params.push(value.clone());
                format!("\"{field}\" >= ?")
            }
            Filter::Contains {
                field,
                needle,
                case_insensitive,
            } => {
                params.push(Value::Text(needle.clone()));
                if *case_insensitive {
                    format!("INSTR(LOWER(\"{field}\"), LOWER(?)) > 0")
                } else {
                    format!("INSTR(\"{field}\", ?) > 0")
                }
            }
            Filter::And(filters) => {
                if filters.is_empty() {
                    return "1".to_string();
                }
                let parts: Vec<String> = filters.iter().map(|f| f.to_sql(params)).collect();
                format!("({})", parts.join(" AND "))
            }
            Filter::Or(filters) => {
                if filters.is_empty() {
                    return "0".to_string();
                }
                let parts: Vec<String> = filters.iter().map(|f| f.to_sql(params)).collect();
                format!("({})", parts.join(" OR "))
            }
            Filter::Not(filter) => format!("NOT ({})", filter.to_sql(params)),
        }
    }

    /// Evaluate the predicate against an in-memory record.
    ///
    /// Fields absent from the record count as NULL, matching the SQL
    /// rendering's treatment of NULL columns.
    pub fn matches(&self, record: &Record) -> bool {
        use std::cmp::Ordering;

        let field_value = |field: &str| record.get(field).unwrap_or(&Value::Null);

        match self {
            Filter::Eq(field, value) => value_eq(field_value(field), value),
            Filter::Ne(field, Value::Null) => !matches!(field_value(field), Value::Null),
            Filter::Ne(field, value) => {
                let actual = field_value(field);
                !matches!(actual, Value::Null) && !value_eq(actual, value)
            }
            Filter::Lt(field, value) => {
                matches!(field_value(field).compare(value), Some(Ordering::Less))
            }
            Filter::Le(field, value) => matches!(
                field_value(field).compare(value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Filter::Gt(field, value) => {
                matches!(field_value(field).compare(value), Some(Ordering::Greater))
            }
            Filter::Ge(field, value) => matches!(
                field_value(field).compare(value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Contains {
                field,
                needle,
                case_insensitive,
            } => match field_value(field) {
                Value::Text(s) => {
                    if *case_insensitive {
                        s.to_lowercase().contains(&needle.to_lowercase())
                    } else {
                        s.contains(needle.as_str())
                    }
                }
                _ => false,
            },
            Filter::And(filters) => filters.iter().all(|f| f.matches(record)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(record)),
            Filter::Not(filter) => !filter.matches(record),
        }
    }
}

fn value_eq(a: &Value, b: &Value) -> bool {
    if matches!(a, Value::Null) || matches!(b, Value::Null) {
        return matches!(a, Value::Null) && matches!(b, Value::Null);
    }
    a == b || a.compare(b) == Some(std::cmp::Ordering::Equal)
}

/// One sort key: a field and a direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortBy {
    pub field: String,
    pub ascending: bool,
}

impl SortBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }
}

/// Order records in place by a list of sort keys.
///
/// NULL (and absent) values sort before everything else, as the engine orders
/// them; incomparable values keep their relative order.
pub fn sort_records(records: &mut [Record], order: &[SortBy]) {
    use std::cmp::Ordering;

    if order.is_empty() {
        return;
    }

    records.sort_by(|a, b| {
        for key in order {
            let va = a.get(&key.field).unwrap_or(&Value::Null);
            let vb = b.get(&key.field).unwrap_or(&Value::Null);

            let ordering = match (va, vb) {
                (Value::Null, Value::Null) => Ordering::Equal,
                (Value::Null, _) => Ordering::Less,
                (_, Value::Null) => Ordering::Greater,
                _ => va.compare(vb).unwrap_or(Ordering::Equal),
            };

            let ordering = if key.ascending {
                ordering
            } else {
                ordering.reverse()
            };

            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Options for a fetch: filter, ordering, batching, truncation.
///
/// The default value means "no restriction". `batch_size` is a row-batching
/// hint for the store scan and never changes the returned set; `limit`
/// truncates it. Zero means unrestricted for both.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub filter: Option<Filter>,
    pub order: Vec<SortBy>,
    pub batch_size: usize,
    pub limit: usize,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, key: SortBy) -> Self {
        self.order.push(key);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}
