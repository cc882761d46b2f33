//! Context operations facade - typed CRUD against a working context
//!
//! Stateless free functions parameterized by an [`Entity`] type and a
//! context handle, so callers never pass entity-name strings. Nothing here
//! touches the store directly; every operation resolves through the
//! context's merged view and working set, and nothing persists until
//! [`save`] is called.
//!
//! Engine failures surface as errors. A count or fetch never silently
//! degrades to zero or empty, so "no data" and "broken store" stay
//! distinguishable.

use crate::context::ContextHandle;
use crate::entity::Entity;
use crate::query::{FetchOptions, Filter, SortBy};
use crate::schema::EntityDef;
use crate::Result;

/// Resolve the schema description for an entity type.
///
/// A type whose `NAME` has no schema entry is a programmer error and fails
/// with [`Error::UnknownEntity`](crate::Error::UnknownEntity).
pub fn entity_def<T: Entity>(ctx: &ContextHandle) -> Result<EntityDef> {
    ctx.entity_def(T::NAME)
}

/// Create a new zero-valued instance attached to the context.
///
/// The instance carries a pending identity until a save assigns it a stored
/// one. Nothing reaches the store before [`save`].
pub fn insert<T: Entity>(ctx: &ContextHandle) -> Result<T> {
    let record = ctx.attach_zero_record(T::NAME)?;
    T::from_record(&record)
}

/// Stage an instance's current field values back into the context.
///
/// Field changes made on a fetched or inserted instance are plain struct
/// mutations; this writes them into the working set so the next save picks
/// them up.
pub fn update<T: Entity>(ctx: &ContextHandle, entity: &T) -> Result<()> {
    ctx.stage_record(T::NAME, entity.to_record())
}

/// Count instances matching an optional filter
pub fn count<T: Entity>(ctx: &ContextHandle, filter: Option<&Filter>) -> Result<u64> {
    ctx.count_merged(T::NAME, filter)
}

/// Fetch instances matching the options' filter, ordered and truncated as
/// requested. Default options mean "everything".
pub fn fetch<T: Entity>(ctx: &ContextHandle, opts: &FetchOptions) -> Result<Vec<T>> {
    ctx.fetch_merged(T::NAME, opts)?
        .iter()
        .map(T::from_record)
        .collect()
}

/// Fetch the first matching instance, or `None`
pub fn fetch_first<T: Entity>(
    ctx: &ContextHandle,
    filter: Option<&Filter>,
    order: &[SortBy],
) -> Result<Option<T>> {
    let opts = FetchOptions {
        filter: filter.cloned(),
        order: order.to_vec(),
        batch_size: 0,
        limit: 1,
    };
    Ok(fetch::<T>(ctx, &opts)?.into_iter().next())
}

/// Stage removal of every instance matching an optional filter (all
/// instances of the type when `None`), returning how many were staged.
/// Deletion reaches the store on the next save.
pub fn delete<T: Entity>(ctx: &ContextHandle, filter: Option<&Filter>) -> Result<u64> {
    ctx.stage_delete(T::NAME, filter)
}

/// Save the context's pending changes.
///
/// A context with nothing pending is a no-op. Saving a context that has a
/// parent pushes its changes into the parent and continues there, so a
/// background save always implies a foreground save; the root flushes to
/// the store in one transaction. On failure the changes stay pending and
/// the error is returned for an explicit re-attempt.
pub fn save(ctx: &ContextHandle) -> Result<()> {
    ctx.save()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Record, RecordId};
    use crate::manager::{StackConfig, StackManager};
    use crate::Error;

    const MODEL: &str = r#"
name = "Model"

[[entity]]
name = "person"

[[entity.field]]
name = "name"
kind = "text"
"#;

    struct Person {
        id: RecordId,
        name: String,
    }

    impl Entity for Person {
        const NAME: &'static str = "person";

        fn from_record(record: &Record) -> Result<Self> {
            Ok(Self {
                id: record.id,
                name: record.text("name")?.to_string(),
            })
        }

        fn to_record(&self) -> Record {
            let mut record = Record::new(self.id);
            record.set("name", self.name.clone());
            record
        }
    }

    struct Ghost;

    impl Entity for Ghost {
        const NAME: &'static str = "ghost";

        fn from_record(_record: &Record) -> Result<Self> {
            Ok(Self)
        }

        fn to_record(&self) -> Record {
            Record::new(RecordId::Pending(0))
        }
    }

    fn test_context() -> (StackManager, tempfile::TempDir, ContextHandle) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Model.toml"), MODEL).unwrap();

        let manager = StackManager::new();
        manager.configure(StackConfig::new("Model", dir.path()).with_data_dir(dir.path()));
        let ctx = manager.foreground().unwrap();
        (manager, dir, ctx)
    }

    #[test]
    fn test_entity_def_resolves_known_type() {
        let (_manager, _dir, ctx) = test_context();

        let def = entity_def::<Person>(&ctx).unwrap();
        assert_eq!(def.name, "person");
        assert!(def.field("name").is_some());
    }

    #[test]
    fn test_unknown_entity_type_fails_fast() {
        let (_manager, _dir, ctx) = test_context();

        assert!(matches!(
            entity_def::<Ghost>(&ctx),
            Err(Error::UnknownEntity(_))
        ));
        assert!(matches!(
            insert::<Ghost>(&ctx),
            Err(Error::UnknownEntity(_))
        ));
    }

    #[test]
    fn test_insert_returns_zero_valued_instance() {
        let (_manager, _dir, ctx) = test_context();

        let person: Person = insert(&ctx).unwrap();
        assert_eq!(person.name, "");
        assert!(!person.id.is_stored());
    }

    #[test]
    fn test_fetch_first_none_on_empty_store() {
        let (_manager, _dir, ctx) = test_context();

        let first: Option<Person> = fetch_first(&ctx, None, &[]).unwrap();
        assert!(first.is_none());
    }
}
