//! Working contexts - layered mutable views over the store
//!
//! A context is a working set of pending changes (inserts, updates, deletes)
//! held in memory until a save. The foreground context sits directly on the
//! storage connection; the background context's parent is the foreground
//! context, and its changes only reach the store by cascading up through it.
//!
//! Reads resolve a merged view: the store scan first, then each ancestor's
//! pending overlay, then the context's own. Saving walks the parent chain
//! iteratively, merging pending sets upward, and flushes everything at the
//! root in one transaction.
//!
//! Every operation runs inside the context's critical section, which is what
//! serializes access to a context shared across threads. A context handle is
//! cheap to clone; all clones address the same working set.

use crate::entity::{Record, RecordId};
use crate::query::{self, FetchOptions, Filter};
use crate::schema::{EntityDef, Schema};
use crate::store::StoreConnection;
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Pending changes for one entity
#[derive(Debug, Clone, Default)]
struct EntityChanges {
    /// Records attached by insert, identified by pending ids
    inserted: Vec<Record>,
    /// Staged field changes to stored rows, keyed by rowid
    updated: BTreeMap<i64, Record>,
    /// Staged field changes to records a parent context inserted but has not
    /// yet flushed
    pending_updates: BTreeMap<u64, Record>,
    /// Stored rows staged for deletion
    deleted: BTreeSet<i64>,
    /// Parent-owned pending records staged for deletion
    deleted_pending: BTreeSet<u64>,
}

impl EntityChanges {
    fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.updated.is_empty()
            && self.pending_updates.is_empty()
            && self.deleted.is_empty()
            && self.deleted_pending.is_empty()
    }

    /// Overlay these changes onto a base record set: deletes hide, updates
    /// replace, inserts append
    fn apply(&self, records: &mut Vec<Record>) {
        records.retain(|record| match record.id {
            RecordId::Stored(id) => !self.deleted.contains(&id),
            RecordId::Pending(id) => !self.deleted_pending.contains(&id),
        });

        for record in records.iter_mut() {
            let replacement = match record.id {
                RecordId::Stored(id) => self.updated.get(&id),
                RecordId::Pending(id) => self.pending_updates.get(&id),
            };
            if let Some(replacement) = replacement {
                *record = replacement.clone();
            }
        }

        records.extend(self.inserted.iter().cloned());
    }

    /// Fold a child context's changes into these (the parent's). Deletes
    /// trump updates of the same record.
    fn absorb(&mut self, child: EntityChanges) {
        for pending_id in child.deleted_pending {
            let own_insert = self
                .inserted
                .iter()
                .position(|r| r.id == RecordId::Pending(pending_id));
            match own_insert {
                Some(pos) => {
                    self.inserted.remove(pos);
                    self.pending_updates.remove(&pending_id);
                }
                None => {
                    self.deleted_pending.insert(pending_id);
                }
            }
        }

        for rowid in child.deleted {
            self.updated.remove(&rowid);
            self.deleted.insert(rowid);
        }

        for (pending_id, record) in child.pending_updates {
            let own_insert = self
                .inserted
                .iter_mut()
                .find(|r| r.id == RecordId::Pending(pending_id));
            match own_insert {
                Some(existing) => *existing = record,
                None => {
                    self.pending_updates.insert(pending_id, record);
                }
            }
        }

        for (rowid, record) in child.updated {
            if !self.deleted.contains(&rowid) {
                self.updated.insert(rowid, record);
            }
        }

        self.inserted.extend(child.inserted);
    }
}

type Changes = BTreeMap<String, EntityChanges>;

struct ContextState {
    invalidated: bool,
    schema: Arc<Schema>,
    /// Present on every context except the root, which talks to the store
    parent: Option<ContextHandle>,
    /// Present on the root context only
    conn: Option<Arc<Mutex<StoreConnection>>>,
    changes: Changes,
    /// Pending-id counter shared by every context of one stack
    pending_ids: Arc<AtomicU64>,
}

/// Handle to one working context.
///
/// Clones are cheap and address the same working set. Handles stay valid
/// until the owning manager clears the stack, after which every operation
/// answers [`Error::ContextInvalidated`].
#[derive(Clone)]
pub struct ContextHandle {
    id: u64,
    state: Arc<Mutex<ContextState>>,
}

fn lock<'a>(state: &'a Arc<Mutex<ContextState>>) -> MutexGuard<'a, ContextState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn lock_conn(conn: &Arc<Mutex<StoreConnection>>) -> MutexGuard<'_, StoreConnection> {
    conn.lock().unwrap_or_else(|e| e.into_inner())
}

impl ContextHandle {
    /// Build the root context, attached directly to the store
    pub(crate) fn root(
        id: u64,
        schema: Arc<Schema>,
        conn: Arc<Mutex<StoreConnection>>,
        pending_ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(ContextState {
                invalidated: false,
                schema,
                parent: None,
                conn: Some(conn),
                changes: Changes::new(),
                pending_ids,
            })),
        }
    }

    /// Build a child context layered over `parent`
    pub(crate) fn child(id: u64, parent: ContextHandle) -> Self {
        let (schema, pending_ids) = {
            let parent_state = lock(&parent.state);
            (parent_state.schema.clone(), parent_state.pending_ids.clone())
        };

        Self {
            id,
            state: Arc::new(Mutex::new(ContextState {
                invalidated: false,
                schema,
                parent: Some(parent),
                conn: None,
                changes: Changes::new(),
                pending_ids,
            })),
        }
    }

    /// Stable identity of this context within its manager. Two handles to
    /// the same context compare equal by id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The parent context, `None` for the root
    pub fn parent(&self) -> Option<ContextHandle> {
        lock(&self.state).parent.clone()
    }

    /// Whether this context holds changes not yet pushed to its parent or
    /// the store
    pub fn has_pending_changes(&self) -> Result<bool> {
        self.with_state(|state| Ok(state.changes.values().any(|c| !c.is_empty())))
    }

    /// Run `f` inside the context's critical section, refusing invalidated
    /// contexts
    fn with_state<R>(&self, f: impl FnOnce(&mut ContextState) -> Result<R>) -> Result<R> {
        let mut state = lock(&self.state);
        if state.invalidated {
            return Err(Error::ContextInvalidated);
        }
        f(&mut state)
    }

    /// Tear the context down; called by the manager on clear
    pub(crate) fn invalidate(&self) {
        let mut state = lock(&self.state);
        state.invalidated = true;
        state.changes.clear();
        state.conn = None;
        state.parent = None;
    }

    /// Schema definition for an entity
    pub(crate) fn entity_def(&self, entity: &str) -> Result<EntityDef> {
        self.with_state(|state| state.schema.require_entity(entity).cloned())
    }

    /// Attach a new zero-valued record for `entity` and return it
    pub(crate) fn attach_zero_record(&self, entity: &str) -> Result<Record> {
        self.with_state(|state| {
            let def = state.schema.require_entity(entity)?;

            let pending_id = state.pending_ids.fetch_add(1, Ordering::Relaxed);
            let mut record = Record::new(RecordId::Pending(pending_id));
            for field in &def.fields {
                record.set(field.name.clone(), field.kind.zero_value());
            }

            state
                .changes
                .entry(entity.to_string())
                .or_default()
                .inserted
                .push(record.clone());

            Ok(record)
        })
    }

    /// Stage a record's current field values into the working set
    pub(crate) fn stage_record(&self, entity: &str, record: Record) -> Result<()> {
        self.with_state(|state| {
            let def = state.schema.require_entity(entity)?;
            def.validate_record(&record)?;

            let changes = state.changes.entry(entity.to_string()).or_default();
            match record.id {
                RecordId::Pending(pending_id) => {
                    let own_insert =
                        changes.inserted.iter_mut().find(|r| r.id == record.id);
                    match own_insert {
                        Some(existing) => *existing = record,
                        None => {
                            changes.pending_updates.insert(pending_id, record);
                        }
                    }
                }
                RecordId::Stored(rowid) => {
                    changes.updated.insert(rowid, record);
                }
            }
            Ok(())
        })
    }

    /// Collect the overlay chain for one entity (own context first) plus the
    /// root's connection and schema
    fn read_plan(
        &self,
        entity: &str,
    ) -> Result<(Vec<EntityChanges>, Arc<Mutex<StoreConnection>>, Arc<Schema>)> {
        let mut overlays = Vec::new();
        let mut current = self.clone();

        loop {
            let (parent, conn, schema) = current.with_state(|state| {
                overlays.push(state.changes.get(entity).cloned().unwrap_or_default());
                Ok((
                    state.parent.clone(),
                    state.conn.clone(),
                    state.schema.clone(),
                ))
            })?;

            match parent {
                Some(parent) => current = parent,
                None => {
                    let conn = conn.ok_or(Error::ContextInvalidated)?;
                    return Ok((overlays, conn, schema));
                }
            }
        }
    }

    /// Fetch the merged view of an entity: store rows overlaid with every
    /// pending set from the root down to this context
    pub(crate) fn fetch_merged(&self, entity: &str, opts: &FetchOptions) -> Result<Vec<Record>> {
        let (overlays, conn, schema) = self.read_plan(entity)?;
        let def = schema.require_entity(entity)?;

        if let Some(filter) = &opts.filter {
            filter.validate(def)?;
        }
        for key in &opts.order {
            def.require_field(&key.field)?;
        }

        let any_pending = overlays.iter().any(|o| !o.is_empty());

        let mut records = {
            let store = lock_conn(&conn);
            if any_pending {
                // Overlay updates can change which rows match, so the scan
                // must be unfiltered and the predicate applied after merging
                store.select(def, None, opts.batch_size)?
            } else {
                store.select(def, opts.filter.as_ref(), opts.batch_size)?
            }
        };

        if any_pending {
            for overlay in overlays.iter().rev() {
                overlay.apply(&mut records);
            }
            if let Some(filter) = &opts.filter {
                records.retain(|record| filter.matches(record));
            }
        }

        query::sort_records(&mut records, &opts.order);
        if opts.limit > 0 && records.len() > opts.limit {
            records.truncate(opts.limit);
        }

        Ok(records)
    }

    /// Count the merged view of an entity. Falls back to an engine-level
    /// count when no overlay is pending anywhere in the chain.
    pub(crate) fn count_merged(&self, entity: &str, filter: Option<&Filter>) -> Result<u64> {
        let (overlays, conn, schema) = self.read_plan(entity)?;
        let def = schema.require_entity(entity)?;
        if let Some(filter) = filter {
            filter.validate(def)?;
        }

        if overlays.iter().all(|o| o.is_empty()) {
            let store = lock_conn(&conn);
            return store.count(def, filter);
        }

        let opts = FetchOptions {
            filter: filter.cloned(),
            ..FetchOptions::default()
        };
        Ok(self.fetch_merged(entity, &opts)?.len() as u64)
    }

    /// Stage removal of every record matching `filter` (all records of the
    /// entity when `None`). Pending inserts are dropped outright; stored rows
    /// are deleted on the next save.
    pub(crate) fn stage_delete(&self, entity: &str, filter: Option<&Filter>) -> Result<u64> {
        let opts = FetchOptions {
            filter: filter.cloned(),
            ..FetchOptions::default()
        };
        let matching = self.fetch_merged(entity, &opts)?;

        self.with_state(|state| {
            let changes = state.changes.entry(entity.to_string()).or_default();
            for record in &matching {
                match record.id {
                    RecordId::Pending(pending_id) => {
                        let own_insert =
                            changes.inserted.iter().position(|r| r.id == record.id);
                        match own_insert {
                            Some(pos) => {
                                changes.inserted.remove(pos);
                            }
                            None => {
                                changes.deleted_pending.insert(pending_id);
                            }
                        }
                        changes.pending_updates.remove(&pending_id);
                    }
                    RecordId::Stored(rowid) => {
                        changes.deleted.insert(rowid);
                        changes.updated.remove(&rowid);
                    }
                }
            }
            Ok(matching.len() as u64)
        })
    }

    /// Save pending changes, cascading up the parent chain.
    ///
    /// A context with nothing pending is a no-op and does not cascade. With
    /// a parent, pending sets merge into the parent and the walk continues
    /// there; the root flushes everything to the store in one transaction
    /// and clears the flushed sets, so an immediately following count sees
    /// every write side effect (cascade deletes included). On flush failure
    /// the changes stay pending for an explicit re-attempt.
    pub(crate) fn save(&self) -> Result<()> {
        if !self.has_pending_changes()? {
            return Ok(());
        }

        let mut current = self.clone();
        loop {
            let parent = current.with_state(|state| Ok(state.parent.clone()))?;

            match parent {
                Some(parent) => {
                    let taken =
                        current.with_state(|state| Ok(std::mem::take(&mut state.changes)))?;

                    if let Err((taken, err)) = parent.try_absorb(taken) {
                        // Parent was invalidated mid-save; put the changes
                        // back so the caller can retry after a rebuild
                        let _ = current.with_state(|state| {
                            for (entity, changes) in taken {
                                state.changes.entry(entity).or_default().absorb(changes);
                            }
                            Ok(())
                        });
                        return Err(err);
                    }

                    current = parent;
                }
                None => return current.flush_root(),
            }
        }
    }

    /// Merge a child's drained changes into this context, handing them back
    /// if this context is no longer usable
    fn try_absorb(&self, taken: Changes) -> std::result::Result<(), (Changes, Error)> {
        let mut state = lock(&self.state);
        if state.invalidated {
            return Err((taken, Error::ContextInvalidated));
        }
        for (entity, changes) in taken {
            state.changes.entry(entity).or_default().absorb(changes);
        }
        Ok(())
    }

    /// Flush the root context's pending sets to the store in one transaction
    fn flush_root(&self) -> Result<()> {
        self.with_state(|state| {
            if state.changes.values().all(|c| c.is_empty()) {
                return Ok(());
            }

            let conn = state.conn.clone().ok_or(Error::ContextInvalidated)?;
            let schema = state.schema.clone();

            let mut store = lock_conn(&conn);
            store.begin_transaction()?;

            let result = flush_changes(&store, &schema, &state.changes)
                .and_then(|_| store.commit());

            match result {
                Ok(()) => {
                    // The engine applied cascade deletes inside the
                    // transaction; dropping the flushed sets makes the next
                    // read hit the store directly
                    state.changes.clear();
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("save failed, changes stay pending: {e}");
                    let _ = store.rollback();
                    Err(e)
                }
            }
        })
    }
}

fn flush_changes(
    store: &StoreConnection,
    schema: &Schema,
    changes: &Changes,
) -> Result<()> {
    for (entity, entity_changes) in changes {
        let def = schema.require_entity(entity)?;

        for record in &entity_changes.inserted {
            let RecordId::Pending(pending_id) = record.id else {
                continue;
            };
            if entity_changes.deleted_pending.contains(&pending_id) {
                continue;
            }
            let record = entity_changes
                .pending_updates
                .get(&pending_id)
                .unwrap_or(record);
            store.insert_record(def, record)?;
        }

        for (rowid, record) in &entity_changes.updated {
            if entity_changes.deleted.contains(rowid) {
                continue;
            }
            store.update_record(def, *rowid, record)?;
        }

        for rowid in &entity_changes.deleted {
            store.delete_record(def, *rowid)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    const MODEL: &str = r#"
name = "Model"

[[entity]]
name = "person"

[[entity.field]]
name = "name"
kind = "text"

[[entity.field]]
name = "test_id"
kind = "integer"
"#;

    fn stack() -> (ContextHandle, ContextHandle) {
        let schema = Arc::new(Schema::from_toml_str(MODEL).unwrap());
        let conn = Arc::new(Mutex::new(
            StoreConnection::open_in_memory(&schema).unwrap(),
        ));
        let pending_ids = Arc::new(AtomicU64::new(1));

        let foreground = ContextHandle::root(1, schema, conn, pending_ids);
        let background = ContextHandle::child(2, foreground.clone());
        (foreground, background)
    }

    fn attach_person(ctx: &ContextHandle, name: &str, test_id: i64) -> Record {
        let mut record = ctx.attach_zero_record("person").unwrap();
        record.set("name", name).set("test_id", test_id);
        ctx.stage_record("person", record.clone()).unwrap();
        record
    }

    #[test]
    fn test_insert_visible_before_save_in_own_context_only() {
        let (foreground, background) = stack();
        attach_person(&background, "Bob", 1);

        assert_eq!(background.count_merged("person", None).unwrap(), 1);
        assert_eq!(foreground.count_merged("person", None).unwrap(), 0);
    }

    #[test]
    fn test_cascade_save_reaches_store() {
        let (foreground, background) = stack();
        attach_person(&background, "Bob", 1);

        background.save().unwrap();

        assert!(!background.has_pending_changes().unwrap());
        assert!(!foreground.has_pending_changes().unwrap());
        assert_eq!(foreground.count_merged("person", None).unwrap(), 1);

        let records = foreground
            .fetch_merged("person", &FetchOptions::default())
            .unwrap();
        assert_eq!(records[0].text("name").unwrap(), "Bob");
        assert!(records[0].id.is_stored());
    }

    #[test]
    fn test_save_without_changes_is_noop() {
        let (_foreground, background) = stack();
        background.save().unwrap();
        assert_eq!(background.count_merged("person", None).unwrap(), 0);
    }

    #[test]
    fn test_staged_delete_hides_row_before_save() {
        let (foreground, _background) = stack();
        attach_person(&foreground, "Bob", 1);
        foreground.save().unwrap();

        let removed = foreground.stage_delete("person", None).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(foreground.count_merged("person", None).unwrap(), 0);

        foreground.save().unwrap();
        assert_eq!(foreground.count_merged("person", None).unwrap(), 0);
    }

    #[test]
    fn test_child_updates_parent_pending_record() {
        let (foreground, background) = stack();
        let record = attach_person(&foreground, "Bob", 1);

        // The child sees the parent's unsaved insert and stages a rename
        let mut seen = background
            .fetch_merged("person", &FetchOptions::default())
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, record.id);

        seen[0].set("name", "Robert");
        background.stage_record("person", seen.remove(0)).unwrap();
        background.save().unwrap();

        let records = foreground
            .fetch_merged("person", &FetchOptions::default())
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text("name").unwrap(), "Robert");
    }

    #[test]
    fn test_child_deletes_parent_pending_record() {
        let (foreground, background) = stack();
        attach_person(&foreground, "Bob", 1);

        assert_eq!(background.stage_delete("person", None).unwrap(), 1);
        background.save().unwrap();

        assert_eq!(foreground.count_merged("person", None).unwrap(), 0);
    }

    #[test]
    fn test_invalidated_context_refuses_operations() {
        let (foreground, background) = stack();
        attach_person(&background, "Bob", 1);

        foreground.invalidate();
        background.invalidate();

        assert!(matches!(
            background.count_merged("person", None),
            Err(Error::ContextInvalidated)
        ));
        assert!(matches!(
            foreground.attach_zero_record("person"),
            Err(Error::ContextInvalidated)
        ));
    }

    #[test]
    fn test_merged_fetch_respects_filter_over_overlay() {
        let (foreground, _background) = stack();
        attach_person(&foreground, "Bob", 19);
        foreground.save().unwrap();

        // Rename staged but unsaved: the filter must see the new value
        let mut records = foreground
            .fetch_merged("person", &FetchOptions::default())
            .unwrap();
        records[0].set("name", "Toby");
        foreground
            .stage_record("person", records.remove(0))
            .unwrap();

        let opts = FetchOptions::default().with_filter(Filter::eq("name", "Toby"));
        assert_eq!(foreground.fetch_merged("person", &opts).unwrap().len(), 1);

        let opts = FetchOptions::default().with_filter(Filter::eq("name", "Bob"));
        assert_eq!(foreground.fetch_merged("person", &opts).unwrap().len(), 0);
    }
}
