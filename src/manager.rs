//! Stack manager - store identity, lifecycle, and the two working contexts
//!
//! The manager owns exactly one schema handle, one store location, and one
//! storage connection per lifetime, all created lazily on first context
//! access and invalidated together by [`StackManager::clear`]. It is a plain
//! constructible object meant to live at the application's composition root,
//! not a hidden global.
//!
//! Store materialization follows a delete-and-retry recovery: if the store
//! cannot be opened or migrated, the store directory is deleted and opening
//! is retried exactly once against a fresh store. A second failure poisons
//! the manager - every later call answers [`Error::Unusable`] until a clear
//! or reset - so no caller can observe a half-initialized stack.

use crate::context::ContextHandle;
use crate::schema::Schema;
use crate::store::StoreConnection;
use crate::{Error, Result};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard};

/// Identifiers the manager needs before it can materialize a store:
/// the schema name, where to find `<schema_name>.toml`, and where the
/// store directory should live
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub schema_name: String,
    pub schema_source: PathBuf,
    /// Base directory for the store; the platform-local data directory when
    /// unset
    pub data_dir: Option<PathBuf>,
}

impl StackConfig {
    pub fn new(schema_name: impl Into<String>, schema_source: impl Into<PathBuf>) -> Self {
        Self {
            schema_name: schema_name.into(),
            schema_source: schema_source.into(),
            data_dir: None,
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }
}

struct Stack {
    foreground: ContextHandle,
    background: ContextHandle,
}

struct ManagerInner {
    config: Option<StackConfig>,
    stack: Option<Stack>,
    /// Set when a fatal store failure has occurred; cleared by clear/reset
    failure: Option<String>,
    next_context_id: u64,
}

/// The store lifecycle manager.
///
/// All lifecycle paths (lazy creation, clear, reset) serialize on one
/// internal lock, so a clear racing a context request cannot tear the stack.
pub struct StackManager {
    inner: Mutex<ManagerInner>,
}

impl Default for StackManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StackManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                config: None,
                stack: None,
                failure: None,
                next_context_id: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the schema identifier and its source location. Touches no
    /// disk; the store materializes on first context access.
    pub fn configure(&self, config: StackConfig) {
        let mut inner = self.lock();
        inner.config = Some(config);
    }

    /// The directory holding the store file and its side files
    pub fn store_directory(&self) -> Result<PathBuf> {
        let inner = self.lock();
        let config = inner.config.as_ref().ok_or(Error::Unconfigured)?;
        Ok(store_directory_for(config))
    }

    /// The foreground context, creating the store on first access.
    ///
    /// Returns the same context identity until the next clear.
    pub fn foreground(&self) -> Result<ContextHandle> {
        let mut inner = self.lock();
        let (foreground, _) = ensure_stack(&mut inner)?;
        Ok(foreground)
    }

    /// The background context, creating the store on first access.
    ///
    /// Its parent is always the current foreground context.
    pub fn background(&self) -> Result<ContextHandle> {
        let mut inner = self.lock();
        let (_, background) = ensure_stack(&mut inner)?;
        Ok(background)
    }

    /// Save the foreground context (no-op when it holds no pending changes)
    pub fn save_foreground(&self) -> Result<()> {
        self.foreground()?.save()
    }

    /// Save the background context, cascading into the foreground context
    /// and on to the store
    pub fn save_background(&self) -> Result<()> {
        self.background()?.save()
    }

    /// Tear the stack down and delete the on-disk store.
    ///
    /// Both contexts are invalidated (outstanding handles answer
    /// [`Error::ContextInvalidated`]), the connection and schema handle are
    /// dropped, and the store directory is removed wholesale so the
    /// write-ahead log and shared-memory side files go with it. The recorded
    /// configuration stays; the next context access rebuilds an empty store
    /// at the same location.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock();

        if let Some(stack) = inner.stack.take() {
            stack.background.invalidate();
            stack.foreground.invalidate();
        }
        inner.failure = None;

        if let Some(config) = &inner.config {
            let store_dir = store_directory_for(config);
            if store_dir.exists() {
                std::fs::remove_dir_all(&store_dir)?;
                tracing::info!("deleted store directory {}", store_dir.display());
            }
        }

        Ok(())
    }

    /// Destroy the store and re-arm with the recorded configuration.
    ///
    /// Equivalent to [`clear`](Self::clear) followed by
    /// [`configure`](Self::configure) with the previously recorded
    /// identifiers; the stack rebuilds lazily on next access.
    pub fn reset(&self) -> Result<()> {
        self.clear()
    }
}

fn ensure_stack(inner: &mut ManagerInner) -> Result<(ContextHandle, ContextHandle)> {
    if let Some(reason) = &inner.failure {
        return Err(Error::Unusable(reason.clone()));
    }

    if let Some(stack) = &inner.stack {
        return Ok((stack.foreground.clone(), stack.background.clone()));
    }

    let config = inner.config.clone().ok_or(Error::Unconfigured)?;

    let foreground_id = inner.next_context_id;
    let background_id = inner.next_context_id + 1;

    match build_stack(&config, foreground_id, background_id) {
        Ok(stack) => {
            inner.next_context_id += 2;
            let handles = (stack.foreground.clone(), stack.background.clone());
            inner.stack = Some(stack);
            Ok(handles)
        }
        Err(e) => {
            tracing::error!("stack initialization failed: {e}");
            inner.failure = Some(e.to_string());
            Err(e)
        }
    }
}

fn build_stack(config: &StackConfig, foreground_id: u64, background_id: u64) -> Result<Stack> {
    let schema = Arc::new(Schema::load(&config.schema_name, &config.schema_source)?);

    let store_dir = store_directory_for(config);
    std::fs::create_dir_all(&store_dir)?;
    let store_path = store_dir.join(format!("{}.db", config.schema_name));

    let conn = match StoreConnection::open(&store_path, &schema, true) {
        Ok(conn) => conn,
        Err(first) => {
            tracing::warn!(
                "store open failed ({first}), deleting store and retrying once"
            );
            std::fs::remove_dir_all(&store_dir)?;
            std::fs::create_dir_all(&store_dir)?;

            StoreConnection::open(&store_path, &schema, false).inspect_err(|second| {
                tracing::error!("store open failed after delete-and-retry: {second}");
            })?
        }
    };

    let conn = Arc::new(Mutex::new(conn));
    let pending_ids = Arc::new(AtomicU64::new(1));

    let foreground = ContextHandle::root(foreground_id, schema, conn, pending_ids);
    let background = ContextHandle::child(background_id, foreground.clone());

    tracing::info!("store ready at {}", store_path.display());
    Ok(Stack {
        foreground,
        background,
    })
}

fn store_directory_for(config: &StackConfig) -> PathBuf {
    let base = config
        .data_dir
        .clone()
        .unwrap_or_else(default_data_dir);
    base.join("persistent-store")
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir().unwrap_or_else(std::env::temp_dir)
}
