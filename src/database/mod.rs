//! The reactor state database.
//!
//! A [`Database`] owns one container file holding:
//!
//! - root attributes describing the run (versions, host, timing, outcome);
//! - an `inputs` group with the settings, blueprints and geometry blobs;
//! - one group per [`TimeStep`] with the structural layout, one subgroup per
//!   object type holding one dataset per parameter, and any auxiliary
//!   groups attached by callers.

mod reader;
mod time_step;
mod transfer;
mod writer;

use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::config::DatabaseConfig;
use crate::error::{DatabaseError, DbResult, IntegrityError, SchemaError, UsageError};
use crate::registry::ParamRegistry;
use crate::storage::{AttrValue, Attributes, Container, DamagedLog, Dataset};
use crate::value::ArrayData;
use crate::version::SchemaVersion;

pub use reader::{load_snapshot, LoadOptions, Snapshot};
pub(crate) use reader::{read_param, resolved_attrs};
pub use time_step::TimeStep;

pub(crate) const ATTR_DATABASE_VERSION: &str = "databaseVersion";
const ATTR_APP_VERSION: &str = "appVersion";
const ATTR_PLATFORM: &str = "platform";
const ATTR_HOSTNAME: &str = "hostname";
const ATTR_USER: &str = "user";
const ATTR_CASE_TITLE: &str = "caseTitle";
const ATTR_START_TIME: &str = "startTime";
const ATTR_END_TIME: &str = "endTime";
const ATTR_ELAPSED: &str = "elapsedSeconds";
const ATTR_SUCCESS: &str = "successfulCompletion";

pub(crate) const INPUTS_GROUP: &str = "inputs";
const INPUT_SETTINGS: &str = "settings";
const INPUT_BLUEPRINTS: &str = "blueprints";
const INPUT_GEOMETRY: &str = "geometry";
const ATTR_DIGEST: &str = "blake3";

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// How a database file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only; the file must exist (`"r"`).
    Read,
    /// Read-write; the file must exist (`"r+"`).
    ReadWrite,
    /// Create, truncating any existing file (`"w"`).
    Create,
    /// Create; fail if the file exists (`"w-"`).
    CreateNew,
    /// Read-write, creating the file if missing (`"a"`).
    ReadWriteCreate,
}

impl OpenMode {
    #[must_use]
    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::Read)
    }
}

impl FromStr for OpenMode {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "r" => Ok(Self::Read),
            "r+" => Ok(Self::ReadWrite),
            "w" => Ok(Self::Create),
            "w-" | "x" => Ok(Self::CreateNew),
            "a" => Ok(Self::ReadWriteCreate),
            other => Err(DatabaseError::invalid_argument(format!(
                "unknown open mode {other:?}"
            ))),
        }
    }
}

/// Raw input blobs stored alongside the time steps.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Inputs {
    pub settings: Vec<u8>,
    pub blueprints: Vec<u8>,
    pub geometry: Option<Vec<u8>>,
}

/// A versioned, hierarchical store of reactor snapshots.
///
/// # Example
///
/// ```no_run
/// use reactordb::{CompositeTree, Database, DatabaseConfig, OpenMode, ParamDef, ParamRegistry, TimeStep};
///
/// let mut registry = ParamRegistry::new();
/// registry.define("Block", ParamDef::new("power"));
///
/// let mut db = Database::new("case.rxdb", OpenMode::Create, registry, DatabaseConfig::default())?;
/// db.scoped(|db| {
///     let mut tree = CompositeTree::new("Reactor", "r");
///     let block = tree.add_child(tree.root(), "Block", "B1", None);
///     tree.get_mut(block).set_param("power", 1.0e6);
///     db.write_time_step(&TimeStep::new(0, 0), &tree)
/// })?;
/// # Ok::<(), reactordb::DatabaseError>(())
/// ```
#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    working_path: PathBuf,
    mode: OpenMode,
    registry: ParamRegistry,
    config: DatabaseConfig,
    container: Option<Container>,
    version: SchemaVersion,
    opened_at: Option<DateTime<Utc>>,
}

impl Database {
    /// Prepares a handle; nothing is touched on disk until [`open`](Self::open).
    ///
    /// # Errors
    /// Returns an invalid-argument error if `config` does not validate.
    pub fn new(
        path: impl Into<PathBuf>,
        mode: OpenMode,
        registry: ParamRegistry,
        config: DatabaseConfig,
    ) -> DbResult<Self> {
        let config = config.validate()?;
        let path = path.into();
        Ok(Self {
            working_path: path.clone(),
            path,
            mode,
            registry,
            version: config.schema_version,
            config,
            container: None,
            opened_at: None,
        })
    }

    /// Permanent path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path being written while open (differs from [`path`](Self::path)
    /// when a scratch directory is configured).
    #[must_use]
    pub fn working_path(&self) -> &Path {
        &self.working_path
    }

    #[must_use]
    pub const fn mode(&self) -> OpenMode {
        self.mode
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.container.is_some()
    }

    /// Schema version of the open file.
    #[must_use]
    pub const fn version(&self) -> SchemaVersion {
        self.version
    }

    #[must_use]
    pub const fn registry(&self) -> &ParamRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Opens the file according to the open mode.
    ///
    /// # Errors
    /// - [`UsageError::AlreadyOpen`] if this handle is already open
    /// - [`UsageError::FileNotFound`] / [`UsageError::FileExists`] per mode
    /// - [`UsageError::RestartSourceOverwrite`] when writing onto the
    ///   configured restart source
    /// - [`UsageError::Locked`] if another writer holds the file
    /// - [`SchemaError`] for files of an unsupported version
    pub fn open(&mut self) -> DbResult<()> {
        if self.is_open() {
            return Err(UsageError::AlreadyOpen {
                path: self.path.clone(),
            }
            .into());
        }

        if self.mode.is_writable() {
            self.check_restart_source()?;
        }

        let exists = self.path.exists();
        let create = match self.mode {
            OpenMode::Read | OpenMode::ReadWrite => {
                if !exists {
                    return Err(UsageError::FileNotFound {
                        path: self.path.clone(),
                    }
                    .into());
                }
                false
            }
            OpenMode::Create => true,
            OpenMode::CreateNew => {
                if exists {
                    return Err(UsageError::FileExists {
                        path: self.path.clone(),
                    }
                    .into());
                }
                true
            }
            OpenMode::ReadWriteCreate => !exists,
        };

        self.working_path = match (&self.config.scratch_dir, create) {
            (Some(dir), true) => {
                let name = self.path.file_name().ok_or_else(|| {
                    DatabaseError::invalid_argument(format!(
                        "database path {} has no file name",
                        self.path.display()
                    ))
                })?;
                fs::create_dir_all(dir)?;
                dir.join(name)
            }
            _ => self.path.clone(),
        };

        let container = if create {
            self.create_file()?
        } else {
            self.open_file()?
        };

        tracing::info!(
            path = %self.path.display(),
            working = %self.working_path.display(),
            mode = ?self.mode,
            version = %self.version,
            "opened database"
        );
        self.container = Some(container);
        self.opened_at = Some(Utc::now());
        Ok(())
    }

    fn lock_error(&self, err: std::io::Error) -> DatabaseError {
        if err.kind() == ErrorKind::WouldBlock {
            UsageError::Locked {
                path: self.path.clone(),
            }
            .into()
        } else {
            err.into()
        }
    }

    fn create_file(&mut self) -> DbResult<Container> {
        let mut container = Container::create(&self.working_path, self.config.sync_on_write)
            .map_err(|e| self.lock_error(e))?;
        self.version = self.config.schema_version;

        let mut attrs = Attributes::new();
        let mut set = |name: &str, value: AttrValue| {
            attrs.insert(name.to_string(), value);
        };
        set(ATTR_DATABASE_VERSION, self.version.to_string().into());
        set(ATTR_APP_VERSION, env!("CARGO_PKG_VERSION").into());
        set(ATTR_PLATFORM, std::env::consts::OS.into());
        set(ATTR_HOSTNAME, env_or_unknown(&["HOSTNAME", "COMPUTERNAME"]).into());
        set(ATTR_USER, env_or_unknown(&["USER", "USERNAME"]).into());
        set(ATTR_CASE_TITLE, self.config.case_title.clone().into());
        set(ATTR_START_TIME, Utc::now().to_rfc3339().into());

        let mut txn = container.begin()?;
        txn.set_attrs("", attrs)?;
        txn.commit()?;
        Ok(container)
    }

    fn open_file(&mut self) -> DbResult<Container> {
        let mut head = Vec::with_capacity(SQLITE_MAGIC.len());
        fs::File::open(&self.working_path)?
            .take(SQLITE_MAGIC.len() as u64)
            .read_to_end(&mut head)?;
        if head.as_slice() == SQLITE_MAGIC {
            return Err(SchemaError::Unsupported {
                found: "1".to_string(),
            }
            .into());
        }

        let container = Container::open(
            &self.working_path,
            self.mode.is_writable(),
            self.config.sync_on_write,
        )
        .map_err(|e| match e.kind() {
            _ if e.get_ref().is_some_and(|inner| inner.is::<DamagedLog>()) => {
                IntegrityError::corrupted(self.working_path.display().to_string(), e.to_string()).into()
            }
            ErrorKind::InvalidData | ErrorKind::UnexpectedEof => SchemaError::Unreadable {
                reason: e.to_string(),
            }
            .into(),
            _ => self.lock_error(e),
        })?;

        let version = container
            .attrs("")
            .and_then(|a| a.get(ATTR_DATABASE_VERSION))
            .and_then(AttrValue::as_str)
            .ok_or_else(|| SchemaError::Unreadable {
                reason: format!("root attribute '{ATTR_DATABASE_VERSION}' is missing"),
            })?
            .parse::<SchemaVersion>()?
            .ensure_readable()?;
        self.version = version;
        Ok(container)
    }

    fn check_restart_source(&self) -> DbResult<()> {
        let Some(source) = &self.config.restart_source else {
            return Ok(());
        };
        let same = match (fs::canonicalize(source), fs::canonicalize(&self.path)) {
            (Ok(a), Ok(b)) => a == b,
            _ => source == &self.path,
        };
        if same {
            return Err(UsageError::RestartSourceOverwrite {
                path: self.path.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Closes the file, stamping run metadata when writable.
    ///
    /// `success` is recorded as `successfulCompletion` when given. A file
    /// written to a scratch directory is moved to its permanent path.
    ///
    /// # Errors
    /// Returns [`UsageError::NotOpen`] if the handle is not open, or the
    /// I/O error from the final write or relocation.
    pub fn close(&mut self, success: Option<bool>) -> DbResult<()> {
        self.finish(success, true)
    }

    pub(crate) fn finish(&mut self, success: Option<bool>, stamp: bool) -> DbResult<()> {
        let opened_at = self.opened_at;
        self.release(|container| {
            if !(container.is_writable() && stamp) {
                return Ok(());
            }
            let now = Utc::now();
            let mut attrs = Attributes::new();
            attrs.insert(ATTR_END_TIME.to_string(), now.to_rfc3339().into());
            if let Some(start) = opened_at {
                #[allow(clippy::cast_precision_loss)]
                let elapsed = (now - start).num_milliseconds() as f64 / 1000.0;
                attrs.insert(ATTR_ELAPSED.to_string(), elapsed.into());
            }
            if let Some(success) = success {
                attrs.insert(ATTR_SUCCESS.to_string(), success.into());
            }
            let mut txn = container.begin()?;
            txn.set_attrs("", attrs)?;
            txn.commit()?;
            Ok(())
        })?;
        tracing::info!(path = %self.path.display(), ?success, "closed database");
        Ok(())
    }

    /// Runs `last_write` on the open container, then closes it and moves a
    /// scratch file to its permanent path. The move happens even when
    /// `last_write` or the close fails; the first error is returned.
    fn release(&mut self, last_write: impl FnOnce(&mut Container) -> DbResult<()>) -> DbResult<()> {
        let Some(mut container) = self.container.take() else {
            return Err(UsageError::NotOpen {
                path: self.path.clone(),
            }
            .into());
        };
        self.opened_at = None;

        let written = last_write(&mut container);
        let closed = container.close().map_err(DatabaseError::from);

        if self.working_path != self.path {
            relocate(&self.working_path, &self.path)?;
            tracing::info!(
                from = %self.working_path.display(),
                to = %self.path.display(),
                "moved database from scratch"
            );
            self.working_path = self.path.clone();
        }
        written.and(closed)
    }

    /// Runs `f` on the open database and closes it afterwards.
    ///
    /// The database is opened first if needed. It is closed with
    /// `success = true` if `f` succeeds; on failure it is closed with
    /// `success = false`, any error from closing is logged and discarded, and
    /// the error from `f` is returned.
    ///
    /// # Errors
    /// Returns the error from opening, from `f`, or from the final close.
    pub fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> DbResult<T>) -> DbResult<T> {
        if !self.is_open() {
            self.open()?;
        }
        match f(self) {
            Ok(value) => {
                self.close(Some(true))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(close_err) = self.close(Some(false)) {
                    tracing::warn!(path = %self.path.display(), error = %close_err, "close after failure also failed");
                }
                Err(err)
            }
        }
    }

    pub(crate) fn container(&self) -> DbResult<&Container> {
        self.container.as_ref().ok_or_else(|| {
            UsageError::NotOpen {
                path: self.path.clone(),
            }
            .into()
        })
    }

    pub(crate) fn container_mut(&mut self) -> DbResult<&mut Container> {
        match &mut self.container {
            Some(c) if c.is_writable() => Ok(c),
            Some(_) => Err(UsageError::ReadOnly {
                path: self.path.clone(),
            }
            .into()),
            None => Err(UsageError::NotOpen {
                path: self.path.clone(),
            }
            .into()),
        }
    }

    /// Root attributes describing the run.
    ///
    /// # Errors
    /// Returns [`UsageError::NotOpen`] if the handle is closed.
    pub fn run_metadata(&self) -> DbResult<Attributes> {
        Ok(self.container()?.attrs("").cloned().unwrap_or_default())
    }

    /// Stored time steps in ascending order.
    ///
    /// # Errors
    /// Returns [`UsageError::NotOpen`] if the handle is closed.
    pub fn time_steps(&self) -> DbResult<Vec<TimeStep>> {
        let container = self.container()?;
        let mut steps: Vec<TimeStep> = container
            .children("")
            .into_iter()
            .filter(|name| container.is_group(name))
            .filter_map(TimeStep::from_group_name)
            .collect();
        steps.sort();
        Ok(steps)
    }

    /// Returns true if `ts` is stored.
    ///
    /// # Errors
    /// Returns [`UsageError::NotOpen`] if the handle is closed.
    pub fn has_time_step(&self, ts: &TimeStep) -> DbResult<bool> {
        Ok(self.container()?.is_group(&ts.group_name()))
    }

    /// Stores the input blobs, replacing any stored before.
    ///
    /// # Errors
    /// Returns [`UsageError::ReadOnly`] / [`UsageError::NotOpen`], or the
    /// container write error.
    pub fn write_inputs(&mut self, inputs: &Inputs) -> DbResult<()> {
        let container = self.container_mut()?;
        let mut txn = container.begin()?;
        if txn.container().exists(INPUTS_GROUP) {
            txn.remove(INPUTS_GROUP)?;
        }
        txn.create_group(INPUTS_GROUP, Attributes::new())?;

        let blobs = [
            (INPUT_SETTINGS, Some(&inputs.settings)),
            (INPUT_BLUEPRINTS, Some(&inputs.blueprints)),
            (INPUT_GEOMETRY, inputs.geometry.as_ref()),
        ];
        for (name, blob) in blobs {
            let Some(blob) = blob else { continue };
            let mut attrs = Attributes::new();
            attrs.insert(
                ATTR_DIGEST.to_string(),
                blake3::hash(blob).to_hex().to_string().into(),
            );
            let dataset = Dataset::vector(ArrayData::Bytes(blob.clone())).with_attrs(attrs);
            txn.write_dataset(&format!("{INPUTS_GROUP}/{name}"), &dataset)?;
        }
        txn.commit()?;
        tracing::debug!(path = %self.path.display(), "wrote inputs");
        Ok(())
    }

    /// Reads the input blobs, or `None` if none were stored.
    ///
    /// # Errors
    /// Returns [`IntegrityError::Corrupted`](crate::IntegrityError::Corrupted)
    /// if a blob fails its digest check.
    pub fn read_inputs(&self) -> DbResult<Option<Inputs>> {
        let container = self.container()?;
        if !container.is_group(INPUTS_GROUP) {
            return Ok(None);
        }
        let read = |name: &str| -> DbResult<Option<Vec<u8>>> {
            let path = format!("{INPUTS_GROUP}/{name}");
            if !container.exists(&path) {
                return Ok(None);
            }
            let dataset = container
                .read(&path)
                .map_err(|e| DatabaseError::from_read(&path, e))?;
            let ArrayData::Bytes(bytes) = dataset.data else {
                return Err(crate::IntegrityError::corrupted(path, "input blob is not raw bytes").into());
            };
            if let Some(expected) = dataset.attrs.get(ATTR_DIGEST).and_then(AttrValue::as_str) {
                let actual = blake3::hash(&bytes).to_hex();
                if actual.as_str() != expected {
                    return Err(crate::IntegrityError::corrupted(
                        path,
                        format!("digest mismatch: stored {expected}, computed {actual}"),
                    )
                    .into());
                }
            }
            Ok(Some(bytes))
        };
        Ok(Some(Inputs {
            settings: read(INPUT_SETTINGS)?.unwrap_or_default(),
            blueprints: read(INPUT_BLUEPRINTS)?.unwrap_or_default(),
            geometry: read(INPUT_GEOMETRY)?,
        }))
    }

    /// Rewrites the file without superseded records.
    ///
    /// Returns the number of bytes reclaimed.
    ///
    /// # Errors
    /// Returns [`UsageError::ReadOnly`] / [`UsageError::NotOpen`], or the
    /// container error.
    pub fn compact(&mut self) -> DbResult<u64> {
        Ok(self.container_mut()?.compact()?)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.container.is_some() {
            if let Err(e) = self.close(None) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to close database on drop");
            }
        }
    }
}

fn env_or_unknown(names: &[&str]) -> String {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Moves a file, copying when a rename across filesystems is refused.
fn relocate(from: &Path, to: &Path) -> DbResult<()> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}
