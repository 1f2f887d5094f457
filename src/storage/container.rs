//! Hierarchical container file.
//!
//! A container is a tree of named groups and datasets addressed by
//! slash-separated paths (the root group is `""`). On disk it is an
//! append-only record log:
//!
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [RECORD: header frame]([PAYLOAD: raw frame] if the record is a dataset)
//! ...
//! [COMMIT: header frame]
//! ```
//!
//! Records between two commit markers form one transaction. On open the
//! log is replayed into an in-memory index; records after the last commit
//! marker (an interrupted write) are discarded and, for writers, truncated
//! away. A damaged record with committed transactions after it is not a
//! torn tail: the open fails instead. Dataset payloads are not loaded
//! during replay, only their offsets.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{
    BufReader, BufWriter, Error as IoError, ErrorKind, Read, Result as IoResult, Seek, SeekFrom,
    Write,
};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::codec::{self, CODEC_VERSION, FILE_HEADER_LEN};
use super::dataset::{decode_payload, encode_payload, AttrValue, Attributes, Dataset, DatasetMeta};
use super::file_lock::FileLock;

/// A damaged record that committed transactions follow.
///
/// Unlike a torn tail this is never truncated away; the open fails and
/// the file is left untouched. Carried inside an `InvalidData` I/O error.
#[derive(Debug, thiserror::Error)]
#[error("damaged record at offset {offset} is followed by committed data: {source}")]
pub struct DamagedLog {
    pub offset: u64,
    #[source]
    source: IoError,
}

/// One record of the container log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Record {
    Group { path: String, attrs: Attributes },
    /// Followed directly by a raw payload frame.
    Dataset { path: String, meta: DatasetMeta },
    SetAttrs { path: String, attrs: Attributes },
    Remove { path: String },
    Commit {
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
}

/// Index mutation staged by a transaction or replayed from the log.
#[derive(Debug, Clone)]
enum Op {
    Group { path: String, attrs: Attributes },
    Dataset {
        path: String,
        meta: DatasetMeta,
        offset: u64,
    },
    SetAttrs { path: String, attrs: Attributes },
    Remove { path: String },
}

#[derive(Debug, Clone)]
enum Entry {
    Group { attrs: Attributes },
    Dataset { meta: DatasetMeta, offset: u64 },
}

impl Entry {
    const fn attrs(&self) -> &Attributes {
        match self {
            Self::Group { attrs } => attrs,
            Self::Dataset { meta, .. } => &meta.attrs,
        }
    }

    fn attrs_mut(&mut self) -> &mut Attributes {
        match self {
            Self::Group { attrs } => attrs,
            Self::Dataset { meta, .. } => &mut meta.attrs,
        }
    }
}

/// Kind of a node in the container tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Group,
    Dataset,
}

/// Joins a parent path and a child name.
#[must_use]
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Last component of a path.
#[must_use]
pub fn base_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

fn check_path(path: &str) -> IoResult<()> {
    if path.is_empty() {
        return Ok(());
    }
    if path.split('/').any(str::is_empty) {
        return Err(IoError::new(
            ErrorKind::InvalidInput,
            format!("invalid container path '{path}'"),
        ));
    }
    Ok(())
}

fn not_found(path: &str) -> IoError {
    IoError::new(ErrorKind::NotFound, format!("no such container node '{path}'"))
}

fn read_only(path: &Path) -> IoError {
    IoError::new(
        ErrorKind::PermissionDenied,
        format!("container {} was opened read-only", path.display()),
    )
}

/// Prefix under which all descendants of `path` live.
fn child_prefix(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    }
}

/// The in-memory tree index.
#[derive(Debug, Clone)]
struct Index {
    entries: BTreeMap<String, Entry>,
}

impl Index {
    fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            String::new(),
            Entry::Group {
                attrs: Attributes::new(),
            },
        );
        Self { entries }
    }

    fn descendants<'a>(&'a self, path: &str) -> impl Iterator<Item = (&'a String, &'a Entry)> + 'a {
        let prefix = child_prefix(path);
        self.entries
            .range::<str, _>((Bound::Excluded(prefix.as_str()), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(&prefix))
    }

    fn remove_subtree(&mut self, path: &str) {
        let doomed: Vec<String> = self.descendants(path).map(|(k, _)| k.clone()).collect();
        for key in doomed {
            self.entries.remove(&key);
        }
        if !path.is_empty() {
            self.entries.remove(path);
        }
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut end = 0;
        while let Some(i) = path[end..].find('/') {
            let parent = &path[..end + i];
            if !matches!(self.entries.get(parent), Some(Entry::Group { .. })) {
                self.remove_subtree(parent);
                self.entries.insert(
                    parent.to_string(),
                    Entry::Group {
                        attrs: Attributes::new(),
                    },
                );
            }
            end += i + 1;
        }
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::Group { path, attrs } => {
                self.ensure_parents(&path);
                match self.entries.get_mut(&path) {
                    Some(Entry::Group { attrs: existing }) => existing.extend(attrs),
                    _ => {
                        self.remove_subtree(&path);
                        self.entries.insert(path, Entry::Group { attrs });
                    }
                }
            }
            Op::Dataset { path, meta, offset } => {
                self.ensure_parents(&path);
                self.remove_subtree(&path);
                self.entries.insert(path, Entry::Dataset { meta, offset });
            }
            Op::SetAttrs { path, attrs } => match self.entries.get_mut(&path) {
                Some(entry) => entry.attrs_mut().extend(attrs),
                None => tracing::warn!(path = %path, "attributes set on missing node ignored"),
            },
            Op::Remove { path } => self.remove_subtree(&path),
        }
    }
}

/// An open container file.
///
/// Any number of read-only handles may be open on one file; a writable
/// handle holds an exclusive [`FileLock`] for its lifetime.
#[derive(Debug)]
pub struct Container {
    path: PathBuf,
    reader: Mutex<File>,
    writer: Option<BufWriter<File>>,
    lock: Option<FileLock>,
    index: Index,
    sequence: u64,
    end: u64,
    sync_on_write: bool,
}

impl Container {
    /// Creates a new, empty container, replacing any file at `path`.
    ///
    /// # Errors
    /// Returns `WouldBlock` if another writer holds the file.
    pub fn create(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let lock = FileLock::acquire(path)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        codec::write_header(&mut file)?;
        if sync_on_write {
            file.sync_all()?;
        }
        drop(file);

        Self::attach(path, Some(lock), Index::new(), 0, FILE_HEADER_LEN, sync_on_write)
    }

    /// Opens an existing container and replays its log.
    ///
    /// A writable open truncates any interrupted transaction off the end
    /// of the file.
    ///
    /// # Errors
    /// - `InvalidData` if the file is not a container or its header is damaged
    /// - `WouldBlock` if `writable` and another writer holds the file
    pub fn open(path: &Path, writable: bool, sync_on_write: bool) -> IoResult<Self> {
        let lock = if writable {
            Some(FileLock::acquire(path)?)
        } else {
            None
        };

        let (index, sequence, end, file_len) = Self::replay(path)?;

        if writable && end < file_len {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(end)?;
            if sync_on_write {
                file.sync_all()?;
            }
            tracing::info!(
                path = %path.display(),
                discarded = file_len - end,
                "truncated interrupted transaction"
            );
        }

        Self::attach(path, lock, index, sequence, end, sync_on_write)
    }

    fn attach(
        path: &Path,
        lock: Option<FileLock>,
        index: Index,
        sequence: u64,
        end: u64,
        sync_on_write: bool,
    ) -> IoResult<Self> {
        let reader = File::open(path)?;
        let writer = if lock.is_some() {
            Some(BufWriter::new(OpenOptions::new().append(true).open(path)?))
        } else {
            None
        };
        Ok(Self {
            path: path.to_path_buf(),
            reader: Mutex::new(reader),
            writer,
            lock,
            index,
            sequence,
            end,
            sync_on_write,
        })
    }

    /// Replays the log, returning the index, last committed sequence,
    /// committed length and file length.
    fn replay(path: &Path) -> IoResult<(Index, u64, u64, u64)> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let version = codec::read_header(&mut reader)?;
        if version != CODEC_VERSION {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!("unsupported container version {version} (expected {CODEC_VERSION})"),
            ));
        }

        let mut index = Index::new();
        let mut pending = Vec::new();
        let mut sequence = 0;
        let mut committed_end = FILE_HEADER_LEN;
        let mut pos = FILE_HEADER_LEN;

        while pos < file_len {
            let record: Record = match codec::decode(&mut reader) {
                Ok(record) => record,
                Err(e) if matches!(e.kind(), ErrorKind::UnexpectedEof | ErrorKind::InvalidData) => {
                    if commit_follows(&mut reader, pos, file_len)? {
                        tracing::error!(path = %path.display(), offset = pos, error = %e, "damaged record ahead of committed data");
                        return Err(IoError::new(
                            ErrorKind::InvalidData,
                            DamagedLog { offset: pos, source: e },
                        ));
                    }
                    tracing::warn!(path = %path.display(), offset = pos, error = %e, "damaged record in container log");
                    break;
                }
                Err(e) => return Err(e),
            };

            match record {
                Record::Group { path, attrs } => pending.push(Op::Group { path, attrs }),
                Record::SetAttrs { path, attrs } => pending.push(Op::SetAttrs { path, attrs }),
                Record::Remove { path } => pending.push(Op::Remove { path }),
                Record::Dataset { path: node, meta } => {
                    let offset = reader.stream_position()?;
                    if let Err(e) = codec::skip_raw(&mut reader, file_len) {
                        tracing::warn!(path = %path.display(), node = %node, error = %e, "truncated dataset payload");
                        break;
                    }
                    pending.push(Op::Dataset {
                        path: node,
                        meta,
                        offset,
                    });
                }
                Record::Commit {
                    sequence: seq,
                    timestamp,
                } => {
                    tracing::trace!(sequence = seq, %timestamp, "replayed commit");
                    for op in pending.drain(..) {
                        index.apply(op);
                    }
                    sequence = seq;
                    committed_end = reader.stream_position()?;
                }
            }
            pos = reader.stream_position()?;
        }

        if committed_end < file_len {
            tracing::warn!(
                path = %path.display(),
                records = pending.len(),
                bytes = file_len - committed_end,
                "ignoring uncommitted tail of container log"
            );
        }

        Ok((index, sequence, committed_end, file_len))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.writer.is_some()
    }

    /// Sequence number of the last committed transaction.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Length of the committed log in bytes.
    #[must_use]
    pub const fn len_bytes(&self) -> u64 {
        self.end
    }

    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        self.index.entries.contains_key(path)
    }

    #[must_use]
    pub fn kind(&self, path: &str) -> Option<NodeKind> {
        self.index.entries.get(path).map(|e| match e {
            Entry::Group { .. } => NodeKind::Group,
            Entry::Dataset { .. } => NodeKind::Dataset,
        })
    }

    #[must_use]
    pub fn is_group(&self, path: &str) -> bool {
        self.kind(path) == Some(NodeKind::Group)
    }

    #[must_use]
    pub fn attrs(&self, path: &str) -> Option<&Attributes> {
        self.index.entries.get(path).map(Entry::attrs)
    }

    #[must_use]
    pub fn dataset_meta(&self, path: &str) -> Option<&DatasetMeta> {
        match self.index.entries.get(path) {
            Some(Entry::Dataset { meta, .. }) => Some(meta),
            _ => None,
        }
    }

    /// Names of the immediate children of `path`, sorted.
    #[must_use]
    pub fn children(&self, path: &str) -> Vec<&str> {
        let skip = child_prefix(path).len();
        self.index
            .descendants(path)
            .map(|(k, _)| &k[skip..])
            .filter(|rest| !rest.contains('/'))
            .collect()
    }

    /// Full paths of every node below `path`, parents before children.
    #[must_use]
    pub fn subtree(&self, path: &str) -> Vec<&str> {
        self.index
            .descendants(path)
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Loads a dataset with its payload.
    ///
    /// # Errors
    /// - `NotFound` if `path` is not a dataset
    /// - `InvalidData` if the payload fails its checksum
    pub fn read(&self, path: &str) -> IoResult<Dataset> {
        let (meta, offset) = match self.index.entries.get(path) {
            Some(Entry::Dataset { meta, offset }) => (meta, *offset),
            _ => return Err(not_found(path)),
        };
        let bytes = self.read_raw_at(offset)?;
        let data = decode_payload(meta.dtype, &bytes)
            .map_err(|e| IoError::new(e.kind(), format!("dataset '{path}': {e}")))?;
        let expected: usize = meta.shape.iter().product();
        if data.len() != expected {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!(
                    "dataset '{path}' has {} elements, shape {:?} needs {expected}",
                    data.len(),
                    meta.shape
                ),
            ));
        }
        Ok(Dataset {
            data,
            shape: meta.shape.clone(),
            attrs: meta.attrs.clone(),
        })
    }

    /// Reads an attribute, following an `@`-reference to its dataset.
    ///
    /// # Errors
    /// Returns `InvalidData` if a reference points at a missing dataset or
    /// one that cannot be expressed as an attribute.
    pub fn read_attr(&self, path: &str, name: &str) -> IoResult<Option<AttrValue>> {
        let Some(value) = self.attrs(path).and_then(|a| a.get(name)) else {
            return Ok(None);
        };
        let Some(target) = value.reference() else {
            return Ok(Some(value.clone()));
        };
        let dataset = self.read(target).map_err(|e| {
            IoError::new(
                ErrorKind::InvalidData,
                format!("attribute '{name}' of '{path}' references '{target}': {e}"),
            )
        })?;
        AttrValue::from_array_data(dataset.data).map(Some).ok_or_else(|| {
            IoError::new(
                ErrorKind::InvalidData,
                format!("attribute '{name}' of '{path}' references a non-attribute dataset"),
            )
        })
    }

    fn read_raw_at(&self, offset: u64) -> IoResult<Vec<u8>> {
        let mut file = self
            .reader
            .lock()
            .map_err(|_| IoError::new(ErrorKind::Other, "container reader poisoned"))?;
        file.seek(SeekFrom::Start(offset))?;
        codec::decode_raw(&mut *file)
    }

    /// Starts a transaction. Nothing it writes is visible, to this handle
    /// or to later opens, until [`Transaction::commit`] returns.
    ///
    /// # Errors
    /// Returns `PermissionDenied` on a read-only handle.
    pub fn begin(&mut self) -> IoResult<Transaction<'_>> {
        if self.writer.is_none() {
            return Err(read_only(&self.path));
        }
        let start = self.end;
        Ok(Transaction {
            container: self,
            ops: Vec::new(),
            start,
            pos: start,
            committed: false,
        })
    }

    /// Rewrites the log keeping only live nodes.
    ///
    /// Writes to a temporary file and renames it over the container.
    /// Returns the number of bytes reclaimed.
    ///
    /// # Errors
    /// Returns `PermissionDenied` on a read-only handle.
    pub fn compact(&mut self) -> IoResult<u64> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(read_only(&self.path));
        };
        writer.flush()?;

        let before = self.end;
        let temp = TempFile::new(
            self.path
                .with_extension(format!("tmp.{}", Uuid::new_v4())),
        );
        let mut out = BufWriter::new(
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(temp.path())?,
        );
        codec::write_header(&mut out)?;

        let mut pos = FILE_HEADER_LEN;
        let mut entries = BTreeMap::new();
        for (path, entry) in &self.index.entries {
            match entry {
                Entry::Group { attrs } => {
                    let bytes = codec::encode(&Record::Group {
                        path: path.clone(),
                        attrs: attrs.clone(),
                    })?;
                    out.write_all(&bytes)?;
                    pos += bytes.len() as u64;
                    entries.insert(path.clone(), entry.clone());
                }
                Entry::Dataset { meta, offset } => {
                    let payload = self.read_raw_at(*offset)?;
                    let header = codec::encode(&Record::Dataset {
                        path: path.clone(),
                        meta: meta.clone(),
                    })?;
                    out.write_all(&header)?;
                    pos += header.len() as u64;
                    entries.insert(
                        path.clone(),
                        Entry::Dataset {
                            meta: meta.clone(),
                            offset: pos,
                        },
                    );
                    let frame = codec::encode_raw(&payload);
                    out.write_all(&frame)?;
                    pos += frame.len() as u64;
                }
            }
        }

        let sequence = self.sequence + 1;
        let commit = codec::encode(&Record::Commit {
            sequence,
            timestamp: Utc::now(),
        })?;
        out.write_all(&commit)?;
        pos += commit.len() as u64;

        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);

        self.writer = None;
        if let Err(e) = fs::rename(temp.path(), &self.path) {
            self.writer = Some(BufWriter::new(
                OpenOptions::new().append(true).open(&self.path)?,
            ));
            return Err(e);
        }
        temp.persist();

        *self
            .reader
            .lock()
            .map_err(|_| IoError::new(ErrorKind::Other, "container reader poisoned"))? =
            File::open(&self.path)?;
        self.writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(&self.path)?,
        ));
        self.index.entries = entries;
        self.sequence = sequence;
        self.end = pos;

        tracing::info!(path = %self.path.display(), before, after = pos, "compacted container");
        Ok(before.saturating_sub(pos))
    }

    /// Flushes and releases the writer (if any).
    ///
    /// # Errors
    /// Returns the error from the final flush or fsync.
    pub fn close(mut self) -> IoResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            if self.sync_on_write {
                writer.get_ref().sync_all()?;
            }
        }
        self.lock.take();
        Ok(())
    }

    fn writer_mut(&mut self) -> IoResult<&mut BufWriter<File>> {
        match &mut self.writer {
            Some(writer) => Ok(writer),
            None => Err(read_only(&self.path)),
        }
    }

    fn rollback_to(&mut self, offset: u64) -> IoResult<()> {
        if let Some(writer) = self.writer.take() {
            // Unflushed bytes are dropped, never written.
            let (file, _unwritten) = writer.into_parts();
            let result = file.set_len(offset);
            self.writer = Some(BufWriter::new(file));
            result?;
        }
        Ok(())
    }
}

/// Temporary file removed on drop unless persisted.
struct TempFile {
    path: PathBuf,
    keep: bool,
}

impl TempFile {
    const fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn persist(mut self) {
        self.keep = true;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.keep && self.path.exists() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// A batch of container writes applied atomically.
///
/// Records are appended to the file as they are staged. Dropping a
/// transaction without committing truncates them off again.
#[derive(Debug)]
pub struct Transaction<'a> {
    container: &'a mut Container,
    ops: Vec<Op>,
    start: u64,
    pos: u64,
    committed: bool,
}

impl Transaction<'_> {
    /// Committed view of the container being written.
    #[must_use]
    pub fn container(&self) -> &Container {
        &*self.container
    }

    fn append(&mut self, bytes: &[u8]) -> IoResult<()> {
        self.container.writer_mut()?.write_all(bytes)?;
        self.pos += bytes.len() as u64;
        Ok(())
    }

    /// Creates a group (and any missing parents), merging `attrs` into an
    /// existing group of the same name.
    pub fn create_group(&mut self, path: &str, attrs: Attributes) -> IoResult<()> {
        check_path(path)?;
        let bytes = codec::encode(&Record::Group {
            path: path.to_string(),
            attrs: attrs.clone(),
        })?;
        self.append(&bytes)?;
        self.ops.push(Op::Group {
            path: path.to_string(),
            attrs,
        });
        Ok(())
    }

    /// Writes a dataset, replacing whatever node was at `path`.
    pub fn write_dataset(&mut self, path: &str, dataset: &Dataset) -> IoResult<()> {
        check_path(path)?;
        if path.is_empty() {
            return Err(IoError::new(ErrorKind::InvalidInput, "root cannot be a dataset"));
        }
        let expected: usize = dataset.shape.iter().product();
        if expected != dataset.data.len() {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                format!(
                    "dataset '{path}': shape {:?} needs {expected} elements, buffer has {}",
                    dataset.shape,
                    dataset.data.len()
                ),
            ));
        }
        let payload = encode_payload(&dataset.data)?;
        self.write_dataset_raw(path, dataset.meta(), &payload)
    }

    fn write_dataset_raw(&mut self, path: &str, meta: DatasetMeta, payload: &[u8]) -> IoResult<()> {
        let header = codec::encode(&Record::Dataset {
            path: path.to_string(),
            meta: meta.clone(),
        })?;
        self.append(&header)?;
        let offset = self.pos;
        self.append(&codec::encode_raw(payload))?;
        self.ops.push(Op::Dataset {
            path: path.to_string(),
            meta,
            offset,
        });
        Ok(())
    }

    /// Merges attributes into an existing node.
    pub fn set_attrs(&mut self, path: &str, attrs: Attributes) -> IoResult<()> {
        check_path(path)?;
        let bytes = codec::encode(&Record::SetAttrs {
            path: path.to_string(),
            attrs: attrs.clone(),
        })?;
        self.append(&bytes)?;
        self.ops.push(Op::SetAttrs {
            path: path.to_string(),
            attrs,
        });
        Ok(())
    }

    /// Removes a node and everything below it.
    pub fn remove(&mut self, path: &str) -> IoResult<()> {
        check_path(path)?;
        if path.is_empty() {
            return Err(IoError::new(ErrorKind::InvalidInput, "cannot remove the root group"));
        }
        let bytes = codec::encode(&Record::Remove {
            path: path.to_string(),
        })?;
        self.append(&bytes)?;
        self.ops.push(Op::Remove {
            path: path.to_string(),
        });
        Ok(())
    }

    /// Copies the subtree at `src_path` of `src` to `dst_path` here.
    ///
    /// String attributes holding `@`-references into the copied subtree are
    /// rewritten to point at the copy.
    ///
    /// # Errors
    /// Returns `NotFound` if `src_path` does not exist in `src`.
    pub fn copy_from(&mut self, src: &Container, src_path: &str, dst_path: &str) -> IoResult<()> {
        check_path(dst_path)?;
        if src_path.is_empty() || dst_path.is_empty() {
            return Err(IoError::new(ErrorKind::InvalidInput, "cannot copy to or from the root group"));
        }
        let root = src.index.entries.get(src_path).ok_or_else(|| not_found(src_path))?;

        let mut nodes = vec![(src_path, root)];
        nodes.extend(src.index.descendants(src_path).map(|(k, e)| (k.as_str(), e)));

        for (path, entry) in nodes {
            let target = format!("{dst_path}{}", &path[src_path.len()..]);
            let attrs = rewrite_references(entry.attrs(), src_path, dst_path);
            match entry {
                Entry::Group { .. } => self.create_group(&target, attrs)?,
                Entry::Dataset { meta, offset } => {
                    let payload = src.read_raw_at(*offset)?;
                    let meta = DatasetMeta {
                        dtype: meta.dtype,
                        shape: meta.shape.clone(),
                        attrs,
                    };
                    self.write_dataset_raw(&target, meta, &payload)?;
                }
            }
        }
        Ok(())
    }

    /// Writes the commit marker and publishes the staged changes.
    ///
    /// # Errors
    /// On failure nothing is published and the records are rolled back.
    pub fn commit(mut self) -> IoResult<u64> {
        let sequence = self.container.sequence + 1;
        let bytes = codec::encode(&Record::Commit {
            sequence,
            timestamp: Utc::now(),
        })?;
        self.append(&bytes)?;

        let sync = self.container.sync_on_write;
        let writer = self.container.writer_mut()?;
        writer.flush()?;
        if sync {
            writer.get_ref().sync_all()?;
        }

        for op in self.ops.drain(..) {
            self.container.index.apply(op);
        }
        self.container.sequence = sequence;
        self.container.end = self.pos;
        self.committed = true;
        Ok(sequence)
    }

    /// Discards the staged changes.
    ///
    /// # Errors
    /// Returns the error from truncating the file.
    pub fn abort(mut self) -> IoResult<()> {
        self.committed = true;
        self.container.rollback_to(self.start)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.container.rollback_to(self.start) {
                tracing::warn!(
                    path = %self.container.path.display(),
                    error = %e,
                    "failed to roll back uncommitted transaction"
                );
            }
        }
    }
}

/// Returns true if a valid commit record follows the damaged header frame
/// starting at `pos`.
///
/// The frame's own length prefix locates the next frame; when the prefix
/// itself is unusable the damage is treated as a torn tail. A damaged
/// dataset header still has its payload frame behind it, so the scan is
/// retried past one raw frame.
fn commit_follows(reader: &mut BufReader<File>, pos: u64, file_len: u64) -> IoResult<bool> {
    reader.seek(SeekFrom::Start(pos))?;
    let mut prefix = [0u8; 5];
    if reader.read_exact(&mut prefix).is_err() || prefix[0] != CODEC_VERSION {
        return Ok(false);
    }
    let len = u64::from(u32::from_le_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]));
    let after_header = pos + 5 + len + 4;
    if scan_for_commit(reader, after_header, file_len)? {
        return Ok(true);
    }

    reader.seek(SeekFrom::Start(after_header))?;
    if codec::skip_raw(reader, file_len).is_err() {
        return Ok(false);
    }
    let after_payload = reader.stream_position()?;
    scan_for_commit(reader, after_payload, file_len)
}

fn scan_for_commit(reader: &mut BufReader<File>, mut next: u64, file_len: u64) -> IoResult<bool> {
    while next < file_len {
        reader.seek(SeekFrom::Start(next))?;
        match codec::decode::<Record>(reader) {
            Ok(Record::Commit { .. }) => return Ok(true),
            Ok(Record::Dataset { .. }) => {
                if codec::skip_raw(reader, file_len).is_err() {
                    return Ok(false);
                }
            }
            Ok(_) => {}
            Err(_) => return Ok(false),
        }
        next = reader.stream_position()?;
    }
    Ok(false)
}

fn rewrite_references(attrs: &Attributes, src_path: &str, dst_path: &str) -> Attributes {
    attrs
        .iter()
        .map(|(name, value)| {
            let rewritten = value
                .reference()
                .and_then(|target| target.strip_prefix(src_path))
                .filter(|rest| rest.is_empty() || rest.starts_with('/'))
                .map(|rest| AttrValue::Str(format!("@{dst_path}{rest}")));
            (name.clone(), rewritten.unwrap_or_else(|| value.clone()))
        })
        .collect()
}
