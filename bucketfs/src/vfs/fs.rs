//! Path-level filesystem view of a bucket.
//!
//! `Fs` resolves paths against the stat and type caches, keeps created but not
//! yet uploaded files visible, and implements directory operations on top of
//! the flat object namespace. A directory `a/b` is the placeholder object
//! `a/b/`. When a file and a directory share a name, listings show the file
//! with [`CONFLICT_SUFFIX`] appended and lookups of the plain name return the
//! directory.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::handle::{FileHandle, LinkState, LocalFile};
use super::rename::{
    RenameProgress, plan_flat_rename, rename_folder_hierarchical, run_flat_rename,
};
use super::stale::StaleHandleDetector;
use crate::cadapter::{
    Bucket, BucketError, BucketType, CopyRequest, CreateRequest, DeleteRequest, Generation,
    ListRequest, ObjectKind, ObjectRecord,
};
use crate::clock::{Clock, SystemClock};
use crate::config::MountConfig;
use crate::context::OpContext;
use crate::error::{FsError, Precondition};
use crate::meta::{EntryType, FastStatBucket, SharedStatCache, TypeCacheRegistry};
use crate::reader::cache::{ContentCache, MemoryContentCache};
use crate::reader::{MIB, ReaderOptions};

/// Appended to a file name that collides with a directory of the same name.
pub const CONFLICT_SUFFIX: &str = "\n";

const READ_CHUNK: usize = 64 * 1024;

/// Attributes of a resolved path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    pub path: String,
    pub kind: EntryType,
    pub size: u64,
    /// `None` for the root and for files not uploaded yet.
    pub generation: Option<Generation>,
    pub mtime: SystemTime,
    pub symlink_target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryType,
}

/// Strips redundant slashes: `"/a//b/"` becomes `"a/b"`, the root is `""`.
pub(crate) fn norm_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Splits a normalized path into its parent path and final component.
pub(crate) fn split_dir_file(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

/// Object-name prefix of the children of directory `path`.
pub(crate) fn dir_prefix(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    }
}

fn entry_type(record: &ObjectRecord) -> EntryType {
    match record.kind {
        ObjectKind::Regular => EntryType::File,
        ObjectKind::Directory => EntryType::Directory,
        ObjectKind::Symlink => EntryType::Symlink,
    }
}

enum Resolved {
    Root,
    Local(Arc<LocalFile>),
    Object(ObjectRecord),
}

impl Resolved {
    fn kind(&self) -> EntryType {
        match self {
            Resolved::Root => EntryType::Directory,
            Resolved::Local(_) => EntryType::File,
            Resolved::Object(record) => entry_type(record),
        }
    }

    fn into_attr(self, path: String) -> FileAttr {
        match self {
            Resolved::Root => FileAttr {
                path,
                kind: EntryType::Directory,
                size: 0,
                generation: None,
                mtime: UNIX_EPOCH,
                symlink_target: None,
            },
            Resolved::Local(local) => FileAttr {
                path,
                kind: EntryType::File,
                size: local.size(),
                generation: None,
                mtime: local.created,
                symlink_target: None,
            },
            Resolved::Object(record) => FileAttr {
                path,
                kind: entry_type(&record),
                size: record.size,
                generation: Some(record.generation),
                mtime: record.updated,
                symlink_target: record.symlink_target,
            },
        }
    }
}

pub(crate) struct FsInner {
    pub(crate) bucket: Arc<FastStatBucket>,
    pub(crate) content_cache: Option<Arc<dyn ContentCache>>,
    pub(crate) reader_options: ReaderOptions,
    pub(crate) max_file_size: u64,
    pub(crate) detector: StaleHandleDetector,
    clock: Arc<dyn Clock>,
    types: TypeCacheRegistry,
    native_rename: bool,
    local_files: Mutex<HashMap<String, Arc<LocalFile>>>,
    links: Mutex<HashMap<String, Weak<LinkState>>>,
}

impl FsInner {
    fn local_files(&self) -> MutexGuard<'_, HashMap<String, Arc<LocalFile>>> {
        self.local_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn links(&self) -> MutexGuard<'_, HashMap<String, Weak<LinkState>>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn local_file(&self, path: &str) -> Option<Arc<LocalFile>> {
        self.local_files().get(path).cloned()
    }

    /// Drops the local entry for `path` if it is still `local`.
    pub(crate) fn forget_local(&self, path: &str, local: &Arc<LocalFile>) {
        let mut files = self.local_files();
        if files.get(path).is_some_and(|f| Arc::ptr_eq(f, local)) {
            files.remove(path);
        }
    }

    /// Names of local files directly under `prefix`.
    fn local_names_in(&self, prefix: &str) -> Vec<String> {
        self.local_files()
            .keys()
            .filter_map(|path| path.strip_prefix(prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }

    fn has_local_under(&self, prefix: &str) -> bool {
        self.local_files().keys().any(|p| p.starts_with(prefix))
    }

    fn link_for(&self, path: &str) -> Arc<LinkState> {
        let mut links = self.links();
        if let Some(link) = links.get(path).and_then(Weak::upgrade) {
            return link;
        }
        let link = Arc::new(LinkState::default());
        links.insert(path.to_string(), Arc::downgrade(&link));
        links.retain(|_, l| l.strong_count() > 0);
        link
    }

    /// Detaches every open handle from `path`.
    fn mark_unlinked(&self, path: &str) {
        if let Some(link) = self.links().remove(path).and_then(|l| l.upgrade()) {
            link.mark_unlinked();
        }
    }

    pub(crate) fn note_type(&self, path: &str, kind: EntryType) {
        let (parent, name) = split_dir_file(path);
        self.types
            .insert(&dir_prefix(parent), self.clock.now(), name, kind);
    }

    pub(crate) fn forget_type(&self, path: &str) {
        let (parent, name) = split_dir_file(path);
        self.types.erase(&dir_prefix(parent), name);
    }

    async fn stat_cached(
        &self,
        ctx: &OpContext,
        name: &str,
    ) -> Result<Option<ObjectRecord>, FsError> {
        match self.bucket.stat_object(ctx, name).await {
            Ok(record) => Ok(Some(record)),
            Err(BucketError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct FsBuilder {
    bucket: Arc<dyn Bucket>,
    config: MountConfig,
    clock: Option<Arc<dyn Clock>>,
    stat_cache: Option<Arc<SharedStatCache>>,
    content_cache: Option<Arc<dyn ContentCache>>,
}

impl FsBuilder {
    pub fn config(mut self, config: MountConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Shares a stat cache with other mounted buckets. Entries stay keyed by
    /// bucket name.
    pub fn stat_cache(mut self, cache: Arc<SharedStatCache>) -> Self {
        self.stat_cache = Some(cache);
        self
    }

    pub fn content_cache(mut self, cache: Arc<dyn ContentCache>) -> Self {
        self.content_cache = Some(cache);
        self
    }

    pub fn build(self) -> Fs {
        let config = self.config;
        let meta = &config.metadata_cache;
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let stat_cache = self
            .stat_cache
            .unwrap_or_else(|| SharedStatCache::new(meta.stat_cache_max_entries));
        let content_cache: Option<Arc<dyn ContentCache>> = match self.content_cache {
            Some(cache) => Some(cache),
            None if config.file_cache.enabled => Some(Arc::new(MemoryContentCache::new(
                config.file_cache.max_size_mb * MIB,
            ))),
            None => None,
        };

        let uncached = self.bucket;
        let native_rename =
            config.enable_hns && uncached.bucket_type() == BucketType::Hierarchical;
        let bucket = Arc::new(FastStatBucket::new(
            meta.stat_cache_ttl(),
            stat_cache.view(uncached.name()),
            clock.clone(),
            uncached.clone(),
        ));
        info!(
            bucket = uncached.name(),
            native_rename,
            stat_ttl = ?meta.stat_cache_ttl(),
            type_ttl = ?meta.type_cache_ttl(),
            file_cache = content_cache.is_some(),
            "bucket mounted"
        );

        Fs {
            inner: Arc::new(FsInner {
                bucket,
                content_cache,
                reader_options: ReaderOptions::from_config(&config),
                max_file_size: config.write.max_file_size(),
                detector: StaleHandleDetector::new(uncached),
                types: TypeCacheRegistry::new(
                    meta.type_cache_max_dirs,
                    meta.type_cache_max_entries_per_dir,
                    meta.type_cache_ttl(),
                ),
                clock,
                native_rename,
                local_files: Mutex::new(HashMap::new()),
                links: Mutex::new(HashMap::new()),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Fs {
    inner: Arc<FsInner>,
}

impl Fs {
    pub fn builder(bucket: Arc<dyn Bucket>) -> FsBuilder {
        FsBuilder {
            bucket,
            config: MountConfig::default(),
            clock: None,
            stat_cache: None,
            content_cache: None,
        }
    }

    /// The caching bucket all path operations go through.
    pub fn bucket(&self) -> &Arc<FastStatBucket> {
        &self.inner.bucket
    }

    pub fn bucket_name(&self) -> &str {
        self.inner.bucket.name()
    }

    async fn resolve(&self, ctx: &OpContext, path: &str) -> Result<Option<Resolved>, FsError> {
        if path.is_empty() {
            return Ok(Some(Resolved::Root));
        }
        let (parent, name) = split_dir_file(path);
        self.lookup_child(ctx, parent, name).await
    }

    /// Resolves `name` inside directory `parent`.
    ///
    /// A cached type decides which record is fetched. Without one both the
    /// file and the directory record are fetched and the directory wins.
    async fn lookup_child(
        &self,
        ctx: &OpContext,
        parent: &str,
        name: &str,
    ) -> Result<Option<Resolved>, FsError> {
        let inner = &self.inner;
        let prefix = dir_prefix(parent);

        if let Some(base) = name.strip_suffix(CONFLICT_SUFFIX) {
            let file = format!("{prefix}{base}");
            let dir = format!("{file}/");
            let found = futures::try_join!(inner.stat_cached(ctx, &file), inner.stat_cached(ctx, &dir))?;
            return match found {
                (Some(file), Some(_)) => Ok(Some(Resolved::Object(file))),
                _ => Ok(None),
            };
        }

        let path = format!("{prefix}{name}");
        if let Some(local) = inner.local_file(&path) {
            return Ok(Some(Resolved::Local(local)));
        }

        let now = inner.clock.now();
        let record = match inner.types.get(&prefix, now, name) {
            Some(EntryType::Directory) => inner.stat_cached(ctx, &format!("{path}/")).await?,
            Some(EntryType::File | EntryType::Symlink) => inner.stat_cached(ctx, &path).await?,
            None => {
                let dir = format!("{path}/");
                let (file, dir) =
                    futures::try_join!(inner.stat_cached(ctx, &path), inner.stat_cached(ctx, &dir))?;
                dir.or(file)
            }
        };
        Ok(record.map(|record| {
            inner.types.insert(&prefix, now, name, entry_type(&record));
            Resolved::Object(record)
        }))
    }

    async fn ensure_dir(&self, ctx: &OpContext, path: &str) -> Result<(), FsError> {
        match self.resolve(ctx, path).await? {
            Some(entry) if entry.kind() == EntryType::Directory => Ok(()),
            Some(_) => Err(FsError::NotADirectory(path.to_string())),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    async fn dir_is_empty(&self, ctx: &OpContext, path: &str) -> Result<bool, FsError> {
        let prefix = dir_prefix(path);
        if self.inner.has_local_under(&prefix) {
            return Ok(false);
        }
        let listing = self
            .inner
            .bucket
            .list_objects(
                ctx,
                ListRequest {
                    prefix: prefix.clone(),
                    delimiter: Some('/'),
                },
            )
            .await?;
        Ok(listing.prefixes.is_empty() && listing.objects.iter().all(|o| o.name == prefix))
    }

    pub async fn stat(&self, ctx: &OpContext, path: &str) -> Result<FileAttr, FsError> {
        let path = norm_path(path);
        match self.resolve(ctx, &path).await? {
            Some(entry) => Ok(entry.into_attr(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    pub async fn exists(&self, ctx: &OpContext, path: &str) -> Result<bool, FsError> {
        Ok(self.resolve(ctx, &norm_path(path)).await?.is_some())
    }

    /// Lists the children of a directory, sorted by name.
    pub async fn readdir(&self, ctx: &OpContext, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let path = norm_path(path);
        self.ensure_dir(ctx, &path).await?;
        let inner = &self.inner;
        let prefix = dir_prefix(&path);
        let listing = inner
            .bucket
            .list_objects(
                ctx,
                ListRequest {
                    prefix: prefix.clone(),
                    delimiter: Some('/'),
                },
            )
            .await?;

        let dirs: BTreeSet<String> = listing
            .prefixes
            .iter()
            .filter_map(|p| p.strip_prefix(&prefix)?.strip_suffix('/'))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        let mut files: BTreeMap<String, EntryType> = listing
            .objects
            .iter()
            .filter(|o| o.name != prefix)
            .filter_map(|o| {
                let name = o.name.strip_prefix(&prefix)?;
                Some((name.to_string(), entry_type(o)))
            })
            .collect();
        for name in inner.local_names_in(&prefix) {
            files.entry(name).or_insert(EntryType::File);
        }

        let now = inner.clock.now();
        let mut entries = Vec::with_capacity(dirs.len() + files.len());
        for name in &dirs {
            inner.types.insert(&prefix, now, name, EntryType::Directory);
            entries.push(DirEntry {
                name: name.clone(),
                kind: EntryType::Directory,
            });
        }
        for (name, kind) in files {
            if dirs.contains(&name) {
                entries.push(DirEntry {
                    name: format!("{name}{CONFLICT_SUFFIX}"),
                    kind,
                });
            } else {
                inner.types.insert(&prefix, now, &name, kind);
                entries.push(DirEntry { name, kind });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(dir = %path, entries = entries.len(), "listed directory");
        Ok(entries)
    }

    pub async fn mkdir(&self, ctx: &OpContext, path: &str) -> Result<FileAttr, FsError> {
        let path = norm_path(path);
        if path.is_empty() {
            return Err(FsError::AlreadyExists("/".to_string()));
        }
        let (parent, name) = split_dir_file(&path);
        self.ensure_dir(ctx, parent).await?;
        if self.lookup_child(ctx, parent, name).await?.is_some() {
            return Err(FsError::AlreadyExists(path));
        }
        let created = self
            .inner
            .bucket
            .create_object(
                ctx,
                CreateRequest {
                    name: dir_prefix(&path),
                    contents: Bytes::new(),
                    if_generation_match: Some(Generation::ABSENT),
                    symlink_target: None,
                },
            )
            .await;
        let record = match created {
            Ok(record) => record,
            Err(BucketError::PreconditionFailed(_)) => return Err(FsError::AlreadyExists(path)),
            Err(e) => return Err(e.into()),
        };
        self.inner.note_type(&path, EntryType::Directory);
        info!(dir = %path, "created directory");
        Ok(Resolved::Object(record).into_attr(path))
    }

    /// Creates a new empty file. It is visible at once but only uploaded when
    /// the returned handle is synced or closed.
    pub async fn create(&self, ctx: &OpContext, path: &str) -> Result<FileHandle, FsError> {
        let path = norm_path(path);
        let (parent, name) = split_dir_file(&path);
        if name.is_empty() {
            return Err(FsError::IsADirectory("/".to_string()));
        }
        self.ensure_dir(ctx, parent).await?;
        if self.lookup_child(ctx, parent, name).await?.is_some() {
            return Err(FsError::AlreadyExists(path));
        }
        let local = Arc::new(LocalFile::new());
        {
            let mut files = self.inner.local_files();
            if files.contains_key(&path) {
                return Err(FsError::AlreadyExists(path));
            }
            files.insert(path.clone(), local.clone());
        }
        self.inner.note_type(&path, EntryType::File);
        debug!(file = %path, "created local file");
        let link = self.inner.link_for(&path);
        Ok(FileHandle::new_local(path, self.inner.clone(), link, local))
    }

    pub async fn open(&self, ctx: &OpContext, path: &str) -> Result<FileHandle, FsError> {
        let path = norm_path(path);
        match self.resolve(ctx, &path).await? {
            None => Err(FsError::NotFound(path)),
            Some(Resolved::Root) => Err(FsError::IsADirectory(path)),
            Some(Resolved::Local(_)) => Err(FsError::Unsupported(format!(
                "{path} is still being written by another handle"
            ))),
            Some(Resolved::Object(record)) if record.is_dir() => Err(FsError::IsADirectory(path)),
            Some(Resolved::Object(record)) => {
                let link = self.inner.link_for(&record.name);
                Ok(FileHandle::open_object(self.inner.clone(), link, record))
            }
        }
    }

    /// Replaces the contents of `path`, creating it if needed.
    pub async fn write_file(
        &self,
        ctx: &OpContext,
        path: &str,
        data: &[u8],
    ) -> Result<FileAttr, FsError> {
        let handle = match self.create(ctx, path).await {
            Ok(handle) => handle,
            Err(FsError::AlreadyExists(_)) => {
                let handle = self.open(ctx, path).await?;
                handle.truncate(ctx, 0).await?;
                handle
            }
            Err(e) => return Err(e),
        };
        let written = handle.write_at(ctx, 0, data).await;
        let closed = handle.close(ctx).await;
        written?;
        closed?;
        self.stat(ctx, path).await
    }

    pub async fn read_file(&self, ctx: &OpContext, path: &str) -> Result<Vec<u8>, FsError> {
        let handle = self.open(ctx, path).await?;
        let mut contents = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        let res = loop {
            match handle.read_at(ctx, &mut chunk, contents.len() as u64).await {
                Ok(data) if data.eof || data.size == 0 => break Ok(()),
                Ok(data) => contents.extend_from_slice(&chunk[..data.size]),
                Err(e) => break Err(e),
            }
        };
        handle.close(ctx).await?;
        res.map(|()| contents)
    }

    /// Removes a file or symlink. Open handles on it keep their content but
    /// never upload it.
    pub async fn unlink(&self, ctx: &OpContext, path: &str) -> Result<(), FsError> {
        let path = norm_path(path);
        let name = match self.resolve(ctx, &path).await? {
            None => return Err(FsError::NotFound(path)),
            Some(Resolved::Root) => return Err(FsError::IsADirectory(path)),
            Some(Resolved::Object(record)) if record.is_dir() => {
                return Err(FsError::IsADirectory(path));
            }
            Some(Resolved::Local(local)) => {
                self.inner.forget_local(&path, &local);
                path
            }
            Some(Resolved::Object(record)) => {
                let deleted = self
                    .inner
                    .bucket
                    .delete_object(
                        ctx,
                        DeleteRequest {
                            name: record.name.clone(),
                            if_generation_match: None,
                        },
                    )
                    .await;
                match deleted {
                    Ok(()) | Err(BucketError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                record.name
            }
        };
        self.inner.forget_type(&name);
        self.inner.mark_unlinked(&name);
        info!(file = %name, "unlinked");
        Ok(())
    }

    pub async fn rmdir(&self, ctx: &OpContext, path: &str) -> Result<(), FsError> {
        let path = norm_path(path);
        let record = match self.resolve(ctx, &path).await? {
            None => return Err(FsError::NotFound(path)),
            Some(Resolved::Root) => {
                return Err(FsError::Unsupported("cannot remove the root directory".into()));
            }
            Some(Resolved::Object(record)) if record.is_dir() => record,
            Some(_) => return Err(FsError::NotADirectory(path)),
        };
        if !self.dir_is_empty(ctx, &path).await? {
            return Err(FsError::DirectoryNotEmpty(path));
        }
        let deleted = self
            .inner
            .bucket
            .delete_object(
                ctx,
                DeleteRequest {
                    name: record.name.clone(),
                    if_generation_match: None,
                },
            )
            .await;
        match deleted {
            Ok(()) | Err(BucketError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.inner.forget_type(&path);
        self.inner.types.erase_dirs_under(&record.name);
        info!(dir = %path, "removed directory");
        Ok(())
    }

    pub async fn symlink(
        &self,
        ctx: &OpContext,
        path: &str,
        target: &str,
    ) -> Result<FileAttr, FsError> {
        let path = norm_path(path);
        let (parent, name) = split_dir_file(&path);
        self.ensure_dir(ctx, parent).await?;
        if self.lookup_child(ctx, parent, name).await?.is_some() {
            return Err(FsError::AlreadyExists(path));
        }
        let created = self
            .inner
            .bucket
            .create_object(
                ctx,
                CreateRequest {
                    name: path.clone(),
                    contents: Bytes::new(),
                    if_generation_match: Some(Generation::ABSENT),
                    symlink_target: Some(target.to_string()),
                },
            )
            .await;
        let record = match created {
            Ok(record) => record,
            Err(BucketError::PreconditionFailed(_)) => return Err(FsError::AlreadyExists(path)),
            Err(e) => return Err(e.into()),
        };
        self.inner.note_type(&path, EntryType::Symlink);
        Ok(Resolved::Object(record).into_attr(path))
    }

    /// Renames a file or directory.
    ///
    /// Checked in order: the source exists; the destination is absent or an
    /// empty directory; source and destination differ; a directory is not
    /// moved inside itself. The first failing check is reported.
    pub async fn rename(&self, ctx: &OpContext, src: &str, dst: &str) -> Result<(), FsError> {
        let src = norm_path(src);
        let dst = norm_path(dst);
        let source = match self.resolve(ctx, &src).await? {
            None => return Err(FsError::NotFound(src)),
            Some(Resolved::Root) => {
                return Err(FsError::Unsupported("cannot rename the root directory".into()));
            }
            Some(entry) => entry,
        };
        if dst.is_empty() {
            return Err(FsError::Unsupported("cannot replace the root directory".into()));
        }
        let target = self.resolve(ctx, &dst).await?;
        if let Some(existing) = &target {
            if existing.kind() == EntryType::Directory && !self.dir_is_empty(ctx, &dst).await? {
                return Err(FsError::PreconditionFailed {
                    name: dst,
                    reason: Precondition::DestinationNotEmpty,
                });
            }
        }
        if src == dst {
            return Err(FsError::PreconditionFailed {
                name: dst,
                reason: Precondition::SamePath,
            });
        }
        let src_is_dir = source.kind() == EntryType::Directory;
        if src_is_dir && dst.starts_with(&dir_prefix(&src)) {
            return Err(FsError::PreconditionFailed {
                name: dst,
                reason: Precondition::DestinationInsideSource,
            });
        }
        if let Some(existing) = &target {
            let dst_is_dir = existing.kind() == EntryType::Directory;
            if src_is_dir && !dst_is_dir {
                return Err(FsError::NotADirectory(dst));
            }
            if !src_is_dir && dst_is_dir {
                return Err(FsError::IsADirectory(dst));
            }
        }
        let (dst_parent, _) = split_dir_file(&dst);
        self.ensure_dir(ctx, dst_parent).await?;

        match source {
            Resolved::Root => Err(FsError::Unsupported("cannot rename the root directory".into())),
            Resolved::Local(_) => Err(FsError::Unsupported(format!(
                "{src} has not been uploaded yet"
            ))),
            Resolved::Object(record) if record.is_dir() => {
                self.rename_dir(ctx, &src, &dst, target.is_some()).await
            }
            Resolved::Object(record) => {
                let replaced = match target {
                    Some(Resolved::Object(existing)) => existing.generation,
                    _ => Generation::ABSENT,
                };
                self.rename_file(ctx, record, &dst, replaced).await
            }
        }
    }

    /// Continues a folder rename that failed with `FsError::PartialFailure`.
    pub async fn resume_rename(
        &self,
        ctx: &OpContext,
        progress: RenameProgress,
    ) -> Result<(), FsError> {
        info!(
            src = %progress.source_prefix,
            dst = %progress.destination_prefix,
            pending = progress.pending.len(),
            "resuming folder rename"
        );
        self.ensure_no_local_under(&progress.source_prefix)?;
        self.drive_flat_rename(ctx, progress).await
    }

    /// Files created under `prefix` but not uploaded yet would be left behind
    /// by a folder rename, so their presence blocks it.
    fn ensure_no_local_under(&self, prefix: &str) -> Result<(), FsError> {
        if self.inner.has_local_under(prefix) {
            return Err(FsError::Unsupported(format!(
                "{prefix} holds files that have not been uploaded yet"
            )));
        }
        Ok(())
    }

    async fn rename_file(
        &self,
        ctx: &OpContext,
        record: ObjectRecord,
        dst: &str,
        replaced: Generation,
    ) -> Result<(), FsError> {
        let bucket = &self.inner.bucket;
        let copied = bucket
            .copy_object(
                ctx,
                CopyRequest {
                    src: record.name.clone(),
                    src_generation: Some(record.generation),
                    dst: dst.to_string(),
                    if_generation_match: Some(replaced),
                },
            )
            .await;
        let copied = match copied {
            Ok(copied) => copied,
            Err(BucketError::PreconditionFailed(_)) => {
                return Err(FsError::PreconditionFailed {
                    name: dst.to_string(),
                    reason: Precondition::GenerationMismatch,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let deleted = bucket
            .delete_object(
                ctx,
                DeleteRequest {
                    name: record.name.clone(),
                    if_generation_match: Some(record.generation),
                },
            )
            .await;
        match deleted {
            Ok(()) | Err(BucketError::NotFound(_)) => {}
            Err(e) => {
                warn!(src = %record.name, %dst, error = %e, "source kept after copy");
                return Err(e.into());
            }
        }
        self.inner.forget_type(&record.name);
        self.inner.note_type(dst, entry_type(&copied));
        self.inner.mark_unlinked(&record.name);
        info!(src = %record.name, %dst, "renamed file");
        Ok(())
    }

    async fn rename_dir(
        &self,
        ctx: &OpContext,
        src: &str,
        dst: &str,
        replace_existing: bool,
    ) -> Result<(), FsError> {
        let src_prefix = dir_prefix(src);
        let dst_prefix = dir_prefix(dst);
        self.ensure_no_local_under(&src_prefix)?;
        if !self.inner.native_rename {
            let progress = plan_flat_rename(ctx, &self.inner.bucket, &src_prefix, &dst_prefix).await?;
            return self.drive_flat_rename(ctx, progress).await;
        }

        if replace_existing {
            // Only an empty destination gets here; drop its placeholder so
            // the native rename can take the name.
            let deleted = self
                .inner
                .bucket
                .delete_object(
                    ctx,
                    DeleteRequest {
                        name: dst_prefix.clone(),
                        if_generation_match: None,
                    },
                )
                .await;
            match deleted {
                Ok(()) | Err(BucketError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        rename_folder_hierarchical(ctx, &self.inner.bucket, &src_prefix, &dst_prefix).await?;
        self.finish_dir_rename(&src_prefix, &dst_prefix);
        info!(%src, %dst, "renamed directory");
        Ok(())
    }

    async fn drive_flat_rename(
        &self,
        ctx: &OpContext,
        mut progress: RenameProgress,
    ) -> Result<(), FsError> {
        match run_flat_rename(ctx, &self.inner.bucket, &mut progress).await {
            Ok(()) => {
                self.finish_dir_rename(&progress.source_prefix, &progress.destination_prefix);
                Ok(())
            }
            Err(cause) if progress.has_started() => {
                // Both names may now resolve to partial trees.
                self.inner
                    .forget_type(progress.source_prefix.trim_end_matches('/'));
                self.inner
                    .forget_type(progress.destination_prefix.trim_end_matches('/'));
                warn!(
                    src = %progress.source_prefix,
                    dst = %progress.destination_prefix,
                    pending = progress.pending.len(),
                    copied = progress.copied.len(),
                    error = %cause,
                    "folder rename stopped partway"
                );
                Err(FsError::PartialFailure {
                    progress: Box::new(progress),
                    cause: Box::new(cause),
                })
            }
            Err(cause) => Err(cause),
        }
    }

    fn finish_dir_rename(&self, src_prefix: &str, dst_prefix: &str) {
        let inner = &self.inner;
        inner.forget_type(src_prefix.trim_end_matches('/'));
        inner.note_type(dst_prefix.trim_end_matches('/'), EntryType::Directory);
        inner.types.erase_dirs_under(src_prefix);
        inner.types.erase_dirs_under(dst_prefix);
    }
}
