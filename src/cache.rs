use std::{
    collections::HashMap,
    io,
    path::PathBuf,
};

use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncRead,
    sync::Mutex,
    task::spawn_blocking,
};
use walkdir::WalkDir;

use crate::apt::{self, copy_with_file_info, FileInfo};

pub const FILE_SUFFIX: &str = ".cache";

#[derive(Debug, Error)]
pub enum Error {
    /// No cached item matches, or the cached bytes disagree with the
    /// requested FileInfo.
    #[error("not found")]
    NotFound,

    /// The path is absolute, unclean, empty or `.`.
    #[error("bad path")]
    BadPath,

    /// The streamed bytes disagree with the supplied FileInfo.
    #[error("can not insert invalid data")]
    InvalidData,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

struct Entry {
    fi: FileInfo,
    atime: u64,
}

/// In-memory bookkeeping: `cache` maps a path to its current slot in
/// `lru`, a binary min-heap ordered on `atime`. Every heap swap
/// updates the map, so the map always doubles as the heap index.
#[derive(Default)]
struct Inner {
    used: u64,
    lclock: u64,
    cache: HashMap<String, usize>,
    lru: Vec<Entry>,
}

impl Inner {
    fn swap(&mut self, i: usize, j: usize) {
        self.lru.swap(i, j);
        self.cache.insert(self.lru[i].fi.path().to_string(), i);
        self.cache.insert(self.lru[j].fi.path().to_string(), j);
    }

    fn sift_up(&mut self, mut i: usize) -> usize {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.lru[parent].atime <= self.lru[i].atime {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
        i
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let mut smallest = i;
            for child in [2 * i + 1, 2 * i + 2] {
                if child < self.lru.len() && self.lru[child].atime < self.lru[smallest].atime {
                    smallest = child;
                }
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }

    fn heap_init(&mut self) {
        for i in (0..self.lru.len() / 2).rev() {
            self.sift_down(i);
        }
    }

    fn push(&mut self, e: Entry) {
        let path = e.fi.path().to_string();
        self.lru.push(e);
        let i = self.lru.len() - 1;
        self.cache.insert(path, i);
        self.sift_up(i);
    }

    fn pop_min(&mut self) -> Option<Entry> {
        if self.lru.is_empty() {
            return None;
        }
        self.swap(0, self.lru.len() - 1);
        let e = self.lru.pop()?;
        self.cache.remove(e.fi.path());
        self.sift_down(0);
        Some(e)
    }

    fn remove(&mut self, i: usize) -> Entry {
        let last = self.lru.len() - 1;
        self.swap(i, last);
        let e = match self.lru.pop() {
            Some(e) => e,
            None => unreachable!("remove on an empty heap"),
        };
        self.cache.remove(e.fi.path());
        if i < self.lru.len() {
            self.fix(i);
        }
        e
    }

    fn fix(&mut self, i: usize) {
        let i = self.sift_up(i);
        self.sift_down(i);
    }

    fn touch(&mut self, i: usize) {
        self.lru[i].atime = self.lclock;
        self.lclock += 1;
        self.fix(i);
    }
}

/// Stores cache items in the local file system, at
/// `<dir>/<path>.cache`. Items are removed in LRU fashion once the
/// total size exceeds the capacity; a zero capacity disables eviction.
pub struct Storage {
    dir: PathBuf,
    capacity: u64,
    inner: Mutex<Inner>,
}

impl Storage {
    /// `dir` must be an absolute path; anything else is a programmer
    /// error.
    pub fn new(dir: impl Into<PathBuf>, capacity: u64) -> Self {
        let dir = dir.into();
        assert!(dir.is_absolute(), "cache dir must be an absolute path");
        Self {
            dir,
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn cache_file_path(&self, p: &str) -> PathBuf {
        self.dir.join(format!("{p}{FILE_SUFFIX}"))
    }

    /// Enrolls the `*.cache` files already present under the cache
    /// directory. Checksums are calculated lazily on first lookup to
    /// keep startup cost independent of the cache size.
    pub async fn load(&self) -> Result<()> {
        let dir = self.dir.clone();
        let found = spawn_blocking(move || -> io::Result<Vec<(String, u64)>> {
            let mut out = Vec::new();
            for entry in WalkDir::new(&dir) {
                let entry = entry.map_err(walk_error)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(rel) = entry
                    .path()
                    .strip_prefix(&dir)
                    .ok()
                    .and_then(|p| p.to_str())
                else {
                    continue;
                };
                let Some(subpath) = rel.strip_suffix(FILE_SUFFIX) else {
                    continue;
                };
                if subpath.is_empty() {
                    continue;
                }
                out.push((subpath.to_string(), entry.metadata().map_err(walk_error)?.len()));
            }
            Ok(out)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        let mut inner = self.inner.lock().await;
        for (subpath, size) in found {
            if inner.cache.contains_key(&subpath) {
                continue;
            }
            let atime = inner.lclock;
            inner.lclock += 1;
            inner.used += size;
            inner.lru.push(Entry {
                fi: FileInfo::no_checksum(subpath.clone(), size),
                atime,
            });
            let i = inner.lru.len() - 1;
            inner.cache.insert(subpath, i);
        }
        inner.heap_init();

        self.maint(&mut inner).await;
        Ok(())
    }

    /// Inserts or replaces a cache item. When `fi` carries checksums,
    /// the streamed bytes are verified against it.
    pub async fn insert<R>(&self, r: R, p: &str, fi: Option<&FileInfo>) -> Result<FileInfo>
    where
        R: AsyncRead + Unpin,
    {
        if !apt::is_clean_path(p) {
            return Err(Error::BadPath);
        }

        let dir = self.dir.clone();
        let temp = spawn_blocking(move || tempfile::Builder::new().prefix("_tmp").tempfile_in(dir))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        let mut f = File::from_std(temp.as_file().try_clone()?);
        let fi2 = copy_with_file_info(r, &mut f, p).await?;
        f.sync_all().await?;

        if let Some(fi) = fi {
            if fi.has_checksum() && !fi.same(&fi2) {
                return Err(Error::InvalidData);
            }
        }

        let dest = self.cache_file_path(p);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut inner = self.inner.lock().await;

        if let Some(&i) = inner.cache.get(p) {
            match fs::remove_file(&dest).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("cache file was removed already: {p}");
                }
                Err(e) => return Err(e.into()),
            }
            let old = inner.remove(i);
            inner.used -= old.fi.size();
            debug!("deleted existing cache entry: {p}");
        }

        temp.into_temp_path().persist(&dest).map_err(|e| e.error)?;

        let atime = inner.lclock;
        inner.lclock += 1;
        inner.used += fi2.size();
        inner.push(Entry {
            fi: fi2.clone(),
            atime,
        });

        self.maint(&mut inner).await;
        Ok(fi2)
    }

    /// Looks up an item. Returns [`Error::NotFound`] on a miss or when
    /// the cached bytes do not match `fi`.
    pub async fn lookup(&self, fi: &FileInfo) -> Result<File> {
        let mut inner = self.inner.lock().await;

        let Some(&i) = inner.cache.get(fi.path()) else {
            return Err(Error::NotFound);
        };

        // delayed checksum calculation
        if !inner.lru[i].fi.has_checksum() {
            let data = fs::read(self.cache_file_path(fi.path())).await?;
            inner.lru[i].fi.calc_checksums(&data);
        }

        if !fi.same(&inner.lru[i].fi) {
            return Err(Error::NotFound);
        }

        inner.touch(i);
        Ok(File::open(self.cache_file_path(fi.path())).await?)
    }

    /// Removes an item. Missing items and already-removed files are
    /// not errors.
    pub async fn delete(&self, p: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let Some(&i) = inner.cache.get(p) else {
            return Ok(());
        };

        match fs::remove_file(self.cache_file_path(p)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("cached file was already removed: {p}");
            }
            Err(e) => return Err(e.into()),
        }

        let e = inner.remove(i);
        inner.used -= e.fi.size();
        info!("deleted cache entry: {p}");
        Ok(())
    }

    pub async fn list_all(&self) -> Vec<FileInfo> {
        let inner = self.inner.lock().await;
        inner.lru.iter().map(|e| e.fi.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.lru.len()
    }

    /// Evicts least-recently-used items until `used` fits the
    /// capacity. Failure to unlink an evicted file is logged; the
    /// in-memory accounting stays authoritative.
    async fn maint(&self, inner: &mut Inner) {
        while self.capacity > 0 && inner.used > self.capacity {
            let Some(e) = inner.pop_min() else {
                break;
            };
            inner.used -= e.fi.size();
            let path = self.cache_file_path(e.fi.path());
            if let Err(err) = fs::remove_file(&path).await {
                warn!("failed to remove {}: {err}", path.display());
            }
            info!("evicted cache entry: {}", e.fi.path());
        }
    }
}

fn walk_error(e: walkdir::Error) -> io::Error {
    e.into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk failed"))
}

#[cfg(test)]
mod tests {
    use color_eyre::Result as EyreResult;
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    async fn make_file_info(path: &str, data: &[u8]) -> EyreResult<FileInfo> {
        Ok(copy_with_file_info(data, tokio::io::sink(), path).await?)
    }

    async fn insert_bytes(cm: &Storage, data: &[u8], path: &str) -> Result<FileInfo> {
        let fi = copy_with_file_info(data, tokio::io::sink(), path).await?;
        cm.insert(data, path, Some(&fi)).await
    }

    #[tokio::test]
    async fn insert_then_lookup() -> EyreResult<()> {
        let dir = TempDir::new()?;
        let cm = Storage::new(dir.path(), 0);

        let fi = insert_bytes(&cm, b"a", "path/to/a").await?;
        assert_eq!(cm.len().await, 1);

        cm.lookup(&fi).await?;
        Ok(())
    }

    #[tokio::test]
    async fn insert_overwrites_existing_entry() -> EyreResult<()> {
        let dir = TempDir::new()?;
        let cm = Storage::new(dir.path(), 0);

        insert_bytes(&cm, b"a", "path/to/a").await?;
        let fi = insert_bytes(&cm, b"a", "path/to/a").await?;

        assert_eq!(cm.len().await, 1);
        assert_eq!(cm.inner.lock().await.used, 1);
        cm.lookup(&fi).await?;
        Ok(())
    }

    #[rstest]
    #[case("/absolute/path")]
    #[case("./unclean/path")]
    #[case("")]
    #[case(".")]
    #[tokio::test]
    async fn bad_paths_are_rejected(#[case] path: &str) -> EyreResult<()> {
        let dir = TempDir::new()?;
        let cm = Storage::new(dir.path(), 0);

        let err = insert_bytes(&cm, b"a", path).await.unwrap_err();
        assert!(matches!(err, Error::BadPath));
        Ok(())
    }

    #[tokio::test]
    async fn eviction_removes_least_recently_used_first() -> EyreResult<()> {
        let dir = TempDir::new()?;
        let cm = Storage::new(dir.path(), 3);

        let fi_a = insert_bytes(&cm, b"a", "path/to/a").await?;
        let fi_bc = insert_bytes(&cm, b"bc", "path/to/bc").await?;
        assert_eq!(cm.inner.lock().await.used, 3);

        // a and bc are both evicted to make room
        let fi_de = insert_bytes(&cm, b"de", "path/to/de").await?;
        assert_eq!(cm.len().await, 1);
        assert_eq!(cm.inner.lock().await.used, 2);
        assert!(matches!(cm.lookup(&fi_a).await, Err(Error::NotFound)));
        assert!(matches!(cm.lookup(&fi_bc).await, Err(Error::NotFound)));

        let fi_a = insert_bytes(&cm, b"a", "path/to/a").await?;
        assert_eq!(cm.len().await, 2);
        assert_eq!(cm.inner.lock().await.used, 3);

        // touch de so that a becomes the eviction candidate
        cm.lookup(&fi_de).await?;

        let fi_f = insert_bytes(&cm, b"f", "path/to/f").await?;
        assert!(matches!(cm.lookup(&fi_a).await, Err(Error::NotFound)));
        cm.lookup(&fi_de).await?;
        cm.lookup(&fi_f).await?;
        Ok(())
    }

    #[tokio::test]
    async fn zero_capacity_never_evicts() -> EyreResult<()> {
        let dir = TempDir::new()?;
        let cm = Storage::new(dir.path(), 0);

        for (i, data) in [&b"aaaa"[..], b"bbbb", b"cccc", b"dddd"].into_iter().enumerate() {
            insert_bytes(&cm, data, &format!("f{i}")).await?;
        }
        assert_eq!(cm.len().await, 4);
        assert_eq!(cm.inner.lock().await.used, 16);
        Ok(())
    }

    #[tokio::test]
    async fn lookup_rejects_checksum_mismatch() -> EyreResult<()> {
        let dir = TempDir::new()?;
        let cm = Storage::new(dir.path(), 0);

        insert_bytes(&cm, b"data", "data").await?;

        let wrong = make_file_info("data", b"dat.").await?;
        assert!(matches!(cm.lookup(&wrong).await, Err(Error::NotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn lookup_makes_the_entry_most_recently_used() -> EyreResult<()> {
        let dir = TempDir::new()?;
        let cm = Storage::new(dir.path(), 0);

        let fi_a = insert_bytes(&cm, b"a", "a").await?;
        insert_bytes(&cm, b"b", "b").await?;
        insert_bytes(&cm, b"c", "c").await?;

        cm.lookup(&fi_a).await?;

        let inner = cm.inner.lock().await;
        let &i = inner.cache.get("a").unwrap();
        let atime = inner.lru[i].atime;
        assert!(inner
            .lru
            .iter()
            .all(|e| e.fi.path() == "a" || e.atime < atime));
        Ok(())
    }

    #[tokio::test]
    async fn load_enrolls_only_suffixed_files() -> EyreResult<()> {
        let files: &[(&str, &[u8])] = &[
            ("a", b"a"),
            ("bc", b"bc"),
            ("def", b"def"),
            ("ghij", b"ghij"),
        ];

        let dir = TempDir::new()?;
        for (name, data) in files {
            fs::write(dir.path().join(format!("{name}{FILE_SUFFIX}")), data).await?;
        }
        // no proper suffix, must be ignored
        fs::write(dir.path().join("dummy"), b"d").await?;

        let cm = Storage::new(dir.path(), 0);
        cm.load().await?;

        assert_eq!(cm.list_all().await.len(), files.len());

        for (name, data) in files {
            let fi = make_file_info(name, data).await?;
            cm.lookup(&fi).await?;
        }

        let fi = make_file_info("ghij", b"ghij").await?;
        let mut f = cm.lookup(&fi).await?;
        let mut data = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut f, &mut data).await?;
        assert_eq!(data, b"ghij");
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> EyreResult<()> {
        let dir = TempDir::new()?;
        let cm = Storage::new(dir.path(), 0);

        let fi = insert_bytes(&cm, b"a", "a").await?;
        cm.delete("a").await?;
        assert!(matches!(cm.lookup(&fi).await, Err(Error::NotFound)));
        cm.delete("a").await?;
        assert_eq!(cm.len().await, 0);
        Ok(())
    }
}
