use std::{
    collections::{HashMap, HashSet},
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
    sync::Mutex,
    task::spawn_blocking,
};

use crate::apt::{self, copy_with_file_info, FileInfo};

const INFO_FILE: &str = "info.json";

#[derive(Debug, Error)]
pub enum Error {
    /// The path is absolute, unclean, empty or `.`.
    #[error("bad path: {0}")]
    BadPath(String),

    /// The streamed bytes disagree with the supplied FileInfo.
    #[error("can not store invalid data")]
    InvalidData,

    /// The location is already stored, or is being stored right now.
    #[error("already stored: {0}")]
    AlreadyStored(String),

    /// A by-hash store needs a SHA256 digest.
    #[error("no SHA256 checksum for {0}")]
    MissingDigest(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Default)]
struct Inner {
    /// Storage location to the FileInfo stored there. For by-hash
    /// stores the key is the SHA256 by-hash path while the value
    /// keeps the logical path.
    info: HashMap<String, FileInfo>,

    /// Locations with a store in flight. Disjoint from `info`.
    locked: HashSet<String>,
}

/// One mirror snapshot on disk. Contents live under `<dir>/<prefix>/`,
/// the serialized info map next to them in `<dir>/info.json`.
pub struct Storage {
    dir: PathBuf,
    prefix: String,
    inner: Mutex<Inner>,
}

impl Storage {
    /// `dir` must be an existing directory.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        let meta = std::fs::metadata(&dir)?;
        if !meta.is_dir() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("not a directory: {}", dir.display()),
            )));
        }
        Ok(Self {
            dir,
            prefix: prefix.into(),
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn full_path(&self, location: &str) -> PathBuf {
        self.dir.join(&self.prefix).join(location)
    }

    /// Reads the metadata sidecar if one exists. A missing sidecar
    /// means a fresh snapshot.
    pub async fn load(&self) -> Result<()> {
        let data = match fs::read(self.dir.join(INFO_FILE)).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let info: HashMap<String, FileInfo> =
            serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.inner.lock().await.info = info;
        Ok(())
    }

    /// Persists the info map atomically: temp file, fsync, rename,
    /// directory fsync.
    pub async fn save(&self) -> Result<()> {
        let info = self.inner.lock().await.info.clone();
        let data =
            serde_json::to_vec(&info).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let temp = self.temp_file().await?;
        let mut f = File::from_std(temp.as_file().try_clone()?);
        f.write_all(&data).await?;
        f.sync_all().await?;
        temp.into_temp_path()
            .persist(self.dir.join(INFO_FILE))
            .map_err(|e| e.error)?;

        dir_sync(&self.dir).await?;
        Ok(())
    }

    /// Opens the stored file at `p`. Paths that would resolve outside
    /// the storage root are rejected.
    pub async fn open(&self, p: &str) -> Result<File> {
        if !apt::is_clean_path(p) {
            return Err(Error::BadPath(p.to_string()));
        }
        Ok(File::open(self.full_path(p)).await?)
    }

    /// Stores `r` at `p`. A checksummed `fi` is verified against the
    /// stream; `None` records the computed FileInfo (used for Release
    /// files whose checksums are not known up front).
    pub async fn store<R>(&self, p: &str, fi: Option<&FileInfo>, r: R) -> Result<FileInfo>
    where
        R: AsyncRead + Unpin,
    {
        if !apt::is_clean_path(p) {
            return Err(Error::BadPath(p.to_string()));
        }

        self.begin(p).await?;
        let result = self.write_content(&self.full_path(p), fi, r, p).await;
        self.finish(p, result).await
    }

    /// Stores `r` under the by-hash SHA256 path derived from `fi`,
    /// with sibling symlinks at the SHA1 and MD5Sum by-hash paths.
    pub async fn store_with_hash<R>(&self, p: &str, fi: &FileInfo, r: R) -> Result<FileInfo>
    where
        R: AsyncRead + Unpin,
    {
        if !apt::is_clean_path(p) {
            return Err(Error::BadPath(p.to_string()));
        }
        let location = fi
            .sha256_path()
            .ok_or_else(|| Error::MissingDigest(p.to_string()))?;

        self.begin(&location).await?;
        let result = async {
            let fi2 = self
                .write_content(&self.full_path(&location), Some(fi), r, p)
                .await?;
            self.add_hash_links(fi, &location).await?;
            Ok(fi2)
        }
        .await;
        self.finish(&location, result).await
    }

    /// Hardlinks (or copies) the external file at `fullpath` into the
    /// snapshot at `fi`'s natural path. Used for reuse from a prior
    /// snapshot.
    pub async fn store_link(&self, fi: &FileInfo, fullpath: &Path) -> Result<()> {
        let location = fi.path().to_string();
        self.begin(&location).await?;
        let result = link_or_copy(fullpath, &self.full_path(&location)).await;
        self.finish(&location, result.map_err(Error::from).map(|()| fi.clone()))
            .await?;
        Ok(())
    }

    /// Like [`Storage::store_link`] but into the by-hash layout.
    pub async fn store_link_with_hash(&self, fi: &FileInfo, fullpath: &Path) -> Result<()> {
        let location = fi
            .sha256_path()
            .ok_or_else(|| Error::MissingDigest(fi.path().to_string()))?;
        self.begin(&location).await?;
        let result = async {
            link_or_copy(fullpath, &self.full_path(&location)).await?;
            self.add_hash_links(fi, &location).await
        }
        .await;
        self.finish(&location, result.map(|()| fi.clone())).await?;
        Ok(())
    }

    /// Finds a stored FileInfo matching `fi` and returns it together
    /// with the absolute path of its content file (for hardlinking).
    /// With `by_hash`, a miss at the natural path falls back to the
    /// SHA256 by-hash location.
    pub async fn lookup(&self, fi: &FileInfo, by_hash: bool) -> Option<(FileInfo, PathBuf)> {
        let inner = self.inner.lock().await;

        if let Some(found) = inner.info.get(fi.path()) {
            if found.same(fi) {
                return Some((found.clone(), self.full_path(fi.path())));
            }
        }
        if !by_hash {
            return None;
        }

        let location = fi.sha256_path()?;
        let found = inner.info.get(&location)?;
        found
            .same(fi)
            .then(|| (found.clone(), self.full_path(&location)))
    }

    async fn begin(&self, location: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.info.contains_key(location) || inner.locked.contains(location) {
            return Err(Error::AlreadyStored(location.to_string()));
        }
        inner.locked.insert(location.to_string());
        Ok(())
    }

    async fn finish(&self, location: &str, result: Result<FileInfo>) -> Result<FileInfo> {
        let mut inner = self.inner.lock().await;
        inner.locked.remove(location);
        if let Ok(fi) = &result {
            inner.info.insert(location.to_string(), fi.clone());
        }
        result
    }

    async fn write_content<R>(
        &self,
        dest: &Path,
        fi: Option<&FileInfo>,
        r: R,
        logical: &str,
    ) -> Result<FileInfo>
    where
        R: AsyncRead + Unpin,
    {
        let temp = self.temp_file().await?;
        let mut f = File::from_std(temp.as_file().try_clone()?);
        let fi2 = copy_with_file_info(r, &mut f, logical).await?;
        f.sync_all().await?;

        if let Some(fi) = fi {
            if fi.has_checksum() && !fi.same(&fi2) {
                return Err(Error::InvalidData);
            }
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        temp.into_temp_path().persist(dest).map_err(|e| e.error)?;
        Ok(fi2)
    }

    /// Symlinks the SHA1 and MD5Sum by-hash paths to the SHA256 file.
    async fn add_hash_links(&self, fi: &FileInfo, location: &str) -> Result<()> {
        let hex = location.rsplit('/').next().unwrap_or(location);
        let target = format!("../SHA256/{hex}");

        for alt in [fi.sha1_path(), fi.md5sum_path()].into_iter().flatten() {
            let link = self.full_path(&alt);
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::symlink(&target, &link).await?;
        }
        Ok(())
    }

    async fn temp_file(&self) -> Result<tempfile::NamedTempFile> {
        let dir = self.dir.clone();
        Ok(
            spawn_blocking(move || tempfile::Builder::new().prefix("_tmp").tempfile_in(dir))
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??,
        )
    }
}

async fn link_or_copy(src: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    match fs::hard_link(src, dest).await {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("hardlink to {} failed ({e}), copying", dest.display());
            fs::copy(src, dest).await.map(|_| ())
        }
    }
}

/// Directories need their own fsync for entry creation and rename to
/// become durable.
pub(crate) async fn dir_sync(dir: &Path) -> io::Result<()> {
    File::open(dir).await?.sync_all().await
}
