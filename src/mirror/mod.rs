//! Mirror engine: Release → indices → items pipeline with reuse from
//! the previously published snapshot and an atomic symlink publish.

mod download;
pub mod storage;

use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use color_eyre::eyre::{bail, eyre, Context, Result};
use reqwest::{Client, StatusCode};
use tokio::{
    fs,
    sync::{mpsc, OwnedSemaphorePermit, Semaphore},
    task::{spawn_blocking, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::{
    apt::{self, FileInfo},
    config::{Config, MirrorConfig},
};

use self::{
    download::{DlResult, Downloader},
    storage::{dir_sync, Storage},
};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5 * 60);

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_' | '-'))
}

/// One mirror update: a fresh dot-prefixed snapshot directory filled
/// from the upstream archive (reusing the currently published
/// snapshot where possible), published by flipping a symlink.
pub struct Mirror {
    id: String,
    dir: PathBuf,
    mc: Arc<MirrorConfig>,
    storage: Arc<Storage>,
    current: Option<Arc<Storage>>,
    dl: Arc<Downloader>,
}

impl Mirror {
    pub async fn new(t: DateTime<Local>, id: &str, config: &Config) -> Result<Self> {
        let dir = config.dir.clone();
        let mc = config
            .mirrors
            .get(id)
            .cloned()
            .ok_or_else(|| eyre!("no such mirror: {id}"))?;

        if !valid_id(id) {
            bail!("invalid id: {id}");
        }
        mc.check().map_err(|e| e.wrap_err(id.to_string()))?;
        let mc = Arc::new(mc);

        // the published symlink, when present, leads to the snapshot
        // to reuse files from
        let current = match fs::canonicalize(dir.join(id)).await {
            Ok(curdir) => {
                let parent = curdir
                    .parent()
                    .ok_or_else(|| eyre!("bad published snapshot: {}", curdir.display()))?;
                let storage = Storage::new(parent, id)?;
                storage.load().await?;
                Some(Arc::new(storage))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e).wrap_err_with(|| id.to_string()),
        };

        let d = dir.join(format!(".{id}.{}", t.format(TIMESTAMP_FORMAT)));
        fs::create_dir(&d).await.wrap_err_with(|| id.to_string())?;
        let storage = Arc::new(Storage::new(&d, id)?);

        let client = Client::builder()
            .pool_max_idle_per_host(config.max_conns)
            .build()?;
        let semaphore = Arc::new(Semaphore::new(config.max_conns));
        let dl = Arc::new(Downloader::new(
            id.to_string(),
            mc.clone(),
            client,
            semaphore,
            storage.clone(),
        ));

        Ok(Self {
            id: id.to_string(),
            dir,
            mc,
            storage,
            current,
            dl,
        })
    }

    /// Runs one full update. On failure the published symlink is left
    /// untouched and the in-progress snapshot stays under its
    /// dot-prefixed directory.
    pub async fn update(&self, cancel: &CancellationToken) -> Result<()> {
        let mut item_map = HashMap::new();
        for suite in &self.mc.suites {
            self.update_suite(cancel, suite, &mut item_map)
                .await
                .map_err(|e| e.wrap_err(self.id.clone()))?;
        }

        info!(
            "Downloading {} items for mirror '{}'",
            item_map.len(),
            self.id
        );
        self.download_items(cancel, item_map)
            .await
            .map_err(|e| e.wrap_err(self.id.clone()))?;

        info!("Saving meta data for mirror '{}'", self.id);
        self.storage.save().await.wrap_err_with(|| self.id.clone())?;

        self.replace_link()
            .await
            .map_err(|e| e.wrap_err(self.id.clone()))?;

        info!("Update of mirror '{}' succeeded", self.id);
        Ok(())
    }

    async fn update_suite(
        &self,
        cancel: &CancellationToken,
        suite: &str,
        item_map: &mut HashMap<String, FileInfo>,
    ) -> Result<()> {
        info!(
            "Downloading Release/InRelease of suite '{suite}' for mirror '{}'",
            self.id
        );
        let (mut index_map, by_hash) = self.download_release(cancel, suite).await?;

        if by_hash {
            info!("Detected by-hash support for mirror '{}'", self.id);
        }

        if index_map.is_empty() {
            bail!("found no Release/InRelease");
        }

        // Some upstreams serve garbage for nonexistent Sources files,
        // so drop Sources indices when sources are not mirrored.
        if !self.mc.source {
            index_map.retain(|p, _| {
                let base = p.rsplit('/').next().unwrap_or(p);
                let stem = base.rsplit_once('.').map(|(s, _)| s).unwrap_or(base);
                stem != "Sources"
            });
        }

        let indices = self.download_indices(cancel, &index_map, by_hash).await?;
        self.extract_items(&indices, &index_map, item_map, by_hash)
            .await?;
        Ok(())
    }

    /// Requests every Release/InRelease variant of the suite. Absent
    /// variants (4xx) are fine; the collected entries must agree on
    /// checksums unless the suite advertises by-hash.
    async fn download_release(
        &self,
        cancel: &CancellationToken,
        suite: &str,
    ) -> Result<(HashMap<String, Vec<FileInfo>>, bool)> {
        let releases = self.mc.release_files(suite);
        let (tx, mut rx) = mpsc::channel(releases.len());

        let mut tasks = JoinSet::new();
        for p in &releases {
            let permit = acquire(cancel, &self.dl.semaphore).await?;
            tasks.spawn(self.dl.clone().fetch(
                p.clone(),
                None,
                false,
                cancel.clone(),
                tx.clone(),
                permit,
            ));
        }
        drop(tx);

        let mut by_hash = true;
        let mut fil_map: HashMap<String, Vec<FileInfo>> = HashMap::new();
        while let Some(r) = rx.recv().await {
            if let Some(err) = r.err {
                return Err(err.wrap_err("download"));
            }
            let status = r.status.ok_or_else(|| eyre!("no status for {}", r.path))?;
            if status.is_client_error() {
                continue;
            }
            if status != StatusCode::OK {
                bail!("status {status} for {}", r.path);
            }

            let f = self.storage.open(&r.path).await?.into_std().await;
            let path = r.path.clone();
            let (fil, fields) = spawn_blocking(move || apt::extract_file_info(&path, f))
                .await?
                .map_err(|e| e.wrap_err(format!("extract_file_info: {}", r.path)))?;

            let base = r.path.rsplit('/').next().unwrap_or(&r.path);
            if by_hash && base != "Release.gpg" {
                by_hash = apt::support_by_hash(&fields);
            }

            for fi in fil {
                add_file_info_to_list(fi, &mut fil_map, by_hash)?;
            }
        }
        while tasks.join_next().await.is_some() {}

        Ok((fil_map, by_hash))
    }

    async fn download_indices(
        &self,
        cancel: &CancellationToken,
        fil_map: &HashMap<String, Vec<FileInfo>>,
        by_hash: bool,
    ) -> Result<Vec<FileInfo>> {
        let fil: Vec<FileInfo> = fil_map.values().flatten().cloned().collect();
        info!(
            "Downloading {} indices for mirror '{}'",
            fil.len(),
            self.id
        );
        self.download_files(cancel, fil, false, by_hash).await
    }

    async fn download_items(
        &self,
        cancel: &CancellationToken,
        item_map: HashMap<String, FileInfo>,
    ) -> Result<Vec<FileInfo>> {
        let fil: Vec<FileInfo> = item_map.into_values().collect();
        self.download_files(cancel, fil, true, false).await
    }

    /// Extracts item FileInfos from the downloaded indices that match
    /// the mirror configuration. Paths already covered by the release
    /// index set are skipped.
    async fn extract_items(
        &self,
        indices: &[FileInfo],
        index_map: &HashMap<String, Vec<FileInfo>>,
        item_map: &mut HashMap<String, FileInfo>,
        by_hash: bool,
    ) -> Result<()> {
        for index in indices {
            let p = index.path();
            if !self.mc.matching_index(p) || !apt::is_supported(p) {
                continue;
            }

            let open_path = if by_hash {
                index
                    .sha256_path()
                    .ok_or_else(|| eyre!("no SHA256 checksum for {p}"))?
            } else {
                p.to_string()
            };
            let f = self.storage.open(&open_path).await?.into_std().await;

            let path = p.to_string();
            let (fil, _) = spawn_blocking(move || apt::extract_file_info(&path, f))
                .await?
                .map_err(|e| e.wrap_err(format!("extract_file_info: {p}")))?;

            for fi in fil {
                if index_map.contains_key(fi.path()) {
                    // already included in Release/InRelease
                    continue;
                }
                item_map.insert(fi.path().to_string(), fi);
            }
        }
        Ok(())
    }

    /// Producer/consumer pair over a results channel: the producer
    /// reuses or dispatches downloads and closes the channel once all
    /// dispatched workers finished; the consumer accumulates their
    /// results. The first error cancels the sibling.
    async fn download_files(
        &self,
        cancel: &CancellationToken,
        fil: Vec<FileInfo>,
        allow_missing: bool,
        by_hash: bool,
    ) -> Result<Vec<FileInfo>> {
        let total = fil.len();
        let (tx, rx) = mpsc::channel(total.max(1));

        let (mut reused, downloaded) = tokio::try_join!(
            self.reuse_or_download(cancel, fil, by_hash, tx),
            recv_results(&self.id, allow_missing, rx),
        )?;

        info!(
            "Stats for mirror '{}': total={total} reused={} downloaded={}",
            self.id,
            reused.len(),
            downloaded.len()
        );

        reused.extend(downloaded);
        Ok(reused)
    }

    async fn reuse_or_download(
        &self,
        cancel: &CancellationToken,
        fil: Vec<FileInfo>,
        by_hash: bool,
        tx: mpsc::Sender<DlResult>,
    ) -> Result<Vec<FileInfo>> {
        let mut tasks = JoinSet::new();
        let mut reused = Vec::with_capacity(fil.len());
        let mut logged_at = Instant::now();

        let total = fil.len();
        for (i, fi) in fil.into_iter().enumerate() {
            if logged_at.elapsed() > PROGRESS_INTERVAL {
                logged_at = Instant::now();
                info!(
                    "Download progress for mirror '{}': total={total} reused={} downloads={}",
                    self.id,
                    reused.len(),
                    i - reused.len()
                );
            }

            if let Some(current) = &self.current {
                if let Some((localfi, fullpath)) = current.lookup(&fi, by_hash).await {
                    if by_hash {
                        self.storage.store_link_with_hash(&localfi, &fullpath).await
                    } else {
                        self.storage.store_link(&localfi, &fullpath).await
                    }
                    .wrap_err("store_link")?;

                    debug!("Reusing {}", fi.path());
                    reused.push(localfi);
                    continue;
                }
            }

            let permit = acquire(cancel, &self.dl.semaphore).await?;
            tasks.spawn(self.dl.clone().fetch(
                fi.path().to_string(),
                Some(fi),
                by_hash,
                cancel.clone(),
                tx.clone(),
                permit,
            ));
        }

        // close the results channel only after every dispatched
        // worker delivered its result, or the consumer would hang
        while tasks.join_next().await.is_some() {}
        drop(tx);
        Ok(reused)
    }

    /// Atomically publishes the snapshot: temp symlink, directory
    /// fsync (the symlink lives in the dentry), rename over the
    /// published name, directory fsync again.
    async fn replace_link(&self) -> Result<()> {
        let tmp = self.dir.join(format!("{}.tmp", self.id));
        let _ = fs::remove_file(&tmp).await;
        fs::symlink(self.storage.dir().join(&self.id), &tmp).await?;

        dir_sync(&self.dir).await?;
        fs::rename(&tmp, self.dir.join(&self.id)).await?;
        dir_sync(&self.dir).await?;
        Ok(())
    }
}

async fn recv_results(
    id: &str,
    allow_missing: bool,
    mut rx: mpsc::Receiver<DlResult>,
) -> Result<Vec<FileInfo>> {
    let mut dlfil = Vec::new();
    while let Some(r) = rx.recv().await {
        if let Some(err) = r.err {
            return Err(err.wrap_err("download"));
        }
        let status = r.status.ok_or_else(|| eyre!("no status for {}", r.path))?;

        if allow_missing && status == StatusCode::NOT_FOUND {
            warn!("Missing file on mirror '{id}': {}", r.path);
            continue;
        }
        if status != StatusCode::OK {
            bail!("status {status} for {}", r.path);
        }

        if let Some(fi) = r.fi {
            dlfil.push(fi);
        }
    }
    Ok(dlfil)
}

fn add_file_info_to_list(
    fi: FileInfo,
    map: &mut HashMap<String, Vec<FileInfo>>,
    by_hash: bool,
) -> Result<()> {
    let fil = map.entry(fi.path().to_string()).or_default();
    if fil.iter().any(|existing| existing.same(&fi)) {
        return Ok(());
    }
    if !fil.is_empty() && !by_hash {
        bail!("inconsistent checksum for {}", fi.path());
    }
    fil.push(fi);
    Ok(())
}

async fn acquire(
    cancel: &CancellationToken,
    semaphore: &Arc<Semaphore>,
) -> Result<OwnedSemaphorePermit> {
    tokio::select! {
        _ = cancel.cancelled() => Err(eyre!("cancelled")),
        permit = semaphore.clone().acquire_owned() => Ok(permit?),
    }
}
