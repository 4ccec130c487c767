use std::{io, sync::Arc, time::Duration};

use color_eyre::eyre::{eyre, Report, Result};
use futures::TryStreamExt;
use reqwest::{Client, StatusCode};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::{io::StreamReader, sync::CancellationToken};

use crate::{apt::FileInfo, config::MirrorConfig};

use super::storage::{self, Storage};

const HTTP_RETRIES: u32 = 5;

/// Outcome of one download: the HTTP status when a response was
/// received, the requested FileInfo once stored, or the error.
pub(super) struct DlResult {
    pub path: String,
    pub status: Option<StatusCode>,
    pub fi: Option<FileInfo>,
    pub err: Option<Report>,
}

/// Issues GET requests against one mirror, bounded by a shared
/// semaphore, writing response bodies through the snapshot storage.
pub(super) struct Downloader {
    id: String,
    mc: Arc<MirrorConfig>,
    client: Client,
    pub(super) semaphore: Arc<Semaphore>,
    storage: Arc<Storage>,
}

impl Downloader {
    pub(super) fn new(
        id: String,
        mc: Arc<MirrorConfig>,
        client: Client,
        semaphore: Arc<Semaphore>,
        storage: Arc<Storage>,
    ) -> Self {
        Self {
            id,
            mc,
            client,
            semaphore,
            storage,
        }
    }

    /// Downloads `p` and delivers a result on `tx`. The permit is
    /// released only after the result is sent, so every delivered
    /// result accounts for exactly one release.
    pub(super) async fn fetch(
        self: Arc<Self>,
        p: String,
        fi: Option<FileInfo>,
        by_hash: bool,
        cancel: CancellationToken,
        tx: mpsc::Sender<DlResult>,
        permit: OwnedSemaphorePermit,
    ) {
        let mut result = DlResult {
            path: p.clone(),
            status: None,
            fi: None,
            err: None,
        };
        if let Err(e) = self
            .fetch_inner(&p, fi.as_ref(), by_hash, &cancel, &mut result)
            .await
        {
            result.err = Some(e);
        }
        let _ = tx.send(result).await;
        drop(permit);
    }

    async fn fetch_inner(
        &self,
        p: &str,
        fi: Option<&FileInfo>,
        by_hash: bool,
        cancel: &CancellationToken,
        result: &mut DlResult,
    ) -> Result<()> {
        let mut targets: Vec<String> = vec![p.to_string()];
        if by_hash {
            if let Some(fi) = fi {
                targets.extend(
                    [fi.sha256_path(), fi.sha1_path(), fi.md5sum_path()]
                        .into_iter()
                        .flatten(),
                );
            }
        }

        let mut retries: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(eyre!("cancelled"));
            }

            if retries > 0 {
                warn!("Retrying download of {p} (mirror '{}')", self.id);
                let backoff = Duration::from_secs(1 << (retries - 1));
                tokio::select! {
                    _ = cancel.cancelled() => return Err(eyre!("cancelled")),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            let url = self.mc.resolve(&targets[0])?;
            let resp = tokio::select! {
                _ = cancel.cancelled() => return Err(eyre!("cancelled")),
                resp = self.client.get(url).send() => resp,
            };
            let resp = match resp {
                Ok(resp) => resp,
                Err(e) => {
                    if retries < HTTP_RETRIES {
                        retries += 1;
                        continue;
                    }
                    return Err(e.into());
                }
            };

            let status = resp.status();
            debug!("Downloaded {p}: {status}");
            if status.is_server_error() && retries < HTTP_RETRIES {
                retries += 1;
                continue;
            }
            result.status = Some(status);
            if status != StatusCode::OK {
                return Ok(());
            }

            let stored = tokio::select! {
                _ = cancel.cancelled() => return Err(eyre!("cancelled")),
                stored = self.store_body(p, fi, by_hash, resp) => stored,
            };
            match stored {
                Ok(()) => {
                    result.fi = fi.cloned();
                    return Ok(());
                }
                Err(storage::Error::InvalidData) if targets.len() > 1 => {
                    // stale content behind the advertised path; fall
                    // back to the by-hash alternates
                    targets.remove(0);
                    warn!("Trying by-hash retrieval of {p} via {}", targets[0]);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn store_body(
        &self,
        p: &str,
        fi: Option<&FileInfo>,
        by_hash: bool,
        resp: reqwest::Response,
    ) -> storage::Result<()> {
        let stream = resp
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let reader = StreamReader::new(Box::pin(stream));

        match (by_hash, fi) {
            (true, Some(fi)) => self.storage.store_with_hash(p, fi, reader).await?,
            (_, fi) => self.storage.store(p, fi, reader).await?,
        };
        Ok(())
    }
}
