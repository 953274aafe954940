//! Media fetcher: bounded-concurrency downloads into content-addressed storage.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{
    client::RemoteClient,
    config::RetryPolicy,
    domain::{ChatId, DownloadState, MediaRef, MessageId},
    governor::RateGovernor,
    manifest::ExportDir,
    Error, Result,
};

/// Downloads message attachments under a shared permit pool.
///
/// Downloads are idempotent: a FloodWait simply re-runs the same item after
/// the governor cooldown, and a file that already exists under its content
/// hash is reused rather than re-written.
#[derive(Clone)]
pub struct MediaFetcher {
    client: Arc<dyn RemoteClient>,
    governor: Arc<RateGovernor>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl MediaFetcher {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        governor: Arc<RateGovernor>,
        retry: RetryPolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            client,
            governor,
            retry,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Fetch one attachment. Per-item failures never surface as errors: on
    /// exhausted retries the returned ref carries `download_state: Failed` so
    /// the message is still exported and the loss stays visible downstream.
    /// Only the governor's terminal `RateLimitExceeded` propagates.
    pub async fn fetch(
        &self,
        chat: ChatId,
        message: MessageId,
        media: &MediaRef,
        dir: &ExportDir,
    ) -> Result<MediaRef> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::External("media fetcher permit pool closed".into()))?;

        let mut attempt: u32 = 0;
        loop {
            match self.try_fetch(chat, message, media, dir).await {
                Ok(fetched) => {
                    self.governor.report_ok().await;
                    return Ok(fetched);
                }
                Err(Error::RateLimited { retry_after }) => {
                    // Not counted against transient attempts: the governor's
                    // strike ceiling bounds repeated FloodWaits.
                    warn!(message = message.0, wait_secs = retry_after.as_secs_f64(), "download rate limited, will retry");
                    self.governor.report_limited(retry_after).await;
                }
                Err(e @ Error::RateLimitExceeded { .. }) => return Err(e),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        warn!(message = message.0, error = %e, attempts = attempt, "download failed after retries");
                        return Ok(failed(media));
                    }
                    let backoff = backoff_delay(self.retry.backoff_base, attempt);
                    debug!(message = message.0, error = %e, attempt, backoff_ms = backoff.as_millis() as u64, "download retry");
                    sleep(backoff).await;
                }
                Err(e) => {
                    warn!(message = message.0, error = %e, "download failed");
                    return Ok(failed(media));
                }
            }
        }
    }

    async fn try_fetch(
        &self,
        chat: ChatId,
        message: MessageId,
        media: &MediaRef,
        dir: &ExportDir,
    ) -> Result<MediaRef> {
        self.governor.acquire().await?;

        let bytes = self.client.download_media(chat, message, media).await?;
        if bytes.is_empty() {
            return Err(Error::Transient("empty download".into()));
        }

        let hash = hex_digest(&bytes);
        let final_path = dir.media_path(&hash, media.file_ext.as_deref());

        if !final_path.exists() {
            // Write to a temp path and atomically rename so no partial file
            // is ever visible under the media directory.
            let tmp_path = dir.media_dir().join(format!("{hash}.part"));
            tokio::fs::write(&tmp_path, &bytes).await?;
            tokio::fs::rename(&tmp_path, &final_path).await?;
        }

        debug!(message = message.0, path = %final_path.display(), bytes = bytes.len(), "media downloaded");

        Ok(MediaRef {
            kind: media.kind,
            remote_ref: media.remote_ref.clone(),
            file_ext: media.file_ext.clone(),
            local_path: Some(final_path),
            content_hash: Some(hash),
            size_bytes: bytes.len() as u64,
            download_state: DownloadState::Complete,
        })
    }
}

fn failed(media: &MediaRef) -> MediaRef {
    MediaRef {
        download_state: DownloadState::Failed,
        ..media.clone()
    }
}

pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16).saturating_sub(1))
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
