//! Redelivery engine: replay an exported chat into a destination chat.
//!
//! Delivery is strictly sequential in manifest order. A unit is never left
//! behind while a later one proceeds: rate limits retry the same unit after
//! the governor cooldown, and only a permanent per-unit failure (rejected
//! content, exhausted transient retries) records the loss and moves on.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    batch::build_units,
    client::{OutgoingMessage, RemoteClient},
    config::{ResendConfig, RetryPolicy},
    domain::{ChatId, DeliveryUnit, IdRemap, MessageId},
    governor::RateGovernor,
    job::JobHandle,
    manifest::{load_manifest, ExportDir},
    media::backoff_delay,
    render::{render_unit, truncate_chars, CAPTION_LIMIT},
    Error, Result,
};

/// Upper bound the destination accepts for a single uploaded file. Larger
/// attachments are redelivered as text with the loss recorded.
const MAX_UPLOAD_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Outcome of one redelivery run.
#[derive(Clone, Debug, Default)]
pub struct DeliveryReport {
    /// Source message id -> id assigned by the destination.
    pub remap: IdRemap,
    pub delivered_units: u64,
    pub skipped_units: u64,
    pub failed_units: u64,
    pub delivered_messages: u64,
    pub cancelled: bool,
}

pub struct RedeliveryEngine {
    client: Arc<dyn RemoteClient>,
    governor: Arc<RateGovernor>,
    cfg: ResendConfig,
    retry: RetryPolicy,
}

impl RedeliveryEngine {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        governor: Arc<RateGovernor>,
        cfg: ResendConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            governor,
            cfg,
            retry,
        }
    }

    /// Replay the export in `dir` into the configured destination chat,
    /// settling the job status on the way out.
    pub async fn run(&self, dir: &ExportDir, job: &JobHandle) -> Result<DeliveryReport> {
        match self.run_inner(dir, job).await {
            Ok(report) => {
                if report.cancelled {
                    job.mark_cancelled();
                } else {
                    job.mark_completed();
                }
                Ok(report)
            }
            Err(e) => {
                job.mark_failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn run_inner(&self, dir: &ExportDir, job: &JobHandle) -> Result<DeliveryReport> {
        let dest = ChatId(
            self.cfg
                .target_chat_id
                .ok_or_else(|| Error::Config("redelivery target chat id is not set".into()))?,
        );

        let messages = load_manifest(&dir.manifest_path())?;
        let mut units = build_units(&messages, &self.cfg.batch);
        info!(
            dest = dest.0,
            messages = messages.len(),
            units = units.len(),
            "redelivery starting"
        );
        job.set_total_estimate(units.len() as u64);

        let mut report = DeliveryReport::default();

        for unit in &mut units {
            if job.is_cancel_requested() {
                report.cancelled = true;
                break;
            }
            if report.delivered_units > 0 {
                sleep(self.cfg.send_spacing).await;
            }

            match self.deliver_unit(dest, unit, &report.remap, job).await {
                Ok(Some(dest_id)) => {
                    // Every member of a merged unit maps to the one message
                    // the destination created for it.
                    for source_id in unit.member_ids() {
                        report.remap.insert(source_id, dest_id);
                    }
                    report.delivered_units += 1;
                    report.delivered_messages += unit.members.len() as u64;
                    job.add_processed(1);
                }
                Ok(None) => {
                    debug!(ids = ?unit.member_ids(), "unit has nothing to send, skipped");
                    report.skipped_units += 1;
                    job.add_processed(1);
                }
                Err(e) if matches!(e, Error::Rejected(_)) || e.is_transient() => {
                    warn!(ids = ?unit.member_ids(), error = %e, "unit not delivered");
                    report.failed_units += 1;
                    job.add_failed_items(1);
                    job.set_last_error(e.to_string());
                    job.add_processed(1);
                }
                Err(e) => return Err(e),
            }
        }

        report.cancelled = report.cancelled || job.is_cancel_requested();
        info!(
            delivered = report.delivered_units,
            skipped = report.skipped_units,
            failed = report.failed_units,
            "redelivery finished"
        );
        Ok(report)
    }

    /// Send one unit. `Ok(None)` means the unit had nothing to send under the
    /// current include settings. `Rejected` and exhausted transient errors
    /// bubble up for the caller to record; rate limits are retried here so
    /// ordering is preserved.
    async fn deliver_unit(
        &self,
        dest: ChatId,
        unit: &mut DeliveryUnit,
        remap: &IdRemap,
        job: &JobHandle,
    ) -> Result<Option<MessageId>> {
        // A reply is native only when its target already exists in the
        // destination; otherwise the rendered header carries the fallback.
        unit.reply_target = unit.reply_to_id().and_then(|src| remap.get(src));

        let Some(first) = unit.members.first() else {
            return Ok(None);
        };

        if first.has_media() && !self.cfg.include_media {
            return Ok(None);
        }

        let body = render_unit(unit, &self.cfg.header, unit.reply_target.is_some());

        let media_path = first.media.as_ref().and_then(|m| {
            if m.is_complete() && m.size_bytes <= MAX_UPLOAD_BYTES {
                m.local_path.clone().filter(|p| p.exists())
            } else {
                None
            }
        });
        if first.has_media() && media_path.is_none() {
            warn!(message = first.id.0, "attachment unavailable, redelivering text only");
            job.add_failed_items(1);
        }

        let (html, media_path) = match (media_path, self.cfg.include_text) {
            (Some(path), true) => (Some(truncate_chars(&body, CAPTION_LIMIT)), Some(path)),
            (Some(path), false) => (None, Some(path)),
            (None, true) => (Some(body), None),
            (None, false) => return Ok(None),
        };
        if media_path.is_none() && html.as_deref().map_or(true, |h| h.trim().is_empty()) {
            return Ok(None);
        }

        let outgoing = OutgoingMessage {
            html,
            media_path,
            reply_to: unit.reply_target,
            silent: self.cfg.silent,
        };

        let mut attempt: u32 = 0;
        loop {
            self.governor.acquire().await?;
            match self.client.send_message(dest, outgoing.clone()).await {
                Ok(id) => {
                    self.governor.report_ok().await;
                    return Ok(Some(id));
                }
                Err(Error::RateLimited { retry_after }) => {
                    warn!(
                        ids = ?unit.member_ids(),
                        wait_secs = retry_after.as_secs_f64(),
                        "send rate limited, unit will be retried"
                    );
                    self.governor.report_limited(retry_after).await;
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(e);
                    }
                    let backoff = backoff_delay(self.retry.backoff_base, attempt);
                    debug!(error = %e, attempt, "send retry");
                    sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
