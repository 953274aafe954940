//! Export coordinator: pull the archived messages of one chat into a durable
//! on-disk export.
//!
//! Two overlapping phases. Pagination lists messages oldest-first, assigns
//! order keys and appends manifest records as each page arrives; media
//! downloads run concurrently in the background and append an updated record
//! per item when they resolve. A crash or cancellation therefore leaves a
//! loadable manifest behind, and a re-run resumes from it instead of starting
//! over.

use std::{collections::HashSet, fs, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    client::{MessagePage, PageCursor, RemoteClient, RemoteMessage},
    config::{ExportConfig, ExportMode, RetryPolicy},
    domain::{ChatId, DownloadState, MediaRef, MessageId, OrderKey, Sender, SourceMessage},
    governor::RateGovernor,
    job::JobHandle,
    manifest::{load_manifest, ExportDir, ManifestWriter},
    media::{backoff_delay, MediaFetcher},
    Error, Result,
};

/// Final tallies of one export run, persisted as `export_summary.json` once
/// the run completes. The file doubles as the completion marker: its presence
/// tells a re-run that listing is already done.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub messages: u64,
    pub text_messages: u64,
    pub media_complete: u64,
    pub media_failed: u64,
    #[serde(default)]
    pub cancelled: bool,
}

impl ExportSummary {
    /// Read the completion marker. Missing or unreadable means no marker, in
    /// which case the coordinator lists from scratch.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path)?;
        match serde_json::from_str(&data) {
            Ok(summary) => Ok(Some(summary)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable export summary");
                Ok(None)
            }
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }
}

/// Drives one export job end to end. Cheap to construct; all heavy state
/// lives in the export directory and the shared governor.
pub struct ExportCoordinator {
    client: Arc<dyn RemoteClient>,
    governor: Arc<RateGovernor>,
    cfg: ExportConfig,
    retry: RetryPolicy,
}

impl ExportCoordinator {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        governor: Arc<RateGovernor>,
        cfg: ExportConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            governor,
            cfg,
            retry,
        }
    }

    /// Run the export to completion, cancellation or failure, settling the
    /// job status accordingly.
    pub async fn run(&self, dir: &ExportDir, job: &JobHandle) -> Result<ExportSummary> {
        match self.run_inner(dir, job).await {
            Ok(summary) => {
                if summary.cancelled {
                    job.mark_cancelled();
                } else {
                    job.mark_completed();
                }
                Ok(summary)
            }
            Err(e) => {
                job.mark_failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn run_inner(&self, dir: &ExportDir, job: &JobHandle) -> Result<ExportSummary> {
        let chat = ChatId(
            self.cfg
                .chat_id
                .ok_or_else(|| Error::Config("export chat id is not set".into()))?,
        );

        let existing = load_manifest(&dir.manifest_path())?;
        let prior_complete = ExportSummary::read(&dir.summary_path())?.is_some();
        let unresolved: Vec<SourceMessage> = existing
            .iter()
            .filter(|m| {
                m.media
                    .as_ref()
                    .is_some_and(|md| md.download_state != DownloadState::Complete)
            })
            .cloned()
            .collect();

        job.set_total_estimate(existing.len() as u64);

        if prior_complete && unresolved.is_empty() {
            // Nothing left to list or download: not a single remote call.
            info!(chat = chat.0, messages = existing.len(), "export already complete");
            job.add_processed(existing.len() as u64);
            return Ok(summarize(&existing, job.is_cancel_requested()));
        }

        let fetcher = MediaFetcher::new(
            self.client.clone(),
            self.governor.clone(),
            self.retry,
            self.cfg.download_concurrency,
        );
        let mut writer = ManifestWriter::open(&dir.manifest_path())?;
        let mut downloads: JoinSet<Result<SourceMessage>> = JoinSet::new();

        let mut known: HashSet<MessageId> = existing.iter().map(|m| m.id).collect();
        let mut next_key = existing
            .last()
            .map(|m| m.order_key.next())
            .unwrap_or(OrderKey(1));

        // Downloads left pending or failed by an earlier run go first.
        for msg in unresolved {
            if job.is_cancel_requested() {
                break;
            }
            spawn_download(&mut downloads, fetcher.clone(), chat, msg, dir.clone());
        }

        let mut fatal: Option<Error> = None;
        let mut cancelled = job.is_cancel_requested();

        if !prior_complete && !cancelled {
            let mut cursor: Option<PageCursor> = None;
            'pages: loop {
                if job.is_cancel_requested() {
                    cancelled = true;
                    break;
                }
                let page = match self.list_page(chat, cursor.take()).await {
                    Ok(page) => page,
                    Err(e) => {
                        fatal = Some(e);
                        break;
                    }
                };
                let page_len = page.messages.len();
                for raw in page.messages {
                    if !self.id_in_bounds(raw.id) || !self.mode_allows(&raw) {
                        continue;
                    }
                    if !known.insert(raw.id) {
                        continue;
                    }
                    let msg = assign(raw, chat, next_key);
                    next_key = next_key.next();
                    if let Err(e) = writer.append(&msg) {
                        fatal = Some(e);
                        break 'pages;
                    }
                    job.add_total_estimate(1);
                    if msg.has_text() {
                        job.add_text_messages(1);
                    }
                    if msg.has_media() {
                        spawn_download(&mut downloads, fetcher.clone(), chat, msg, dir.clone());
                    } else {
                        job.add_processed(1);
                    }
                }
                debug!(chat = chat.0, page_len, "page archived");
                match page.next {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }

        // In-flight downloads run to completion even on cancellation or a
        // fatal listing error; each resolves with an updated manifest record.
        debug!(in_flight = downloads.len(), "draining media downloads");
        while let Some(joined) = downloads.join_next().await {
            match joined {
                Ok(Ok(updated)) => {
                    let complete = updated.media.as_ref().is_some_and(MediaRef::is_complete);
                    if let Err(e) = writer.append(&updated) {
                        if fatal.is_none() {
                            fatal = Some(e);
                        }
                        continue;
                    }
                    job.add_processed(1);
                    if complete {
                        job.add_media_messages(1);
                    } else {
                        job.add_failed_items(1);
                    }
                }
                Ok(Err(e)) => {
                    // Terminal rate limit: every remaining task fails the
                    // same way, so keep draining rather than aborting.
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
                Err(join_err) => {
                    warn!(error = %join_err, "media download task aborted");
                    job.add_failed_items(1);
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        cancelled = cancelled || job.is_cancel_requested();

        let records = load_manifest(&dir.manifest_path())?;
        let summary = summarize(&records, cancelled);
        if cancelled {
            info!(chat = chat.0, messages = summary.messages, "export cancelled");
        } else {
            summary.write(&dir.summary_path())?;
            info!(
                chat = chat.0,
                messages = summary.messages,
                media = summary.media_complete,
                failed = summary.media_failed,
                "export complete"
            );
        }
        Ok(summary)
    }

    /// List one page, retrying FloodWaits via the governor and transient
    /// failures with bounded backoff. Listing failures past the retry budget
    /// are fatal: without the page the sequence cannot continue safely.
    async fn list_page(&self, chat: ChatId, cursor: Option<PageCursor>) -> Result<MessagePage> {
        let mut attempt: u32 = 0;
        loop {
            self.governor.acquire().await?;
            match self
                .client
                .list_messages(chat, cursor.clone(), self.cfg.page_size)
                .await
            {
                Ok(page) => {
                    self.governor.report_ok().await;
                    return Ok(page);
                }
                Err(Error::RateLimited { retry_after }) => {
                    warn!(wait_secs = retry_after.as_secs_f64(), "listing rate limited");
                    self.governor.report_limited(retry_after).await;
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(e);
                    }
                    let backoff = backoff_delay(self.retry.backoff_base, attempt);
                    debug!(error = %e, attempt, "listing retry");
                    sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn id_in_bounds(&self, id: MessageId) -> bool {
        if self.cfg.min_message_id > 0 && id.0 < self.cfg.min_message_id {
            return false;
        }
        if self.cfg.max_message_id > 0 && id.0 > self.cfg.max_message_id {
            return false;
        }
        true
    }

    fn mode_allows(&self, raw: &RemoteMessage) -> bool {
        match self.cfg.export_mode {
            ExportMode::All => true,
            ExportMode::MediaOnly => raw.media.is_some(),
            ExportMode::TextOnly => {
                raw.media.is_none()
                    && raw.text.as_deref().is_some_and(|t| !t.trim().is_empty())
            }
        }
    }
}

fn assign(raw: RemoteMessage, chat: ChatId, key: OrderKey) -> SourceMessage {
    SourceMessage {
        order_key: key,
        id: raw.id,
        chat_id: chat,
        sender: Sender {
            id: raw.sender_id,
            name: raw.sender_name,
            username: raw.sender_username,
        },
        sent_at: raw.sent_at,
        text: raw.text,
        reply_to_id: raw.reply_to_id,
        quote_text: raw.quote_text,
        media: raw.media,
    }
}

fn spawn_download(
    set: &mut JoinSet<Result<SourceMessage>>,
    fetcher: MediaFetcher,
    chat: ChatId,
    mut msg: SourceMessage,
    dir: ExportDir,
) {
    set.spawn(async move {
        let Some(media) = msg.media.clone() else {
            return Ok(msg);
        };
        let fetched = fetcher.fetch(chat, msg.id, &media, &dir).await?;
        msg.media = Some(fetched);
        Ok(msg)
    });
}

fn summarize(records: &[SourceMessage], cancelled: bool) -> ExportSummary {
    let mut summary = ExportSummary {
        cancelled,
        ..Default::default()
    };
    for msg in records {
        summary.messages += 1;
        if msg.has_text() {
            summary.text_messages += 1;
        }
        match msg.media.as_ref().map(|m| m.download_state) {
            Some(DownloadState::Complete) => summary.media_complete += 1,
            Some(_) => summary.media_failed += 1,
            None => {}
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MediaKind;

    fn coordinator(cfg: ExportConfig) -> ExportCoordinator {
        struct NoClient;

        #[async_trait::async_trait]
        impl RemoteClient for NoClient {
            async fn list_messages(
                &self,
                _chat: ChatId,
                _cursor: Option<PageCursor>,
                _limit: usize,
            ) -> Result<MessagePage> {
                Err(Error::External("unexpected call".into()))
            }

            async fn download_media(
                &self,
                _chat: ChatId,
                _message: MessageId,
                _media: &MediaRef,
            ) -> Result<Vec<u8>> {
                Err(Error::External("unexpected call".into()))
            }

            async fn send_message(
                &self,
                _chat: ChatId,
                _out: crate::client::OutgoingMessage,
            ) -> Result<MessageId> {
                Err(Error::External("unexpected call".into()))
            }
        }

        ExportCoordinator::new(
            Arc::new(NoClient),
            Arc::new(RateGovernor::new(Default::default())),
            cfg,
            RetryPolicy::default(),
        )
    }

    fn raw(id: i64, text: Option<&str>, media: bool) -> RemoteMessage {
        RemoteMessage {
            id: MessageId(id),
            text: text.map(str::to_string),
            media: media.then(|| MediaRef::pending(MediaKind::Photo, format!("ref-{id}"), None)),
            ..Default::default()
        }
    }

    #[test]
    fn id_bounds_are_inclusive_and_zero_disables() {
        let mut cfg = ExportConfig::default();
        cfg.min_message_id = 10;
        cfg.max_message_id = 20;
        let coord = coordinator(cfg);
        assert!(coord.id_in_bounds(MessageId(10)));
        assert!(coord.id_in_bounds(MessageId(20)));
        assert!(!coord.id_in_bounds(MessageId(9)));
        assert!(!coord.id_in_bounds(MessageId(21)));

        let open = coordinator(ExportConfig::default());
        assert!(open.id_in_bounds(MessageId(i64::MAX)));
        assert!(open.id_in_bounds(MessageId(1)));
    }

    #[test]
    fn export_mode_filters_listing() {
        let mut cfg = ExportConfig::default();
        cfg.export_mode = ExportMode::MediaOnly;
        let media_only = coordinator(cfg.clone());
        assert!(media_only.mode_allows(&raw(1, Some("caption"), true)));
        assert!(!media_only.mode_allows(&raw(2, Some("text"), false)));

        cfg.export_mode = ExportMode::TextOnly;
        let text_only = coordinator(cfg);
        assert!(text_only.mode_allows(&raw(1, Some("text"), false)));
        assert!(!text_only.mode_allows(&raw(2, Some("caption"), true)));
        assert!(!text_only.mode_allows(&raw(3, Some("   "), false)));
    }

    #[test]
    fn summary_counts_media_states() {
        let mut with_media = SourceMessage {
            order_key: OrderKey(1),
            id: MessageId(1),
            chat_id: ChatId(1),
            sender: Sender::default(),
            sent_at: None,
            text: Some("hello".into()),
            reply_to_id: None,
            quote_text: None,
            media: Some(MediaRef::pending(MediaKind::Photo, "r", None)),
        };
        let text_only = SourceMessage {
            order_key: OrderKey(2),
            id: MessageId(2),
            media: None,
            ..with_media.clone()
        };
        if let Some(media) = with_media.media.as_mut() {
            media.download_state = DownloadState::Failed;
        }

        let summary = summarize(&[with_media, text_only], false);
        assert_eq!(summary.messages, 2);
        assert_eq!(summary.text_messages, 2);
        assert_eq!(summary.media_complete, 0);
        assert_eq!(summary.media_failed, 1);
        assert!(!summary.cancelled);
    }
}
