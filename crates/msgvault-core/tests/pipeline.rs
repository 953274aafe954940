//! End-to-end pipeline tests against a scripted in-memory remote client:
//! export with media, crash-free cancellation, resume, completed-export
//! idempotence, and redelivery of a fresh export.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use msgvault_core::client::{
    MessagePage, OutgoingMessage, PageCursor, RemoteClient, RemoteMessage,
};
use msgvault_core::config::{ExportConfig, ResendConfig, RetryPolicy};
use msgvault_core::deliver::RedeliveryEngine;
use msgvault_core::domain::{ChatId, DownloadState, MediaKind, MediaRef, MessageId};
use msgvault_core::export::{ExportCoordinator, ExportSummary};
use msgvault_core::governor::{GovernorConfig, RateGovernor};
use msgvault_core::job::{JobHandle, JobStatus};
use msgvault_core::manifest::{load_manifest, ExportDir};
use msgvault_core::{Error, Result};

const CHAT: i64 = 4242;

/// Scripted remote service: fixed pages, deterministic downloads, recorded
/// sends, per-call counters.
struct ScriptedClient {
    pages: Vec<Vec<RemoteMessage>>,
    list_calls: AtomicUsize,
    download_calls: AtomicUsize,
    sends: Mutex<Vec<OutgoingMessage>>,
    next_send_id: AtomicI64,
    /// Downloads for these remote refs always fail with a transient error.
    broken_refs: HashSet<String>,
    /// Request cancellation on this job once the nth list call has served.
    cancel_after_list: Option<(usize, JobHandle)>,
}

impl ScriptedClient {
    fn new(pages: Vec<Vec<RemoteMessage>>) -> Self {
        Self {
            pages,
            list_calls: AtomicUsize::new(0),
            download_calls: AtomicUsize::new(0),
            sends: Mutex::new(Vec::new()),
            next_send_id: AtomicI64::new(100),
            broken_refs: HashSet::new(),
            cancel_after_list: None,
        }
    }
}

#[async_trait]
impl RemoteClient for ScriptedClient {
    async fn list_messages(
        &self,
        _chat: ChatId,
        cursor: Option<PageCursor>,
        _limit: usize,
    ) -> Result<MessagePage> {
        let served = self.list_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let idx: usize = match cursor {
            Some(PageCursor(s)) => s.parse().map_err(|_| Error::External("bad cursor".into()))?,
            None => 0,
        };
        let messages = self.pages.get(idx).cloned().unwrap_or_default();
        let next = (idx + 1 < self.pages.len()).then(|| PageCursor((idx + 1).to_string()));

        if let Some((after, job)) = &self.cancel_after_list {
            if served == *after {
                job.request_cancel();
            }
        }
        Ok(MessagePage { messages, next })
    }

    async fn download_media(
        &self,
        _chat: ChatId,
        _message: MessageId,
        media: &MediaRef,
    ) -> Result<Vec<u8>> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if self.broken_refs.contains(&media.remote_ref) {
            return Err(Error::Transient("connection reset".into()));
        }
        Ok(format!("bytes-{}", media.remote_ref).into_bytes())
    }

    async fn send_message(&self, _chat: ChatId, out: OutgoingMessage) -> Result<MessageId> {
        self.sends.lock().unwrap().push(out);
        Ok(MessageId(self.next_send_id.fetch_add(1, Ordering::SeqCst)))
    }
}

fn remote(id: i64, sender: i64, at_secs: i64, text: Option<&str>) -> RemoteMessage {
    RemoteMessage {
        id: MessageId(id),
        sender_id: Some(sender),
        sender_name: Some(format!("user{sender}")),
        sender_username: None,
        sent_at: Some(
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap() + chrono::Duration::seconds(at_secs),
        ),
        text: text.map(str::to_string),
        reply_to_id: None,
        quote_text: None,
        media: None,
    }
}

fn with_media(mut msg: RemoteMessage, remote_ref: &str) -> RemoteMessage {
    msg.media = Some(MediaRef::pending(MediaKind::Photo, remote_ref, Some("jpg".into())));
    msg
}

fn governor() -> Arc<RateGovernor> {
    Arc::new(RateGovernor::new(GovernorConfig {
        jitter_cap: Duration::ZERO,
        ..Default::default()
    }))
}

fn export_cfg() -> ExportConfig {
    ExportConfig {
        chat_id: Some(CHAT),
        page_size: 3,
        ..Default::default()
    }
}

fn coordinator(client: Arc<ScriptedClient>) -> ExportCoordinator {
    ExportCoordinator::new(client, governor(), export_cfg(), RetryPolicy::default())
}

fn two_pages() -> Vec<Vec<RemoteMessage>> {
    vec![
        vec![
            remote(1, 9, 0, Some("first")),
            remote(2, 9, 5, Some("second")),
            with_media(remote(3, 9, 10, Some("photo caption")), "ref-3"),
        ],
        vec![
            remote(4, 8, 60, None),
            with_media(remote(5, 8, 65, None), "ref-5"),
        ],
    ]
}

#[tokio::test(start_paused = true)]
async fn export_writes_manifest_media_and_summary() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = ExportDir::create(tmp.path(), "My Chat", ChatId(CHAT)).unwrap();
    let client = Arc::new(ScriptedClient::new(two_pages()));
    let job = JobHandle::new();

    let summary = coordinator(client.clone()).run(&dir, &job).await.unwrap();

    assert_eq!(summary.messages, 5);
    assert_eq!(summary.text_messages, 3);
    assert_eq!(summary.media_complete, 2);
    assert_eq!(summary.media_failed, 0);
    assert!(!summary.cancelled);
    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(client.list_calls.load(Ordering::SeqCst), 2);

    let records = load_manifest(&dir.manifest_path()).unwrap();
    assert_eq!(records.len(), 5);
    // Order keys are assigned in listing order, strictly increasing.
    let keys: Vec<u64> = records.iter().map(|m| m.order_key.0).collect();
    assert_eq!(keys, vec![1, 2, 3, 4, 5]);

    for record in &records {
        if let Some(media) = &record.media {
            assert_eq!(media.download_state, DownloadState::Complete);
            let path = media.local_path.as_ref().unwrap();
            assert!(path.exists());
            assert!(path.starts_with(dir.media_dir()));
        }
    }
    assert!(dir.summary_path().exists());

    let snap = job.snapshot();
    assert_eq!(snap.processed, 5);
    assert_eq!(snap.media_messages, 2);
}

#[tokio::test(start_paused = true)]
async fn completed_export_rerun_makes_no_remote_calls() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = ExportDir::create(tmp.path(), "My Chat", ChatId(CHAT)).unwrap();
    let first = Arc::new(ScriptedClient::new(two_pages()));
    coordinator(first).run(&dir, &JobHandle::new()).await.unwrap();

    let second = Arc::new(ScriptedClient::new(two_pages()));
    let job = JobHandle::new();
    let summary = coordinator(second.clone()).run(&dir, &job).await.unwrap();

    assert_eq!(summary.messages, 5);
    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(second.list_calls.load(Ordering::SeqCst), 0);
    assert_eq!(second.download_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_export_leaves_a_resumable_manifest() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = ExportDir::create(tmp.path(), "My Chat", ChatId(CHAT)).unwrap();
    let job = JobHandle::new();
    let mut client = ScriptedClient::new(two_pages());
    client.cancel_after_list = Some((1, job.clone()));
    let client = Arc::new(client);

    let summary = coordinator(client.clone()).run(&dir, &job).await.unwrap();

    assert!(summary.cancelled);
    assert_eq!(job.status(), JobStatus::Cancelled);
    assert!(!dir.summary_path().exists(), "cancelled run must not mark completion");
    // Page one landed, page two was never listed.
    let records = load_manifest(&dir.manifest_path()).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(client.list_calls.load(Ordering::SeqCst), 1);
    // In-flight downloads ran to completion: no pending media left behind.
    for record in &records {
        if let Some(media) = &record.media {
            assert_eq!(media.download_state, DownloadState::Complete);
        }
    }

    // Resume: already-archived ids are skipped, the rest is exported.
    let resume_client = Arc::new(ScriptedClient::new(two_pages()));
    let resume_job = JobHandle::new();
    let resumed = coordinator(resume_client.clone())
        .run(&dir, &resume_job)
        .await
        .unwrap();

    assert_eq!(resumed.messages, 5);
    assert_eq!(resume_job.status(), JobStatus::Completed);
    let records = load_manifest(&dir.manifest_path()).unwrap();
    let ids: HashSet<i64> = records.iter().map(|m| m.id.0).collect();
    assert_eq!(ids.len(), 5, "no duplicates after resume");
    // Only the two messages new to the manifest were downloaded.
    assert_eq!(resume_client.download_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_download_is_retried_on_rerun_without_relisting() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = ExportDir::create(tmp.path(), "My Chat", ChatId(CHAT)).unwrap();
    let mut client = ScriptedClient::new(two_pages());
    client.broken_refs.insert("ref-5".into());
    let client = Arc::new(client);

    let summary = coordinator(client).run(&dir, &JobHandle::new()).await.unwrap();
    assert_eq!(summary.media_complete, 1);
    assert_eq!(summary.media_failed, 1);
    assert!(dir.summary_path().exists(), "failed media does not block completion");

    // Second run: the marker skips listing, the failed item is re-fetched.
    let retry_client = Arc::new(ScriptedClient::new(two_pages()));
    let retried = coordinator(retry_client.clone())
        .run(&dir, &JobHandle::new())
        .await
        .unwrap();

    assert_eq!(retry_client.list_calls.load(Ordering::SeqCst), 0);
    assert_eq!(retry_client.download_calls.load(Ordering::SeqCst), 1);
    assert_eq!(retried.media_complete, 2);
    assert_eq!(retried.media_failed, 0);

    let loaded = ExportSummary::read(&dir.summary_path()).unwrap().unwrap();
    assert_eq!(loaded.media_failed, 0);
}

#[tokio::test(start_paused = true)]
async fn exported_chat_redelivers_with_batching_and_reply_remap() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = ExportDir::create(tmp.path(), "My Chat", ChatId(CHAT)).unwrap();

    let mut reply = remote(4, 7, 20, Some("replying to the start"));
    reply.reply_to_id = Some(MessageId(1));
    let pages = vec![vec![
        remote(1, 9, 0, Some("one")),
        remote(2, 9, 5, Some("two")),
        remote(3, 9, 10, Some("three")),
        reply,
    ]];
    let export_client = Arc::new(ScriptedClient::new(pages));
    coordinator(export_client).run(&dir, &JobHandle::new()).await.unwrap();

    let mut resend = ResendConfig {
        target_chat_id: Some(999),
        send_spacing: Duration::from_millis(10),
        ..Default::default()
    };
    resend.batch.enabled = true;

    let send_client = Arc::new(ScriptedClient::new(Vec::new()));
    let engine = RedeliveryEngine::new(send_client.clone(), governor(), resend, RetryPolicy::default());
    let job = JobHandle::new();
    let report = engine.run(&dir, &job).await.unwrap();

    // Messages 1-3 merge into one unit; the reply is delivered solo.
    assert_eq!(report.delivered_units, 2);
    assert_eq!(report.delivered_messages, 4);
    assert_eq!(job.status(), JobStatus::Completed);

    let sends = send_client.sends.lock().unwrap();
    assert_eq!(sends.len(), 2);
    let merged = sends[0].html.as_deref().unwrap();
    assert!(merged.contains("one\n\ntwo\n\nthree"));
    // The reply targets the destination id of the merged unit.
    assert_eq!(sends[1].reply_to, Some(MessageId(100)));
    assert_eq!(report.remap.get(MessageId(2)), Some(MessageId(100)));
    assert_eq!(report.remap.get(MessageId(4)), Some(MessageId(101)));
}
