//! Durable export manifest and on-disk layout.
//!
//! The manifest is a JSON-lines file: one record per line, append-only while
//! an export runs. Records are keyed by `order_key`; appending a record with
//! an existing key updates it (last complete record wins), which is how media
//! download results land without rewriting the file. A truncated trailing
//! line — the tell-tale of a crash mid-write — is discarded on load.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    domain::{ChatId, OrderKey, SourceMessage},
    Error, Result,
};

pub const MANIFEST_FILE: &str = "messages.jsonl";
pub const MEDIA_DIR: &str = "media";
pub const SUMMARY_FILE: &str = "export_summary.json";

const FOLDER_NAME_MAX: usize = 100;

/// Build a filesystem-safe export folder name: invalid characters replaced,
/// trimmed, length-capped, chat id appended for uniqueness.
pub fn sanitize_folder_name(name: &str, chat_id: ChatId) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == ' ');
    let capped: String = trimmed.chars().take(FOLDER_NAME_MAX).collect();
    format!("{capped}_{}", chat_id.0)
}

/// One export's directory: the manifest file plus a media subdirectory keyed
/// by content hash. Owned exclusively by the export coordinator while an
/// export runs; read-only for batching and redelivery.
#[derive(Clone, Debug)]
pub struct ExportDir {
    root: PathBuf,
}

impl ExportDir {
    /// Create (or reuse) the export directory for a chat under `base`.
    pub fn create(base: &Path, chat_title: &str, chat_id: ChatId) -> Result<Self> {
        let root = base.join(sanitize_folder_name(chat_title, chat_id));
        fs::create_dir_all(root.join(MEDIA_DIR))?;
        Ok(Self { root })
    }

    /// Open an existing export directory (e.g. for redelivery or resume).
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "export directory not found: {}",
                root.display()
            )));
        }
        fs::create_dir_all(root.join(MEDIA_DIR))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.root.join(SUMMARY_FILE)
    }

    pub fn media_dir(&self) -> PathBuf {
        self.root.join(MEDIA_DIR)
    }

    /// Final content-addressed path for a downloaded attachment. Files here
    /// are created once and never overwritten.
    pub fn media_path(&self, content_hash: &str, file_ext: Option<&str>) -> PathBuf {
        let name = match file_ext {
            Some(ext) if !ext.is_empty() => format!("{content_hash}.{}", ext.trim_start_matches('.')),
            _ => content_hash.to_string(),
        };
        self.media_dir().join(name)
    }
}

/// Append-only manifest writer. Every record is flushed before `append`
/// returns so a crash can lose at most the line being written.
pub struct ManifestWriter {
    file: File,
    path: PathBuf,
}

impl ManifestWriter {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn append(&mut self, message: &SourceMessage) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        debug!(order_key = message.order_key.0, id = message.id.0, path = %self.path.display(), "manifest record appended");
        Ok(())
    }
}

/// Load a manifest, applying last-record-wins per `order_key`.
///
/// Returns messages in strictly increasing `order_key` order. A missing file
/// is an empty manifest. A parse failure on the final line is treated as a
/// torn write and discarded; anywhere else it is corruption and fatal.
///
/// The writer only ever appends a new key greater than every key before it;
/// re-appearing keys are media-state updates. A record introducing a new key
/// below the running maximum can therefore only be corruption and is fatal.
pub fn load_manifest(path: &Path) -> Result<Vec<SourceMessage>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let lines: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;

    let mut records: BTreeMap<OrderKey, SourceMessage> = BTreeMap::new();
    let mut max_key: Option<OrderKey> = None;
    let last_idx = lines.len().saturating_sub(1);

    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SourceMessage>(line) {
            Ok(msg) => {
                let key = msg.order_key;
                if !records.contains_key(&key) {
                    if max_key.is_some_and(|max| key < max) {
                        return Err(Error::Manifest {
                            path: path.to_path_buf(),
                            reason: format!(
                                "order key {} out of sequence at line {}",
                                key.0,
                                idx + 1
                            ),
                        });
                    }
                    max_key = Some(key);
                }
                records.insert(key, msg);
            }
            Err(e) if idx == last_idx => {
                warn!(path = %path.display(), error = %e, "discarding truncated trailing manifest record");
            }
            Err(e) => {
                return Err(Error::Manifest {
                    path: path.to_path_buf(),
                    reason: format!("unreadable record at line {}: {e}", idx + 1),
                });
            }
        }
    }

    Ok(records.into_values().collect())
}
