//! Maildir-style durable mailboxes.
//!
//! Each endpoint owns `{dataDir}/{hash}/{new,cur,failed}/`. An envelope
//! exists in exactly one of the three directories at any instant; movement
//! between them is always an atomic rename, never a copy-then-delete, so a
//! crash mid-publish leaves either the old state or the new one, never a
//! partial file.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use relay_types::{DeadLetter, DeadLetterReason, Envelope, MessageId, RelayError};

const NEW: &str = "new";
const CUR: &str = "cur";
const FAILED: &str = "failed";

/// Durable per-endpoint mailbox store rooted at a single `dataDir`.
pub struct MaildirStore {
    data_dir: PathBuf,
}

impl MaildirStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Create `new/`, `cur/`, `failed/` for an endpoint if they don't exist.
    /// Called whenever an endpoint is registered; idempotent.
    pub fn ensure_endpoint_dirs(&self, endpoint_hash: &str) -> Result<(), RelayError> {
        for sub in [NEW, CUR, FAILED] {
            fs::create_dir_all(self.endpoint_dir(endpoint_hash).join(sub))
                .map_err(|e| RelayError::Io(e.to_string()))?;
        }
        Ok(())
    }

    fn endpoint_dir(&self, endpoint_hash: &str) -> PathBuf {
        self.data_dir.join(endpoint_hash)
    }

    fn path_in(&self, endpoint_hash: &str, subdir: &str, id: MessageId) -> PathBuf {
        self.endpoint_dir(endpoint_hash)
            .join(subdir)
            .join(format!("{id}.json"))
    }

    /// Serialize `envelope` to a temp file on the same filesystem, fsync,
    /// then rename into `new/{id}.json`.
    pub fn write(&self, endpoint_hash: &str, envelope: &Envelope) -> Result<(), RelayError> {
        let dest = self.path_in(endpoint_hash, NEW, envelope.id);
        atomic_write_json(&dest, envelope)
    }

    /// Rename `new/{id}.json` -> `cur/{id}.json`. The rename is the
    /// linearization point: at most one of two concurrent claimers wins.
    pub fn claim(&self, endpoint_hash: &str, message_id: MessageId) -> Result<Envelope, RelayError> {
        let src = self.path_in(endpoint_hash, NEW, message_id);
        let dest = self.path_in(endpoint_hash, CUR, message_id);
        let envelope = read_envelope_file(&src)?.ok_or(RelayError::NotFound)?;
        fs::rename(&src, &dest).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RelayError::NotFound,
            _ => RelayError::Io(e.to_string()),
        })?;
        fsync_parent_dir(&dest);
        Ok(envelope)
    }

    /// Unlink `cur/{id}.json`. Missing file is not an error.
    pub fn complete(&self, endpoint_hash: &str, message_id: MessageId) -> Result<(), RelayError> {
        let path = self.path_in(endpoint_hash, CUR, message_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                fsync_parent_dir(&path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RelayError::Io(e.to_string())),
        }
    }

    /// Write the sidecar reason, then rename `cur/{id}.json` -> `failed/{id}.json`.
    pub fn fail(
        &self,
        endpoint_hash: &str,
        message_id: MessageId,
        reason: &str,
    ) -> Result<(), RelayError> {
        let sidecar = self.reason_path(endpoint_hash, message_id);
        atomic_write_json(
            &sidecar,
            &DeadLetterReason {
                reason: reason.to_string(),
                failed_at: Utc::now(),
            },
        )?;

        let src = self.path_in(endpoint_hash, CUR, message_id);
        let dest = self.path_in(endpoint_hash, FAILED, message_id);
        fs::rename(&src, &dest).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RelayError::NotFound,
            _ => RelayError::Io(e.to_string()),
        })?;
        fsync_parent_dir(&dest);
        Ok(())
    }

    /// Rejection path for envelopes that never entered `new/` (access/budget
    /// denied): write envelope + sidecar straight into `failed/`.
    pub fn fail_direct(
        &self,
        endpoint_hash: &str,
        envelope: &Envelope,
        reason: &str,
    ) -> Result<(), RelayError> {
        let dest = self.path_in(endpoint_hash, FAILED, envelope.id);
        atomic_write_json(&dest, envelope)?;
        atomic_write_json(
            &self.reason_path(endpoint_hash, envelope.id),
            &DeadLetterReason {
                reason: reason.to_string(),
                failed_at: Utc::now(),
            },
        )?;
        Ok(())
    }

    fn reason_path(&self, endpoint_hash: &str, id: MessageId) -> PathBuf {
        self.endpoint_dir(endpoint_hash)
            .join(FAILED)
            .join(format!("{id}.reason.json"))
    }

    pub fn list_new(&self, endpoint_hash: &str) -> Result<Vec<MessageId>, RelayError> {
        self.list_ids(endpoint_hash, NEW)
    }

    pub fn list_current(&self, endpoint_hash: &str) -> Result<Vec<MessageId>, RelayError> {
        self.list_ids(endpoint_hash, CUR)
    }

    pub fn list_failed(&self, endpoint_hash: &str) -> Result<Vec<MessageId>, RelayError> {
        self.list_ids(endpoint_hash, FAILED)
    }

    /// IDs sorted ascending (ULID order = chronological). Non-`.json` files
    /// and `.reason.json` sidecars are ignored.
    fn list_ids(&self, endpoint_hash: &str, subdir: &str) -> Result<Vec<MessageId>, RelayError> {
        let dir = self.endpoint_dir(endpoint_hash).join(subdir);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RelayError::Io(e.to_string())),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RelayError::Io(e.to_string()))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if stem.ends_with(".reason") {
                continue;
            }
            if let Ok(id) = stem.parse::<MessageId>() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Reads an envelope from a given subdirectory; `None` on ENOENT or a
    /// parse error rather than propagating an error.
    pub fn read_envelope(
        &self,
        endpoint_hash: &str,
        subdir: &str,
        message_id: MessageId,
    ) -> Result<Option<Envelope>, RelayError> {
        read_envelope_file(&self.path_in(endpoint_hash, subdir, message_id))
    }

    /// Reads a dead letter: the envelope plus its sidecar (or `None` if the
    /// sidecar is missing — callers report reason `unknown`).
    pub fn read_dead_letter(
        &self,
        endpoint_hash: &str,
        message_id: MessageId,
    ) -> Result<Option<DeadLetter>, RelayError> {
        let Some(envelope) = self.read_envelope(endpoint_hash, FAILED, message_id)? else {
            return Ok(None);
        };
        let reason = fs::read(self.reason_path(endpoint_hash, message_id))
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());
        Ok(Some(DeadLetter { envelope, reason }))
    }
}

fn read_envelope_file(path: &Path) -> Result<Option<Envelope>, RelayError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Envelope::from_canonical_json(&bytes).ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(RelayError::Io(e.to_string())),
    }
}

/// Best-effort fsync of the parent directory after a rename, so the
/// directory-entry update itself is durable across a crash. Silently
/// ignored on platforms that don't support opening a directory for sync.
fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), RelayError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| RelayError::Io(e.to_string()))?;
    }
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec(value).map_err(|e| RelayError::Serialization(e.to_string()))?;

    {
        let mut f = fs::File::create(&tmp).map_err(|e| RelayError::Io(e.to_string()))?;
        f.write_all(&data).map_err(|e| RelayError::Io(e.to_string()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).map_err(|e| RelayError::Io(e.to_string()))?;
    fsync_parent_dir(path);
    Ok(())
}
