//! Dead-letter queue: composes `MaildirStore` + `SqliteIndex`. Never a
//! second source of truth — every operation here reads or writes Maildir
//! first and keeps the index consistent with it, never the reverse.

use chrono::{DateTime, Utc};
use relay_maildir::MaildirStore;
use relay_types::{DeadLetter, Envelope, MessageId, MessageStatus, RelayError};

use relay_index::{QueryFilters, SqliteIndex};

pub struct DeadLetterQueue<'a> {
    maildir: &'a MaildirStore,
    index: &'a SqliteIndex,
}

impl<'a> DeadLetterQueue<'a> {
    pub fn new(maildir: &'a MaildirStore, index: &'a SqliteIndex) -> Self {
        Self { maildir, index }
    }

    /// Dead-letter an envelope that never entered `new/` (budget/access
    /// denial). Writes the envelope + sidecar to `failed/`, then indexes it.
    pub fn reject(&self, endpoint_hash: &str, envelope: &Envelope, reason: &str) -> Result<(), RelayError> {
        self.maildir.fail_direct(endpoint_hash, envelope, reason)?;
        self.index.insert_message(&relay_types::IndexedMessageRow {
            id: envelope.id,
            subject: envelope.subject.clone(),
            endpoint_hash: endpoint_hash.to_string(),
            status: MessageStatus::Failed,
            created_at: envelope.created_at,
            expires_at: None,
            sender: Some(envelope.from.clone()),
        })
    }

    /// When `endpoint_hash` is given, scans `failed/` directly; otherwise
    /// queries the index across all endpoints and joins each row with its
    /// sidecar.
    pub fn list_dead(&self, endpoint_hash: Option<&str>) -> Result<Vec<DeadLetter>, RelayError> {
        match endpoint_hash {
            Some(hash) => {
                let ids = self.maildir.list_failed(hash)?;
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(dl) = self.maildir.read_dead_letter(hash, id)? {
                        out.push(dl);
                    }
                }
                Ok(out)
            }
            None => {
                let page = self.index.query_messages(
                    &QueryFilters {
                        status: Some(MessageStatus::Failed),
                        ..Default::default()
                    },
                    None,
                    usize::MAX,
                )?;
                let mut out = Vec::with_capacity(page.messages.len());
                for row in page.messages {
                    if let Some(dl) = self.maildir.read_dead_letter(&row.endpoint_hash, row.id)? {
                        out.push(dl);
                    }
                }
                Ok(out)
            }
        }
    }

    /// Removes envelope + sidecar + index row for every dead letter older
    /// than `max_age_ms`. Eligibility is based on the sidecar's `failed_at`,
    /// falling back to the index's `created_at` when the sidecar is
    /// missing; if neither is available, the row is purged rather than
    /// retained indefinitely.
    pub fn purge(
        &self,
        max_age_ms: i64,
        endpoint_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, RelayError> {
        let candidates: Vec<(String, MessageId)> = match endpoint_hash {
            Some(hash) => self
                .maildir
                .list_failed(hash)?
                .into_iter()
                .map(|id| (hash.to_string(), id))
                .collect(),
            None => {
                let page = self.index.query_messages(
                    &QueryFilters {
                        status: Some(MessageStatus::Failed),
                        ..Default::default()
                    },
                    None,
                    usize::MAX,
                )?;
                page.messages
                    .into_iter()
                    .map(|row| (row.endpoint_hash, row.id))
                    .collect()
            }
        };

        let mut purged = 0u64;
        for (hash, id) in candidates {
            let dead = self.maildir.read_dead_letter(&hash, id)?;
            let failed_at = dead.as_ref().and_then(|d| d.reason.as_ref()).map(|r| r.failed_at);
            let eligible = match failed_at {
                Some(failed_at) => (now - failed_at).num_milliseconds() >= max_age_ms,
                None => true,
            };
            if eligible {
                self.remove_dead_letter(&hash, id)?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn remove_dead_letter(&self, endpoint_hash: &str, id: MessageId) -> Result<(), RelayError> {
        let dir = self.maildir.data_dir().join(endpoint_hash).join("failed");
        let _ = std::fs::remove_file(dir.join(format!("{id}.json")));
        let _ = std::fs::remove_file(dir.join(format!("{id}.reason.json")));
        self.index.delete_row(id)?;
        Ok(())
    }
}
