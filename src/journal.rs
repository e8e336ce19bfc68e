//! Transition journal (spec.md §4.5): append-only line-delimited
//! record stream, startup restoration into the store, and a scheduled
//! retention pruner that atomically rewrites the file in place.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::JournalError;
use crate::store::ServiceStore;
use crate::types::{split_service_key, Event, ServiceKey, TransitionRecord};

const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Owns the journal's single append file descriptor, shared under one
/// lock so the pruner can rewrite the file and reopen the descriptor
/// without a writer ever appending against the stale inode in between
/// (spec.md §9 "Journal reopen coordination").
pub struct Journal {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl Journal {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Journal { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Appends one record as a full line under the writer lock. A
    /// partial write is surfaced as an error but never corrupts framing
    /// since each write is a single complete line.
    pub async fn record(&self, record: &TransitionRecord) -> Result<(), JournalError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<TransitionRecord>, JournalError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_records(&contents))
    }

    /// Restores service status from the journal (spec.md §4.5
    /// "Restoration contract"). For every key whose service already
    /// exists, patches `status`/`lastStateChange` only if the service
    /// has not yet been probed. Keys whose service is absent are
    /// returned so the caller can keep them pending until a
    /// `Discovered` event arrives for that key.
    pub async fn restore_history(
        &self,
        store: &ServiceStore,
    ) -> Result<HashMap<ServiceKey, TransitionRecord>, JournalError> {
        let records = self.read_all().await?;
        let latest = latest_per_key(records);

        let mut pending = HashMap::new();
        for (key, record) in latest {
            match store.get(&key.0, &key.1).await {
                Some(svc) if svc.last_checked.is_none() => {
                    let record = record.clone();
                    store
                        .update(&key.0, &key.1, move |s| {
                            s.status = record.next;
                            s.last_state_change = Some(record.ts);
                        })
                        .await;
                }
                Some(_) => {}
                None => {
                    pending.insert(key, record);
                }
            }
        }
        Ok(pending)
    }

    /// Runs one prune pass: reads the whole file, drops records older
    /// than `cutoff = now - retentionDays` and any malformed lines, and
    /// rewrites the file atomically only if something actually changed
    /// (preserving mtime on a no-op pass). Returns whether a rewrite
    /// happened.
    async fn prune_once(&self, retention_days: i64) -> Result<bool, JournalError> {
        let mut guard = self.file.lock().await;
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let cutoff = Utc::now() - ChronoDuration::days(retention_days.max(1));

        let mut kept_lines = Vec::new();
        let mut saw_malformed = false;
        let mut total_lines = 0usize;
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            total_lines += 1;
            match serde_json::from_str::<TransitionRecord>(line) {
                Ok(rec) if rec.ts >= cutoff => kept_lines.push(line.to_string()),
                Ok(_) => {}
                Err(_) => saw_malformed = true,
            }
        }

        if !saw_malformed && kept_lines.len() == total_lines {
            return Ok(false);
        }

        let tmp_path = PathBuf::from(format!("{}.tmp", self.path.display()));
        let mut body = kept_lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        let write_result = async {
            let mut tmp = tokio::fs::File::create(&tmp_path).await?;
            tmp.write_all(body.as_bytes()).await?;
            tmp.sync_all().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;
        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        tokio::fs::rename(&tmp_path, &self.path).await?;

        let reopened = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        *guard = reopened;
        Ok(true)
    }

    /// Flushes the writer's file descriptor (spec.md §4.5 "close():
    /// flush and close the descriptor"). The descriptor itself is
    /// released when the last `Arc<Journal>` drops; this only ensures
    /// buffered bytes have reached the OS before shutdown proceeds.
    pub async fn close(&self) {
        let mut file = self.file.lock().await;
        if let Err(e) = file.flush().await {
            warn!(error = %e, "failed to flush journal on shutdown");
        }
    }

    /// Runs immediately on start, then every 24 hours, until
    /// `cancellation` fires.
    pub async fn run_pruner(&self, retention_days: i64, cancellation: CancellationToken) {
        loop {
            match self.prune_once(retention_days).await {
                Ok(true) => info!(retention_days, "journal pruned"),
                Ok(false) => debug!("journal prune pass found nothing to prune"),
                Err(e) => warn!(error = %e, "journal prune failed, original file preserved"),
            }
            tokio::select! {
                _ = cancellation.cancelled() => return,
                _ = tokio::time::sleep(PRUNE_INTERVAL) => {}
            }
        }
    }
}

fn parse_records(contents: &str) -> Vec<TransitionRecord> {
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str::<TransitionRecord>(l).ok())
        .collect()
}

fn latest_per_key(records: Vec<TransitionRecord>) -> HashMap<ServiceKey, TransitionRecord> {
    let mut latest: HashMap<ServiceKey, TransitionRecord> = HashMap::new();
    for record in records {
        let Some((ns, name)) = split_service_key(&record.svc) else { continue };
        let key: ServiceKey = (ns.to_string(), name.to_string());
        match latest.get(&key) {
            Some(existing) if existing.ts >= record.ts => {}
            _ => {
                latest.insert(key, record);
            }
        }
    }
    latest
}

/// Applies a journal record that was pending at startup (its service
/// key had no matching store entry yet) the moment that service is
/// `Discovered`, then drops it from the pending set. Runs until
/// `cancellation` fires or the store's event channel closes.
pub async fn run_pending_apply(
    pending: Arc<Mutex<HashMap<ServiceKey, TransitionRecord>>>,
    store: ServiceStore,
    cancellation: CancellationToken,
) {
    let (_id, mut rx) = store.subscribe().await;
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => return,
            maybe = rx.recv() => {
                let Some(event) = maybe else { return };
                if let Event::Discovered(svc) = &*event {
                    let key = svc.key();
                    let record = {
                        let mut guard = pending.lock().await;
                        guard.remove(&key)
                    };
                    if let Some(record) = record {
                        store
                            .update(&key.0, &key.1, move |s| {
                                if s.last_checked.is_none() {
                                    s.status = record.next;
                                    s.last_state_change = Some(record.ts);
                                }
                            })
                            .await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Service, Status};
    use chrono::TimeZone;

    fn record(ts_secs: i64, svc: &str, prev: Status, next: Status) -> TransitionRecord {
        TransitionRecord {
            ts: Utc.timestamp_opt(ts_secs, 0).unwrap(),
            svc: svc.to_string(),
            prev,
            next,
            code: None,
            ms: None,
        }
    }

    #[tokio::test]
    async fn record_then_read_all_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path().join("history.jsonl")).await.unwrap();
        journal.record(&record(1000, "default/web", Status::Unknown, Status::Healthy)).await.unwrap();
        let records = journal.read_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].svc, "default/web");
    }

    #[tokio::test]
    async fn restore_patches_existing_service_only_if_unchecked() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path().join("history.jsonl")).await.unwrap();
        journal
            .record(&record(1000, "default/web", Status::Unknown, Status::Unhealthy))
            .await
            .unwrap();
        journal
            .record(&record(2000, "default/web", Status::Unhealthy, Status::Healthy))
            .await
            .unwrap();

        let store = ServiceStore::new();
        store
            .add_or_update(Service::new_kubernetes("default".into(), "web".into(), "http://web".into()))
            .await;

        let pending = journal.restore_history(&store).await.unwrap();
        assert!(pending.is_empty());
        let svc = store.get("default", "web").await.unwrap();
        assert_eq!(svc.status, Status::Healthy);
        assert_eq!(svc.last_state_change, Some(Utc.timestamp_opt(2000, 0).unwrap()));
    }

    #[tokio::test]
    async fn restore_does_not_clobber_an_already_probed_service() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path().join("history.jsonl")).await.unwrap();
        journal
            .record(&record(1000, "default/web", Status::Unknown, Status::Unhealthy))
            .await
            .unwrap();

        let store = ServiceStore::new();
        let mut svc = Service::new_kubernetes("default".into(), "web".into(), "http://web".into());
        svc.last_checked = Some(Utc::now());
        svc.status = Status::Healthy;
        store.add_or_update(svc).await;

        journal.restore_history(&store).await.unwrap();
        let svc = store.get("default", "web").await.unwrap();
        assert_eq!(svc.status, Status::Healthy);
    }

    #[tokio::test]
    async fn restore_keeps_unknown_keys_pending() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path().join("history.jsonl")).await.unwrap();
        journal
            .record(&record(1000, "default/web", Status::Unknown, Status::Unhealthy))
            .await
            .unwrap();

        let store = ServiceStore::new();
        let pending = journal.restore_history(&store).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending.contains_key(&("default".to_string(), "web".to_string())));
    }

    #[tokio::test]
    async fn prune_drops_old_records_and_keeps_recent_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let journal = Journal::open(&path).await.unwrap();
        let old = Utc::now() - ChronoDuration::days(40);
        let recent = Utc::now() - ChronoDuration::hours(1);
        journal
            .record(&TransitionRecord {
                ts: old,
                svc: "default/old".into(),
                prev: Status::Unknown,
                next: Status::Healthy,
                code: None,
                ms: None,
            })
            .await
            .unwrap();
        journal
            .record(&TransitionRecord {
                ts: recent,
                svc: "default/new".into(),
                prev: Status::Unknown,
                next: Status::Healthy,
                code: None,
                ms: None,
            })
            .await
            .unwrap();

        let changed = journal.prune_once(30).await.unwrap();
        assert!(changed);
        let remaining = journal.read_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].svc, "default/new");
    }

    #[tokio::test]
    async fn prune_is_a_noop_on_the_second_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let journal = Journal::open(&path).await.unwrap();
        journal
            .record(&record(Utc::now().timestamp(), "default/web", Status::Unknown, Status::Healthy))
            .await
            .unwrap();

        let first = journal.prune_once(30).await.unwrap();
        assert!(!first, "a fresh, all-recent journal should not need rewriting");
        let mtime_after_first = std::fs::metadata(&path).unwrap().modified().unwrap();
        let second = journal.prune_once(30).await.unwrap();
        let mtime_after_second = std::fs::metadata(&path).unwrap().modified().unwrap();

        assert!(!second, "second pass with no new writes must be a no-op");
        assert_eq!(mtime_after_first, mtime_after_second);
    }
}
