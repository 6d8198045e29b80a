//! The round-updates log and its file-backed monotonic counters.
//!
//! The log is the serialization every node observes: an append-only,
//! index-ordered sequence of signed [`RoundInfo`] records with strictly
//! monotonic, gap-free update ids. Consumers subscribe by supplying the
//! last id they have seen.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use ed25519_dalek::SigningKey;
use parking_lot::RwLock;

use mixnet_common::crypto;

use crate::error::RegistrarError;
use crate::wire::RoundInfo;

/// A monotonic id counter persisted to a text file so restarts never
/// reuse ids.
pub struct MonotonicCounter {
    path: PathBuf,
    value: AtomicU64,
}

impl MonotonicCounter {
    /// Load the counter from `path`, starting at zero when the file does
    /// not exist yet.
    pub fn load(path: PathBuf) -> Result<Self, RegistrarError> {
        let value = match fs::read_to_string(&path) {
            Ok(s) => s.trim().parse::<u64>().map_err(|e| {
                RegistrarError::Fatal(format!(
                    "counter file {} is corrupt: {}",
                    path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(RegistrarError::Fatal(format!(
                    "could not read counter file {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Ok(MonotonicCounter {
            path,
            value: AtomicU64::new(value),
        })
    }

    /// Allocate the next id and persist it.
    pub fn next(&self) -> Result<u64, RegistrarError> {
        let next = self.value.fetch_add(1, Ordering::SeqCst) + 1;
        fs::write(&self.path, next.to_string()).map_err(|e| {
            RegistrarError::Fatal(format!(
                "could not persist counter file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(next)
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

/// Append-only log of signed round updates.
pub struct UpdateLog {
    entries: RwLock<Vec<RoundInfo>>,
    counter: MonotonicCounter,
}

impl UpdateLog {
    pub fn new(counter: MonotonicCounter) -> Self {
        UpdateLog {
            entries: RwLock::new(Vec::new()),
            counter,
        }
    }

    /// Assign the next update id to `info`, sign it, and append it.
    ///
    /// Id allocation happens under the log's write lock, which is what
    /// keeps the sequence gap-free: an id never escapes without its entry
    /// landing in the log.
    pub fn add(&self, mut info: RoundInfo, key: &SigningKey) -> Result<u64, RegistrarError> {
        let mut entries = self.entries.write();
        let update_id = self.counter.next()?;
        info.update_id = update_id;
        info.signature = crypto::sign(key, &info.signing_bytes());
        entries.push(info);
        Ok(update_id)
    }

    /// Every update with id greater than `last_seen`, in order.
    pub fn get_updates_since(&self, last_seen: u64) -> Vec<RoundInfo> {
        self.entries
            .read()
            .iter()
            .filter(|info| info.update_id > last_seen)
            .cloned()
            .collect()
    }

    pub fn last_update_id(&self) -> u64 {
        self.counter.current()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixnet_common::crypto::{generate_signing_key, public_key_bytes};
    use mixnet_common::round::NUM_PHASES;
    use mixnet_common::{NodeId, RoundPhase};
    use tempfile::tempdir;

    fn info(round_id: u64, phase: RoundPhase) -> RoundInfo {
        RoundInfo {
            id: round_id,
            update_id: 0,
            phase,
            batch_size: 32,
            topology: vec![NodeId::new([1; 32])],
            timestamps: [0; NUM_PHASES],
            errors: vec![],
            signature: vec![],
        }
    }

    #[test]
    fn test_counter_starts_at_zero_and_persists() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("updateId.txt");

        let counter = MonotonicCounter::load(path.clone()).expect("load");
        assert_eq!(counter.current(), 0);
        assert_eq!(counter.next().expect("next"), 1);
        assert_eq!(counter.next().expect("next"), 2);

        // A reload resumes where the file left off.
        let reloaded = MonotonicCounter::load(path).expect("reload");
        assert_eq!(reloaded.current(), 2);
        assert_eq!(reloaded.next().expect("next"), 3);
    }

    #[test]
    fn test_counter_rejects_corrupt_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("roundId.txt");
        std::fs::write(&path, "not a number").expect("write");
        assert!(MonotonicCounter::load(path).is_err());
    }

    #[test]
    fn test_log_ids_are_monotonic_and_gap_free() {
        let dir = tempdir().expect("tempdir");
        let key = generate_signing_key();
        let log = UpdateLog::new(
            MonotonicCounter::load(dir.path().join("updateId.txt")).expect("counter"),
        );

        for i in 0..5 {
            log.add(info(1, RoundPhase::Precomputing), &key).expect("add");
            assert_eq!(log.last_update_id(), i + 1);
        }

        let all = log.get_updates_since(0);
        let ids: Vec<u64> = all.iter().map(|u| u.update_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_get_updates_since_filters() {
        let dir = tempdir().expect("tempdir");
        let key = generate_signing_key();
        let log = UpdateLog::new(
            MonotonicCounter::load(dir.path().join("updateId.txt")).expect("counter"),
        );
        for _ in 0..4 {
            log.add(info(1, RoundPhase::Standby), &key).expect("add");
        }

        assert_eq!(log.get_updates_since(0).len(), 4);
        assert_eq!(log.get_updates_since(2).len(), 2);
        assert_eq!(log.get_updates_since(4).len(), 0);
        assert_eq!(log.get_updates_since(99).len(), 0);
    }

    #[test]
    fn test_log_entries_are_signed() {
        let dir = tempdir().expect("tempdir");
        let key = generate_signing_key();
        let log = UpdateLog::new(
            MonotonicCounter::load(dir.path().join("updateId.txt")).expect("counter"),
        );
        log.add(info(3, RoundPhase::Queued), &key).expect("add");

        let entry = &log.get_updates_since(0)[0];
        let ok = crypto::verify(
            &public_key_bytes(&key),
            &entry.signing_bytes(),
            &entry.signature,
        )
        .expect("verify");
        assert!(ok);
    }
}
