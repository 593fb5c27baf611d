//! Store compaction
//!
//! Merges the completed files of one store into a single new generation
//! file, copying only the items the index still points at. The output file
//! is written at a temporary path and renamed into place before any index
//! entry is switched over, so readers always land in a live file (or retry
//! once on a freshly removed one).
//!
//! Index switch-over is compare-and-swap per entry: a concurrent flush that
//! re-wrote an entry wins, and the compacted copy of that item is simply
//! dead weight in the new file until the next compaction. Switch-over can
//! also be paused, which snapshots use to get a stable view of index
//! side-files.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::collections::LongIndex;
use crate::error::Result;
use crate::files::DataFileCollection;

// =============================================================================
// CancelToken
// =============================================================================

/// Cooperative cancellation flag, checked between items
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

// =============================================================================
// PauseGate
// =============================================================================

struct GateState {
    paused: bool,
    in_critical: usize,
}

/// Gate around index switch-over. `pause` blocks until no switch-over is in
/// flight and holds further ones off until `resume`.
pub struct PauseGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                paused: false,
                in_critical: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Block new critical sections and wait for in-flight ones to drain
    pub fn pause(&self) {
        let mut state = self.state.lock();
        state.paused = true;
        while state.in_critical > 0 {
            self.cond.wait(&mut state);
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        self.cond.notify_all();
    }

    /// Enter a critical section, waiting while the gate is paused
    pub fn enter(&self) -> CriticalSection<'_> {
        let mut state = self.state.lock();
        while state.paused {
            self.cond.wait(&mut state);
        }
        state.in_critical += 1;
        CriticalSection { gate: self }
    }
}

pub struct CriticalSection<'a> {
    gate: &'a PauseGate,
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.in_critical -= 1;
        self.gate.cond.notify_all();
    }
}

// =============================================================================
// StoreCompactor
// =============================================================================

/// Extracts the index key of a serialized item, so compaction can check
/// liveness without knowing the item layout
pub type KeyExtractor = Box<dyn Fn(&[u8]) -> Result<i64> + Send + Sync>;

pub struct StoreCompactor {
    name: String,
    files: Arc<DataFileCollection>,
    index: Arc<dyn LongIndex>,
    key_of: KeyExtractor,
    min_files_to_compact: usize,
    pause_gate: Arc<PauseGate>,
}

impl StoreCompactor {
    pub fn new(
        name: impl Into<String>,
        files: Arc<DataFileCollection>,
        index: Arc<dyn LongIndex>,
        key_of: KeyExtractor,
        min_files_to_compact: usize,
        pause_gate: Arc<PauseGate>,
    ) -> Self {
        Self {
            name: name.into(),
            files,
            index,
            key_of,
            min_files_to_compact,
            pause_gate,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run one compaction pass. Returns whether a merge actually happened;
    /// a pass below the file threshold or cancelled mid-copy is a clean
    /// no-op.
    pub fn compact(&self, cancel: &CancelToken) -> Result<bool> {
        // Snapshot the file set up front; files completed by concurrent
        // flushes after this point are left for the next pass
        let files_to_merge = self.files.completed_files();
        if files_to_merge.len() < self.min_files_to_compact {
            return Ok(false);
        }
        let merged_indices: Vec<u32> = files_to_merge.iter().map(|f| f.index()).collect();
        debug!(
            store = %self.name,
            files = files_to_merge.len(),
            "compaction pass starting"
        );

        let mut writer = self.files.new_compaction_writer()?;
        // (key, old location, new location), applied after the file is live
        let mut moves: Vec<(i64, u64, u64)> = Vec::new();
        let mut copied = 0u64;
        let mut skipped = 0u64;

        for file in &files_to_merge {
            let mut cancelled = false;
            file.for_each_item(|old_location, data| {
                if cancel.is_cancelled() {
                    cancelled = true;
                    return Err(crate::error::VirtaError::InvalidState(
                        "compaction cancelled".to_string(),
                    ));
                }
                let key = (self.key_of)(data)?;
                // Only the copy the index points at is live
                if self.index.get(key) != Some(old_location) {
                    skipped += 1;
                    return Ok(());
                }
                let new_location = writer.store_item(data)?;
                moves.push((key, old_location, new_location));
                copied += 1;
                Ok(())
            })
            .or_else(|e| if cancelled { Ok(()) } else { Err(e) })?;
            if cancelled {
                writer.abandon();
                debug!(store = %self.name, "compaction pass cancelled");
                return Ok(false);
            }
        }

        // Make the new file visible before any index entry points into it.
        // Publishing and removal both hold the gate so a paused compaction
        // leaves the file set stable for the duration of the pause.
        {
            let _critical = self.pause_gate.enter();
            self.files.publish_compaction_file(writer)?;
        }

        let mut lost_races = 0u64;
        for (key, old_location, new_location) in moves {
            let _critical = self.pause_gate.enter();
            if !self.index.put_if_equal(key, old_location, new_location) {
                // A newer flush re-wrote this key; its copy wins
                lost_races += 1;
            }
        }

        // Old copies are unreachable now; readers racing the removal retry
        // through the index and land in the new file
        {
            let _critical = self.pause_gate.enter();
            self.files.remove_files(&merged_indices)?;
        }

        info!(
            store = %self.name,
            merged_files = merged_indices.len(),
            copied,
            skipped,
            lost_races,
            "compaction pass finished"
        );
        Ok(true)
    }

    /// Gate used to hold off index switch-over during snapshots
    pub fn pause_gate(&self) -> &Arc<PauseGate> {
        &self.pause_gate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::data_file::location_file;

    fn location_in_files(location: u64, indices: &[u32]) -> bool {
        indices.contains(&location_file(location))
    }
    use crate::collections::MemLongIndex;
    use bytes::{Buf, BufMut};
    use std::path::Path;
    use tempfile::TempDir;

    // Test items: [key i64 LE][payload...]
    fn item(key: i64, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_i64_le(key);
        buf.put_slice(payload);
        buf
    }

    fn key_extractor() -> KeyExtractor {
        Box::new(|mut data: &[u8]| Ok(data.get_i64_le()))
    }

    fn setup(dir: &Path) -> (Arc<DataFileCollection>, Arc<MemLongIndex>, StoreCompactor) {
        let (files, _) = DataFileCollection::open(dir, "teststore").unwrap();
        let files = Arc::new(files);
        let index = Arc::new(MemLongIndex::new(1024));
        index.update_valid_range(0, 1_000).unwrap();
        let compactor = StoreCompactor::new(
            "teststore",
            files.clone(),
            index.clone(),
            key_extractor(),
            2,
            Arc::new(PauseGate::new()),
        );
        (files, index, compactor)
    }

    fn flush(files: &DataFileCollection, index: &MemLongIndex, entries: &[(i64, &[u8])]) {
        files.start_writing().unwrap();
        for (key, payload) in entries {
            let loc = files.store_data_item(&item(*key, payload)).unwrap();
            index.put(*key, loc).unwrap();
        }
        files.end_writing().unwrap();
    }

    #[test]
    fn below_threshold_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let (files, index, compactor) = setup(dir.path());
        flush(&files, &index, &[(1, b"one")]);
        assert!(!compactor.compact(&CancelToken::new()).unwrap());
        assert_eq!(files.completed_file_count(), 1);
    }

    #[test]
    fn merge_keeps_latest_copies_readable() {
        let dir = TempDir::new().unwrap();
        let (files, index, compactor) = setup(dir.path());
        flush(&files, &index, &[(1, b"one-old"), (2, b"two")]);
        flush(&files, &index, &[(1, b"one-new"), (3, b"three")]);
        let old_indices: Vec<u32> =
            files.completed_files().iter().map(|f| f.index()).collect();

        assert!(compactor.compact(&CancelToken::new()).unwrap());
        assert_eq!(files.completed_file_count(), 1);

        for (key, expected) in [(1i64, &b"one-new"[..]), (2, b"two"), (3, b"three")] {
            let loc = index.get(key).unwrap();
            assert!(!location_in_files(loc, &old_indices));
            assert_eq!(files.read_data_item(loc).unwrap(), item(key, expected));
        }
    }

    #[test]
    fn cancelled_pass_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let (files, index, compactor) = setup(dir.path());
        flush(&files, &index, &[(1, b"one")]);
        flush(&files, &index, &[(2, b"two")]);
        let loc_before = index.get(1).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(!compactor.compact(&cancel).unwrap());

        assert_eq!(files.completed_file_count(), 2);
        assert_eq!(index.get(1).unwrap(), loc_before);
        // No stray temp file left behind
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .map_or(false, |ext| ext == "compact")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn concurrent_flush_wins_the_index_race() {
        let dir = TempDir::new().unwrap();
        let (files, index, compactor) = setup(dir.path());
        flush(&files, &index, &[(1, b"compacted-away")]);
        flush(&files, &index, &[(2, b"two")]);

        // Simulate a flush landing after the compactor copied key 1 but
        // before switch-over: the entry no longer matches the old location,
        // so put_if_equal must leave it alone. We model this by re-pointing
        // the entry to a sentinel location first.
        let old_loc = index.get(1).unwrap();
        index.put(1, 0xdead_0000_0001).unwrap();
        assert!(!index.put_if_equal(1, old_loc, 0xbeef_0000_0001));
        assert_eq!(index.get(1).unwrap(), 0xdead_0000_0001);
    }

    #[test]
    fn pause_gate_blocks_and_resumes() {
        let gate = Arc::new(PauseGate::new());
        gate.pause();

        let entered = Arc::new(AtomicBool::new(false));
        let thread_gate = gate.clone();
        let thread_entered = entered.clone();
        let handle = std::thread::spawn(move || {
            let _critical = thread_gate.enter();
            thread_entered.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));

        gate.resume();
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }
}
