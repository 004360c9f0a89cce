//! Commit completion coordination
//!
//! Two nested countdowns: every partition job owns a column counter, and all
//! partition jobs of a commit share one partition counter. Workers only ever
//! decrement; the thread that takes a counter to zero moves the protocol one
//! level up. The committing writer is the only thread that blocks, on the
//! [`CompletionSignal`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{Result, StoreError};

// ============================================================================
// Completion Signal
// ============================================================================

/// One-shot latch raised when the last partition of a commit completes
#[derive(Debug, Default)]
pub struct CompletionSignal {
    raised: AtomicBool,
    done: Mutex<bool>,
    cv: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Returns false if it was already raised.
    pub fn raise(&self) -> bool {
        if self.raised.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut done = self.done.lock();
        *done = true;
        self.cv.notify_all();
        true
    }

    #[inline]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Block until raised
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    /// Block until raised or `timeout` elapses; true if raised
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cv.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

// ============================================================================
// Commit Progress
// ============================================================================

/// State shared by every task of one commit
#[derive(Debug)]
pub struct CommitProgress {
    partitions_remaining: AtomicUsize,
    tasks_completed: AtomicUsize,
    failure: Mutex<Option<StoreError>>,
    signal: CompletionSignal,
}

impl CommitProgress {
    /// A commit touching `partitions` partitions. With none, the signal is
    /// raised immediately.
    pub fn new(partitions: usize) -> Arc<Self> {
        let progress = Arc::new(Self {
            partitions_remaining: AtomicUsize::new(partitions),
            tasks_completed: AtomicUsize::new(0),
            failure: Mutex::new(None),
            signal: CompletionSignal::new(),
        });
        if partitions == 0 {
            progress.signal.raise();
        }
        progress
    }

    pub fn signal(&self) -> &CompletionSignal {
        &self.signal
    }

    pub fn partitions_remaining(&self) -> usize {
        self.partitions_remaining.load(Ordering::Acquire)
    }

    /// Column tasks that have reported back so far
    pub fn tasks_completed(&self) -> usize {
        self.tasks_completed.load(Ordering::Acquire)
    }

    /// Keep the first failure; later ones are logged and dropped
    fn record_failure(&self, err: StoreError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        } else {
            log::warn!("additional O3 task failure: {}", err);
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// Take the recorded failure, if any
    pub fn take_failure(&self) -> Option<StoreError> {
        self.failure.lock().take()
    }

    fn partition_done(&self) {
        if self.partitions_remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.signal.raise();
        }
    }

    /// Wait for every partition, then surface the first failure
    pub fn wait(&self) -> Result<()> {
        self.signal.wait();
        match self.take_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Partition Progress
// ============================================================================

/// Column counter of one partition job
#[derive(Debug)]
pub struct PartitionProgress {
    columns_remaining: AtomicUsize,
    complete: AtomicBool,
    commit: Arc<CommitProgress>,
}

impl PartitionProgress {
    pub fn new(columns: usize, commit: Arc<CommitProgress>) -> Arc<Self> {
        let progress = Arc::new(Self {
            columns_remaining: AtomicUsize::new(columns),
            complete: AtomicBool::new(false),
            commit,
        });
        if columns == 0 {
            progress.finish();
        }
        progress
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn commit(&self) -> &Arc<CommitProgress> {
        &self.commit
    }

    /// Report one column task. The last one marks the partition complete
    /// and counts it down at commit level.
    pub fn column_done(&self, result: Result<()>) {
        if let Err(err) = result {
            self.commit.record_failure(err);
        }
        self.commit.tasks_completed.fetch_add(1, Ordering::AcqRel);
        if self.columns_remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        self.complete.store(true, Ordering::Release);
        self.commit.partition_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::thread;

    #[test]
    fn test_signal_fires_once() {
        let signal = CompletionSignal::new();
        assert!(!signal.is_raised());
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
        assert!(signal.raise());
        assert!(!signal.raise());
        signal.wait();
        assert!(signal.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_no_partitions_completes_immediately() {
        let commit = CommitProgress::new(0);
        assert!(commit.signal().is_raised());
        commit.wait().unwrap();
    }

    #[test]
    fn test_signal_after_all_columns_any_order() {
        let columns = [3usize, 1, 5, 2];
        let total: usize = columns.iter().sum();
        let commit = CommitProgress::new(columns.len());

        let partitions: Vec<Arc<PartitionProgress>> = columns
            .iter()
            .map(|&c| PartitionProgress::new(c, commit.clone()))
            .collect();

        let mut reports: Vec<usize> = columns
            .iter()
            .enumerate()
            .flat_map(|(p, &c)| std::iter::repeat(p).take(c))
            .collect();
        reports.shuffle(&mut rand::rng());

        let fired = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = reports
            .into_iter()
            .map(|p| {
                let partition = partitions[p].clone();
                let fired = fired.clone();
                thread::spawn(move || {
                    let was_raised = partition.commit().signal().is_raised();
                    partition.column_done(Ok(()));
                    if !was_raised && partition.commit().signal().is_raised() {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        commit.wait().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(commit.tasks_completed(), total);
        assert_eq!(commit.partitions_remaining(), 0);
        assert!(partitions.iter().all(|p| p.is_complete()));
        assert!(fired.load(Ordering::SeqCst) >= 1);
        assert!(!commit.signal().raise());
    }

    #[test]
    fn test_signal_waits_for_last_column() {
        let commit = CommitProgress::new(2);
        let a = PartitionProgress::new(2, commit.clone());
        let b = PartitionProgress::new(1, commit.clone());

        a.column_done(Ok(()));
        b.column_done(Ok(()));
        assert!(b.is_complete());
        assert!(!a.is_complete());
        assert!(!commit.signal().is_raised());

        a.column_done(Ok(()));
        assert!(commit.signal().is_raised());
        assert_eq!(commit.tasks_completed(), 3);
    }

    #[test]
    fn test_failure_surfaces_after_completion() {
        let commit = CommitProgress::new(1);
        let part = PartitionProgress::new(2, commit.clone());

        part.column_done(Err(StoreError::Disconnected("peer gone".into())));
        assert!(commit.has_failed());
        assert!(!commit.signal().is_raised());

        part.column_done(Err(StoreError::EndOfStream("short".into())));
        assert!(matches!(commit.wait(), Err(StoreError::Disconnected(_))));
    }
}
