use super::{Job, JobKind};
use crate::error::Result;
use jiff::Timestamp;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Table of live jobs keyed by sequence number.
///
/// Every operation takes the lock for exactly that operation.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<BTreeMap<u64, Job>>,
    next_seq: AtomicU64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: JobKind) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(seq, %kind, "job registered");
        self.jobs.lock().insert(
            seq,
            Job {
                seq,
                kind,
                processing: false,
                output: Vec::new(),
                created_at: Timestamp::now(),
            },
        );
        seq
    }

    /// Mark the job as processing. Only the first caller for a queued job wins.
    pub fn try_claim(&self, seq: u64) -> bool {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(&seq) {
            Some(job) if !job.processing => {
                job.processing = true;
                true
            }
            _ => false,
        }
    }

    pub fn append_output(&self, seq: u64, line: &str) {
        if let Some(job) = self.jobs.lock().get_mut(&seq) {
            job.output.push(line.to_string());
        }
    }

    /// Remove the job, returning its final state.
    pub fn finish(&self, seq: u64) -> Option<Job> {
        self.jobs.lock().remove(&seq)
    }

    pub fn get(&self, seq: u64) -> Option<Job> {
        self.jobs.lock().get(&seq).cloned()
    }

    /// All live jobs ordered by sequence.
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.lock().values().cloned().collect()
    }

    /// JSON rendering of [`snapshot`](Self::snapshot); serialisation happens after
    /// the lock is released.
    pub fn snapshot_json(&self) -> Result<String> {
        let jobs = self.snapshot();
        Ok(serde_json::to_string_pretty(&jobs)?)
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn claim_is_exactly_once_under_contention() {
        let registry = Arc::new(JobRegistry::new());
        let seq = registry.register(JobKind::ResetAll);
        let wins = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let wins = wins.clone();
                thread::spawn(move || {
                    if registry.try_claim(seq) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(registry.get(seq).unwrap().processing);
    }

    #[test]
    fn lifecycle_and_snapshot_order() {
        let registry = JobRegistry::new();
        let first = registry.register(JobKind::CheckAllForUpdates);
        let second = registry.register(JobKind::RestartStack { stack_id: 4 });
        assert!(second > first);

        registry.append_output(first, "checking");
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.iter().map(|j| j.seq).collect::<Vec<_>>(), vec![first, second]);
        assert_eq!(snapshot[0].output, vec!["checking"]);

        let json = registry.snapshot_json().unwrap();
        assert!(json.contains("\"kind\": \"restart_stack\""));

        let done = registry.finish(first).unwrap();
        assert_eq!(done.output, vec!["checking"]);
        assert!(registry.get(first).is_none());
        assert!(!registry.try_claim(first));
        registry.append_output(first, "ignored");
        assert_eq!(registry.snapshot().len(), 1);
    }
}
