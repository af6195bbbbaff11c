use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub type DiskJob = Box<dyn FnOnce() + Send + 'static>;

/// Session-side handle to the disk subsystem. Jobs queued during a tick
/// are deferred and flushed in one batch at the end of the tick; shutdown
/// drains the worker pool to zero and waits for every worker to exit.
pub struct DiskThreads {
    pending: Vec<DiskJob>,
    deferred: bool,
    senders: Vec<mpsc::UnboundedSender<DiskJob>>,
    workers: Vec<JoinHandle<()>>,
    next_worker: usize,
}

impl DiskThreads {
    pub fn new(num_workers: usize) -> Self {
        let mut senders = Vec::with_capacity(num_workers);
        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let (tx, mut rx) = mpsc::unbounded_channel::<DiskJob>();
            senders.push(tx);
            workers.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job();
                }
                debug!(worker = i, "disk worker exiting");
            }));
        }
        Self { pending: Vec::new(), deferred: false, senders, workers, next_worker: 0 }
    }

    /// Queue a job for the next flush.
    pub fn queue_job(&mut self, job: DiskJob) {
        self.pending.push(job);
    }

    /// Arm a flush for the end of the current tick. Returns true the
    /// first time per tick, letting the caller schedule the flush once.
    pub fn deferred_submit_jobs(&mut self) -> bool {
        if self.deferred {
            return false;
        }
        self.deferred = true;
        true
    }

    /// Flush every deferred job to the workers, round-robin.
    pub fn submit_jobs(&mut self) {
        self.deferred = false;
        if self.senders.is_empty() {
            self.pending.clear();
            return;
        }
        for job in self.pending.drain(..) {
            let n = self.senders.len();
            let tx = &self.senders[self.next_worker % n];
            let _ = tx.send(job);
            self.next_worker = self.next_worker.wrapping_add(1);
        }
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Drain the pool to zero workers and wait for them to finish. The
    /// scheduler must stay alive until this returns.
    pub async fn shutdown(&mut self) {
        self.pending.clear();
        self.senders.clear();
        for w in self.workers.drain(..) {
            let _ = w.await;
        }
    }
}
