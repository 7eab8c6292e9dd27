//! Task orchestrator: a lazily started rayon pool running one file transform
//! per task.
//!
//! Each task gets a private channel pair: an unbounded mpsc stream of progress
//! increments and a oneshot carrying the terminal result. Inside its worker the
//! task drives the async stream transform on a current-thread tokio runtime,
//! so the cipher work stays on the pool's OS threads.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rayon::{ThreadPool, ThreadPoolBuilder};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use cloak_core::{CloakError, CloakResult};
use cloak_crypto::SecretKey;

use crate::stream::{self, TransformMode};

/// One file transform: read `src`, write the result to `temp`.
#[derive(Debug, Clone)]
pub struct TransformTask {
    pub mode: TransformMode,
    pub src: PathBuf,
    pub temp: PathBuf,
    pub key: Arc<SecretKey>,
}

pub struct TaskOrchestrator {
    threads: usize,
    chunk_size: usize,
    chunk_log: Option<PathBuf>,
    pool: Mutex<Option<Arc<ThreadPool>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl TaskOrchestrator {
    pub fn new(threads: usize, chunk_size: usize, chunk_log: Option<PathBuf>) -> Self {
        Self {
            threads: threads.max(1),
            chunk_size,
            chunk_log,
            pool: Mutex::new(None),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_running(&self) -> bool {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Tasks currently executing on a worker.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously executing tasks observed so far.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Release the worker threads. Tasks already queued still run to
    /// completion; the next `run` starts a fresh pool.
    pub fn shutdown(&self) {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if pool.is_some() {
            info!(threads = self.threads, "worker pool shut down");
        }
    }

    fn pool(&self) -> CloakResult<Arc<ThreadPool>> {
        let mut guard = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("cloak-worker-{i}"))
            .panic_handler(|_| error!("transform worker panicked"))
            .build()
            .map_err(|e| CloakError::Worker(format!("starting worker pool: {e}")))?;
        let pool = Arc::new(pool);
        *guard = Some(pool.clone());
        info!(threads = self.threads, "worker pool started");
        Ok(pool)
    }

    /// Run `task` on a worker, forwarding its progress to `on_progress`.
    ///
    /// Returns the number of plaintext bytes the transform processed.
    pub async fn run(
        &self,
        task: TransformTask,
        mut on_progress: impl FnMut(u64),
    ) -> CloakResult<u64> {
        let pool = self.pool()?;
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<u64>();
        let (done_tx, mut done_rx) = oneshot::channel::<CloakResult<u64>>();

        debug!(mode = %task.mode, src = %task.src.display(), "dispatching transform task");
        let in_flight = self.in_flight.clone();
        let peak = self.peak_in_flight.clone();
        let chunk_size = self.chunk_size;
        let chunk_log = self.chunk_log.clone();
        pool.spawn(move || {
            let _slot = InFlightSlot::enter(in_flight, &peak);
            let result = execute(&task, chunk_size, chunk_log.as_deref(), progress_tx);
            let _ = done_tx.send(result);
        });

        let result = loop {
            tokio::select! {
                Some(n) = progress_rx.recv() => on_progress(n),
                done = &mut done_rx => {
                    break done.map_err(|_| {
                        CloakError::Worker("worker dropped its task without a result".into())
                    })?;
                }
            }
        };
        while let Ok(n) = progress_rx.try_recv() {
            on_progress(n);
        }
        result
    }
}

/// Counts a task as executing for as long as it lives, panics included.
struct InFlightSlot(Arc<AtomicUsize>);

impl InFlightSlot {
    fn enter(counter: Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Body of a task on its worker thread.
fn execute(
    task: &TransformTask,
    chunk_size: usize,
    chunk_log: Option<&Path>,
    progress: mpsc::UnboundedSender<u64>,
) -> CloakResult<u64> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| CloakError::Worker(format!("starting task runtime: {e}")))?;

    let report = |n: u64| {
        let _ = progress.send(n);
    };
    runtime.block_on(async {
        match task.mode {
            TransformMode::Encrypt => {
                stream::encrypt_file(&task.src, &task.temp, &task.key, chunk_size, chunk_log, report)
                    .await
            }
            TransformMode::Decrypt => {
                stream::decrypt_file(&task.src, &task.temp, &task.key, chunk_size, chunk_log, report)
                    .await
            }
        }
    })
}
