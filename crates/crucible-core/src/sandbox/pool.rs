//! Fixed pool of isolate worker threads
//!
//! `JsRuntime` is not `Send`, so V8 work happens on dedicated OS threads.
//! Each worker owns a single-threaded tokio runtime and drains jobs from
//! its own channel; a semaphore plus a free-slot list gate admission so at
//! most `pool_size` isolates execute at once. Every job gets a fresh
//! isolate, so no state crosses from one execution to the next.

use crate::core_types::{ErrorCode, ExecutionResult};
use crate::sandbox::vm::{self, IsolatePayload};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot, Semaphore};

type IsolateJob = (IsolatePayload, oneshot::Sender<ExecutionResult>);

struct Worker {
    sender: Option<mpsc::UnboundedSender<IsolateJob>>,
    thread: Option<JoinHandle<()>>,
}

pub(crate) struct IsolatePool {
    workers: Vec<Worker>,
    free: Mutex<Vec<usize>>,
    permits: Arc<Semaphore>,
}

impl IsolatePool {
    pub fn new(pool_size: usize) -> Self {
        let mut workers = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            let (tx, rx) = mpsc::unbounded_channel::<IsolateJob>();
            let thread = std::thread::Builder::new()
                .name(format!("crucible-isolate-{}", i))
                .spawn(move || worker_loop(rx))
                .ok();
            if thread.is_none() {
                log::error!("could not spawn isolate worker thread {}", i);
            }
            workers.push(Worker {
                sender: Some(tx),
                thread,
            });
        }
        Self {
            free: Mutex::new((0..workers.len()).collect()),
            permits: Arc::new(Semaphore::new(workers.len())),
            workers,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Acquire a worker slot, run one job on it, release the slot. Waits
    /// when all isolates are busy; queue-level concurrency caps normally
    /// keep that wait short.
    pub async fn run(&self, payload: IsolatePayload) -> ExecutionResult {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return ExecutionResult::failure(ErrorCode::Internal, "isolate pool is closed")
            }
        };
        let slot = match self.acquire_slot() {
            Some(slot) => slot,
            None => {
                return ExecutionResult::failure(
                    ErrorCode::Internal,
                    "isolate pool free list is empty",
                )
            }
        };

        let (tx, rx) = oneshot::channel();
        let sender = self.workers[slot.index].sender.as_ref();
        let sent = sender.map(|s| s.send((payload, tx)).is_ok()).unwrap_or(false);
        if !sent {
            return ExecutionResult::failure(
                ErrorCode::BackendUnavailable,
                "isolate worker thread is not running",
            );
        }
        rx.await.unwrap_or_else(|_| {
            ExecutionResult::failure(ErrorCode::Internal, "isolate worker dropped the reply")
        })
    }

    fn acquire_slot(&self) -> Option<SlotGuard<'_>> {
        let index = self.lock_free().pop()?;
        Some(SlotGuard { pool: self, index })
    }

    fn lock_free(&self) -> std::sync::MutexGuard<'_, Vec<usize>> {
        self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Returns the slot on drop, so an abandoned `run` future cannot leak a
/// worker.
struct SlotGuard<'a> {
    pool: &'a IsolatePool,
    index: usize,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pool.lock_free().push(self.index);
    }
}

impl Drop for IsolatePool {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            worker.sender.take();
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

fn worker_loop(mut rx: mpsc::UnboundedReceiver<IsolateJob>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("isolate worker could not build a runtime: {}", e);
            return;
        }
    };
    while let Some((payload, reply)) = rx.blocking_recv() {
        let result = runtime.block_on(vm::execute_in_isolate(payload));
        let _ = reply.send(result);
    }
}
