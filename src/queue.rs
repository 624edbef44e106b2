//! Rate-limited transfer queue.
//!
//! The service allows at most one in-flight transfer per execution channel,
//! and the realtime channel additionally enforces a cooldown between
//! transfers. [`TransferQueue`] serializes transfer requests across any
//! number of registered workers so neither limit is ever exceeded, while
//! keeping throughput as high as the combined worker cadence allows.
//!
//! Dispatch runs inside a single background task that owns the queue and
//! every worker's busy flag. All scheduling happens through messages sent to
//! that task (new task, worker registration, worker becoming idle), so a
//! dispatch step never recurses and stack depth stays flat under load.

use crate::error::{CoinLinkError, Result};
use crate::models::SendReceipt;
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// One transfer execution channel: takes `(to_id, amount, from_shop)` and
/// performs the transfer asynchronously.
pub type WorkerFn =
    Arc<dyn Fn(i64, i64, bool) -> BoxFuture<'static, Result<SendReceipt>> + Send + Sync>;

/// One queued transfer request, owned by the queue until dispatched. The
/// outcome travels back to the original caller through `done`.
struct TransferTask {
    to_id: i64,
    amount: i64,
    from_shop: bool,
    done: oneshot::Sender<Result<SendReceipt>>,
}

struct WorkerSlot {
    func: WorkerFn,
    /// Minimum idle time after a task settles before the worker may take
    /// another.
    delay: Option<Duration>,
    busy: bool,
}

/// Messages driving the dispatch task. Every state change arrives here,
/// never through shared mutation.
enum QueueCmd {
    AddWorker {
        func: WorkerFn,
        delay: Option<Duration>,
    },
    AddTask {
        task: TransferTask,
        bypass: bool,
    },
}

/// Handle to the transfer queue. Cloning yields another handle to the same
/// queue; the background task stops when the last handle is dropped.
#[derive(Clone)]
pub struct TransferQueue {
    cmd_tx: mpsc::UnboundedSender<QueueCmd>,
    _task: Arc<JoinHandle<()>>,
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferQueue {
    /// Create an empty queue with no workers. Tasks enqueued before the
    /// first worker registration simply wait.
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(dispatch_task(cmd_rx));
        Self {
            cmd_tx,
            _task: Arc::new(task),
        }
    }

    /// Register one more execution channel. Workers live for the queue's
    /// lifetime and are scanned in registration order.
    pub fn add_worker(&self, func: WorkerFn, delay: Option<Duration>) {
        let _ = self.cmd_tx.send(QueueCmd::AddWorker { func, delay });
    }

    /// Enqueue a transfer request. With `bypass` the task is inserted at the
    /// front of the queue, ahead of every task not yet dispatched; it cannot
    /// preempt a task a worker is already running.
    ///
    /// The returned future settles exactly once, with whatever outcome the
    /// executing worker produced.
    pub async fn add_task(
        &self,
        to_id: i64,
        amount: i64,
        from_shop: bool,
        bypass: bool,
    ) -> Result<SendReceipt> {
        let (done, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(QueueCmd::AddTask {
                task: TransferTask {
                    to_id,
                    amount,
                    from_shop,
                    done,
                },
                bypass,
            })
            .map_err(|_| {
                CoinLinkError::LifecycleError("transfer queue is not running".to_string())
            })?;

        done_rx.await.map_err(|_| {
            CoinLinkError::LifecycleError("transfer queue dropped the task".to_string())
        })?
    }
}

/// The single consumer of [`QueueCmd`]; owns the queue and all busy flags.
async fn dispatch_task(mut cmd_rx: mpsc::UnboundedReceiver<QueueCmd>) {
    let mut queue: VecDeque<TransferTask> = VecDeque::new();
    let mut workers: Vec<WorkerSlot> = Vec::new();
    // Re-used to notify ourselves when a worker frees up.
    let (idle_tx, mut idle_rx) = mpsc::unbounded_channel::<usize>();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(QueueCmd::AddWorker { func, delay }) => {
                        workers.push(WorkerSlot { func, delay, busy: false });
                    }
                    Some(QueueCmd::AddTask { task, bypass }) => {
                        if bypass {
                            queue.push_front(task);
                        } else {
                            queue.push_back(task);
                        }
                    }
                    None => return,
                }
            }
            Some(index) = idle_rx.recv() => {
                workers[index].busy = false;
            }
        }

        dispatch_step(&mut queue, &mut workers, &idle_tx);
    }
}

/// One dispatch step: hand queued tasks to free workers until either runs
/// out. Runs synchronously inside the dispatch task, so queue state and
/// busy flags never change concurrently.
fn dispatch_step(
    queue: &mut VecDeque<TransferTask>,
    workers: &mut [WorkerSlot],
    idle_tx: &mpsc::UnboundedSender<usize>,
) {
    while !queue.is_empty() {
        // First non-busy worker in registration order.
        let Some(index) = workers.iter().position(|w| !w.busy) else {
            // No capacity; the next idle notification re-triggers us.
            return;
        };

        let Some(task) = queue.pop_front() else { return };
        let slot = &mut workers[index];
        slot.busy = true;

        let func = slot.func.clone();
        let delay = slot.delay;
        let idle_tx = idle_tx.clone();
        tokio::spawn(async move {
            let outcome = func(task.to_id, task.amount, task.from_shop).await;
            // The caller may have dropped the receiver; the worker's
            // cadence is enforced regardless.
            let _ = task.done.send(outcome);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let _ = idle_tx.send(index);
        });
    }
}
