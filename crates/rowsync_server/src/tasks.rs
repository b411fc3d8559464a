//! Background worker for post-commit side tasks.

use rowsync_core::DeferredTask;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;
use tracing::{debug, warn};

enum Job {
    Run(DeferredTask),
    Flush(mpsc::Sender<()>),
}

/// Runs deferred tasks on a dedicated thread, in enqueue order.
///
/// Task failures and panics are logged and otherwise ignored. The queue is bounded;
/// when it is full, new tasks are dropped with a warning rather than
/// blocking the request that committed them.
#[derive(Debug)]
pub struct TaskQueue {
    sender: Option<SyncSender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl TaskQueue {
    /// Starts the worker.
    pub fn start(capacity: usize) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
        let worker = std::thread::Builder::new()
            .name("rowsync-tasks".into())
            .spawn(move || work(receiver))?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Queues a task. Returns false if it was dropped.
    pub fn enqueue(&self, task: DeferredTask) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match sender.try_send(Job::Run(task)) {
            Ok(()) => true,
            Err(TrySendError::Full(Job::Run(task))) => {
                warn!(task = task.name(), "task queue full, dropping task");
                false
            }
            Err(_) => {
                warn!("task worker stopped, dropping task");
                false
            }
        }
    }

    /// Blocks until every task queued before this call has run.
    pub fn flush(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let (done_tx, done_rx) = mpsc::channel();
        if sender.send(Job::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop after the backlog.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("task worker panicked");
            }
        }
    }
}

fn work(receiver: Receiver<Job>) {
    for job in receiver {
        match job {
            Job::Run(task) => {
                let name = task.name().to_string();
                match panic::catch_unwind(AssertUnwindSafe(move || task.run())) {
                    Ok(Ok(())) => debug!(task = %name, "side task finished"),
                    Ok(Err(err)) => warn!(task = %name, error = %err, "side task failed"),
                    Err(payload) => warn!(
                        task = %name,
                        panic = panic_message(&*payload),
                        "side task panicked"
                    ),
                }
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn tasks_run_in_order_and_failures_are_contained() {
        let queue = TaskQueue::start(16).unwrap();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = Arc::clone(&log);
            assert!(queue.enqueue(DeferredTask::new("push", move || {
                log.lock().push(i);
                Ok(())
            })));
        }
        assert!(queue.enqueue(DeferredTask::new("broken", || Err("smtp down".into()))));
        let after = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&after);
        queue.enqueue(DeferredTask::new("after", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        queue.flush();
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_task_does_not_stop_the_worker() {
        let queue = TaskQueue::start(8).unwrap();
        assert!(queue.enqueue(DeferredTask::new("explode", || panic!("boom"))));
        queue.flush();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        assert!(queue.enqueue(DeferredTask::new("count", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })));
        queue.flush();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_drains_backlog() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let queue = TaskQueue::start(4).unwrap();
            for _ in 0..4 {
                let ran = Arc::clone(&ran);
                queue.enqueue(DeferredTask::new("count", move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }));
            }
        }
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }
}
