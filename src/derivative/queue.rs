use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};

/// Submission priority. Higher wins; a higher-priority submission of an
/// already-pending job promotes it in place. In-flight jobs never
/// preempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Background,
    UserImplicit,
    UserBlocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    ImageVariant,
    VideoThumb,
    Hls,
}

/// Job identity: duplicate submissions of the same key share one
/// execution and one ticket while the job is pending or in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub kind: JobKind,
    pub hash: String,
    pub variant: String,
}

impl JobKey {
    pub fn new(kind: JobKind, hash: impl Into<String>, variant: impl Into<String>) -> Self {
        JobKey {
            kind,
            hash: hash.into(),
            variant: variant.into(),
        }
    }
}

type JobFn = Box<dyn FnOnce() -> Result<PathBuf> + Send>;

enum TicketState {
    Pending,
    Done(Result<PathBuf>),
}

/// Waitable handle for a submitted job. All submitters of one job key
/// hold the same ticket.
pub struct JobTicket {
    state: Mutex<TicketState>,
    done: Condvar,
}

impl JobTicket {
    fn new() -> Arc<Self> {
        Arc::new(JobTicket {
            state: Mutex::new(TicketState::Pending),
            done: Condvar::new(),
        })
    }

    fn complete(&self, result: Result<PathBuf>) {
        *self.state.lock().unwrap() = TicketState::Done(result);
        self.done.notify_all();
    }

    /// Block until the job finishes.
    pub fn wait(&self) -> Result<PathBuf> {
        let mut state = self.state.lock().unwrap();
        loop {
            match &*state {
                TicketState::Done(result) => return result.clone(),
                TicketState::Pending => state = self.done.wait(state).unwrap(),
            }
        }
    }

    /// Block up to `timeout`; `None` when the job is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<PathBuf>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let TicketState::Done(result) = &*state {
                return Some(result.clone());
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (next, timed_out) = self.done.wait_timeout(state, remaining).unwrap();
            state = next;
            if timed_out.timed_out() {
                if let TicketState::Done(result) = &*state {
                    return Some(result.clone());
                }
                return None;
            }
        }
    }
}

struct PendingJob {
    key: JobKey,
    priority: Priority,
    seq: u64,
    work: JobFn,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<PendingJob>,
    tickets: HashMap<JobKey, Arc<JobTicket>>,
    active: usize,
    next_seq: u64,
    shutdown: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    work_ready: Condvar,
}

/// The media processing queue: a small worker pool with priority-ordered
/// dispatch and duplicate-job coalescing. One instance is shared by
/// everything that produces derivatives; concurrency stays low because
/// each job leans on an encoder.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct MediaQueue {
    inner: Arc<QueueInner>,
    workers: Arc<Mutex<Vec<std::thread::JoinHandle<()>>>>,
}

impl MediaQueue {
    pub fn new(worker_count: usize) -> Self {
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState::default()),
            work_ready: Condvar::new(),
        });
        let workers = (0..worker_count.max(1))
            .map(|i| {
                let inner = Arc::clone(&inner);
                std::thread::Builder::new()
                    .name(format!("media-queue-{i}"))
                    .spawn(move || worker_loop(&inner))
                    .expect("cannot spawn media queue worker")
            })
            .collect();
        MediaQueue {
            inner,
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    /// Submit a job. If the key is already pending or in flight the
    /// existing ticket comes back (promoted when `priority` is higher)
    /// and `work` is dropped unexecuted.
    pub fn submit(
        &self,
        key: JobKey,
        priority: Priority,
        work: impl FnOnce() -> Result<PathBuf> + Send + 'static,
    ) -> Arc<JobTicket> {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            let ticket = JobTicket::new();
            ticket.complete(Err(Error::Internal("queue is shut down".to_string())));
            return ticket;
        }
        if let Some(ticket) = state.tickets.get(&key) {
            let ticket = Arc::clone(ticket);
            if let Some(pending) = state.pending.iter_mut().find(|p| p.key == key) {
                if priority > pending.priority {
                    tracing::debug!("promoting {:?} to {:?}", key, priority);
                    pending.priority = priority;
                }
            }
            return ticket;
        }

        let ticket = JobTicket::new();
        state.tickets.insert(key.clone(), Arc::clone(&ticket));
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(PendingJob {
            key,
            priority,
            seq,
            work: Box::new(work),
        });
        drop(state);
        self.inner.work_ready.notify_one();
        ticket
    }

    pub fn queue_size(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().unwrap().active
    }

    /// Stop the workers. Pending jobs are abandoned with an error;
    /// in-flight jobs run to completion.
    pub fn shutdown(&self) {
        let abandoned: Vec<Arc<JobTicket>> = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let drained: Vec<PendingJob> = state.pending.drain(..).collect();
            drained
                .into_iter()
                .filter_map(|p| state.tickets.remove(&p.key))
                .collect()
        };
        for ticket in abandoned {
            ticket.complete(Err(Error::Internal("queue is shut down".to_string())));
        }
        self.inner.work_ready.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: &QueueInner) {
    loop {
        let (key, work, ticket) = {
            let mut state = inner.state.lock().unwrap();
            loop {
                if state.shutdown {
                    return;
                }
                // Highest priority first, FIFO within a priority.
                let best = state
                    .pending
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, p)| (p.priority, std::cmp::Reverse(p.seq)))
                    .map(|(i, _)| i);
                match best {
                    Some(index) => {
                        let job = state.pending.swap_remove(index);
                        let ticket = state
                            .tickets
                            .get(&job.key)
                            .cloned()
                            .expect("pending job always has a ticket");
                        state.active += 1;
                        break (job.key, job.work, ticket);
                    }
                    None => state = inner.work_ready.wait(state).unwrap(),
                }
            }
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(work))
            .unwrap_or_else(|_| Err(Error::Internal(format!("job panicked: {key:?}"))));
        if let Err(e) = &result {
            tracing::warn!("media job {:?} failed: {}", key, e);
        }

        {
            let mut state = inner.state.lock().unwrap();
            state.active -= 1;
            state.tickets.remove(&key);
        }
        ticket.complete(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn key(variant: &str) -> JobKey {
        JobKey::new(JobKind::ImageVariant, "hash", variant)
    }

    #[test]
    fn test_job_runs_and_ticket_resolves() {
        let queue = MediaQueue::new(2);
        let ticket = queue.submit(key("640"), Priority::UserBlocked, || {
            Ok(PathBuf::from("/tmp/out.jpg"))
        });
        assert_eq!(ticket.wait().unwrap(), PathBuf::from("/tmp/out.jpg"));
        queue.shutdown();
    }

    #[test]
    fn test_duplicate_submissions_share_one_execution() {
        let queue = MediaQueue::new(2);
        let executions = Arc::new(AtomicUsize::new(0));
        // Hold the worker back until both submissions are in.
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Arc::new(Mutex::new(gate_rx));

        let exec1 = Arc::clone(&executions);
        let gate1 = Arc::clone(&gate_rx);
        let first = queue.submit(key("640"), Priority::Background, move || {
            let _ = gate1.lock().unwrap().recv();
            exec1.fetch_add(1, Ordering::SeqCst);
            Ok(PathBuf::from("/tmp/once.jpg"))
        });

        let exec2 = Arc::clone(&executions);
        let second = queue.submit(key("640"), Priority::Background, move || {
            exec2.fetch_add(1, Ordering::SeqCst);
            Ok(PathBuf::from("/tmp/twice.jpg"))
        });

        assert!(Arc::ptr_eq(&first, &second), "same key shares one ticket");
        gate_tx.send(()).unwrap();

        assert_eq!(first.wait().unwrap(), PathBuf::from("/tmp/once.jpg"));
        assert_eq!(second.wait().unwrap(), PathBuf::from("/tmp/once.jpg"));
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        queue.shutdown();
    }

    #[test]
    fn test_priority_orders_dispatch() {
        // One worker, blocked by a gate job; everything submitted behind
        // it dispatches by priority, not arrival order.
        let queue = MediaQueue::new(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Arc::new(Mutex::new(gate_rx));
        let order = Arc::new(Mutex::new(Vec::new()));

        let gate = Arc::clone(&gate_rx);
        let blocker = queue.submit(key("gate"), Priority::UserBlocked, move || {
            let _ = gate.lock().unwrap().recv();
            Ok(PathBuf::new())
        });

        for (variant, priority) in [
            ("bg", Priority::Background),
            ("implicit", Priority::UserImplicit),
            ("blocked", Priority::UserBlocked),
        ] {
            let order = Arc::clone(&order);
            queue.submit(key(variant), priority, move || {
                order.lock().unwrap().push(variant);
                Ok(PathBuf::new())
            });
        }
        assert_eq!(queue.queue_size(), 3);

        gate_tx.send(()).unwrap();
        blocker.wait().unwrap();
        // Drain: wait on the lowest-priority job, which runs last.
        let queue2 = queue.clone();
        let bg_ticket = queue2.submit(key("bg"), Priority::Background, || Ok(PathBuf::new()));
        let _ = bg_ticket.wait();

        let order = order.lock().unwrap().clone();
        assert_eq!(order, vec!["blocked", "implicit", "bg"]);
        queue.shutdown();
    }

    #[test]
    fn test_resubmission_promotes_pending_job() {
        let queue = MediaQueue::new(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Arc::new(Mutex::new(gate_rx));
        let order = Arc::new(Mutex::new(Vec::new()));

        let gate = Arc::clone(&gate_rx);
        let blocker = queue.submit(key("gate"), Priority::UserBlocked, move || {
            let _ = gate.lock().unwrap().recv();
            Ok(PathBuf::new())
        });

        let o = Arc::clone(&order);
        queue.submit(key("implicit"), Priority::UserImplicit, move || {
            o.lock().unwrap().push("implicit");
            Ok(PathBuf::new())
        });
        let o = Arc::clone(&order);
        let promoted = queue.submit(key("promoted"), Priority::Background, move || {
            o.lock().unwrap().push("promoted");
            Ok(PathBuf::new())
        });
        // Resubmission at a higher priority moves it ahead of implicit.
        let again = queue.submit(key("promoted"), Priority::UserBlocked, || Ok(PathBuf::new()));
        assert!(Arc::ptr_eq(&promoted, &again));

        gate_tx.send(()).unwrap();
        blocker.wait().unwrap();
        promoted.wait().unwrap();

        let order = order.lock().unwrap().clone();
        assert_eq!(order[0], "promoted");
        queue.shutdown();
    }

    #[test]
    fn test_failed_job_reports_error_to_all_waiters() {
        let queue = MediaQueue::new(2);
        let ticket = queue.submit(key("bad"), Priority::UserBlocked, || {
            Err(Error::InvalidImage("broken pixels".to_string()))
        });
        let result = ticket.wait();
        assert!(matches!(result, Err(Error::InvalidImage(_))));
        queue.shutdown();
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let queue = MediaQueue::new(1);
        let ticket = queue.submit(key("panic"), Priority::UserBlocked, || {
            panic!("encoder exploded")
        });
        assert!(matches!(ticket.wait(), Err(Error::Internal(_))));

        // The worker survives and runs the next job.
        let ticket = queue.submit(key("ok"), Priority::UserBlocked, || {
            Ok(PathBuf::from("/tmp/fine.jpg"))
        });
        assert!(ticket.wait().is_ok());
        queue.shutdown();
    }

    #[test]
    fn test_wait_timeout_on_running_job() {
        let queue = MediaQueue::new(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Arc::new(Mutex::new(gate_rx));
        let gate = Arc::clone(&gate_rx);
        let ticket = queue.submit(key("slow"), Priority::UserBlocked, move || {
            let _ = gate.lock().unwrap().recv();
            Ok(PathBuf::new())
        });
        assert!(ticket.wait_timeout(Duration::from_millis(100)).is_none());
        gate_tx.send(()).unwrap();
        assert!(ticket.wait_timeout(Duration::from_secs(5)).is_some());
        queue.shutdown();
    }

    #[test]
    fn test_completed_job_key_is_reusable() {
        let queue = MediaQueue::new(1);
        let first = queue.submit(key("x"), Priority::UserBlocked, || {
            Ok(PathBuf::from("/tmp/1.jpg"))
        });
        first.wait().unwrap();
        // After completion the key maps to a fresh job (the artifact
        // cache, not the queue, is what prevents rework).
        let second = queue.submit(key("x"), Priority::UserBlocked, || {
            Ok(PathBuf::from("/tmp/2.jpg"))
        });
        assert_eq!(second.wait().unwrap(), PathBuf::from("/tmp/2.jpg"));
        queue.shutdown();
    }
}
