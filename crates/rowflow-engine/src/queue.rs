//! Bounded row queues between step copies, and the per-node stop signal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError};
use rowflow_types::{FailureReport, Row, RowMeta};

/// Default number of rows a queue holds before `put` blocks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Longest a blocked `put`/`get` waits before re-checking the flags.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

type Item = (Arc<RowMeta>, Row);

/// Outcome of [`RowQueue::get`].
#[derive(Debug)]
pub enum QueueRead {
    Row(Arc<RowMeta>, Row),
    /// Nothing arrived within the timeout; the producer is still running.
    TimedOut,
    /// The producer finished and every row has been taken.
    EndOfStream,
    /// The run is stopping.
    Stopped,
}

/// Bounded FIFO between exactly one producer copy and one consumer copy.
///
/// Both channel ends live here so the channel never disconnects; end of
/// stream is signalled with [`RowQueue::mark_done`].
pub struct RowQueue {
    name: String,
    capacity: usize,
    sender: Sender<Item>,
    receiver: Receiver<Item>,
    done: AtomicBool,
    stopped: AtomicBool,
    closed: AtomicBool,
    discarded: AtomicU64,
}

impl RowQueue {
    /// A queue holding at most `capacity` rows (minimum 1).
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        Self {
            name: name.into(),
            capacity,
            sender,
            receiver,
            done: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            discarded: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rows currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Append a row, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was stopped before the row was accepted.
    pub fn put(&self, meta: Arc<RowMeta>, row: Row) -> bool {
        let mut item = (meta, row);
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return false;
            }
            if self.closed.load(Ordering::Acquire) {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            match self.sender.send_timeout(item, POLL_INTERVAL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => item = back,
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    /// Take the oldest row, waiting at most `timeout` for one to arrive.
    pub fn get(&self, timeout: Duration) -> QueueRead {
        let deadline = Instant::now() + timeout;
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return QueueRead::Stopped;
            }
            // Read `done` before draining: every put happened-before mark_done.
            let done = self.done.load(Ordering::Acquire);
            match self.receiver.try_recv() {
                Ok((meta, row)) => return QueueRead::Row(meta, row),
                Err(TryRecvError::Disconnected) => return QueueRead::EndOfStream,
                Err(TryRecvError::Empty) => {}
            }
            if done {
                return QueueRead::EndOfStream;
            }
            let now = Instant::now();
            if now >= deadline {
                return QueueRead::TimedOut;
            }
            match self.receiver.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
                Ok((meta, row)) => return QueueRead::Row(meta, row),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return QueueRead::EndOfStream,
            }
        }
    }

    /// The producer will put no more rows. Idempotent.
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Wake both ends; later puts fail and gets report `Stopped`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// The consumer has exited. Later puts are accepted and dropped so the
    /// producer of a feedback hop cannot block forever.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        while self.receiver.try_recv().is_ok() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Rows dropped after [`RowQueue::close`].
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RowQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("done", &self.is_done())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Cooperative stop flag shared by every unit of one node's graph.
///
/// Raising it also stops every queue so blocked puts and gets return.
#[derive(Clone)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    queues: Arc<[Arc<RowQueue>]>,
    first_failure: Arc<OnceLock<FailureReport>>,
}

impl StopSignal {
    #[must_use]
    pub fn new(queues: Vec<Arc<RowQueue>>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            queues: queues.into(),
            first_failure: Arc::new(OnceLock::new()),
        }
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::Release);
        for queue in self.queues.iter() {
            queue.stop();
        }
    }

    /// Record `report` if it is the first failure, then stop everything.
    pub fn fail(&self, report: FailureReport) {
        let _ = self.first_failure.set(report);
        self.raise();
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// The raw flag, for socket helpers that poll it.
    #[must_use]
    pub fn flag(&self) -> &Arc<AtomicBool> {
        &self.flag
    }

    #[must_use]
    pub fn first_failure(&self) -> Option<&FailureReport> {
        self.first_failure.get()
    }

    #[must_use]
    pub fn queues(&self) -> &[Arc<RowQueue>] {
        &self.queues
    }
}
