//! Running work on the host thread from other threads.
//!
//! Host state belongs to one thread. A [`Worker`] lives on that thread and
//! runs closures posted to it through a [`WorkerHandle`], which any thread
//! may hold. Each posted closure gets a [`Task`] that yields its result.
//!
//! Closures run one at a time, in the order they were posted, each behind
//! its own error bridge: a host ERROR or a panic fails that task only.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvError, Sender, TryRecvError};

use pgext_log::{debug, trace};

use super::guard::ffi_guard;
use super::report::panic_message;
use crate::{Error, Result};

type Job = Box<dyn FnOnce() + Send>;

enum Message {
    Run(Job),
    Terminate,
}

/// Runs posted closures on the thread that owns it.
///
/// ```
/// use pgext::runtime::worker::Worker;
///
/// let (worker, handle) = Worker::new();
/// let poster = std::thread::spawn(move || {
///     let task = handle.post(|| 6 * 7);
///     handle.terminate();
///     task
/// });
/// worker.run();
/// assert_eq!(poster.join().unwrap().wait().unwrap(), 42);
/// ```
pub struct Worker {
    receiver: Receiver<Message>,
    // Pinned to the host thread.
    _thread: PhantomData<*const ()>,
}

/// Posts closures to a [`Worker`].
#[derive(Clone)]
pub struct WorkerHandle {
    sender: Sender<Message>,
}

/// The pending result of a posted closure.
#[must_use = "a task does nothing unless waited on"]
pub struct Task<R> {
    receiver: Receiver<std::result::Result<R, String>>,
}

impl Worker {
    pub fn new() -> (Worker, WorkerHandle) {
        let (sender, receiver) = mpsc::channel();
        let worker = Worker {
            receiver,
            _thread: PhantomData,
        };
        (worker, WorkerHandle { sender })
    }

    /// Runs posted closures until terminated or until every handle is gone.
    /// Returns how many ran.
    pub fn run(&self) -> usize {
        let mut ran = 0;
        loop {
            match self.receiver.recv() {
                Ok(Message::Run(job)) => {
                    job();
                    ran += 1;
                }
                Ok(Message::Terminate) | Err(RecvError) => break,
            }
        }
        debug!("worker stopped after {ran} tasks");
        ran
    }

    /// Runs the closures already posted without waiting for more. Returns
    /// how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(Message::Run(job)) => {
                    job();
                    ran += 1;
                }
                Ok(Message::Terminate) | Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                    break;
                }
            }
        }
        ran
    }
}

fn failure(payload: Box<dyn Any + Send>) -> String {
    panic_message(payload.as_ref()).unwrap_or_else(|| "some exception occurred".to_string())
}

impl WorkerHandle {
    /// Queues `f` to run on the worker's thread.
    pub fn post<F, R>(&self, f: F) -> Task<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, receiver) = mpsc::sync_channel(1);
        let job: Job = Box::new(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| ffi_guard(f))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(capture)) => Err(capture.message().to_string()),
                Err(payload) => Err(failure(payload)),
            };
            // The poster may have dropped its task.
            let _ = reply.send(outcome);
        });

        if self.sender.send(Message::Run(job)).is_err() {
            trace!("posted to a stopped worker");
        }
        Task { receiver }
    }

    /// Stops the worker once the closures posted before this have run.
    pub fn terminate(&self) {
        let _ = self.sender.send(Message::Terminate);
    }
}

impl<R> Task<R> {
    /// Blocks until the closure has run and returns its result.
    ///
    /// Fails with [`Error::TaskFailed`] if it raised or panicked and with
    /// [`Error::WorkerStopped`] if the worker went away first.
    pub fn wait(self) -> Result<R> {
        match self.receiver.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(Error::TaskFailed(message)),
            Err(RecvError) => Err(Error::WorkerStopped),
        }
    }
}
