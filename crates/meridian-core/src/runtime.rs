use std::thread::{self, ThreadId};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use quanta::Clock;
use thiserror::Error;
use tracing::{debug, info};

use crate::arbiter::Arbiter;
use crate::backend::Dependencies;
use crate::config::ArbiterConfig;

const CONTROL_CAPACITY: usize = 256;

type Task = Box<dyn FnOnce(&mut Arbiter) + Send>;

enum ControlMessage {
    Task(Task),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("arbiter worker has stopped")]
    Disconnected,
    /// A synchronous call from the worker itself would wait on itself.
    #[error("run_sync called from the arbiter worker")]
    CalledFromWorker,
}

/// Thread-safe handle to the arbiter worker.
///
/// The worker thread owns the [`Arbiter`]; every mutation runs there, one
/// task at a time, so a task observes the effects of all tasks posted
/// before it. Timers fire between tasks.
///
/// Dropping the runtime triggers a graceful shutdown of the worker thread.
pub struct ArbiterRuntime {
    control_tx: Sender<ControlMessage>,
    worker: ThreadId,
    handle: Option<thread::JoinHandle<()>>,
}

impl ArbiterRuntime {
    pub fn spawn(config: ArbiterConfig, deps: Dependencies, clock: Clock) -> anyhow::Result<Self> {
        let (control_tx, control_rx) = bounded(CONTROL_CAPACITY);
        let handle = thread::Builder::new()
            .name("meridian-arbiter".into())
            .spawn(move || {
                let arbiter = Arbiter::new(config, deps, clock);
                runtime_worker(arbiter, control_rx)
            })
            .map_err(|e| anyhow::anyhow!("Failed to spawn arbiter worker: {}", e))?;
        Ok(Self {
            control_tx,
            worker: handle.thread().id(),
            handle: Some(handle),
        })
    }

    /// Queues `f` to run on the worker. Returns once it is queued.
    pub fn post(&self, f: impl FnOnce(&mut Arbiter) + Send + 'static) -> Result<(), RuntimeError> {
        self.control_tx
            .send(ControlMessage::Task(Box::new(f)))
            .map_err(|_| RuntimeError::Disconnected)
    }

    /// Runs `f` on the worker and waits for its result.
    pub fn run_sync<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut Arbiter) -> R + Send + 'static,
    ) -> Result<R, RuntimeError> {
        if thread::current().id() == self.worker {
            return Err(RuntimeError::CalledFromWorker);
        }
        let (reply_tx, reply_rx) = bounded(1);
        self.post(move |arbiter| {
            let _ = reply_tx.send(f(arbiter));
        })?;
        reply_rx.recv().map_err(|_| RuntimeError::Disconnected)
    }

    /// Gracefully shuts down the worker thread. Idempotent.
    pub fn shutdown(&mut self) {
        let _ = self.control_tx.send(ControlMessage::Shutdown);
        if thread::current().id() == self.worker {
            return;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ArbiterRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn runtime_worker(mut arbiter: Arbiter, control_rx: Receiver<ControlMessage>) {
    info!("arbiter worker started");
    loop {
        let msg = match arbiter.next_deadline() {
            Some(at) => {
                let wait = at.saturating_duration_since(arbiter.now());
                control_rx.recv_timeout(wait)
            }
            None => control_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match msg {
            Ok(ControlMessage::Task(task)) => task(&mut arbiter),
            Ok(ControlMessage::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("control channel closed");
                break;
            }
        }
        arbiter.process_timers();
    }
    info!("arbiter worker stopped");
}
