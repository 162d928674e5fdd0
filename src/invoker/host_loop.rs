// Minimal host event loop implementing CallInvoker
//
// Embedders with their own JS thread implement `CallInvoker` directly. The CLI
// and tests use this loop to play the host: the thread that calls `run*` is
// the main runtime's thread.

use super::CallInvoker;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

enum HostMessage {
    Work(Box<dyn FnOnce() + Send>),
    Quit,
}

/// Cloneable sender side of a [`HostEventLoop`]
#[derive(Clone)]
pub struct HostInvoker {
    tx: Sender<HostMessage>,
}

impl HostInvoker {
    /// Ask the loop to return from `run` after the work queued so far
    pub fn quit(&self) {
        let _ = self.tx.send(HostMessage::Quit);
    }
}

impl CallInvoker for HostInvoker {
    fn invoke_async(&self, work: Box<dyn FnOnce() + Send>) {
        if self.tx.send(HostMessage::Work(work)).is_err() {
            tracing::warn!("host event loop is gone, dropping work");
        }
    }
}

/// FIFO work loop driven by the host thread
pub struct HostEventLoop {
    tx: Sender<HostMessage>,
    rx: Receiver<HostMessage>,
}

impl HostEventLoop {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }

    pub fn invoker(&self) -> HostInvoker {
        HostInvoker {
            tx: self.tx.clone(),
        }
    }

    /// Run work until [`HostInvoker::quit`] is called; returns the number of
    /// work items executed
    pub fn run(&self) -> usize {
        let mut executed = 0;
        while let Ok(message) = self.rx.recv() {
            match message {
                HostMessage::Work(work) => {
                    work();
                    executed += 1;
                }
                HostMessage::Quit => break,
            }
        }
        executed
    }

    /// Run everything queued right now without blocking
    pub fn run_until_idle(&self) -> usize {
        let mut executed = 0;
        while let Ok(message) = self.rx.try_recv() {
            if let HostMessage::Work(work) = message {
                work();
                executed += 1;
            }
        }
        executed
    }

    /// Run work until nothing arrives for `quiet`, or quit is requested
    pub fn run_until_quiet(&self, quiet: Duration) -> usize {
        let mut executed = 0;
        loop {
            match self.rx.recv_timeout(quiet) {
                Ok(HostMessage::Work(work)) => {
                    work();
                    executed += 1;
                }
                Ok(HostMessage::Quit) | Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        executed
    }
}

impl Default for HostEventLoop {
    fn default() -> Self {
        Self::new()
    }
}
