//! Work Queue and Request Tracking
//!
//! Blocking work (stream resolution, sink negotiation, device enumeration,
//! cache fetches) runs on a small pool of named worker threads fed by a
//! bounded channel. Each job is stamped with a request id from
//! [`RequestTracker`]; when its result reaches the foreground thread, only
//! the latest id of its [`OpClass`] is applied.
//!
//! ```text
//! foreground ──submit(job)──► bounded(64) ──► hiresti-work-0..N
//!     ▲                                              │
//!     └────── pump() ◄── results channel ◄───────────┘
//! ```

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};

/// Jobs waiting beyond this are rejected rather than blocking the caller
pub const WORK_QUEUE_CAPACITY: usize = 64;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Operation classes whose results supersede each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpClass {
    Play,
    OutputReconfig,
    DeviceRefresh,
    HotplugProbe,
    CacheFetch,
}

impl OpClass {
    const COUNT: usize = 5;

    fn slot(self) -> usize {
        match self {
            OpClass::Play => 0,
            OpClass::OutputReconfig => 1,
            OpClass::DeviceRefresh => 2,
            OpClass::HotplugProbe => 3,
            OpClass::CacheFetch => 4,
        }
    }
}

/// Latest issued id per operation class
#[derive(Debug, Default)]
pub struct RequestTracker {
    latest: [u64; OpClass::COUNT],
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new id, invalidating earlier ones of the same class
    pub fn next(&mut self, class: OpClass) -> u64 {
        let slot = &mut self.latest[class.slot()];
        *slot += 1;
        *slot
    }

    pub fn latest(&self, class: OpClass) -> u64 {
        self.latest[class.slot()]
    }

    pub fn is_current(&self, class: OpClass, id: u64) -> bool {
        id != 0 && self.latest(class) == id
    }
}

/// Fixed pool of worker threads
pub struct WorkQueue {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkQueue {
    pub fn new(workers: usize) -> CoreResult<Self> {
        Self::with_capacity(workers, WORK_QUEUE_CAPACITY)
    }

    pub fn with_capacity(workers: usize, capacity: usize) -> CoreResult<Self> {
        let (sender, receiver) = bounded::<Job>(capacity.max(1));
        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let receiver = receiver.clone();
            let name = format!("hiresti-work-{}", i);
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    debug!("Worker started");
                    for job in receiver.iter() {
                        job();
                    }
                    debug!("Worker finished");
                })
                .map_err(|e| CoreError::Spawn {
                    name,
                    message: e.to_string(),
                })?;
            handles.push(handle);
        }
        info!("Work queue started with {} workers", handles.len());
        Ok(Self {
            sender: Some(sender),
            workers: handles,
        })
    }

    /// Queue `job` without blocking
    pub fn submit<F>(&self, job: F) -> CoreResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(CoreError::ShutDown)?;
        sender.try_send(Box::new(job)).map_err(|e| match e {
            TrySendError::Full(_) => CoreError::QueueFull,
            TrySendError::Disconnected(_) => CoreError::ShutDown,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Finish queued jobs and join the workers
    pub fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
