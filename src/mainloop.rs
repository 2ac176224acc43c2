//! The single serialized execution context every back-end call and every
//! transaction from the home server converges on: a dedicated OS thread
//! draining a channel of boxed closures. The HTTP frontend (running on
//! Rocket's async worker pool) and any back-end callback thread only ever
//! touch `Backend` state by posting a job here, never directly.
use std::sync::mpsc;

use crate::backend::Backend;

pub type BoxedJob = Box<dyn FnOnce(&mut Backend) + Send>;

#[derive(Clone)]
pub struct MainLoopHandle {
    sender: mpsc::Sender<BoxedJob>,
}

impl MainLoopHandle {
    /// Posts a job onto the main loop. Never blocks and never runs `job`
    /// inline — the caller must not assume any ordering relative to its own
    /// subsequent code beyond "this job will run after jobs posted earlier".
    pub fn post(&self, job: impl FnOnce(&mut Backend) + Send + 'static) {
        if self.sender.send(Box::new(job)).is_err() {
            tracing::error!("main loop is not running, dropped posted job");
        }
    }
}

pub struct MainLoop {
    receiver: mpsc::Receiver<BoxedJob>,
    handle: MainLoopHandle,
}

impl MainLoop {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        MainLoop {
            receiver,
            handle: MainLoopHandle { sender },
        }
    }

    pub fn handle(&self) -> MainLoopHandle {
        self.handle.clone()
    }

    /// Runs until a job calls `backend.request_stop()` or every
    /// `MainLoopHandle` clone has gone out of scope.
    ///
    /// `Backend` holds `Rc`/`RefCell` state (sound because exactly one
    /// thread ever touches it) and so cannot be built elsewhere and handed
    /// across a thread boundary; `build` runs on the main-loop thread itself
    /// and produces it there.
    pub fn run(self, build: impl FnOnce(MainLoopHandle) -> Backend) {
        let mut backend = build(self.handle.clone());
        for job in self.receiver.iter() {
            job(&mut backend);
            if backend.should_exit() {
                break;
            }
        }
        tracing::info!("main loop exiting");
    }

    /// Spawns the main loop on its own OS thread, as `run` does, but
    /// without blocking the caller.
    pub fn spawn(
        self,
        build: impl FnOnce(MainLoopHandle) -> Backend + Send + 'static,
    ) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("pumaduct-main-loop".to_string())
            .spawn(move || self.run(build))
            .expect("failed to spawn main loop thread")
    }
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}
