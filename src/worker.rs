use std::{
    io,
    panic::resume_unwind,
    thread::{self, JoinHandle},
};

use crate::drop::defer;

/// A builder object that can be used to configure and spawn a [`Worker`].
#[derive(Clone, Default)]
pub struct WorkerBuilder {
    name: Option<String>,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the name of the [`Worker`] thread.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
        }
    }

    /// Spawns a [`Worker`] thread that runs `body` to completion.
    pub fn spawn<F>(self, body: F) -> io::Result<Worker>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut builder = thread::Builder::new();
        if let Some(name) = self.name.clone() {
            builder = builder.name(name);
        }
        let handle = builder.spawn(move || {
            let _guard;
            if let Some(name) = self.name {
                log::trace!("worker '{name}' starting");
                _guard = defer(move || log::trace!("worker '{name}' exiting"));
            }
            body();
        })?;

        Ok(Worker {
            handle: Some(handle),
        })
    }
}

/// An owned thread that runs a closure to completion.
///
/// Dropping a [`Worker`] or calling [`Worker::join`] joins the thread. If the thread has panicked,
/// the panic is forwarded to the joining thread (unless that thread is already panicking).
///
/// A worker that ends up being joined from its own thread (for example because the producer
/// running on it closed its own result handle) is detached instead, since a thread can never
/// observe its own exit.
pub struct Worker {
    handle: Option<JoinHandle<()>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.wait_for_exit();
    }
}

impl Worker {
    fn wait_for_exit(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                log::debug!("worker joined from its own thread, detaching");
                return;
            }
            if let Err(payload) = handle.join() {
                if !thread::panicking() {
                    resume_unwind(payload);
                }
            }
        }
    }

    /// Blocks until the worker thread has exited.
    pub fn join(mut self) {
        self.wait_for_exit();
    }

    /// Returns the ID of the worker thread, unless it was already joined or detached.
    pub fn thread_id(&self) -> Option<thread::ThreadId> {
        self.handle.as_ref().map(|handle| handle.thread().id())
    }

    /// Lets the thread run on without an owner.
    pub fn detach(mut self) {
        self.handle.take();
    }
}
