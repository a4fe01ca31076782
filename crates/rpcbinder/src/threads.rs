//! Thread ownership for servers and sessions.

use std::collections::HashMap;
use std::thread::{self, JoinHandle, ThreadId};

use crate::error::Result;

/// How a server drives its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadingMode {
    /// One thread per connection, plus the accept loop.
    #[default]
    Threaded,
    /// Handshakes and every connection run on the thread that calls `join`.
    Cooperative,
}

pub(crate) fn spawn_named<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    Ok(thread::Builder::new().name(name.to_string()).spawn(f)?)
}

/// Threads a server or session is responsible for, keyed by id.
///
/// Handles are inserted by whoever spawned the thread while holding the
/// owner's lock; the thread removes itself on exit, which detaches it.
#[derive(Debug, Default)]
pub(crate) struct OwnedThreads {
    handles: HashMap<ThreadId, JoinHandle<()>>,
}

impl OwnedThreads {
    pub(crate) fn insert(&mut self, handle: JoinHandle<()>) {
        self.handles.insert(handle.thread().id(), handle);
    }

    pub(crate) fn take(&mut self, id: ThreadId) -> Option<JoinHandle<()>> {
        self.handles.remove(&id)
    }

    pub(crate) fn take_current(&mut self) -> Option<JoinHandle<()>> {
        self.take(thread::current().id())
    }

    pub(crate) fn contains_current(&self) -> bool {
        self.handles.contains_key(&thread::current().id())
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};

    use parking_lot::Mutex;

    #[test]
    fn thread_removes_itself() {
        let owned = Arc::new(Mutex::new(OwnedThreads::default()));
        let (done_tx, done_rx) = mpsc::channel();

        {
            let mut guard = owned.lock();
            let owned2 = owned.clone();
            let handle = spawn_named("owned-test", move || {
                let handle = owned2.lock().take_current();
                done_tx.send(handle.is_some()).unwrap();
            })
            .unwrap();
            guard.insert(handle);
            assert_eq!(guard.len(), 1);
        }

        assert!(done_rx.recv().unwrap());
        assert!(owned.lock().is_empty());
        assert!(!owned.lock().contains_current());
    }
}
