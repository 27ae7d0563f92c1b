use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use strom_shared::{
    crossbeam_channel::{self, Receiver, Sender},
    log::{error, info, trace},
    span,
    tracy_client::Client,
};

use crate::{Error, Origin, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoTaskKind {
    /// Convert the origin into the canonical file
    Materialize,
    /// Read and decode the canonical file
    Load,
}

/// Work item of the [`IoPool`]
///
/// The handle is passed as its raw value so that the pool doesn't depend on the resource kind.
#[derive(Debug, Clone)]
pub struct IoTask {
    pub kind: IoTaskKind,
    pub handle: u32,
    pub origin: Origin,
}

/// Executes the blocking part of an [`IoTask`] on one of the threads of the [`IoPool`].
pub trait IoTaskHandler: Send + Sync {
    fn handle(&self, task: IoTask);
}

enum Item {
    Wakeup,
    Task(IoTask, Arc<dyn IoTaskHandler>),
}

/// Fixed-size thread pool that is fed by a channel.
pub struct IoPool {
    wants_drop: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    item_sender: Sender<Item>,
    thread_count: usize,
}

impl IoPool {
    /// Spawns `thread_count` threads that wait for tasks.
    ///
    /// # Example
    ///
    /// ```rust
    /// use strom_content::IoPool;
    /// let io_pool = IoPool::new(2).unwrap();
    /// assert!(io_pool.is_idle());
    /// ```
    pub fn new(thread_count: usize) -> Result<Self> {
        if thread_count == 0 {
            return Err(Error::FailedToStartThreadPool);
        }
        let _tracy_client = Client::start();
        let wants_drop = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let (item_sender, item_receiver) = crossbeam_channel::unbounded::<Item>();
        for thread_index in 0..thread_count {
            spawn_thread(&wants_drop, &in_flight, &item_receiver, thread_index)?;
        }
        info!("Started IoPool with {thread_count} threads");
        Ok(Self {
            wants_drop,
            in_flight,
            item_sender,
            thread_count,
        })
    }

    /// Enqueues the task. This never blocks.
    pub fn submit(&self, task: IoTask, handler: Arc<dyn IoTaskHandler>) -> Result<()> {
        if self.wants_drop.load(Ordering::SeqCst) {
            return Err(Error::PoolShutDown);
        }
        trace!("Submitting {:?} task for handle {:#x}", task.kind, task.handle);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.item_sender.send(Item::Task(task, handler)).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::PoolShutDown);
        }
        Ok(())
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Number of tasks that were submitted and didn't finish yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }
}

fn spawn_thread(
    wants_drop: &Arc<AtomicBool>,
    in_flight: &Arc<AtomicUsize>,
    item_receiver: &Receiver<Item>,
    thread_index: usize,
) -> Result<()> {
    let wants_drop = wants_drop.clone();
    let in_flight = in_flight.clone();
    let item_receiver = item_receiver.clone();
    let thread_name = format!("IoPool thread {thread_index}");
    let builder = thread::Builder::new().name(thread_name.clone());
    builder
        .spawn(move || {
            info!("Starting IoPool thread '{thread_name}'");
            loop {
                let Ok(item) = item_receiver.recv() else {
                    error!("IoPool thread '{thread_name}' failed to receive item");
                    break;
                };
                if wants_drop.load(Ordering::SeqCst) {
                    trace!("IoPool wants to be dropped");
                    break;
                }

                let (task, handler) = match item {
                    Item::Wakeup => continue,
                    Item::Task(task, handler) => (task, handler),
                };
                trace!("IoPool thread '{thread_name}' starting {:?} of handle {:#x}", task.kind, task.handle);

                let _span = span!("IoPool task");
                let kind = task.kind;
                let handle = task.handle;
                if panic::catch_unwind(AssertUnwindSafe(|| handler.handle(task))).is_err() {
                    error!("IoPool thread '{thread_name}' caught a panic in {kind:?} of handle {handle:#x}");
                }
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            info!("IoPool thread '{thread_name}' will stop now");
        })
        .map_err(|_| Error::FailedToStartThreadPool)?;
    Ok(())
}

impl Drop for IoPool {
    fn drop(&mut self) {
        self.wants_drop.store(true, Ordering::SeqCst);
        for _ in 0..self.thread_count {
            if let Err(err) = self.item_sender.send(Item::Wakeup) {
                error!("Failed to send wakeup item to IoPool in drop implementation: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use strom_shared::parking_lot::Mutex;
    use strom_test::{expect_within, setup_logger};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        tasks: Mutex<Vec<(IoTaskKind, u32, String)>>,
    }

    impl IoTaskHandler for Recorder {
        fn handle(&self, task: IoTask) {
            self.tasks.lock().push((task.kind, task.handle, thread::current().name().unwrap_or("").to_owned()));
        }
    }

    struct Panicking;

    impl IoTaskHandler for Panicking {
        fn handle(&self, _task: IoTask) {
            panic!("handler failed");
        }
    }

    fn task(kind: IoTaskKind, handle: u32) -> IoTask {
        IoTask {
            kind,
            handle,
            origin: Origin::embedded("bin", vec![0u8]),
        }
    }

    #[test]
    fn zero_threads() {
        assert!(matches!(IoPool::new(0), Err(Error::FailedToStartThreadPool)));
    }

    #[test]
    fn executes_tasks() {
        setup_logger();
        let io_pool = IoPool::new(3).unwrap();
        assert_eq!(io_pool.thread_count(), 3);
        let recorder = Arc::new(Recorder::default());
        for handle in 1..=10 {
            io_pool.submit(task(IoTaskKind::Load, handle), recorder.clone()).unwrap();
        }
        io_pool.submit(task(IoTaskKind::Materialize, 11), recorder.clone()).unwrap();

        expect_within(Duration::from_secs(5), || {}, || io_pool.is_idle(), "tasks not executed");
        let tasks = recorder.tasks.lock();
        assert_eq!(tasks.len(), 11);
        let mut handles = tasks.iter().map(|(_, handle, _)| *handle).collect::<Vec<_>>();
        handles.sort();
        assert_eq!(handles, (1..=11).collect::<Vec<_>>());
        assert!(tasks.iter().all(|(_, _, name)| name.starts_with("IoPool thread ")));
        assert!(tasks.iter().any(|(kind, handle, _)| *kind == IoTaskKind::Materialize && *handle == 11));
    }

    #[test]
    fn survives_panicking_handler() {
        setup_logger();
        let io_pool = IoPool::new(1).unwrap();
        io_pool.submit(task(IoTaskKind::Load, 1), Arc::new(Panicking)).unwrap();
        let recorder = Arc::new(Recorder::default());
        io_pool.submit(task(IoTaskKind::Load, 2), recorder.clone()).unwrap();
        expect_within(Duration::from_secs(5), || {}, || io_pool.is_idle(), "tasks not executed");
        assert_eq!(recorder.tasks.lock().len(), 1);
    }
}
