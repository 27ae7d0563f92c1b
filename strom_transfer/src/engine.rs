use std::{
    collections::VecDeque,
    mem,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use strom_shared::{
    crossbeam_channel::{self, Receiver, Sender},
    format_bytes,
    log::{error, info, trace, warn},
    parking_lot::Mutex,
    span, spin_sleep,
    tracy_client::Client,
    StreamingConfig,
};

use crate::{
    device::{Barrier, Command, ImageDesc, ImageId, ImageLayout, QueueKind, TransferDevice},
    staging::StagingRegion,
    task::{Destination, Priority, Source, SourceBytes, Split, TransferTask},
    ticket::{Ticket, TicketAllocator, TicketStatus},
    BufferId, Error, Result,
};

/// Queued tasks, one lane per [`Priority`]
#[derive(Default)]
struct Lanes {
    high: VecDeque<TransferTask>,
    normal: VecDeque<TransferTask>,
}

impl Lanes {
    fn lane(&mut self, priority: Priority) -> &mut VecDeque<TransferTask> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
        }
    }

    fn push_back(&mut self, task: TransferTask) {
        self.lane(task.priority).push_back(task);
    }

    fn push_front(&mut self, task: TransferTask) {
        self.lane(task.priority).push_front(task);
    }

    fn pop_front(&mut self) -> Option<TransferTask> {
        self.high.pop_front().or_else(|| self.normal.pop_front())
    }

    fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty()
    }

    fn retain(&mut self, mut f: impl FnMut(&TransferTask) -> bool) {
        self.high.retain(&mut f);
        self.normal.retain(&mut f);
    }

    fn drain(&mut self) -> impl Iterator<Item = TransferTask> + '_ {
        self.high.drain(..).chain(self.normal.drain(..))
    }
}

/// Producer half of the double buffer
#[derive(Default)]
struct Incoming {
    tasks: Vec<TransferTask>,
    /// Set by the transfer thread when it took the last tasks before stopping
    stopped: bool,
}

struct Shared {
    device: Arc<dyn TransferDevice>,
    tickets: TicketAllocator,
    /// The transfer thread swaps the tasks with its own half.
    incoming: Mutex<Incoming>,
    acquire_barriers: Mutex<Vec<(Ticket, Barrier)>>,
    /// Uploads whose last fragment wasn't submitted yet
    outstanding: AtomicUsize,
    last_submitted: AtomicU64,
    submission_count: AtomicUsize,
    wants_drop: AtomicBool,
}

/// Uploads bytes to device objects on a dedicated thread.
///
/// Producers on any thread call [`TransferEngine::submit`] and get a [`Ticket`] immediately.
/// The transfer thread batches the queued uploads into a bounded [`StagingRegion`], submits
/// one batch at a time to the transfer queue and records the completion counter of the batch
/// against the ticket of every upload whose last fragment was part of the batch.
pub struct TransferEngine {
    shared: Arc<Shared>,
    wakeup_sender: Sender<()>,
    staging_capacity: u64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TransferEngine {
    pub fn new(device: Arc<dyn TransferDevice>, config: &StreamingConfig) -> Result<Self> {
        config.check()?;
        let _tracy_client = Client::start();
        let shared = Arc::new(Shared {
            device,
            tickets: TicketAllocator::new(),
            incoming: Mutex::new(Incoming::default()),
            acquire_barriers: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            last_submitted: AtomicU64::new(0),
            submission_count: AtomicUsize::new(0),
            wants_drop: AtomicBool::new(false),
        });

        // A single pending wakeup is enough because the thread takes all queued tasks at once.
        let (wakeup_sender, wakeup_receiver) = crossbeam_channel::bounded(1);
        let staging = StagingRegion::new(config.staging_capacity, config.staging_alignment);
        let idle_wait = config.transfer_idle_wait();
        let shared2 = shared.clone();
        let thread = thread::Builder::new()
            .name("TransferEngine thread".to_owned())
            .spawn(move || run(shared2, wakeup_receiver, staging, idle_wait))
            .map_err(|_| Error::FailedToStartThread)?;

        info!(
            "Created TransferEngine with a staging region of {}",
            format_bytes(config.staging_capacity)
        );
        Ok(Self {
            shared,
            wakeup_sender,
            staging_capacity: config.staging_capacity,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Enqueues the upload and returns its ticket.
    ///
    /// Fails with [`Error::InvalidTransfer`] when the source doesn't match the destination and
    /// with [`Error::QueueOverflow`] when a single image layer is larger than the staging region.
    pub fn submit(&self, priority: Priority, source: Source, destination: Destination) -> Result<Ticket> {
        if self.shared.wants_drop.load(Ordering::SeqCst) {
            return Err(Error::ShutDown);
        }
        TransferTask::check(&source, &destination)?;
        let min_fragment_size = destination.min_fragment_size();
        if min_fragment_size > self.staging_capacity {
            return Err(Error::QueueOverflow {
                size: min_fragment_size,
                capacity: self.staging_capacity,
            });
        }

        // Checked under the lock so that no task is queued after the final drain of the thread.
        let mut incoming = self.shared.incoming.lock();
        if incoming.stopped {
            return Err(Error::ShutDown);
        }
        let ticket = self.shared.tickets.get_ticket();
        let task = TransferTask::new(ticket, priority, source, destination)?;
        trace!("Submitting {:?} with {} bytes to the TransferEngine", ticket, task.size());
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        incoming.tasks.push(task);
        drop(incoming);
        // A full channel means that a wakeup is already pending.
        let _ = self.wakeup_sender.try_send(());
        Ok(ticket)
    }

    /// Uploads the bytes into the buffer starting at `offset`.
    pub fn submit_buffer(
        &self,
        priority: Priority,
        bytes: impl Into<SourceBytes>,
        buffer: BufferId,
        offset: u64,
    ) -> Result<Ticket> {
        self.submit(priority, Source::new(bytes), Destination::Buffer { buffer, offset })
    }

    /// Uploads all layers of an image. The bytes contain the layers one after another with tight rows.
    pub fn submit_image(
        &self,
        priority: Priority,
        bytes: impl Into<SourceBytes>,
        image: ImageId,
        desc: &ImageDesc,
        layout: ImageLayout,
    ) -> Result<Ticket> {
        let destination = Destination::Image {
            image,
            extent: desc.extent,
            row_pitch: desc.row_pitch(),
            base_layer: 0,
            layer_count: desc.layers,
            layout,
        };
        self.submit(priority, Source::new(bytes), destination)
    }

    pub fn status(&self, ticket: Ticket) -> TicketStatus {
        let completed = self.shared.device.completed_counter(QueueKind::Transfer);
        self.shared.tickets.status(ticket, completed)
    }

    /// Returns whether the upload completed, failed or the ticket is stale. Never blocks.
    pub fn is_ready(&self, ticket: Ticket) -> bool {
        self.status(ticket) != TicketStatus::Pending
    }

    /// Returns the table entry of a failed ticket so that it can be reused.
    pub fn retire(&self, ticket: Ticket) {
        self.shared.tickets.retire(ticket);
    }

    /// Removes and returns the acquire barriers of every completed upload. They have to be
    /// recorded on the consumer queue before the uploaded objects are used there.
    pub fn take_acquire_barriers(&self) -> Vec<Barrier> {
        let completed = self.shared.device.completed_counter(QueueKind::Transfer);
        let mut acquire_barriers = self.shared.acquire_barriers.lock();
        let mut ready = Vec::new();
        acquire_barriers.retain(|(ticket, barrier)| match self.shared.tickets.status(*ticket, completed) {
            TicketStatus::Pending => true,
            TicketStatus::Ready => {
                ready.push(barrier.clone());
                false
            }
            TicketStatus::Failed => false,
        });
        ready
    }

    /// Returns whether every submitted upload was handed to the device and completed.
    pub fn is_idle(&self) -> bool {
        self.shared.outstanding.load(Ordering::SeqCst) == 0
            && self.shared.device.completed_counter(QueueKind::Transfer) >= self.shared.last_submitted.load(Ordering::SeqCst)
    }

    /// Spins until the engine is idle or the `timeout` elapsed. Returns whether the engine is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.is_idle() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            spin_sleep::sleep(Duration::from_micros(500));
        }
    }

    /// Number of batches that were submitted to the device
    pub fn submission_count(&self) -> usize {
        self.shared.submission_count.load(Ordering::SeqCst)
    }

    pub fn staging_capacity(&self) -> u64 {
        self.staging_capacity
    }

    pub fn device(&self) -> &Arc<dyn TransferDevice> {
        &self.shared.device
    }

    /// Stops the transfer thread. Uploads that were not submitted yet are marked as failed.
    pub fn shutdown(&self) {
        self.shared.wants_drop.store(true, Ordering::SeqCst);
        let _ = self.wakeup_sender.try_send(());
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("TransferEngine thread panicked");
            }
        }
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<Shared>, wakeup_receiver: Receiver<()>, mut staging: StagingRegion, idle_wait: Duration) {
    info!("Starting TransferEngine thread");
    let mut back_buffer = Vec::new();
    let mut lanes = Lanes::default();
    let mut in_flight = None;
    loop {
        let wants_drop = shared.wants_drop.load(Ordering::SeqCst);
        {
            let mut incoming = shared.incoming.lock();
            mem::swap(&mut incoming.tasks, &mut back_buffer);
            incoming.stopped = wants_drop;
        }
        for task in back_buffer.drain(..) {
            lanes.push_back(task);
        }
        shared
            .tickets
            .recycle_completed(shared.device.completed_counter(QueueKind::Transfer));

        if wants_drop {
            let mut dropped = 0;
            for task in lanes.drain() {
                shared.tickets.fail(task.ticket);
                if task.last {
                    dropped += 1;
                }
            }
            if dropped > 0 {
                warn!("TransferEngine dropped {dropped} uploads at shutdown");
                shared.outstanding.fetch_sub(dropped, Ordering::SeqCst);
            }
            break;
        }

        if lanes.is_empty() {
            let _ = wakeup_receiver.recv_timeout(idle_wait);
            continue;
        }

        // The previous batch might still read from the staging region. Tasks that arrived
        // while waiting are sorted into the lanes before the next batch is recorded.
        if let Some(counter) = in_flight {
            if shared.device.wait(QueueKind::Transfer, counter, idle_wait) {
                in_flight = None;
            }
            continue;
        }
        in_flight = record_batch(&shared, &mut staging, &mut lanes);
    }
    info!("TransferEngine thread will stop now");
}

fn copy_command(task: &TransferTask, staging_offset: u64) -> Command {
    match &task.destination {
        Destination::Buffer { buffer, offset } => Command::CopyBuffer {
            staging_offset,
            buffer: *buffer,
            offset: *offset,
            size: task.size(),
        },
        Destination::Image {
            image,
            extent,
            row_pitch,
            base_layer,
            layer_count,
            layout,
        } => Command::CopyImage {
            staging_offset,
            image: *image,
            extent: *extent,
            row_pitch: *row_pitch,
            base_layer: *base_layer,
            layer_count: *layer_count,
            layout: *layout,
        },
    }
}

/// Fills the staging region with as many queued tasks as fit and submits them as one batch.
/// Returns the counter of the submission.
fn record_batch(shared: &Shared, staging: &mut StagingRegion, lanes: &mut Lanes) -> Option<u64> {
    let _span = span!("record transfer batch");
    staging.reset();
    let mut commands = Vec::new();
    let mut touched = Vec::new();
    let mut finished = Vec::new();
    while let Some(task) = lanes.pop_front() {
        let task = match task.split(staging.remaining()) {
            Split::Whole(task) => task,
            Split::Parts(head, tail) => {
                lanes.push_front(tail);
                head
            }
            Split::TooLarge(task) if staging.is_empty() => {
                // Rejected in `submit` so that this only happens for a broken task.
                error!("{:?} doesn't fit into the empty staging region", task.ticket);
                shared.tickets.fail(task.ticket);
                lanes.retain(|queued| queued.ticket != task.ticket);
                shared.outstanding.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            Split::TooLarge(task) => {
                lanes.push_front(task);
                break;
            }
        };
        let Some(staging_offset) = staging.push(task.source.data()) else {
            lanes.push_front(task);
            break;
        };
        commands.push(copy_command(&task, staging_offset));
        touched.push(task.ticket);
        if task.last {
            commands.push(Command::Barrier(Barrier::release(task.barrier.clone())));
            finished.push((task.ticket, Barrier::acquire(task.barrier)));
        }
    }
    if commands.is_empty() {
        return None;
    }

    match shared.device.submit(QueueKind::Transfer, staging.as_slice(), &commands) {
        Ok(counter) => {
            trace!(
                "Submitted transfer batch {counter} with {} commands and {}",
                commands.len(),
                format_bytes(staging.len())
            );
            for (ticket, _) in &finished {
                shared.tickets.record(*ticket, counter);
            }
            let finished_count = finished.len();
            shared.acquire_barriers.lock().extend(finished);
            shared.last_submitted.store(counter, Ordering::SeqCst);
            shared.submission_count.fetch_add(1, Ordering::SeqCst);
            shared.outstanding.fetch_sub(finished_count, Ordering::SeqCst);
            Some(counter)
        }
        Err(err) => {
            error!("Failed to submit transfer batch with {} commands: {err}", commands.len());
            touched.sort_by_key(|ticket: &Ticket| (ticket.id(), ticket.generation()));
            touched.dedup();
            for ticket in &touched {
                shared.tickets.fail(*ticket);
            }
            lanes.retain(|queued| !touched.contains(&queued.ticket));
            shared.outstanding.fetch_sub(touched.len(), Ordering::SeqCst);
            None
        }
    }
}
