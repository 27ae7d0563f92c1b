use std::{
    collections::VecDeque,
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use strom_shared::parking_lot::{Mutex, RwLock};

/// Counter value of a ticket whose last fragment wasn't submitted yet
const PENDING: u64 = u64::MAX;
/// Counter value of a ticket whose submission was rejected by the device
const FAILED: u64 = u64::MAX - 1;

/// Pollable completion future of an upload.
///
/// A `Ticket` is a generation-checked reference into the table of the [`TicketAllocator`].
/// Once the entry was recycled the ticket is stale and resolves as ready, so that polling
/// a ticket never blocks forever.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    generation: u32,
    id: u32,
}

impl Ticket {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ticket({}v{})", self.id, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    /// The upload hasn't completed yet
    Pending,
    /// The upload completed or the ticket is stale
    Ready,
    /// The device rejected the batch that contained the upload
    Failed,
}

struct TicketEntry {
    generation: AtomicU32,
    counter: AtomicU64,
}

struct FreeList {
    free: VecDeque<u32>,
    /// Ids whose counter was recorded but not reached when they were last checked
    recorded: Vec<u32>,
}

/// Allocator of [`Ticket`]s
///
/// Entries are only returned to the free list after their counter was reached. Entries of
/// failed tickets are returned by [`TicketAllocator::retire`].
pub struct TicketAllocator {
    entries: RwLock<Vec<TicketEntry>>,
    free_list: Mutex<FreeList>,
}

impl Default for TicketAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketAllocator {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            free_list: Mutex::new(FreeList {
                free: VecDeque::new(),
                recorded: Vec::new(),
            }),
        }
    }

    /// Pops a free ticket or grows the table.
    pub fn get_ticket(&self) -> Ticket {
        let mut free_list = self.free_list.lock();
        if let Some(id) = free_list.free.pop_front() {
            let entries = self.entries.read();
            let entry = &entries[id as usize];
            // The generation was bumped when the entry was freed, so stale tickets already
            // resolve as ready before the counter is reset.
            entry.counter.store(PENDING, Ordering::Release);
            Ticket {
                generation: entry.generation.load(Ordering::Acquire),
                id,
            }
        } else {
            let mut entries = self.entries.write();
            let id = entries.len() as u32;
            entries.push(TicketEntry {
                generation: AtomicU32::new(1),
                counter: AtomicU64::new(PENDING),
            });
            Ticket { generation: 1, id }
        }
    }

    /// Records the completion counter of the batch that contained the last fragment of the ticket.
    pub fn record(&self, ticket: Ticket, counter: u64) {
        strom_shared::assert!(counter < FAILED, "counter {counter} collides with the sentinels");
        if self.store_counter(ticket, counter) {
            self.free_list.lock().recorded.push(ticket.id);
        }
    }

    /// Marks the ticket as failed.
    pub fn fail(&self, ticket: Ticket) {
        self.store_counter(ticket, FAILED);
    }

    fn store_counter(&self, ticket: Ticket, counter: u64) -> bool {
        let entries = self.entries.read();
        let Some(entry) = entries.get(ticket.id as usize) else {
            return false;
        };
        if entry.generation.load(Ordering::Acquire) != ticket.generation {
            return false;
        }
        entry
            .counter
            .compare_exchange(PENDING, counter, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns the status of the ticket given the counter that the transfer queue reached.
    pub fn status(&self, ticket: Ticket, completed: u64) -> TicketStatus {
        let entries = self.entries.read();
        let Some(entry) = entries.get(ticket.id as usize) else {
            return TicketStatus::Ready;
        };
        if entry.generation.load(Ordering::Acquire) != ticket.generation {
            return TicketStatus::Ready;
        }
        let counter = entry.counter.load(Ordering::Acquire);
        // The entry might have been recycled between the two loads. Then the counter belongs
        // to the next owner and the ticket is stale.
        if entry.generation.load(Ordering::Acquire) != ticket.generation {
            return TicketStatus::Ready;
        }
        match counter {
            PENDING => TicketStatus::Pending,
            FAILED => TicketStatus::Failed,
            counter if counter <= completed => TicketStatus::Ready,
            _ => TicketStatus::Pending,
        }
    }

    /// Returns every entry whose counter was reached to the free list.
    pub fn recycle_completed(&self, completed: u64) -> usize {
        let mut free_list = self.free_list.lock();
        let entries = self.entries.read();
        let FreeList { free, recorded } = &mut *free_list;
        let before = free.len();
        recorded.retain(|id| {
            let entry = &entries[*id as usize];
            if entry.counter.load(Ordering::Acquire) <= completed {
                // The counter must only be reset after the generation changed. `get_ticket` does it.
                entry.generation.fetch_add(1, Ordering::AcqRel);
                free.push_back(*id);
                false
            } else {
                true
            }
        });
        free.len() - before
    }

    /// Returns the entry of a failed ticket to the free list. Does nothing for other tickets.
    pub fn retire(&self, ticket: Ticket) {
        let mut free_list = self.free_list.lock();
        let entries = self.entries.read();
        let Some(entry) = entries.get(ticket.id as usize) else {
            return;
        };
        if entry.generation.load(Ordering::Acquire) != ticket.generation || entry.counter.load(Ordering::Acquire) != FAILED {
            return;
        }
        entry.generation.fetch_add(1, Ordering::AcqRel);
        free_list.free.push_back(ticket.id);
    }

    /// Number of entries in the table
    pub fn capacity(&self) -> usize {
        self.entries.read().len()
    }

    /// Number of entries that are handed out
    pub fn len(&self) -> usize {
        self.capacity() - self.free_list.lock().free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{atomic::AtomicBool, Arc},
        thread,
    };

    use super::*;

    #[test]
    fn pending_until_recorded() {
        let allocator = TicketAllocator::new();
        let ticket = allocator.get_ticket();
        assert_eq!(allocator.status(ticket, 100), TicketStatus::Pending);
        allocator.record(ticket, 3);
        assert_eq!(allocator.status(ticket, 2), TicketStatus::Pending);
        assert_eq!(allocator.status(ticket, 3), TicketStatus::Ready);
        assert_eq!(allocator.status(ticket, 4), TicketStatus::Ready);
    }

    #[test]
    fn reuse_after_completion() {
        let allocator = TicketAllocator::new();
        let ticket1 = allocator.get_ticket();
        allocator.record(ticket1, 1);

        // Not reached yet, so the entry stays reserved.
        assert_eq!(allocator.recycle_completed(0), 0);
        let ticket2 = allocator.get_ticket();
        assert_ne!(ticket1.id(), ticket2.id());

        assert_eq!(allocator.recycle_completed(1), 1);
        let ticket3 = allocator.get_ticket();
        assert_eq!(ticket3.id(), ticket1.id());
        assert_ne!(ticket3.generation(), ticket1.generation());

        // The stale ticket is vacuously ready while the new owner is pending.
        assert_eq!(allocator.status(ticket1, 0), TicketStatus::Ready);
        assert_eq!(allocator.status(ticket3, 0), TicketStatus::Pending);
        assert_eq!(allocator.capacity(), 2);
        assert_eq!(allocator.len(), 2);
    }

    #[test]
    fn record_is_generation_checked() {
        let allocator = TicketAllocator::new();
        let ticket1 = allocator.get_ticket();
        allocator.record(ticket1, 1);
        allocator.recycle_completed(1);
        let ticket2 = allocator.get_ticket();

        // A late record for the stale ticket must not complete the new owner.
        allocator.record(ticket1, 1);
        assert_eq!(allocator.status(ticket2, 10), TicketStatus::Pending);
    }

    #[test]
    fn record_only_once() {
        let allocator = TicketAllocator::new();
        let ticket = allocator.get_ticket();
        allocator.record(ticket, 5);
        allocator.record(ticket, 1);
        assert_eq!(allocator.status(ticket, 1), TicketStatus::Pending);
        assert_eq!(allocator.status(ticket, 5), TicketStatus::Ready);
    }

    #[test]
    fn failed() {
        let allocator = TicketAllocator::new();
        let ticket = allocator.get_ticket();
        allocator.fail(ticket);
        assert_eq!(allocator.status(ticket, u64::MAX - 2), TicketStatus::Failed);

        // Failed tickets are not recycled by the counter.
        assert_eq!(allocator.recycle_completed(u64::MAX - 2), 0);
        assert_eq!(allocator.status(ticket, 0), TicketStatus::Failed);

        allocator.retire(ticket);
        assert_eq!(allocator.status(ticket, 0), TicketStatus::Ready);
        assert!(allocator.is_empty());
    }

    #[test]
    fn retire_ignores_pending() {
        let allocator = TicketAllocator::new();
        let ticket = allocator.get_ticket();
        allocator.retire(ticket);
        assert_eq!(allocator.status(ticket, 0), TicketStatus::Pending);
        assert_eq!(allocator.len(), 1);
    }

    #[test]
    fn unknown_ticket_is_ready() {
        let allocator = TicketAllocator::new();
        let ticket = Ticket { generation: 1, id: 42 };
        assert_eq!(allocator.status(ticket, 0), TicketStatus::Ready);
    }

    #[test]
    fn readiness_is_monotonic_under_concurrency() {
        let allocator = Arc::new(TicketAllocator::new());
        let completed = Arc::new(AtomicU64::new(0));
        let tickets = (0..64).map(|_| allocator.get_ticket()).collect::<Vec<_>>();

        let pollers = (0..4)
            .map(|_| {
                let allocator = allocator.clone();
                let completed = completed.clone();
                let tickets = tickets.clone();
                thread::spawn(move || {
                    let mut seen_ready = vec![false; tickets.len()];
                    while seen_ready.iter().any(|ready| !ready) {
                        let completed = completed.load(Ordering::Acquire);
                        for (index, ticket) in tickets.iter().enumerate() {
                            let ready = allocator.status(*ticket, completed) == TicketStatus::Ready;
                            assert!(!seen_ready[index] || ready, "ticket {ticket:?} went back to pending");
                            seen_ready[index] |= ready;
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        for (index, ticket) in tickets.iter().enumerate() {
            let counter = index as u64 + 1;
            allocator.record(*ticket, counter);
            completed.store(counter, Ordering::Release);
            if index % 8 == 0 {
                allocator.recycle_completed(counter);
                allocator.get_ticket();
            }
        }

        for poller in pollers {
            poller.join().unwrap();
        }
    }

    #[test]
    fn ready_ticket_stays_ready_while_its_entry_is_reused() {
        let allocator = Arc::new(TicketAllocator::new());
        let ticket = allocator.get_ticket();
        allocator.record(ticket, 1);
        let stop = Arc::new(AtomicBool::new(false));

        let pollers = (0..4)
            .map(|_| {
                let allocator = allocator.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        assert_eq!(allocator.status(ticket, 1), TicketStatus::Ready);
                    }
                })
            })
            .collect::<Vec<_>>();

        // The same entry is freed and handed out again while the pollers observe the first ticket.
        for counter in 1..20_000 {
            assert_eq!(allocator.recycle_completed(counter), 1);
            let next = allocator.get_ticket();
            assert_eq!(next.id(), ticket.id());
            allocator.record(next, counter + 1);
        }
        stop.store(true, Ordering::Release);
        for poller in pollers {
            poller.join().unwrap();
        }
        assert_eq!(allocator.capacity(), 1);
    }

    #[test]
    fn failed_ticket_is_never_pending_after_retire() {
        let allocator = Arc::new(TicketAllocator::new());
        let ticket = allocator.get_ticket();
        allocator.fail(ticket);
        let stop = Arc::new(AtomicBool::new(false));

        let poller = {
            let allocator = allocator.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    assert_ne!(allocator.status(ticket, 0), TicketStatus::Pending);
                }
            })
        };

        let mut current = ticket;
        for _ in 0..20_000 {
            allocator.retire(current);
            current = allocator.get_ticket();
            assert_eq!(current.id(), ticket.id());
            allocator.fail(current);
        }
        stop.store(true, Ordering::Release);
        poller.join().unwrap();
    }
}
