//! Fence-based asynchronous readback
//!
//! `ReadbackQueue::request` queues a device-to-host copy into a slot drawn
//! from the owner's rotating `TransferPool` and returns a ticket. The queue is
//! resolved once per frame: signaled fences are drained into their ticket,
//! failed fences fail it, everything else waits for the next frame.
//!
//! A ticket whose owner is disposed, or whose slot is reused by the rotating
//! pool while still in flight, is abandoned and never resolves.

use std::cell::RefCell;
use std::rc::Rc;

use super::GroupId;
use crate::compute::{ComputeBackend, FenceStatus, GridId, PoolId, TransferFence, TransferSlot};
use crate::error::{BulletError, Result};

#[derive(Debug, Clone, PartialEq)]
enum TicketState {
    Pending,
    Ready(Vec<f32>),
    Failed(BulletError),
    Abandoned,
    Taken,
}

/// Observable state of a ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    Pending,
    Ready,
    Failed,
    /// Owner disposed or slot reused; will never resolve
    Abandoned,
    /// Result already taken
    Consumed,
}

/// Polled handle to one readback
#[derive(Debug, Clone)]
pub struct ReadbackTicket {
    state: Rc<RefCell<TicketState>>,
}

impl ReadbackTicket {
    fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(TicketState::Pending)),
        }
    }

    pub fn status(&self) -> TicketStatus {
        match &*self.state.borrow() {
            TicketState::Pending => TicketStatus::Pending,
            TicketState::Ready(_) => TicketStatus::Ready,
            TicketState::Failed(_) => TicketStatus::Failed,
            TicketState::Abandoned => TicketStatus::Abandoned,
            TicketState::Taken => TicketStatus::Consumed,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == TicketStatus::Pending
    }

    /// Take the resolved value; `None` while pending, abandoned or already taken
    pub fn take(&self) -> Option<Result<Vec<f32>>> {
        let mut state = self.state.borrow_mut();
        match &*state {
            TicketState::Ready(_) | TicketState::Failed(_) => {}
            _ => return None,
        }
        match std::mem::replace(&mut *state, TicketState::Taken) {
            TicketState::Ready(data) => Some(Ok(data)),
            TicketState::Failed(err) => Some(Err(err)),
            _ => None,
        }
    }

    fn settle(&self, next: TicketState) {
        let mut state = self.state.borrow_mut();
        if *state == TicketState::Pending {
            *state = next;
        }
    }
}

/// Fixed-depth rotating set of transfer slots owned by one group
#[derive(Debug, Clone)]
pub struct TransferPool {
    id: PoolId,
    depth: usize,
    cursor: usize,
}

impl TransferPool {
    pub fn new(id: PoolId, depth: usize) -> Self {
        Self {
            id,
            depth: depth.max(1),
            cursor: 0,
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Next slot; wraps to the oldest once every slot has been handed out
    pub fn next_slot(&mut self) -> TransferSlot {
        let slot = TransferSlot {
            pool: self.id,
            index: self.cursor,
        };
        self.cursor = (self.cursor + 1) % self.depth;
        slot
    }
}

struct PendingReadback {
    fence: Box<dyn TransferFence>,
    ticket: ReadbackTicket,
    owner: GroupId,
    slot: TransferSlot,
}

/// Process-wide list of in-flight readbacks
#[derive(Default)]
pub struct ReadbackQueue {
    pending: Vec<PendingReadback>,
}

impl ReadbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Queue a transfer of `grid` and return its ticket
    pub fn request(
        &mut self,
        backend: &mut dyn ComputeBackend,
        grid: GridId,
        pool: &mut TransferPool,
        owner: GroupId,
    ) -> Result<ReadbackTicket> {
        let slot = pool.next_slot();

        // The slot's previous transfer can no longer be trusted
        let before = self.pending.len();
        self.pending.retain(|p| {
            if p.slot == slot {
                p.ticket.settle(TicketState::Abandoned);
                false
            } else {
                true
            }
        });
        if self.pending.len() != before {
            log::warn!(
                "Readback slot {} of pool {} reused while in flight",
                slot.index,
                slot.pool.0
            );
        }

        let fence = backend.begin_transfer(grid, slot)?;
        let ticket = ReadbackTicket::new();
        self.pending.push(PendingReadback {
            fence,
            ticket: ticket.clone(),
            owner,
            slot,
        });
        Ok(ticket)
    }

    /// Poll the backend once and settle every fence that has finished
    pub fn resolve(&mut self, backend: &mut dyn ComputeBackend) {
        backend.poll();

        self.pending.retain_mut(|p| match p.fence.status() {
            FenceStatus::Pending => true,
            FenceStatus::Signaled => {
                match p.fence.drain() {
                    Ok(data) => p.ticket.settle(TicketState::Ready(data)),
                    Err(err) => {
                        log::warn!("Readback for group {} failed to drain: {}", p.owner.0, err);
                        p.ticket.settle(TicketState::Failed(err));
                    }
                }
                false
            }
            FenceStatus::Failed(msg) => {
                log::warn!("Readback for group {} failed: {}", p.owner.0, msg);
                p.ticket.settle(TicketState::Failed(BulletError::Readback(msg)));
                false
            }
        });
    }

    /// Abandon every in-flight readback owned by `owner`
    pub fn abandon_owner(&mut self, owner: GroupId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|p| {
            if p.owner == owner {
                p.ticket.settle(TicketState::Abandoned);
                false
            } else {
                true
            }
        });
        let abandoned = before - self.pending.len();
        if abandoned > 0 {
            log::debug!("Abandoned {} readbacks of group {}", abandoned, owner.0);
        }
        abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{CpuBackend, TransferMode};

    fn setup() -> (CpuBackend, GridId, TransferPool) {
        let mut backend = CpuBackend::new();
        let grid = backend.allocate(2, [3.0; 4]).unwrap();
        (backend, grid, TransferPool::new(PoolId(7), 4))
    }

    #[test]
    fn test_pool_rotates() {
        let mut pool = TransferPool::new(PoolId(1), 3);
        let indices: Vec<usize> = (0..7).map(|_| pool.next_slot().index).collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_ticket_resolves_on_a_later_frame() {
        let (mut backend, grid, mut pool) = setup();
        let mut queue = ReadbackQueue::new();
        let ticket = queue.request(&mut backend, grid, &mut pool, GroupId(1)).unwrap();

        assert!(ticket.is_pending());
        assert!(ticket.take().is_none());

        queue.resolve(&mut backend);
        assert_eq!(ticket.status(), TicketStatus::Ready);
        assert_eq!(ticket.take().unwrap().unwrap(), vec![3.0; 16]);
        assert_eq!(ticket.status(), TicketStatus::Consumed);
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_unsignaled_fence_stays_pending() {
        let (mut backend, grid, mut pool) = setup();
        backend.set_transfer_mode(TransferMode::Stalled);
        let mut queue = ReadbackQueue::new();
        let ticket = queue.request(&mut backend, grid, &mut pool, GroupId(1)).unwrap();

        for _ in 0..50 {
            queue.resolve(&mut backend);
            assert!(ticket.is_pending());
        }
        assert_eq!(queue.in_flight(), 1);
    }

    #[test]
    fn test_failed_fence_fails_only_its_ticket() {
        let (mut backend, grid, mut pool) = setup();
        let mut queue = ReadbackQueue::new();
        backend.set_transfer_mode(TransferMode::Failing);
        let ticket = queue.request(&mut backend, grid, &mut pool, GroupId(1)).unwrap();
        queue.resolve(&mut backend);

        let err = ticket.take().unwrap().unwrap_err();
        assert!(matches!(err, BulletError::Readback(_)));

        backend.set_transfer_mode(TransferMode::Normal);
        let ticket = queue.request(&mut backend, grid, &mut pool, GroupId(1)).unwrap();
        queue.resolve(&mut backend);
        assert!(ticket.take().unwrap().is_ok());
    }

    #[test]
    fn test_disposed_owner_never_resolves() {
        let (mut backend, grid, mut pool) = setup();
        backend.set_transfer_mode(TransferMode::Stalled);
        let mut queue = ReadbackQueue::new();
        let ticket = queue.request(&mut backend, grid, &mut pool, GroupId(1)).unwrap();
        queue.resolve(&mut backend);

        assert_eq!(queue.abandon_owner(GroupId(1)), 1);
        backend.set_transfer_mode(TransferMode::Normal);

        // another group reuses the same pool slots and grid
        let mut other = TransferPool::new(PoolId(7), 4);
        let fresh = queue.request(&mut backend, grid, &mut other, GroupId(2)).unwrap();
        for _ in 0..5 {
            queue.resolve(&mut backend);
        }
        assert_eq!(ticket.status(), TicketStatus::Abandoned);
        assert!(ticket.take().is_none());
        assert_eq!(fresh.status(), TicketStatus::Ready);
    }

    #[test]
    fn test_slot_reuse_abandons_stale_ticket() {
        let (mut backend, grid, _) = setup();
        backend.set_transfer_mode(TransferMode::Stalled);
        let mut pool = TransferPool::new(PoolId(3), 2);
        let mut queue = ReadbackQueue::new();

        let first = queue.request(&mut backend, grid, &mut pool, GroupId(1)).unwrap();
        let second = queue.request(&mut backend, grid, &mut pool, GroupId(1)).unwrap();
        let third = queue.request(&mut backend, grid, &mut pool, GroupId(1)).unwrap();

        assert_eq!(first.status(), TicketStatus::Abandoned);
        assert!(second.is_pending());
        assert!(third.is_pending());
        assert_eq!(queue.in_flight(), 2);
    }
}
