//! Simulation driver
//!
//! Everything here runs on one thread, ticked once per frame:
//! - `system`: double-buffered position/velocity/collision kernel pairs
//! - `reduce`: 2x2 summing chain over a collision grid
//! - `readback`: fence-polled transfers with rotating slot pools
//! - `world`: actor snapshot and the flat buffers kernels read
//! - `manager`: group lifecycle and collision event decoding

pub mod manager;
pub mod readback;
pub mod reduce;
pub mod system;
pub mod world;

pub use manager::{BulletGroupManager, CollisionEvent, FrameReport};
pub use readback::{ReadbackQueue, ReadbackTicket, TicketStatus, TransferPool};
pub use reduce::ReductionChain;
pub use system::{DifferentialSystem, KernelSet, StepOutput};
pub use world::{ActorBuffers, Collider, EmitterId, ParentTransform, WorldSnapshot};

/// Identity of a live bullet group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);
