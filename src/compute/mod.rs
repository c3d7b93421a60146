//! Compute backends
//!
//! `ComputeBackend` is the only place kernels execute. The CPU backend is a
//! reference executor that is always available; the wgpu backend runs the
//! same programs as WGSL compute shaders.

pub mod cpu;
pub mod gpu;

pub use cpu::{CpuBackend, TransferMode};
pub use gpu::GpuBackend;

use crate::error::Result;
use crate::grid::StateGrid;
use crate::kernel::{CellProgram, KernelInputs, KernelUniforms};

/// Handle to a device-resident grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridId(pub u64);

/// Owner of a set of rotating transfer slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub u64);

/// One slot of a transfer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferSlot {
    pub pool: PoolId,
    pub index: usize,
}

/// One kernel evaluation over every cell of `target`
pub struct Dispatch<'a> {
    pub program: &'a dyn CellProgram,
    pub inputs: &'a KernelInputs,
    pub uniforms: &'a KernelUniforms,
    pub target: GridId,
}

/// State of a queued device-to-host transfer
#[derive(Debug, Clone, PartialEq)]
pub enum FenceStatus {
    Pending,
    Signaled,
    Failed(String),
}

/// Fence over one queued transfer
pub trait TransferFence {
    /// Non-blocking status check
    fn status(&mut self) -> FenceStatus;

    /// Copy the transferred floats out; only valid once signaled
    fn drain(&mut self) -> Result<Vec<f32>>;
}

pub trait ComputeBackend {
    /// Short name for logs
    fn name(&self) -> &'static str;

    fn upload(&mut self, grid: &StateGrid) -> Result<GridId>;

    /// Allocate a grid of the given width filled with `value`
    fn allocate(&mut self, width: u32, value: [f32; 4]) -> Result<GridId> {
        self.upload(&StateGrid::filled(width, value))
    }

    fn release(&mut self, grid: GridId);

    fn width(&self, grid: GridId) -> Option<u32>;

    /// Warm a program up; true once it can be dispatched
    fn prepare(&mut self, program: &dyn CellProgram) -> Result<bool>;

    /// Evaluate a program over every cell of the target grid
    fn dispatch(&mut self, dispatch: &Dispatch) -> Result<()>;

    /// One reduction stage: `target` (width w/2) receives the 2x2 block sums of `source`
    fn reduce(&mut self, source: GridId, target: GridId) -> Result<()>;

    /// Queue a copy of `grid` into a transfer slot and fence it
    fn begin_transfer(&mut self, grid: GridId, slot: TransferSlot) -> Result<Box<dyn TransferFence>>;

    /// Drop every staging resource owned by a pool
    fn release_transfer_pool(&mut self, pool: PoolId);

    /// Advance device work so fences can make progress
    fn poll(&mut self);

    /// Blocking host copy of a grid (tests and diagnostics)
    fn read_grid(&mut self, grid: GridId) -> Result<StateGrid>;
}
