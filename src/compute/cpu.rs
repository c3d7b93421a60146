//! Reference backend: evaluates programs on the host, one cell at a time

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use super::{
    ComputeBackend, Dispatch, FenceStatus, GridId, PoolId, TransferFence, TransferSlot,
};
use crate::error::{BulletError, Result};
use crate::grid::StateGrid;
use crate::kernel::{CellContext, CellProgram, InputSlot};

/// How queued transfers behave; lets callers simulate a slow or failing device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Signal on the first poll after submission
    #[default]
    Normal,
    /// Never signal
    Stalled,
    /// Report failure on the first poll after submission
    Failing,
}

/// Poll counter and transfer mode shared with outstanding fences
#[derive(Debug, Default)]
struct Clock {
    epoch: Cell<u64>,
    mode: Cell<TransferMode>,
}

pub struct CpuBackend {
    grids: HashMap<GridId, StateGrid>,
    next_id: u64,
    clock: Rc<Clock>,
    dispatches: u64,
    /// Prepare calls each program answers cold before reporting ready
    warmup: u32,
    prepared: HashMap<&'static str, u32>,
    /// Uploads left before every further upload fails; `None` is unlimited
    upload_budget: Option<usize>,
    dispatch_failing: bool,
    rejected: u64,
    transfers: u64,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            grids: HashMap::new(),
            next_id: 1,
            clock: Rc::new(Clock::default()),
            dispatches: 0,
            warmup: 0,
            prepared: HashMap::new(),
            upload_budget: None,
            dispatch_failing: false,
            rejected: 0,
            transfers: 0,
        }
    }

    pub fn set_transfer_mode(&mut self, mode: TransferMode) {
        self.clock.mode.set(mode);
    }

    /// Each program reports cold for its first `calls` prepare calls, the way
    /// a device compiles pipelines in the background
    pub fn set_warmup_calls(&mut self, calls: u32) {
        self.warmup = calls;
        self.prepared.clear();
    }

    /// Let `uploads` more uploads succeed, then fail the rest
    pub fn set_upload_budget(&mut self, uploads: Option<usize>) {
        self.upload_budget = uploads;
    }

    /// Make every dispatch fail with a backend error
    pub fn set_dispatch_failing(&mut self, failing: bool) {
        self.dispatch_failing = failing;
    }

    /// Dispatches refused while failing
    pub fn rejected_dispatches(&self) -> u64 {
        self.rejected
    }

    /// Grids currently alive
    pub fn live_grids(&self) -> usize {
        self.grids.len()
    }

    /// Total program and reduction dispatches so far
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    /// Device-to-host transfers queued so far
    pub fn transfer_count(&self) -> u64 {
        self.transfers
    }

    fn grid(&self, id: GridId) -> Result<&StateGrid> {
        self.grids
            .get(&id)
            .ok_or_else(|| BulletError::Backend(format!("unknown grid {}", id.0)))
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn upload(&mut self, grid: &StateGrid) -> Result<GridId> {
        if let Some(left) = self.upload_budget.as_mut() {
            if *left == 0 {
                return Err(BulletError::Backend("out of device memory".into()));
            }
            *left -= 1;
        }
        let id = GridId(self.next_id);
        self.next_id += 1;
        self.grids.insert(id, grid.clone());
        Ok(id)
    }

    fn release(&mut self, grid: GridId) {
        self.grids.remove(&grid);
    }

    fn width(&self, grid: GridId) -> Option<u32> {
        self.grids.get(&grid).map(|g| g.width())
    }

    fn prepare(&mut self, program: &dyn CellProgram) -> Result<bool> {
        let calls = self.prepared.entry(program.name()).or_insert(0);
        *calls = calls.saturating_add(1);
        Ok(*calls > self.warmup)
    }

    fn dispatch(&mut self, dispatch: &Dispatch) -> Result<()> {
        if self.dispatch_failing {
            self.rejected += 1;
            return Err(BulletError::Backend(format!(
                "{}: simulated device loss",
                dispatch.program.name()
            )));
        }
        if dispatch.inputs.contains(dispatch.target) {
            return Err(BulletError::state(format!(
                "{} writes grid {} while reading it",
                dispatch.program.name(),
                dispatch.target.0
            )));
        }

        let width = self
            .width(dispatch.target)
            .ok_or_else(|| BulletError::Backend(format!("unknown grid {}", dispatch.target.0)))?;

        let mut sources: Vec<&[[f32; 4]]> = Vec::with_capacity(InputSlot::ALL.len());
        for slot in InputSlot::ALL {
            let grid = self.grid(dispatch.inputs.get(slot))?;
            if grid.width() != width {
                return Err(BulletError::Backend(format!(
                    "{}: input {:?} has width {}, target has {}",
                    dispatch.program.name(),
                    slot,
                    grid.width(),
                    width
                )));
            }
            sources.push(grid.cells());
        }
        let inputs: [&[[f32; 4]]; 7] = [
            sources[0], sources[1], sources[2], sources[3], sources[4], sources[5], sources[6],
        ];

        let cells: Vec<[f32; 4]> = (0..(width as usize * width as usize))
            .map(|index| {
                let ctx = CellContext::new(index, width, dispatch.uniforms, inputs);
                dispatch.program.eval(&ctx).to_array()
            })
            .collect();

        let target = StateGrid::from_cells(width, cells)
            .ok_or_else(|| BulletError::Backend("dispatch produced a ragged grid".into()))?;
        self.grids.insert(dispatch.target, target);
        self.dispatches += 1;
        Ok(())
    }

    fn reduce(&mut self, source: GridId, target: GridId) -> Result<()> {
        if source == target {
            return Err(BulletError::state("reduction stage reads its own output"));
        }
        let src = self.grid(source)?;
        let source_width = src.width();
        let width = source_width / 2;
        if self.width(target) != Some(width) {
            return Err(BulletError::Backend(format!(
                "reduction target must have width {width}"
            )));
        }

        let sw = source_width as usize;
        let w = width as usize;
        let mut cells = vec![[0.0f32; 4]; w * w];
        for (i, out) in cells.iter_mut().enumerate() {
            let (x, y) = (i % w, i / w);
            let base = (y * 2) * sw + x * 2;
            for offset in [base, base + 1, base + sw, base + sw + 1] {
                for (acc, v) in out.iter_mut().zip(src.cells()[offset]) {
                    *acc += v;
                }
            }
        }

        let reduced = StateGrid::from_cells(width, cells)
            .ok_or_else(|| BulletError::Backend("reduction produced a ragged grid".into()))?;
        self.grids.insert(target, reduced);
        self.dispatches += 1;
        Ok(())
    }

    fn begin_transfer(&mut self, grid: GridId, _slot: TransferSlot) -> Result<Box<dyn TransferFence>> {
        let data = self.grid(grid)?.as_flat().to_vec();
        self.transfers += 1;
        Ok(Box::new(CpuFence {
            data: Some(data),
            submitted: self.clock.epoch.get(),
            clock: Rc::clone(&self.clock),
        }))
    }

    fn release_transfer_pool(&mut self, _pool: PoolId) {}

    fn poll(&mut self) {
        self.clock.epoch.set(self.clock.epoch.get() + 1);
    }

    fn read_grid(&mut self, grid: GridId) -> Result<StateGrid> {
        self.grid(grid).cloned()
    }
}

/// Snapshot taken at submission, released on a later poll
struct CpuFence {
    data: Option<Vec<f32>>,
    submitted: u64,
    clock: Rc<Clock>,
}

impl TransferFence for CpuFence {
    fn status(&mut self) -> FenceStatus {
        if self.clock.epoch.get() <= self.submitted {
            return FenceStatus::Pending;
        }
        match self.clock.mode.get() {
            TransferMode::Normal => FenceStatus::Signaled,
            TransferMode::Stalled => FenceStatus::Pending,
            TransferMode::Failing => FenceStatus::Failed("simulated device loss".into()),
        }
    }

    fn drain(&mut self) -> Result<Vec<f32>> {
        if self.status() != FenceStatus::Signaled {
            return Err(BulletError::Readback("transfer drained before its fence signaled".into()));
        }
        self.data
            .take()
            .ok_or_else(|| BulletError::Readback("transfer already drained".into()))
    }
}
