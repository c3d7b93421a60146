//! Differential position/velocity/collision system
//!
//! Three double-buffered kernel pairs. On frame `f` the pair member at
//! `dest = (f + 1) % 2` is evaluated from the grids the other member wrote on
//! the previous step, so no cell ever reads a grid the same step writes.

use std::sync::Arc;

use super::reduce::ReductionChain;
use crate::compute::{ComputeBackend, Dispatch, GridId};
use crate::error::{BulletError, Result};
use crate::grid::{SourceGrids, StateGrid};
use crate::kernel::{CellProgram, KernelInputs, KernelRole, KernelUniforms};

/// Programs for the three quantities
#[derive(Clone)]
pub struct KernelSet {
    pub position: Arc<dyn CellProgram>,
    pub velocity: Arc<dyn CellProgram>,
    pub collision: Arc<dyn CellProgram>,
}

impl KernelSet {
    fn program(&self, role: KernelRole) -> &Arc<dyn CellProgram> {
        match role {
            KernelRole::Position => &self.position,
            KernelRole::Velocity => &self.velocity,
            KernelRole::Collision => &self.collision,
        }
    }
}

/// Grids produced by one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutput {
    pub position: GridId,
    pub velocity: GridId,
    pub collision: GridId,
    /// Reduction output when downsampling, otherwise the collision grid
    pub collision_result: GridId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SystemState {
    Ready,
    Disposed,
}

struct Kernel {
    program: Arc<dyn CellProgram>,
    target: GridId,
    uniforms: KernelUniforms,
    warmed: bool,
    dormant: bool,
}

/// Kernel pairs, static inputs and reduction chain
type Parts = ([[Kernel; 2]; 3], [GridId; 4], Option<ReductionChain>);

const ROLES: [KernelRole; 3] = [KernelRole::Position, KernelRole::Velocity, KernelRole::Collision];

pub struct DifferentialSystem {
    state: SystemState,
    width: u32,
    /// Indexed by role, then buffer
    kernels: [[Kernel; 2]; 3],
    /// initial positions, initial velocities, timings, end timings
    statics: [GridId; 4],
    chain: Option<ReductionChain>,
    frame: usize,
}

fn role_index(role: KernelRole) -> usize {
    match role {
        KernelRole::Position => 0,
        KernelRole::Velocity => 1,
        KernelRole::Collision => 2,
    }
}

impl DifferentialSystem {
    /// Allocate six kernels over the group's source grids and run each
    /// kernel's one-time initializer
    pub fn new(
        backend: &mut dyn ComputeBackend,
        programs: &KernelSet,
        sources: &SourceGrids,
        downsample: bool,
        init: &mut dyn FnMut(KernelRole, &mut KernelUniforms),
    ) -> Result<Self> {
        if !sources.is_consistent() {
            return Err(BulletError::config("source grids disagree on width"));
        }
        let width = sources.width();

        let mut uploaded = Vec::new();
        let built = Self::allocate(backend, programs, sources, downsample, init, &mut uploaded);
        let (kernels, statics, chain) = match built {
            Ok(parts) => parts,
            Err(err) => {
                for grid in uploaded {
                    backend.release(grid);
                }
                return Err(err);
            }
        };

        log::debug!(
            "Differential system: width {}, programs {}/{}/{}, downsample {}",
            width,
            programs.position.name(),
            programs.velocity.name(),
            programs.collision.name(),
            downsample
        );

        Ok(Self {
            state: SystemState::Ready,
            width,
            kernels,
            statics,
            chain,
            frame: 0,
        })
    }

    /// Upload every grid the system owns, recording each id in `uploaded`
    /// so a partial failure can be released by the caller
    fn allocate(
        backend: &mut dyn ComputeBackend,
        programs: &KernelSet,
        sources: &SourceGrids,
        downsample: bool,
        init: &mut dyn FnMut(KernelRole, &mut KernelUniforms),
        uploaded: &mut Vec<GridId>,
    ) -> Result<Parts> {
        let width = sources.width();
        let mut upload = |backend: &mut dyn ComputeBackend, grid: &StateGrid| -> Result<GridId> {
            let id = backend.upload(grid)?;
            uploaded.push(id);
            Ok(id)
        };

        let statics = [
            upload(backend, &sources.initial_positions)?,
            upload(backend, &sources.initial_velocities)?,
            upload(backend, &sources.timings)?,
            upload(backend, &sources.end_timings)?,
        ];

        let mut make_pair = |backend: &mut dyn ComputeBackend, role: KernelRole| -> Result<[Kernel; 2]> {
            let start = match role {
                KernelRole::Position => &sources.positions,
                KernelRole::Velocity => &sources.velocities,
                KernelRole::Collision => &sources.collisions,
            };
            let mut uniforms = KernelUniforms::default();
            uniforms.set_width(width);
            init(role, &mut uniforms);

            let program = Arc::clone(programs.program(role));
            let make = |target| Kernel {
                program: Arc::clone(&program),
                target,
                uniforms,
                warmed: false,
                dormant: false,
            };
            let first = upload(backend, start)?;
            let second = upload(backend, start)?;
            Ok([make(first), make(second)])
        };

        let kernels = [
            make_pair(backend, KernelRole::Position)?,
            make_pair(backend, KernelRole::Velocity)?,
            make_pair(backend, KernelRole::Collision)?,
        ];

        let chain = if downsample {
            Some(ReductionChain::new(backend, width)?)
        } else {
            None
        };

        Ok((kernels, statics, chain))
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn frame(&self) -> usize {
        self.frame
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.state == SystemState::Disposed
    }

    /// Whether the given buffer of a pair is skipped this step
    pub fn is_dormant(&self, role: KernelRole, buffer: usize) -> bool {
        self.kernels[role_index(role)][buffer % 2].dormant
    }

    /// Advance every pair by one step. `None` when disposed or not yet warm.
    pub fn update(
        &mut self,
        backend: &mut dyn ComputeBackend,
        delta: f32,
        bind_uniforms: &mut dyn FnMut(&mut KernelUniforms),
    ) -> Result<Option<StepOutput>> {
        if self.state == SystemState::Disposed {
            return Ok(None);
        }

        let mut all_warm = true;
        for kernel in self.kernels.iter_mut().flatten() {
            if !kernel.warmed {
                kernel.warmed = backend.prepare(kernel.program.as_ref())?;
            }
            all_warm &= kernel.warmed;
        }
        if !all_warm {
            return Ok(None);
        }

        let source = self.frame % 2;
        let dest = (self.frame + 1) % 2;

        let [ip, iv, timings, end_timings] = self.statics;
        let inputs = KernelInputs([
            self.kernels[0][source].target,
            self.kernels[1][source].target,
            self.kernels[2][source].target,
            ip,
            iv,
            timings,
            end_timings,
        ]);

        for pair in self.kernels.iter_mut() {
            pair[source].dormant = true;
            pair[dest].dormant = false;
        }

        for role in ROLES {
            let kernel = &mut self.kernels[role_index(role)][dest];
            kernel.uniforms.set_delta(delta);
            bind_uniforms(&mut kernel.uniforms);
            backend.dispatch(&Dispatch {
                program: kernel.program.as_ref(),
                inputs: &inputs,
                uniforms: &kernel.uniforms,
                target: kernel.target,
            })?;
        }

        let collision = self.kernels[2][dest].target;
        let collision_result = match &self.chain {
            Some(chain) => chain.run(backend, collision)?,
            None => collision,
        };

        self.frame = dest;

        Ok(Some(StepOutput {
            position: self.kernels[0][dest].target,
            velocity: self.kernels[1][dest].target,
            collision,
            collision_result,
        }))
    }

    /// Release all six kernels, the static inputs and any reduction intermediates
    pub fn dispose(&mut self, backend: &mut dyn ComputeBackend) -> Result<()> {
        if self.state == SystemState::Disposed {
            return Err(BulletError::state("differential system disposed twice"));
        }

        for kernel in self.kernels.iter().flatten() {
            backend.release(kernel.target);
        }
        for grid in self.statics {
            backend.release(grid);
        }
        if let Some(chain) = self.chain.take() {
            chain.release(backend);
        }

        self.state = SystemState::Disposed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::CpuBackend;
    use crate::kernel::{CellContext, InputSlot};
    use glam::{Vec3, Vec4};

    /// Adds one to x every step
    struct Counter;

    impl CellProgram for Counter {
        fn name(&self) -> &'static str {
            "test_counter"
        }

        fn wgsl(&self) -> &'static str {
            "fn cell_value(i: u32) -> vec4<f32> { return position_in[i] + vec4<f32>(1.0, 0.0, 0.0, 0.0); }"
        }

        fn eval(&self, ctx: &CellContext) -> Vec4 {
            ctx.read(InputSlot::Position) + Vec4::X
        }
    }

    /// Copies one slot through unchanged
    struct Hold(InputSlot);

    impl CellProgram for Hold {
        fn name(&self) -> &'static str {
            "test_hold"
        }

        fn wgsl(&self) -> &'static str {
            "fn cell_value(i: u32) -> vec4<f32> { return velocity_in[i]; }"
        }

        fn eval(&self, ctx: &CellContext) -> Vec4 {
            ctx.read(self.0)
        }
    }

    /// Every cell reports one collision
    struct Ones;

    impl CellProgram for Ones {
        fn name(&self) -> &'static str {
            "test_ones"
        }

        fn wgsl(&self) -> &'static str {
            "fn cell_value(i: u32) -> vec4<f32> { return vec4<f32>(1.0); }"
        }

        fn eval(&self, _ctx: &CellContext) -> Vec4 {
            Vec4::ONE
        }
    }

    fn counter_set() -> KernelSet {
        KernelSet {
            position: Arc::new(Counter),
            velocity: Arc::new(Hold(InputSlot::Velocity)),
            collision: Arc::new(Ones),
        }
    }

    fn zero_sources(n: usize) -> SourceGrids {
        let mut sources = SourceGrids::from_vectors(
            &vec![Vec3::ZERO; n],
            &vec![Vec3::ZERO; n],
            &vec![0.0; n],
            &vec![10.0; n],
        );
        sources.positions = StateGrid::filled(sources.width(), [0.0; 4]);
        sources
    }

    #[test]
    fn test_counter_has_no_skipped_or_repeated_steps() {
        let mut backend = CpuBackend::new();
        let sources = zero_sources(10);
        let mut system =
            DifferentialSystem::new(&mut backend, &counter_set(), &sources, false, &mut |_, _| {})
                .unwrap();

        let mut last = None;
        for step in 0..1000 {
            let out = system.update(&mut backend, 0.016, &mut |_| {}).unwrap().unwrap();
            if step == 0 {
                let grid = backend.read_grid(out.position).unwrap();
                assert!(grid.cells().iter().all(|c| c[0] == 1.0));
            }
            last = Some(out);
        }

        let grid = backend.read_grid(last.unwrap().position).unwrap();
        assert!(grid.cells().iter().all(|c| c[0] == 1000.0));
    }

    #[test]
    fn test_dest_alternates_and_source_is_dormant() {
        let mut backend = CpuBackend::new();
        let sources = zero_sources(4);
        let mut system =
            DifferentialSystem::new(&mut backend, &counter_set(), &sources, false, &mut |_, _| {})
                .unwrap();

        let a = system.update(&mut backend, 0.1, &mut |_| {}).unwrap().unwrap();
        assert_eq!(system.frame(), 1);
        assert!(system.is_dormant(KernelRole::Position, 0));
        assert!(!system.is_dormant(KernelRole::Position, 1));

        let b = system.update(&mut backend, 0.1, &mut |_| {}).unwrap().unwrap();
        assert_eq!(system.frame(), 0);
        assert_ne!(a.position, b.position);
        assert!(system.is_dormant(KernelRole::Collision, 1));

        let c = system.update(&mut backend, 0.1, &mut |_| {}).unwrap().unwrap();
        assert_eq!(a.position, c.position);
    }

    #[test]
    fn test_cold_kernels_hold_the_frame() {
        let mut backend = CpuBackend::new();
        backend.set_warmup_calls(3);
        let sources = zero_sources(4);
        let mut system =
            DifferentialSystem::new(&mut backend, &counter_set(), &sources, false, &mut |_, _| {})
                .unwrap();
        let initial = backend.read_grid(system.kernels[0][0].target).unwrap();

        // each program is prepared twice per update, once per buffer
        for _ in 0..2 {
            let out = system.update(&mut backend, 0.1, &mut |_| {}).unwrap();
            assert!(out.is_none());
            assert_eq!(system.frame(), 0);
            assert_eq!(backend.dispatch_count(), 0);
            for buffer in 0..2 {
                assert!(!system.is_dormant(KernelRole::Position, buffer));
                let grid = backend.read_grid(system.kernels[0][buffer].target).unwrap();
                assert_eq!(grid, initial);
            }
        }

        let out = system.update(&mut backend, 0.1, &mut |_| {}).unwrap().unwrap();
        assert_eq!(system.frame(), 1);
        assert_eq!(out.position, system.kernels[0][1].target);
        assert!(system.is_dormant(KernelRole::Position, 0));
        let grid = backend.read_grid(out.position).unwrap();
        assert!(grid.cells().iter().all(|c| c[0] == 1.0));

        let out = system.update(&mut backend, 0.1, &mut |_| {}).unwrap().unwrap();
        assert_eq!(system.frame(), 0);
        assert_eq!(out.position, system.kernels[0][0].target);
    }

    #[test]
    fn test_failed_construction_releases_uploaded_grids() {
        let sources = zero_sources(30);
        // 4 static inputs, 6 kernel targets, 3 reduction stages
        for budget in 0..13 {
            let mut backend = CpuBackend::new();
            backend.set_upload_budget(Some(budget));
            let built =
                DifferentialSystem::new(&mut backend, &counter_set(), &sources, true, &mut |_, _| {});
            assert!(built.is_err(), "budget {budget}");
            assert_eq!(backend.live_grids(), 0, "budget {budget}");
        }

        let mut backend = CpuBackend::new();
        backend.set_upload_budget(Some(13));
        DifferentialSystem::new(&mut backend, &counter_set(), &sources, true, &mut |_, _| {})
            .unwrap();
        assert_eq!(backend.live_grids(), 13);
    }

    #[test]
    fn test_downsampled_collision_result() {
        let mut backend = CpuBackend::new();
        let sources = zero_sources(100);
        let mut system =
            DifferentialSystem::new(&mut backend, &counter_set(), &sources, true, &mut |_, _| {})
                .unwrap();
        let out = system.update(&mut backend, 0.1, &mut |_| {}).unwrap().unwrap();
        assert_ne!(out.collision, out.collision_result);

        let result = backend.read_grid(out.collision_result).unwrap();
        assert_eq!(result.width(), 1);
        assert_eq!(result.cells()[0], [256.0; 4]);
    }

    #[test]
    fn test_initializer_and_binder_reach_every_kernel() {
        let mut backend = CpuBackend::new();
        let sources = zero_sources(4);
        let mut seen = Vec::new();
        let mut system = DifferentialSystem::new(
            &mut backend,
            &counter_set(),
            &sources,
            false,
            &mut |role, u| {
                seen.push(role);
                u.set_bullet_radius(3.0);
            },
        )
        .unwrap();
        assert_eq!(seen, ROLES.to_vec());

        let mut bound = 0;
        system
            .update(&mut backend, 0.1, &mut |u| {
                assert_eq!(u.flags[2], 3.0);
                assert_eq!(u.delta(), 0.1);
                bound += 1;
            })
            .unwrap();
        assert_eq!(bound, 3);
    }

    #[test]
    fn test_dispose_releases_and_rejects_second_dispose() {
        let mut backend = CpuBackend::new();
        let sources = zero_sources(30);
        let mut system =
            DifferentialSystem::new(&mut backend, &counter_set(), &sources, true, &mut |_, _| {})
                .unwrap();
        assert!(backend.live_grids() > 0);

        system.dispose(&mut backend).unwrap();
        assert_eq!(backend.live_grids(), 0);
        assert!(system.is_disposed());

        assert!(system.update(&mut backend, 0.1, &mut |_| {}).unwrap().is_none());
        let err = system.dispose(&mut backend).unwrap_err();
        assert!(matches!(err, BulletError::State(_)));
    }
}
