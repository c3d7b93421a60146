//! wgpu compute backend
//!
//! Grids live in storage buffers of `vec4<f32>`. Each program compiles to one
//! compute pipeline against a shared bind group layout (uniform block, seven
//! read-only inputs, one read-write output). Transfers copy into MAP_READ
//! staging buffers keyed by slot and are fenced with `map_async`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use super::{
    ComputeBackend, Dispatch, FenceStatus, GridId, PoolId, TransferFence, TransferSlot,
};
use crate::error::{BulletError, Result};
use crate::grid::StateGrid;
use crate::kernel::{CellProgram, InputSlot, KernelUniforms, REDUCE_WGSL, compose_wgsl};

const WORKGROUP_SIZE: u32 = 64;

// ============================================================================
// GPU DATA STRUCTURES (must match reduce.wgsl)
// ============================================================================

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct ReduceParams {
    source_width: u32,
    _pad: [u32; 3],
}

struct GpuGrid {
    buffer: wgpu::Buffer,
    width: u32,
}

struct Staging {
    buffer: wgpu::Buffer,
    busy: Arc<AtomicBool>,
}

// ============================================================================
// BACKEND
// ============================================================================

pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,

    kernel_layout: wgpu::BindGroupLayout,
    kernel_pipeline_layout: wgpu::PipelineLayout,
    pipelines: HashMap<&'static str, wgpu::ComputePipeline>,

    reduce_layout: wgpu::BindGroupLayout,
    reduce_pipeline: wgpu::ComputePipeline,

    uniforms_buffer: wgpu::Buffer,
    reduce_params_buffer: wgpu::Buffer,

    grids: HashMap<GridId, GpuGrid>,
    staging: HashMap<TransferSlot, Staging>,
    next_id: u64,
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

#[inline]
fn workgroups(width: u32) -> u32 {
    (width * width).div_ceil(WORKGROUP_SIZE)
}

impl GpuBackend {
    /// Request a device from an adapter and build the shared layouts
    pub async fn request(adapter: &wgpu::Adapter) -> Result<Self> {
        let info = adapter.get_info();
        log::info!("Compute adapter: {} ({:?})", info.name, info.backend);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("danmaku-compute-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
                trace: Default::default(),
                experimental_features: Default::default(),
            })
            .await
            .map_err(|e| BulletError::Backend(format!("failed to create device: {e}")))?;

        Ok(Self::new(device, queue))
    }

    /// Headless backend on the default adapter, blocking on setup
    pub fn headless() -> Result<Self> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::PRIMARY,
                ..Default::default()
            });
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .map_err(|e| BulletError::Backend(format!("no compute adapter: {e}")))?;
            Self::request(&adapter).await
        })
    }

    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let mut kernel_entries = vec![uniform_entry(0)];
        for slot in InputSlot::ALL {
            kernel_entries.push(storage_entry(slot.index() as u32 + 1, true));
        }
        kernel_entries.push(storage_entry(InputSlot::ALL.len() as u32 + 1, false));

        let kernel_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("kernel_bind_group_layout"),
            entries: &kernel_entries,
        });

        let kernel_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("kernel_pipeline_layout"),
            bind_group_layouts: &[&kernel_layout],
            immediate_size: 0,
        });

        let reduce_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("reduce_bind_group_layout"),
            entries: &[uniform_entry(0), storage_entry(1, true), storage_entry(2, false)],
        });

        let reduce_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("reduce_pipeline_layout"),
            bind_group_layouts: &[&reduce_layout],
            immediate_size: 0,
        });

        let reduce_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("reduce_shader"),
            source: wgpu::ShaderSource::Wgsl(REDUCE_WGSL.into()),
        });

        let reduce_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("reduce_pipeline"),
            layout: Some(&reduce_pipeline_layout),
            module: &reduce_shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        let uniforms_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("kernel_uniforms"),
            contents: bytemuck::bytes_of(&KernelUniforms::default()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let reduce_params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("reduce_params"),
            contents: bytemuck::bytes_of(&ReduceParams {
                source_width: 2,
                _pad: [0; 3],
            }),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        log::info!("GPU compute backend ready");

        Self {
            device,
            queue,
            kernel_layout,
            kernel_pipeline_layout,
            pipelines: HashMap::new(),
            reduce_layout,
            reduce_pipeline,
            uniforms_buffer,
            reduce_params_buffer,
            grids: HashMap::new(),
            staging: HashMap::new(),
            next_id: 1,
        }
    }

    fn grid(&self, id: GridId) -> Result<&GpuGrid> {
        self.grids
            .get(&id)
            .ok_or_else(|| BulletError::Backend(format!("unknown grid {}", id.0)))
    }

    fn ensure_pipeline(&mut self, program: &dyn CellProgram) {
        if self.pipelines.contains_key(program.name()) {
            return;
        }

        log::debug!("Compiling kernel {}", program.name());
        let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(program.name()),
            source: wgpu::ShaderSource::Wgsl(compose_wgsl(program).into()),
        });

        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(program.name()),
            layout: Some(&self.kernel_pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        self.pipelines.insert(program.name(), pipeline);
    }

    /// Staging buffer for a slot; a slot still awaiting its map gets a fresh one
    fn staging_for(&mut self, slot: TransferSlot, size: u64) -> (wgpu::Buffer, Arc<AtomicBool>) {
        let reusable = self
            .staging
            .get(&slot)
            .is_some_and(|s| s.buffer.size() == size && !s.busy.load(Ordering::Acquire));

        if !reusable {
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("transfer_staging"),
                size,
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                mapped_at_creation: false,
            });
            self.staging.insert(
                slot,
                Staging {
                    buffer,
                    busy: Arc::new(AtomicBool::new(false)),
                },
            );
        }

        let staging = &self.staging[&slot];
        staging.busy.store(true, Ordering::Release);
        (staging.buffer.clone(), Arc::clone(&staging.busy))
    }
}

impl ComputeBackend for GpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn upload(&mut self, grid: &StateGrid) -> Result<GridId> {
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("state_grid"),
            contents: grid.as_bytes(),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
        });

        let id = GridId(self.next_id);
        self.next_id += 1;
        self.grids.insert(
            id,
            GpuGrid {
                buffer,
                width: grid.width(),
            },
        );
        Ok(id)
    }

    fn release(&mut self, grid: GridId) {
        if let Some(g) = self.grids.remove(&grid) {
            g.buffer.destroy();
        }
    }

    fn width(&self, grid: GridId) -> Option<u32> {
        self.grids.get(&grid).map(|g| g.width)
    }

    fn prepare(&mut self, program: &dyn CellProgram) -> Result<bool> {
        self.ensure_pipeline(program);
        Ok(true)
    }

    fn dispatch(&mut self, dispatch: &Dispatch) -> Result<()> {
        if dispatch.inputs.contains(dispatch.target) {
            return Err(BulletError::state(format!(
                "{} writes grid {} while reading it",
                dispatch.program.name(),
                dispatch.target.0
            )));
        }
        self.ensure_pipeline(dispatch.program);

        let width = self.grid(dispatch.target)?.width;

        let mut uniforms = *dispatch.uniforms;
        uniforms.set_width(width);
        self.queue
            .write_buffer(&self.uniforms_buffer, 0, bytemuck::bytes_of(&uniforms));

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: self.uniforms_buffer.as_entire_binding(),
        }];
        for slot in InputSlot::ALL {
            let grid = self.grid(dispatch.inputs.get(slot))?;
            entries.push(wgpu::BindGroupEntry {
                binding: slot.index() as u32 + 1,
                resource: grid.buffer.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: InputSlot::ALL.len() as u32 + 1,
            resource: self.grid(dispatch.target)?.buffer.as_entire_binding(),
        });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(dispatch.program.name()),
            layout: &self.kernel_layout,
            entries: &entries,
        });

        let pipeline = self
            .pipelines
            .get(dispatch.program.name())
            .ok_or_else(|| BulletError::Backend(format!("{} not compiled", dispatch.program.name())))?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kernel_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(dispatch.program.name()),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups(width), 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn reduce(&mut self, source: GridId, target: GridId) -> Result<()> {
        if source == target {
            return Err(BulletError::state("reduction stage reads its own output"));
        }
        let source_width = self.grid(source)?.width;
        let width = self.grid(target)?.width;
        if width != source_width / 2 {
            return Err(BulletError::Backend(format!(
                "reduction target must have width {}",
                source_width / 2
            )));
        }

        self.queue.write_buffer(
            &self.reduce_params_buffer,
            0,
            bytemuck::bytes_of(&ReduceParams {
                source_width,
                _pad: [0; 3],
            }),
        );

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("reduce_bind_group"),
            layout: &self.reduce_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.reduce_params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.grid(source)?.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.grid(target)?.buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("reduce_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("reduce_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.reduce_pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups(width), 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn begin_transfer(&mut self, grid: GridId, slot: TransferSlot) -> Result<Box<dyn TransferFence>> {
        let size = StateGrid::byte_len(self.grid(grid)?.width);
        let (staging, busy) = self.staging_for(slot, size);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("transfer_encoder"),
            });
        encoder.copy_buffer_to_buffer(&self.grid(grid)?.buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = mpsc::channel();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                sender.send(result).ok();
            });

        Ok(Box::new(GpuFence {
            buffer: staging,
            receiver,
            busy,
            outcome: None,
            drained: false,
        }))
    }

    fn release_transfer_pool(&mut self, pool: PoolId) {
        self.staging.retain(|slot, _| slot.pool != pool);
    }

    fn poll(&mut self) {
        let _ = self.device.poll(wgpu::PollType::Poll);
    }

    fn read_grid(&mut self, grid: GridId) -> Result<StateGrid> {
        let width = self.grid(grid)?.width;
        let size = StateGrid::byte_len(width);

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("read_grid_staging"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("read_grid_encoder"),
            });
        encoder.copy_buffer_to_buffer(&self.grid(grid)?.buffer, 0, &staging, 0, size);
        let submission = self.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = mpsc::channel();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                sender.send(result).ok();
            });

        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(submission),
                timeout: None,
            })
            .map_err(|e| BulletError::Backend(format!("device poll failed: {e}")))?;

        receiver
            .recv()
            .map_err(|e| BulletError::Readback(e.to_string()))?
            .map_err(|e| BulletError::Readback(e.to_string()))?;

        let data = read_mapped(&staging);
        StateGrid::from_flat(width, &data)
            .ok_or_else(|| BulletError::Readback("grid readback has the wrong size".into()))
    }
}

fn read_mapped(buffer: &wgpu::Buffer) -> Vec<f32> {
    let data = {
        let view = buffer.slice(..).get_mapped_range();
        view.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    };
    buffer.unmap();
    data
}

// ============================================================================
// FENCE
// ============================================================================

struct GpuFence {
    buffer: wgpu::Buffer,
    receiver: mpsc::Receiver<std::result::Result<(), wgpu::BufferAsyncError>>,
    busy: Arc<AtomicBool>,
    outcome: Option<std::result::Result<(), String>>,
    drained: bool,
}

impl TransferFence for GpuFence {
    fn status(&mut self) -> FenceStatus {
        if self.outcome.is_none() {
            self.outcome = match self.receiver.try_recv() {
                Ok(Ok(())) => Some(Ok(())),
                Ok(Err(e)) => Some(Err(e.to_string())),
                Err(mpsc::TryRecvError::Empty) => None,
                Err(mpsc::TryRecvError::Disconnected) => {
                    Some(Err("map callback dropped".to_string()))
                }
            };
        }
        match &self.outcome {
            None => FenceStatus::Pending,
            Some(Ok(())) => FenceStatus::Signaled,
            Some(Err(msg)) => FenceStatus::Failed(msg.clone()),
        }
    }

    fn drain(&mut self) -> Result<Vec<f32>> {
        match self.status() {
            FenceStatus::Signaled if !self.drained => {
                let data = read_mapped(&self.buffer);
                self.drained = true;
                self.busy.store(false, Ordering::Release);
                Ok(data)
            }
            FenceStatus::Signaled => Err(BulletError::Readback("transfer already drained".into())),
            FenceStatus::Pending => Err(BulletError::Readback(
                "transfer drained before its fence signaled".into(),
            )),
            FenceStatus::Failed(msg) => Err(BulletError::Readback(msg)),
        }
    }
}

impl Drop for GpuFence {
    fn drop(&mut self) {
        // Abandoned after mapping: release the slot for reuse
        if !self.drained && matches!(self.outcome, Some(Ok(()))) {
            self.buffer.unmap();
            self.busy.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KernelInputs, LinearVelocity};

    #[test]
    fn test_workgroup_count() {
        assert_eq!(workgroups(2), 1);
        assert_eq!(workgroups(8), 1);
        assert_eq!(workgroups(16), 4);
        assert_eq!(workgroups(512), 4096);
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_gpu_matches_cpu_reduction() {
        let mut gpu = GpuBackend::headless().unwrap();
        let cells: Vec<[f32; 4]> = (0..16).map(|i| [i as f32, 1.0, 0.0, 0.0]).collect();
        let source = gpu.upload(&StateGrid::from_cells(4, cells).unwrap()).unwrap();
        let target = gpu.allocate(2, [0.0; 4]).unwrap();
        gpu.reduce(source, target).unwrap();
        let out = gpu.read_grid(target).unwrap();
        assert_eq!(out.cells()[0], [10.0, 4.0, 0.0, 0.0]);
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_gpu_kernel_dispatch_and_transfer() {
        let mut gpu = GpuBackend::headless().unwrap();
        let zero = gpu.allocate(2, [0.0; 4]).unwrap();
        let initial_velocity = gpu.allocate(2, [1.0, 2.0, 3.0, 1.0]).unwrap();
        let target = gpu.allocate(2, [0.0; 4]).unwrap();
        let inputs = KernelInputs([zero, zero, zero, zero, initial_velocity, zero, zero]);
        let mut uniforms = KernelUniforms::default();
        uniforms.set_time_since_start(1.0);

        gpu.dispatch(&Dispatch {
            program: &LinearVelocity,
            inputs: &inputs,
            uniforms: &uniforms,
            target,
        })
        .unwrap();

        let slot = TransferSlot {
            pool: PoolId(1),
            index: 0,
        };
        let mut fence = gpu.begin_transfer(target, slot).unwrap();
        let mut data = None;
        for _ in 0..1000 {
            gpu.poll();
            if fence.status() == FenceStatus::Signaled {
                data = Some(fence.drain().unwrap());
                break;
            }
        }
        let data = data.unwrap();
        assert_eq!(&data[..4], &[1.0, 2.0, 3.0, 1.0]);
    }
}
