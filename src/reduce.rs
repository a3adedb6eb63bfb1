//! Two-stage GPU reduction of per-pixel squared error, with host-side RMSE
//! finalization.
//!
//! Stage 1 collapses groups of `factor` row-contiguous pixels into partial
//! (color, alpha) squared-error sums; stage 2 collapses the partials by the
//! same fan-in; the host sums the remaining `pixels / factor^2` elements and
//! takes the square roots. Buffers are reallocated whenever the stage lengths
//! change and are owned exclusively by the reducer.

use std::sync::mpsc::channel;
use std::sync::Arc;

use tracing::debug;
use wgpu::util::DeviceExt;
use wgpu::{
    BindGroupDescriptor, BindGroupEntry, Buffer, BufferDescriptor, BufferUsages, CommandEncoder,
    ComputePipeline, Device, TextureView,
};

use crate::gpu::GpuContext;
use crate::readback::{CompletionGate, ReadbackError};

const REDUCE_SHADER_TEMPLATE: &str = include_str!("shaders/reduce_rmse.wgsl");

/// Fan-in of each reduction stage.
pub const DEFAULT_REDUCTION_FACTOR: u32 = 128;

/// Errors raised by the reduction pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    #[error("reduction factor {0} must be a power of two between 2 and 256")]
    BadFactor(u32),
    #[error("image has zero pixels")]
    EmptyImage,
    #[error("image width {width} is not divisible by reduction factor {factor}")]
    WidthNotDivisible { width: u32, factor: u32 },
    #[error("stage-1 length {len} is not divisible by reduction factor {factor}")]
    StageNotDivisible { len: u32, factor: u32 },
    #[error("no reduction has been recorded yet")]
    NothingRecorded,
    #[error(transparent)]
    Readback(#[from] ReadbackError),
    #[error("reduction kernel rejected at pipeline creation: {0}")]
    Kernel(String),
}

/// Validate a reduction factor: the kernels do a shared-memory tree reduce,
/// so the factor must be a power of two no larger than a workgroup.
pub fn validate_factor(factor: u32) -> Result<(), ReduceError> {
    if factor < 2 || factor > 256 || !factor.is_power_of_two() {
        return Err(ReduceError::BadFactor(factor));
    }
    Ok(())
}

/// Stage-1 and stage-2 buffer lengths for an image, or the divisibility error
/// that makes the grouping ill-defined. Nothing is ever silently truncated.
pub fn reduction_lengths(width: u32, height: u32, factor: u32) -> Result<(u32, u32), ReduceError> {
    validate_factor(factor)?;
    if width == 0 || height == 0 {
        return Err(ReduceError::EmptyImage);
    }
    if width % factor != 0 {
        return Err(ReduceError::WidthNotDivisible { width, factor });
    }
    let stage1_len = width / factor * height;
    if stage1_len % factor != 0 {
        return Err(ReduceError::StageNotDivisible {
            len: stage1_len,
            factor,
        });
    }
    Ok((stage1_len, stage1_len / factor))
}

/// RMSE of a source/candidate pair.
///
/// `color` is per-channel scale: the kernel accumulates the squared sum of
/// absolute RGB deltas, and the `/ 3.0` here undoes the 3-channel sum, so a
/// uniform per-channel delta `d` comes out as exactly `color == d`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rmse {
    pub color: f32,
    pub alpha: f32,
}

impl Rmse {
    /// Host-side finalization: order-independent linear sum of the stage-2
    /// partials, then normalization to RMS scale.
    pub fn from_partials(partials: &[[f32; 2]], total_pixels: u64) -> Self {
        let mut color_sum = 0.0f64;
        let mut alpha_sum = 0.0f64;
        for p in partials {
            color_sum += p[0] as f64;
            alpha_sum += p[1] as f64;
        }
        let n = total_pixels as f64;
        Self {
            color: ((color_sum / n).sqrt() / 3.0) as f32,
            alpha: (alpha_sum / n).sqrt() as f32,
        }
    }
}

/// Per-dispatch uniform block, mirrored by `ReduceParams` in the WGSL source.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ReduceParams {
    width: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

struct ReduceBuffers {
    width: u32,
    height: u32,
    stage1: Buffer,
    stage2: Buffer,
    staging: Buffer,
    stage1_len: u32,
    stage2_len: u32,
}

/// Two-stage squared-error reducer between a source texture and its
/// re-encoded candidate.
pub struct ErrorReducer {
    device: Arc<Device>,
    factor: u32,
    pipeline_image: ComputePipeline,
    pipeline_buffer: ComputePipeline,
    buffers: Option<ReduceBuffers>,
    recorded: bool,
}

impl ErrorReducer {
    /// Build the reduction pipelines for a given fan-in factor. The factor is
    /// baked into the kernel (it is the workgroup size), so changing it means
    /// constructing a new reducer.
    pub fn new(ctx: &GpuContext, factor: u32) -> Result<Self, ReduceError> {
        validate_factor(factor)?;
        let device = &ctx.device;

        let source = REDUCE_SHADER_TEMPLATE.replace("__FACTOR__", &factor.to_string());

        let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("RMSE reduce shader"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let make_pipeline = |entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: None,
                module: &module,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let pipeline_image = make_pipeline("reduce_image");
        let pipeline_buffer = make_pipeline("reduce_buffer");

        if let Some(err) = pollster::block_on(scope.pop()) {
            return Err(ReduceError::Kernel(err.to_string()));
        }

        Ok(Self {
            device: ctx.device.clone(),
            factor,
            pipeline_image,
            pipeline_buffer,
            buffers: None,
            recorded: false,
        })
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    fn ensure_buffers(&mut self, width: u32, height: u32, stage1_len: u32, stage2_len: u32) {
        let stale = match &self.buffers {
            Some(b) => b.stage1_len != stage1_len || b.stage2_len != stage2_len,
            None => true,
        };
        if stale {
            debug!(
                "allocating reduction buffers: stage1 {} elements, stage2 {} elements",
                stage1_len, stage2_len
            );
            let stage1 = self.device.create_buffer(&BufferDescriptor {
                label: Some("RMSE stage-1 buffer"),
                size: stage1_len as u64 * 8,
                usage: BufferUsages::STORAGE,
                mapped_at_creation: false,
            });
            let stage2 = self.device.create_buffer(&BufferDescriptor {
                label: Some("RMSE stage-2 buffer"),
                size: stage2_len as u64 * 8,
                usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });
            let staging = self.device.create_buffer(&BufferDescriptor {
                label: Some("RMSE staging buffer"),
                size: stage2_len as u64 * 8,
                usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            self.buffers = Some(ReduceBuffers {
                width,
                height,
                stage1,
                stage2,
                staging,
                stage1_len,
                stage2_len,
            });
        } else if let Some(b) = &mut self.buffers {
            b.width = width;
            b.height = height;
        }
    }

    /// Record both reduction dispatches and the staging copy into `cmd`.
    ///
    /// Stream order does the synchronization: stage 2 is enqueued after
    /// stage 1 and the staging copy after stage 2, all on the caller's
    /// command stream. Call [`Self::read_blocking`] or [`Self::read_async`]
    /// after submitting `cmd`.
    pub fn record(
        &mut self,
        cmd: &mut CommandEncoder,
        source: &TextureView,
        candidate: &TextureView,
        width: u32,
        height: u32,
    ) -> Result<(), ReduceError> {
        let (stage1_len, stage2_len) = reduction_lengths(width, height, self.factor)?;
        self.ensure_buffers(width, height, stage1_len, stage2_len);
        let buffers = self
            .buffers
            .as_ref()
            .expect("buffers allocated by ensure_buffers");

        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("RMSE params"),
                contents: bytemuck::cast_slice(&[ReduceParams {
                    width,
                    _pad0: 0,
                    _pad1: 0,
                    _pad2: 0,
                }]),
                usage: BufferUsages::UNIFORM,
            });

        let bind_stage1 = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("RMSE stage-1 bind group"),
            layout: &self.pipeline_image.get_bind_group_layout(0),
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(source),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(candidate),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: params.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 3,
                    resource: buffers.stage1.as_entire_binding(),
                },
            ],
        });

        let bind_stage2 = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("RMSE stage-2 bind group"),
            layout: &self.pipeline_buffer.get_bind_group_layout(0),
            entries: &[
                BindGroupEntry {
                    binding: 4,
                    resource: buffers.stage1.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 5,
                    resource: buffers.stage2.as_entire_binding(),
                },
            ],
        });

        {
            let mut pass = cmd.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("RMSE stage 1"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline_image);
            pass.set_bind_group(0, &bind_stage1, &[]);
            pass.dispatch_workgroups(width / self.factor, height, 1);
        }
        {
            let mut pass = cmd.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("RMSE stage 2"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline_buffer);
            pass.set_bind_group(0, &bind_stage2, &[]);
            pass.dispatch_workgroups(stage1_len / self.factor, 1, 1);
        }

        cmd.copy_buffer_to_buffer(&buffers.stage2, 0, &buffers.staging, 0, stage2_len as u64 * 8);

        self.recorded = true;
        Ok(())
    }

    /// Blocking readback: stalls the host until the submitted commands have
    /// completed, then finalizes the RMSE.
    pub fn read_blocking(&self) -> Result<Rmse, ReduceError> {
        let buffers = match (&self.buffers, self.recorded) {
            (Some(b), true) => b,
            _ => return Err(ReduceError::NothingRecorded),
        };

        let slice = buffers.staging.slice(..);
        let (tx, rx) = channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        });

        let mut gate = CompletionGate::new(rx);
        gate.wait()?;

        let data = slice.get_mapped_range();
        let partials: Vec<[f32; 2]> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        buffers.staging.unmap();

        Ok(Rmse::from_partials(
            &partials,
            buffers.width as u64 * buffers.height as u64,
        ))
    }

    /// Asynchronous readback: returns a promise-like handle immediately.
    ///
    /// The handle owns the pending map; do not record a new reduction cycle
    /// on this reducer until the request has been consumed or dropped
    /// (dropping abandons the result, the buffer is simply never observed).
    pub fn read_async(&self) -> Result<RmseRequest, ReduceError> {
        let buffers = match (&self.buffers, self.recorded) {
            (Some(b), true) => b,
            _ => return Err(ReduceError::NothingRecorded),
        };

        let (tx, rx) = channel();
        buffers
            .staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });

        Ok(RmseRequest {
            device: self.device.clone(),
            staging: buffers.staging.clone(),
            gate: CompletionGate::new(rx),
            total_pixels: buffers.width as u64 * buffers.height as u64,
            result: None,
        })
    }
}

/// Pending asynchronous RMSE readback.
///
/// The payload is not trusted until the completion gate reports done;
/// [`Self::try_wait`] returns `None` until then.
pub struct RmseRequest {
    device: Arc<Device>,
    staging: Buffer,
    gate: CompletionGate<wgpu::BufferAsyncError>,
    total_pixels: u64,
    result: Option<Rmse>,
}

impl RmseRequest {
    fn consume(&mut self) -> Rmse {
        let slice = self.staging.slice(..);
        let data = slice.get_mapped_range();
        let partials: Vec<[f32; 2]> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        self.staging.unmap();

        let rmse = Rmse::from_partials(&partials, self.total_pixels);
        self.result = Some(rmse);
        rmse
    }

    /// Poll for completion without blocking. Returns `Ok(None)` while the
    /// transfer is still in flight.
    pub fn try_wait(&mut self) -> Result<Option<Rmse>, ReduceError> {
        if let Some(rmse) = self.result {
            return Ok(Some(rmse));
        }
        let _ = self.device.poll(wgpu::PollType::Poll);
        if self.gate.check()? {
            Ok(Some(self.consume()))
        } else {
            Ok(None)
        }
    }

    /// Block until the result is available.
    pub fn wait(mut self) -> Result<Rmse, ReduceError> {
        if let Some(rmse) = self.result {
            return Ok(rmse);
        }
        let _ = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        });
        self.gate.wait()?;
        Ok(self.consume())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factor_validation() {
        assert!(validate_factor(128).is_ok());
        assert!(validate_factor(64).is_ok());
        assert!(validate_factor(2).is_ok());
        assert!(validate_factor(256).is_ok());
        assert!(matches!(validate_factor(0), Err(ReduceError::BadFactor(0))));
        assert!(matches!(validate_factor(3), Err(ReduceError::BadFactor(3))));
        assert!(matches!(
            validate_factor(512),
            Err(ReduceError::BadFactor(512))
        ));
    }

    #[test]
    fn test_stage_lengths() {
        assert_eq!(reduction_lengths(256, 256, 128).unwrap(), (512, 4));
        assert_eq!(reduction_lengths(256, 256, 64).unwrap(), (1024, 16));
        assert_eq!(reduction_lengths(128, 128, 128).unwrap(), (128, 1));
    }

    #[test]
    fn test_non_divisible_sizes_are_rejected() {
        assert!(matches!(
            reduction_lengths(100, 256, 128),
            Err(ReduceError::WidthNotDivisible { width: 100, .. })
        ));
        // 128x1: stage 1 produces a single partial, which a 128-wide stage 2
        // group cannot consume
        assert!(matches!(
            reduction_lengths(128, 1, 128),
            Err(ReduceError::StageNotDivisible { len: 1, .. })
        ));
        assert!(matches!(
            reduction_lengths(0, 256, 128),
            Err(ReduceError::EmptyImage)
        ));
    }

    #[test]
    fn test_zero_error_gives_zero_rmse() {
        let rmse = Rmse::from_partials(&[[0.0, 0.0]; 4], 256 * 256);
        assert_eq!(rmse.color, 0.0);
        assert_eq!(rmse.alpha, 0.0);
    }

    // Host mirror of the two kernel stages, used to pin the reducer/kernel
    // error contract without a GPU.
    fn stage1_reference(
        a: &[[f32; 4]],
        b: &[[f32; 4]],
        width: usize,
        height: usize,
        factor: usize,
    ) -> Vec<[f32; 2]> {
        let groups_x = width / factor;
        let mut out = Vec::with_capacity(groups_x * height);
        for y in 0..height {
            for gx in 0..groups_x {
                let mut color = 0.0f32;
                let mut alpha = 0.0f32;
                for i in 0..factor {
                    let p = y * width + gx * factor + i;
                    let d: Vec<f32> = (0..4).map(|c| (a[p][c] - b[p][c]).abs()).collect();
                    let c = d[0] + d[1] + d[2];
                    color += c * c;
                    alpha += d[3] * d[3];
                }
                out.push([color, alpha]);
            }
        }
        out
    }

    fn stage2_reference(partials: &[[f32; 2]], factor: usize) -> Vec<[f32; 2]> {
        partials
            .chunks_exact(factor)
            .map(|chunk| {
                let mut sum = [0.0f32; 2];
                for p in chunk {
                    sum[0] += p[0];
                    sum[1] += p[1];
                }
                sum
            })
            .collect()
    }

    #[test]
    fn test_uniform_error_reduces_exactly() {
        let width = 256usize;
        let height = 128usize;
        let d = 0.1f32;
        let da = 0.2f32;
        let a = vec![[0.5, 0.5, 0.5, 0.5]; width * height];
        let b = vec![[0.5 + d, 0.5 + d, 0.5 + d, 0.5 + da]; width * height];

        let factor = 128usize;
        let stage1 = stage1_reference(&a, &b, width, height, factor);
        // every group holds per-pixel error times the reduction factor
        let expected_color = (3.0 * d) * (3.0 * d) * factor as f32;
        for p in &stage1 {
            assert!((p[0] - expected_color).abs() < 1e-3, "got {}", p[0]);
            assert!((p[1] - da * da * factor as f32).abs() < 1e-4);
        }

        let stage2 = stage2_reference(&stage1, factor);
        assert_eq!(stage2.len(), width * height / (factor * factor));

        let rmse = Rmse::from_partials(&stage2, (width * height) as u64);
        assert!((rmse.color - d).abs() < 1e-4, "color {}", rmse.color);
        assert!((rmse.alpha - da).abs() < 1e-4, "alpha {}", rmse.alpha);
    }

    #[test]
    fn test_final_scalar_is_factor_independent() {
        let width = 256usize;
        let height = 128usize;
        let a: Vec<[f32; 4]> = (0..width * height)
            .map(|i| {
                let v = (i % 17) as f32 / 17.0;
                [v, 1.0 - v, v * 0.5, v * v]
            })
            .collect();
        let b: Vec<[f32; 4]> = a
            .iter()
            .map(|p| [p[0] * 0.9, p[1], (p[2] + 0.05).min(1.0), p[3] * 0.95])
            .collect();

        let run = |factor: usize| {
            let stage1 = stage1_reference(&a, &b, width, height, factor);
            let stage2 = stage2_reference(&stage1, factor);
            Rmse::from_partials(&stage2, (width * height) as u64)
        };

        let r128 = run(128);
        let r64 = run(64);
        assert!((r128.color - r64.color).abs() < 1e-5);
        assert!((r128.alpha - r64.alpha).abs() < 1e-5);
    }

    #[test]
    #[ignore] // Requires GPU
    fn test_identical_images_zero_rmse() {
        use crate::gpu::GpuContext;
        use wgpu::{
            Extent3d, TextureDescriptor, TextureDimension, TextureFormat, TextureUsages,
            TextureViewDescriptor,
        };

        let ctx = GpuContext::new().expect("no GPU");
        let mut reducer = ErrorReducer::new(&ctx, DEFAULT_REDUCTION_FACTOR).expect("pipelines");

        let width = 256u32;
        let height = 256u32;
        let rgba: Vec<u8> = (0..width * height * 4).map(|i| (i % 255) as u8).collect();

        let make = || {
            let texture = ctx.device.create_texture(&TextureDescriptor {
                label: Some("rmse test texture"),
                size: Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: TextureDimension::D2,
                format: TextureFormat::Rgba8Unorm,
                usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
                view_formats: &[],
            });
            ctx.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &rgba,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(width * 4),
                    rows_per_image: Some(height),
                },
                Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            );
            texture
        };

        let a = make();
        let b = make();
        let view_a = a.create_view(&TextureViewDescriptor::default());
        let view_b = b.create_view(&TextureViewDescriptor::default());

        let mut cmd = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        reducer
            .record(&mut cmd, &view_a, &view_b, width, height)
            .expect("record");
        ctx.queue.submit(std::iter::once(cmd.finish()));

        // async path: must report not-ready or ready, never garbage
        let mut request = reducer.read_async().expect("request");
        let rmse = loop {
            if let Some(rmse) = request.try_wait().expect("poll") {
                break rmse;
            }
        };
        assert_eq!(rmse.color, 0.0);
        assert_eq!(rmse.alpha, 0.0);
    }
}
