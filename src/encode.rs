//! GPU BCn encoding: compute dispatch over the block grid plus the packed
//! copy into the destination texture.
//!
//! The encoder owns one compute pipeline per compressed format and a scratch
//! buffer cached by (width, height, format). All work is recorded into a
//! caller-owned [`wgpu::CommandEncoder`]; nothing here submits or blocks.

use std::sync::Arc;

use tracing::debug;
use wgpu::util::DeviceExt;
use wgpu::{
    BindGroupDescriptor, BindGroupEntry, Buffer, BufferDescriptor, BufferUsages, CommandEncoder,
    ComputePipeline, Device, Extent3d, Texture, TextureViewDescriptor,
};

use crate::gpu::GpuContext;
use crate::sizing::{
    block_dims, padded_dims, scratch_byte_size, scratch_row_pitch_blocks, scratch_row_pitch_bytes,
    EncodeFormat,
};

const ENCODE_SHADER: &str = include_str!("shaders/encode_bcn.wgsl");

/// Errors raised while building the encode pipelines.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode kernel rejected at pipeline creation: {0}")]
    Kernel(String),
}

/// Per-dispatch uniform block, mirrored by `EncodeParams` in the WGSL source.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct EncodeParams {
    quality: f32,
    row_pitch_blocks: u32,
    block_width: u32,
    block_height: u32,
}

/// Cached scratch allocation holding one packed block per 4x4 pixel block.
struct ScratchBuffer {
    buffer: Buffer,
    width: u32,
    height: u32,
    format: EncodeFormat,
}

/// GPU encoder for BC1/BC3 block compression.
pub struct BcnEncoder {
    device: Arc<Device>,
    pipeline_bc1: ComputePipeline,
    pipeline_bc3: ComputePipeline,
    scratch: Option<ScratchBuffer>,
}

impl BcnEncoder {
    /// Build the encode pipelines. Fails fast if the kernel module or either
    /// pipeline is rejected by validation.
    pub fn new(ctx: &GpuContext) -> Result<Self, EncodeError> {
        let device = &ctx.device;

        let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("BCn encode shader"),
            source: wgpu::ShaderSource::Wgsl(ENCODE_SHADER.into()),
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

        // Kernel selection is an exhaustive enum-to-pipeline mapping; there is
        // no sentinel index an unknown format could fall through to.
        let pipeline_bc1 = make_pipeline(
            EncodeFormat::Bc1
                .kernel_entry_point()
                .ok_or_else(|| EncodeError::Kernel("BC1 has no kernel entry point".into()))?,
        );
        let pipeline_bc3 = make_pipeline(
            EncodeFormat::Bc3
                .kernel_entry_point()
                .ok_or_else(|| EncodeError::Kernel("BC3 has no kernel entry point".into()))?,
        );

        if let Some(err) = pollster::block_on(scope.pop()) {
            return Err(EncodeError::Kernel(err.to_string()));
        }

        Ok(Self {
            device: ctx.device.clone(),
            pipeline_bc1,
            pipeline_bc3,
            scratch: None,
        })
    }

    fn pipeline_for(&self, format: EncodeFormat) -> Option<&ComputePipeline> {
        match format {
            EncodeFormat::None => None,
            EncodeFormat::Bc1 => Some(&self.pipeline_bc1),
            EncodeFormat::Bc3 => Some(&self.pipeline_bc3),
        }
    }

    /// Make sure the scratch buffer for this encode exists, reusing the
    /// cached one when the (width, height, format) key is unchanged.
    fn ensure_scratch(&mut self, width: u32, height: u32, format: EncodeFormat) {
        let stale = match &self.scratch {
            Some(s) => s.width != width || s.height != height || s.format != format,
            None => true,
        };
        if stale {
            let size = scratch_byte_size(width, height, format);
            debug!(
                "allocating {} scratch buffer: {}x{} blocks, {} bytes",
                format.name(),
                block_dims(width, height).0,
                block_dims(width, height).1,
                size
            );
            let buffer = self.device.create_buffer(&BufferDescriptor {
                label: Some("BCn scratch buffer"),
                size,
                usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });
            self.scratch = Some(ScratchBuffer {
                buffer,
                width,
                height,
                format,
            });
        }
    }

    /// Drop the cached scratch allocation.
    pub fn release_scratch(&mut self) {
        self.scratch = None;
    }

    /// Record an encode of `source` into `target`.
    ///
    /// For [`EncodeFormat::None`] this is a full-resolution texture copy with
    /// no dispatch. Otherwise one work item per 4x4 block packs into the
    /// scratch buffer, which is then copied into `target` as BC texel data.
    /// `target` must have the padded dimensions and format reported by
    /// [`crate::sizing::padded_dims`] / [`crate::sizing::target_texture_format`].
    ///
    /// Fire-and-forget: commands land in `cmd` in order and run when the
    /// caller submits.
    pub fn encode(
        &mut self,
        cmd: &mut CommandEncoder,
        source: &Texture,
        source_width: u32,
        source_height: u32,
        target: &Texture,
        format: EncodeFormat,
        quality: f32,
    ) {
        if format == EncodeFormat::None {
            cmd.copy_texture_to_texture(
                source.as_image_copy(),
                target.as_image_copy(),
                Extent3d {
                    width: source_width,
                    height: source_height,
                    depth_or_array_layers: 1,
                },
            );
            return;
        }

        let (block_width, block_height) = block_dims(source_width, source_height);
        let (padded_w, padded_h) = padded_dims(source_width, source_height, format);
        let pitch_blocks = scratch_row_pitch_blocks(source_width, format);
        let pitch_bytes = scratch_row_pitch_bytes(source_width, format);

        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("BCn encode params"),
                contents: bytemuck::cast_slice(&[EncodeParams {
                    quality,
                    row_pitch_blocks: pitch_blocks,
                    block_width,
                    block_height,
                }]),
                usage: BufferUsages::UNIFORM,
            });

        let source_view = source.create_view(&TextureViewDescriptor::default());
        self.ensure_scratch(source_width, source_height, format);
        let scratch = &self
            .scratch
            .as_ref()
            .expect("scratch allocated by ensure_scratch")
            .buffer;

        // None was handled above; the mapping is total over compressed formats.
        let pipeline = match self.pipeline_for(format) {
            Some(p) => p,
            None => unreachable!("pass-through format reached kernel selection"),
        };

        let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("BCn encode bind group"),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&source_view),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: scratch.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: params.as_entire_binding(),
                },
            ],
        });

        {
            let mut pass = cmd.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("BCn encode pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            // workgroup_size(8, 8) in the kernel; the guard inside handles the
            // rounded-up remainder
            pass.dispatch_workgroups(block_width.div_ceil(8), block_height.div_ceil(8), 1);
        }

        cmd.copy_buffer_to_texture(
            wgpu::TexelCopyBufferInfo {
                buffer: scratch,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(pitch_bytes),
                    rows_per_image: Some(block_height),
                },
            },
            target.as_image_copy(),
            Extent3d {
                width: padded_w,
                height: padded_h,
                depth_or_array_layers: 1,
            },
        );
    }
}
