//! bcnkiln - GPU texture compression harness
//!
//! CLI front end: plays the role of the per-frame caller, wiring one encode
//! dispatch and one RMSE reduction onto a single command stream and printing
//! the scalars that come back.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use bcnkiln::sizing::{
    block_dims, padded_dims, scratch_row_pitch_bytes, target_texture_format, EncodeFormat,
};
use bcnkiln::{BcnEncoder, ErrorReducer, GpuContext, DEFAULT_REDUCTION_FACTOR};

use wgpu::{
    BufferDescriptor, BufferUsages, Extent3d, Texture, TextureDescriptor, TextureDimension,
    TextureFormat, TextureUsages, TextureViewDescriptor,
};

#[derive(Parser)]
#[command(name = "bcnkiln")]
#[command(version)]
#[command(about = "GPU BC1/BC3 compression harness with on-GPU RMSE measurement")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode an image to BC1/BC3 on the GPU and write the result as DDS
    Encode {
        /// Source image (PNG, JPEG, anything the image crate reads)
        input: PathBuf,

        /// Output DDS path
        #[arg(short, long)]
        output: PathBuf,

        /// Compression format: bc1, bc3 or none
        #[arg(short, long, default_value = "bc1")]
        format: String,

        /// Encode quality in [0,1], passed through to the kernel
        #[arg(short, long, default_value_t = 0.25)]
        quality: f32,

        /// GPU adapter index (defaults to auto-selection)
        #[arg(long)]
        gpu: Option<usize>,
    },

    /// Encode an image, then measure RMSE between source and re-encode
    Rmse {
        /// Source image
        input: PathBuf,

        /// Compression format: bc1, bc3 or none
        #[arg(short, long, default_value = "bc1")]
        format: String,

        /// Encode quality in [0,1], passed through to the kernel
        #[arg(short, long, default_value_t = 0.25)]
        quality: f32,

        /// Reduction factor (power of two; image width must divide by it)
        #[arg(long, default_value_t = DEFAULT_REDUCTION_FACTOR)]
        factor: u32,

        /// GPU adapter index (defaults to auto-selection)
        #[arg(long)]
        gpu: Option<usize>,
    },

    /// List available GPUs
    Gpus,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(
                if cli.verbose {
                    "bcnkiln=debug".parse()?
                } else {
                    "bcnkiln=warn".parse()?
                },
            ))
            .init();
    }

    match cli.command {
        Commands::Encode {
            input,
            output,
            format,
            quality,
            gpu,
        } => {
            let format = parse_format(&format)?;
            let (rgba, width, height) = load_image(&input)?;
            let ctx = GpuContext::with_gpu_index(gpu)?;
            println!("GPU: {}", ctx.info());

            let packed = run_encode(&ctx, &rgba, width, height, format, quality)?;
            let (pw, ph) = padded_dims(width, height, format);
            write_dds(&output, &packed, pw, ph, format)?;

            println!(
                "{}x{} {} q={:.1} -> {} ({} bytes)",
                width,
                height,
                format.name(),
                quality,
                output.display(),
                packed.len()
            );
        }

        Commands::Rmse {
            input,
            format,
            quality,
            factor,
            gpu,
        } => {
            let format = parse_format(&format)?;
            let (rgba, width, height) = load_image(&input)?;
            let ctx = GpuContext::with_gpu_index(gpu)?;
            println!("GPU: {}", ctx.info());

            let mut encoder = BcnEncoder::new(&ctx)?;
            let mut reducer = ErrorReducer::new(&ctx, factor)?;

            let source = upload_source(&ctx, &rgba, width, height);
            let target = create_target(&ctx, width, height, format);
            let source_view = source.create_view(&TextureViewDescriptor::default());
            let target_view = target.create_view(&TextureViewDescriptor::default());

            // One ordered stream: encode, stage 1, stage 2, staging copy.
            let mut cmd = ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("encode + rmse"),
                });
            encoder.encode(&mut cmd, &source, width, height, &target, format, quality);
            reducer.record(&mut cmd, &source_view, &target_view, width, height)?;
            ctx.queue.submit(std::iter::once(cmd.finish()));

            let rmse = reducer.read_blocking()?;
            println!(
                "{}x{} {} q={:.1}\nRMSE: RGB {:.4}, alpha {:.4}",
                width,
                height,
                format.name(),
                quality,
                rmse.color,
                rmse.alpha
            );
        }

        Commands::Gpus => {
            let gpus = bcnkiln::list_gpus();
            if gpus.is_empty() {
                println!("No GPUs found");
            } else {
                for gpu in gpus {
                    println!("{}: {}", gpu.adapter_index, gpu);
                }
            }
        }
    }

    Ok(())
}

fn parse_format(s: &str) -> Result<EncodeFormat> {
    EncodeFormat::parse(s)
        .with_context(|| format!("unsupported format '{}' (expected bc1, bc3 or none)", s))
}

fn load_image(path: &PathBuf) -> Result<(Vec<u8>, u32, u32)> {
    let img = image::open(path)
        .with_context(|| format!("Failed to read: {}", path.display()))?
        .into_rgba8();
    let (width, height) = (img.width(), img.height());
    Ok((img.into_raw(), width, height))
}

fn upload_source(ctx: &GpuContext, rgba: &[u8], width: u32, height: u32) -> Texture {
    let texture = ctx.device.create_texture(&TextureDescriptor {
        label: Some("source texture"),
        size: Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: TextureDimension::D2,
        format: TextureFormat::Rgba8Unorm,
        usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST | TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    ctx.queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        rgba,
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
}

fn create_target(ctx: &GpuContext, width: u32, height: u32, format: EncodeFormat) -> Texture {
    let (pw, ph) = padded_dims(width, height, format);
    ctx.device.create_texture(&TextureDescriptor {
        label: Some("compression target"),
        size: Extent3d {
            width: pw,
            height: ph,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: TextureDimension::D2,
        format: target_texture_format(format, TextureFormat::Rgba8Unorm),
        usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST | TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

/// Encode once and read the target texture's tight bytes back to the host.
fn run_encode(
    ctx: &GpuContext,
    rgba: &[u8],
    width: u32,
    height: u32,
    format: EncodeFormat,
    quality: f32,
) -> Result<Vec<u8>> {
    let mut encoder = BcnEncoder::new(ctx)?;
    let source = upload_source(ctx, rgba, width, height);
    let target = create_target(ctx, width, height, format);

    let mut cmd = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("encode"),
        });
    encoder.encode(&mut cmd, &source, width, height, &target, format, quality);

    // Readback layout: BC rows are block rows, None rows are pixel rows.
    let (rows, tight_row) = match format {
        EncodeFormat::None => (height, width * 4),
        _ => {
            let (bw, bh) = block_dims(width, height);
            (bh, bw * format.bytes_per_block())
        }
    };
    let pitch = match format {
        EncodeFormat::None => {
            let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
            (width * 4).div_ceil(align) * align
        }
        _ => scratch_row_pitch_bytes(width, format),
    };

    let staging = ctx.device.create_buffer(&BufferDescriptor {
        label: Some("encode staging"),
        size: pitch as u64 * rows as u64,
        usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let (pw, ph) = padded_dims(width, height, format);
    cmd.copy_texture_to_buffer(
        target.as_image_copy(),
        wgpu::TexelCopyBufferInfo {
            buffer: &staging,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(pitch),
                rows_per_image: Some(rows),
            },
        },
        Extent3d {
            width: pw,
            height: ph,
            depth_or_array_layers: 1,
        },
    );
    ctx.queue.submit(std::iter::once(cmd.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    let _ = ctx.device.poll(wgpu::PollType::Wait {
        submission_index: None,
        timeout: None,
    });
    rx.recv()
        .context("readback channel closed")?
        .map_err(|e| anyhow::anyhow!("failed to map staging buffer: {}", e))?;

    let data = slice.get_mapped_range();
    let mut out = Vec::with_capacity((tight_row * rows) as usize);
    for row in 0..rows {
        let start = (row * pitch) as usize;
        out.extend_from_slice(&data[start..start + tight_row as usize]);
    }
    drop(data);
    staging.unmap();

    Ok(out)
}

fn write_dds(path: &PathBuf, data: &[u8], width: u32, height: u32, format: EncodeFormat) -> Result<()> {
    use image_dds::ddsfile::{AlphaMode, D3D10ResourceDimension, Dds, DxgiFormat, NewDxgiParams};

    let dxgi = match format {
        EncodeFormat::None => DxgiFormat::R8G8B8A8_UNorm,
        EncodeFormat::Bc1 => DxgiFormat::BC1_UNorm,
        EncodeFormat::Bc3 => DxgiFormat::BC3_UNorm,
    };

    let params = NewDxgiParams {
        width,
        height,
        depth: None,
        format: dxgi,
        mipmap_levels: Some(1),
        array_layers: None,
        caps2: None,
        is_cubemap: false,
        resource_dimension: D3D10ResourceDimension::Texture2D,
        alpha_mode: AlphaMode::Straight,
    };

    let mut dds = Dds::new_dxgi(params).context("Failed to create DDS header")?;
    dds.data = data.to_vec();

    let mut out = Vec::new();
    dds.write(&mut out).context("Failed to write DDS")?;
    std::fs::write(path, out).with_context(|| format!("Failed to write: {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image_dds::ddsfile::{Dds, DxgiFormat};

    #[test]
    fn test_parse_format() {
        assert_eq!(parse_format("bc1").unwrap(), EncodeFormat::Bc1);
        assert_eq!(parse_format("DXT5").unwrap(), EncodeFormat::Bc3);
        assert!(parse_format("bc7").is_err());
    }

    #[test]
    fn test_write_dds_bc1_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.dds");

        // one flat-white 4x4 BC1 block
        let block = [0xFFu8, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0];
        write_dds(&path, &block, 4, 4, EncodeFormat::Bc1).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let dds = Dds::read(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(dds.get_width(), 4);
        assert_eq!(dds.get_height(), 4);
        assert_eq!(dds.get_dxgi_format(), Some(DxgiFormat::BC1_UNorm));
        assert_eq!(dds.data, block);
    }

    #[test]
    fn test_write_dds_uncompressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.dds");

        let rgba = vec![128u8; 2 * 2 * 4];
        write_dds(&path, &rgba, 2, 2, EncodeFormat::None).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let dds = Dds::read(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(dds.get_dxgi_format(), Some(DxgiFormat::R8G8B8A8_UNorm));
        assert_eq!(dds.data, rgba);
    }
}
