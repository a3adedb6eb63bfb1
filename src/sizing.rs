//! Block-grid and scratch-buffer sizing for BCn encoding.
//!
//! Pure functions: everything here is deterministic arithmetic with no GPU
//! side effects, so the dispatch code in `encode`/`reduce` and the tests share
//! one source of truth for buffer layouts.

use wgpu::TextureFormat;

/// Target compression format for an encode pass.
///
/// `None` means pass-through: the source is copied to the target at full
/// resolution without a compute dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodeFormat {
    None,
    Bc1,
    Bc3,
}

impl EncodeFormat {
    /// Format name for logging and CLI output
    pub fn name(&self) -> &'static str {
        match self {
            EncodeFormat::None => "None",
            EncodeFormat::Bc1 => "BC1",
            EncodeFormat::Bc3 => "BC3",
        }
    }

    /// Parse from a CLI string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NONE" | "OFF" => Some(EncodeFormat::None),
            "BC1" | "DXT1" => Some(EncodeFormat::Bc1),
            "BC3" | "DXT5" => Some(EncodeFormat::Bc3),
            _ => None,
        }
    }

    /// Packed size of one 4x4 block, in bytes. Zero for pass-through.
    pub fn bytes_per_block(&self) -> u32 {
        match self {
            EncodeFormat::None => 0,
            EncodeFormat::Bc1 => 8,
            EncodeFormat::Bc3 => 16,
        }
    }

    /// Packed size of one block in 32-bit words (the scratch element layout).
    pub fn words_per_block(&self) -> u32 {
        self.bytes_per_block() / 4
    }

    /// Compute kernel entry point for this format.
    ///
    /// `None` has no kernel; the encoder handles it as a plain texture copy
    /// before kernel selection, so the mapping stays exhaustive without a
    /// sentinel index.
    pub fn kernel_entry_point(&self) -> Option<&'static str> {
        match self {
            EncodeFormat::None => None,
            EncodeFormat::Bc1 => Some("encode_bc1"),
            EncodeFormat::Bc3 => Some("encode_bc3"),
        }
    }
}

/// Block-grid dimensions for a source image: one element per 4x4 block,
/// partial edge blocks included.
pub fn block_dims(width: u32, height: u32) -> (u32, u32) {
    ((width + 3) / 4, (height + 3) / 4)
}

/// Number of packed blocks an encode of `width` x `height` produces.
pub fn scratch_elements(width: u32, height: u32) -> u32 {
    let (bw, bh) = block_dims(width, height);
    bw * bh
}

/// Destination dimensions for a given source and format: unchanged for
/// pass-through, rounded up to multiples of 4 when compressing.
pub fn padded_dims(width: u32, height: u32, format: EncodeFormat) -> (u32, u32) {
    match format {
        EncodeFormat::None => (width, height),
        EncodeFormat::Bc1 | EncodeFormat::Bc3 => {
            let (bw, bh) = block_dims(width, height);
            (bw * 4, bh * 4)
        }
    }
}

/// Destination texture format tag. Pass-through keeps the source format.
pub fn target_texture_format(format: EncodeFormat, source: TextureFormat) -> TextureFormat {
    match format {
        EncodeFormat::None => source,
        EncodeFormat::Bc1 => TextureFormat::Bc1RgbaUnorm,
        EncodeFormat::Bc3 => TextureFormat::Bc3RgbaUnorm,
    }
}

/// Scratch-buffer row pitch in bytes.
///
/// Buffer-to-texture copies require `bytes_per_row` to be a multiple of
/// `COPY_BYTES_PER_ROW_ALIGNMENT`, so rows of packed blocks may carry padding
/// the kernel skips over when indexing.
pub fn scratch_row_pitch_bytes(width: u32, format: EncodeFormat) -> u32 {
    let (bw, _) = block_dims(width, 1);
    let tight = bw * format.bytes_per_block();
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    tight.div_ceil(align) * align
}

/// Scratch-buffer row pitch in packed blocks (the index stride the kernel
/// writes with). Block sizes of 8 and 16 bytes both divide the copy alignment,
/// so the pitch is always a whole number of blocks. Zero for pass-through,
/// which has no scratch buffer.
pub fn scratch_row_pitch_blocks(width: u32, format: EncodeFormat) -> u32 {
    match format.bytes_per_block() {
        0 => 0,
        bytes => scratch_row_pitch_bytes(width, format) / bytes,
    }
}

/// Total scratch-buffer allocation for an encode, in bytes.
pub fn scratch_byte_size(width: u32, height: u32, format: EncodeFormat) -> u64 {
    let (_, bh) = block_dims(width, height);
    scratch_row_pitch_bytes(width, format) as u64 * bh as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_keeps_dimensions() {
        assert_eq!(padded_dims(256, 256, EncodeFormat::None), (256, 256));
        assert_eq!(padded_dims(130, 130, EncodeFormat::None), (130, 130));
        assert_eq!(padded_dims(1, 1, EncodeFormat::None), (1, 1));
    }

    #[test]
    fn test_padding_rounds_up_to_block_multiple() {
        assert_eq!(padded_dims(256, 256, EncodeFormat::Bc1), (256, 256));
        assert_eq!(padded_dims(130, 130, EncodeFormat::Bc3), (132, 132));
        assert_eq!(padded_dims(1, 1, EncodeFormat::Bc1), (4, 4));
        assert_eq!(padded_dims(5, 8, EncodeFormat::Bc3), (8, 8));
    }

    #[test]
    fn test_block_grid() {
        assert_eq!(block_dims(256, 256), (64, 64));
        assert_eq!(block_dims(130, 130), (33, 33));
        assert_eq!(block_dims(4, 4), (1, 1));
        assert_eq!(block_dims(1, 1), (1, 1));
    }

    #[test]
    fn test_scratch_element_counts() {
        assert_eq!(scratch_elements(256, 256), 64 * 64);
        assert_eq!(scratch_elements(130, 130), 33 * 33);
    }

    // 256x256 BC1 -> 64x64 blocks of 8 bytes, no row padding needed
    #[test]
    fn test_bc1_256_scratch_layout() {
        assert_eq!(scratch_elements(256, 256), 4096);
        assert_eq!(scratch_row_pitch_bytes(256, EncodeFormat::Bc1), 512);
        assert_eq!(scratch_row_pitch_blocks(256, EncodeFormat::Bc1), 64);
        assert_eq!(scratch_byte_size(256, 256, EncodeFormat::Bc1), 32768);
    }

    // 130x130 BC3: padded to 132x132, 33x33 = 1089 blocks of 16 bytes;
    // 33 * 16 = 528 bytes tight, padded up to the 256-byte copy alignment
    #[test]
    fn test_bc3_130_scratch_layout() {
        assert_eq!(padded_dims(130, 130, EncodeFormat::Bc3), (132, 132));
        assert_eq!(scratch_elements(130, 130), 1089);
        assert_eq!(scratch_row_pitch_bytes(130, EncodeFormat::Bc3), 768);
        assert_eq!(scratch_row_pitch_blocks(130, EncodeFormat::Bc3), 48);
        assert_eq!(scratch_byte_size(130, 130, EncodeFormat::Bc3), 768 * 33);
    }

    // pass-through has no scratch buffer; all of its layout numbers are zero
    #[test]
    fn test_none_scratch_layout_is_zero() {
        assert_eq!(scratch_row_pitch_blocks(256, EncodeFormat::None), 0);
        assert_eq!(scratch_row_pitch_bytes(256, EncodeFormat::None), 0);
        assert_eq!(scratch_byte_size(256, 256, EncodeFormat::None), 0);
    }

    #[test]
    fn test_block_sizes() {
        assert_eq!(EncodeFormat::Bc1.bytes_per_block(), 8);
        assert_eq!(EncodeFormat::Bc3.bytes_per_block(), 16);
        assert_eq!(EncodeFormat::Bc1.words_per_block(), 2);
        assert_eq!(EncodeFormat::Bc3.words_per_block(), 4);
    }

    #[test]
    fn test_target_format_mapping() {
        let src = TextureFormat::Rgba8Unorm;
        assert_eq!(target_texture_format(EncodeFormat::None, src), src);
        assert_eq!(
            target_texture_format(EncodeFormat::Bc1, src),
            TextureFormat::Bc1RgbaUnorm
        );
        assert_eq!(
            target_texture_format(EncodeFormat::Bc3, src),
            TextureFormat::Bc3RgbaUnorm
        );
    }

    #[test]
    fn test_kernel_entry_points() {
        assert_eq!(EncodeFormat::None.kernel_entry_point(), None);
        assert_eq!(EncodeFormat::Bc1.kernel_entry_point(), Some("encode_bc1"));
        assert_eq!(EncodeFormat::Bc3.kernel_entry_point(), Some("encode_bc3"));
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(EncodeFormat::parse("bc1"), Some(EncodeFormat::Bc1));
        assert_eq!(EncodeFormat::parse("DXT5"), Some(EncodeFormat::Bc3));
        assert_eq!(EncodeFormat::parse("none"), Some(EncodeFormat::None));
        assert_eq!(EncodeFormat::parse("bc7"), None);
    }
}
