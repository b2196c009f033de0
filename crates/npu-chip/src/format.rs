//! Model binary layout.
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ header (64 bytes, LE)        │
//! ├──────────────────────────────┤ 64
//! │ inst_count × u64 (LE)        │
//! ├──────────────────────────────┤
//! │ weight_size bytes            │
//! ├──────────────────────────────┤
//! │ bias_size bytes              │
//! └──────────────────────────────┘
//! ```
//!
//! The checksum field is optional: zero means absent, anything else is the
//! wrapping byte sum of everything after the header.

/// Magic number, `"NPUE"` read as a little-endian u32.
pub const MAGIC: u32 = 0x4E50_5545;
/// Newest format version this crate understands.
pub const VERSION: u16 = 0x0100;
/// Header size in bytes.
pub const HEADER_BYTES: usize = 64;

/// Header field byte offsets.
pub mod offsets {
    /// `u32` magic.
    pub const MAGIC:          usize = 0;
    /// `u16` format version.
    pub const VERSION:        usize = 4;
    /// `u16` layer count.
    pub const NUM_LAYERS:     usize = 6;
    /// `u32` weight payload bytes.
    pub const WEIGHT_SIZE:    usize = 8;
    /// `u32` instruction count.
    pub const INST_COUNT:     usize = 12;
    /// `u32` input tensor bytes.
    pub const INPUT_SIZE:     usize = 16;
    /// `u32` output tensor bytes.
    pub const OUTPUT_SIZE:    usize = 20;
    /// `u32` scratch bytes.
    pub const WORKSPACE_SIZE: usize = 24;
    /// `u32` body checksum, 0 if unused.
    pub const CHECKSUM:       usize = 28;
    /// `u32` bias payload bytes.
    pub const BIAS_SIZE:      usize = 32;
    /// First reserved byte.
    pub const RESERVED:       usize = 36;
}

/// Wrapping byte sum used for the optional checksum.
#[must_use]
pub fn checksum(body: &[u8]) -> u32 {
    body.iter()
        .fold(0u32, |acc, &byte| acc.wrapping_add(u32::from(byte)))
}
