//! Typed views of the 48-bit operand field.
//!
//! Each family packs small integers at fixed shifts. Fields are masked to
//! their width when packed, so an out-of-range value never spills into a
//! neighbouring field or into the flags byte. [`DmaOperand::try_pack`] is the
//! checked form for callers that must not lose bits.
//!
//! | Operand | Layout |
//! |---------|--------|
//! | [`DmaOperand`] | src `[17:0]`, dst `[33:18]`, len `[47:34]` |
//! | [`LoadWeightOperand`] | addr `[23:0]`, count `[47:24]` |
//! | [`PoolOperand`] | kh `[7:0]`, kw `[15:8]`, sh `[23:16]`, sw `[31:24]` |
//! | [`ConvOperand`] | kh, kw, sh, sw, ph, pw as 4-bit fields from bit 0 |
//! | [`FcOperand`] | in `[15:0]`, out `[31:16]` |
//! | [`LoopOperand`] | count or target index `[31:0]` |
//!
//! The DMA source spans one 256 KiB buffer window, the destination 64 KiB and
//! the length 16 KiB - 1. Longer transfers are issued as several
//! instructions.

/// Width of buffer addresses inside an operand.
pub const ADDR_BITS: u32 = 24;
const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;
const DMA_SRC_BITS: u32 = 18;
const DMA_DST_BITS: u32 = 16;
const DMA_LEN_BITS: u32 = 14;
const DMA_SRC_MASK: u64 = (1 << DMA_SRC_BITS) - 1;
const DMA_DST_MASK: u64 = (1 << DMA_DST_BITS) - 1;
const DMA_LEN_MASK: u64 = (1 << DMA_LEN_BITS) - 1;

/// `DMA_LOAD_W` / `DMA_LOAD_A` / `DMA_STORE` operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaOperand {
    /// Source address.
    pub src: u32,
    /// Destination address.
    pub dst: u32,
    /// Transfer length in bytes.
    pub len: u32,
}

impl DmaOperand {
    /// Destination field shift.
    pub const DST_SHIFT: u32 = DMA_SRC_BITS;
    /// Length field shift.
    pub const LEN_SHIFT: u32 = DMA_SRC_BITS + DMA_DST_BITS;
    /// Largest encodable source address.
    pub const MAX_SRC: u32 = DMA_SRC_MASK as u32;
    /// Largest encodable destination address.
    pub const MAX_DST: u32 = DMA_DST_MASK as u32;
    /// Largest length one instruction can carry.
    pub const MAX_LEN: u32 = DMA_LEN_MASK as u32;

    /// New operand.
    #[must_use]
    pub const fn new(src: u32, dst: u32, len: u32) -> Self {
        Self { src, dst, len }
    }

    /// Whether every field fits its width.
    #[must_use]
    pub const fn fits(&self) -> bool {
        self.src <= Self::MAX_SRC && self.dst <= Self::MAX_DST && self.len <= Self::MAX_LEN
    }

    /// Pack into an operand field, masking each field to its width.
    #[must_use]
    pub const fn pack(self) -> u64 {
        ((self.src as u64) & DMA_SRC_MASK)
            | (((self.dst as u64) & DMA_DST_MASK) << Self::DST_SHIFT)
            | (((self.len as u64) & DMA_LEN_MASK) << Self::LEN_SHIFT)
    }

    /// Pack only if no field is truncated.
    #[must_use]
    pub const fn try_pack(self) -> Option<u64> {
        if self.fits() {
            Some(self.pack())
        } else {
            None
        }
    }

    /// Unpack from an operand field.
    #[must_use]
    pub const fn unpack(operand: u64) -> Self {
        Self {
            src: (operand & DMA_SRC_MASK) as u32,
            dst: ((operand >> Self::DST_SHIFT) & DMA_DST_MASK) as u32,
            len: ((operand >> Self::LEN_SHIFT) & DMA_LEN_MASK) as u32,
        }
    }
}

/// `LOAD_WEIGHT` operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadWeightOperand {
    /// Weight buffer address.
    pub addr: u32,
    /// Output channels in the tile.
    pub count: u32,
}

impl LoadWeightOperand {
    /// Count field shift.
    pub const COUNT_SHIFT: u32 = 24;

    /// New operand.
    #[must_use]
    pub const fn new(addr: u32, count: u32) -> Self {
        Self { addr, count }
    }

    /// Pack into an operand field.
    #[must_use]
    pub const fn pack(self) -> u64 {
        ((self.addr as u64) & ADDR_MASK) | (((self.count as u64) & ADDR_MASK) << Self::COUNT_SHIFT)
    }

    /// Unpack from an operand field.
    #[must_use]
    pub const fn unpack(operand: u64) -> Self {
        Self {
            addr: (operand & ADDR_MASK) as u32,
            count: ((operand >> Self::COUNT_SHIFT) & ADDR_MASK) as u32,
        }
    }
}

/// Pooling operand: window and stride, one byte each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolOperand {
    /// Window height.
    pub kernel_h: u8,
    /// Window width.
    pub kernel_w: u8,
    /// Vertical stride.
    pub stride_h: u8,
    /// Horizontal stride.
    pub stride_w: u8,
}

impl PoolOperand {
    /// New operand.
    #[must_use]
    pub const fn new(kernel_h: u8, kernel_w: u8, stride_h: u8, stride_w: u8) -> Self {
        Self { kernel_h, kernel_w, stride_h, stride_w }
    }

    /// Pack into an operand field.
    #[must_use]
    pub const fn pack(self) -> u64 {
        (self.kernel_h as u64)
            | ((self.kernel_w as u64) << 8)
            | ((self.stride_h as u64) << 16)
            | ((self.stride_w as u64) << 24)
    }

    /// Unpack from an operand field.
    #[must_use]
    pub const fn unpack(operand: u64) -> Self {
        Self {
            kernel_h: operand as u8,
            kernel_w: (operand >> 8) as u8,
            stride_h: (operand >> 16) as u8,
            stride_w: (operand >> 24) as u8,
        }
    }
}

/// `CONV` / `DWCONV` operand: six 4-bit fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConvOperand {
    /// Kernel height.
    pub kernel_h: u8,
    /// Kernel width.
    pub kernel_w: u8,
    /// Vertical stride.
    pub stride_h: u8,
    /// Horizontal stride.
    pub stride_w: u8,
    /// Vertical padding.
    pub pad_h: u8,
    /// Horizontal padding.
    pub pad_w: u8,
}

impl ConvOperand {
    const NIBBLE: u64 = 0xF;

    /// Pack into an operand field.
    #[must_use]
    pub const fn pack(self) -> u64 {
        ((self.kernel_h as u64) & Self::NIBBLE)
            | (((self.kernel_w as u64) & Self::NIBBLE) << 4)
            | (((self.stride_h as u64) & Self::NIBBLE) << 8)
            | (((self.stride_w as u64) & Self::NIBBLE) << 12)
            | (((self.pad_h as u64) & Self::NIBBLE) << 16)
            | (((self.pad_w as u64) & Self::NIBBLE) << 20)
    }

    /// Unpack from an operand field.
    #[must_use]
    pub const fn unpack(operand: u64) -> Self {
        Self {
            kernel_h: nibble(operand, 0),
            kernel_w: nibble(operand, 4),
            stride_h: nibble(operand, 8),
            stride_w: nibble(operand, 12),
            pad_h: nibble(operand, 16),
            pad_w: nibble(operand, 20),
        }
    }
}

const fn nibble(operand: u64, shift: u32) -> u8 {
    ((operand >> shift) & 0xF) as u8
}

/// `FC` operand: input and output feature counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FcOperand {
    /// Input features.
    pub in_features: u16,
    /// Output features.
    pub out_features: u16,
}

impl FcOperand {
    /// Pack into an operand field.
    #[must_use]
    pub const fn pack(self) -> u64 {
        (self.in_features as u64) | ((self.out_features as u64) << 16)
    }

    /// Unpack from an operand field.
    #[must_use]
    pub const fn unpack(operand: u64) -> Self {
        Self {
            in_features: operand as u16,
            out_features: (operand >> 16) as u16,
        }
    }
}

/// `LOOP_START` / `LOOP_END` operand.
///
/// `LOOP_START` carries the iteration count, `LOOP_END` the instruction
/// index to branch back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopOperand(pub u32);

impl LoopOperand {
    /// Pack into an operand field.
    #[must_use]
    pub const fn pack(self) -> u64 {
        self.0 as u64
    }

    /// Unpack from an operand field.
    #[must_use]
    pub const fn unpack(operand: u64) -> Self {
        Self(operand as u32)
    }
}
