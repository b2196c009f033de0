//! Register map for the EdgeNPU control block.
//!
//! Every register is 32 bits wide and addressed as a byte offset from the
//! configured base address (`0x4000_0000` on the reference SoC). Offsets and
//! bit positions are the wire contract with the RTL and must not move.
//!
//! ```text
//! 0x000-0x01C  control / status / IRQ / identity
//! 0x100-0x10C  instruction buffer
//! 0x200-0x208  weight buffer
//! 0x300-0x310  activation buffers
//! 0x400-0x418  DMA engine
//! 0x500-0x508  PE array
//! 0x600-0x61C  performance counters
//! 0x700-0x734  per-layer configuration
//! ```

/// Size of the register window in bytes (covers every offset below).
pub const REG_WINDOW_BYTES: usize = 0x1000;

/// A register in the control block.
///
/// The discriminant is the byte offset from the block base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(usize)]
pub enum Reg {
    // ── Control and status ──────────────────────────────────────────────────
    /// Control register, see [`ctrl`].
    Ctrl = 0x000,
    /// Status register, see [`status`].
    Status = 0x004,
    /// Interrupt enable mask, see [`irq`].
    IrqEn = 0x008,
    /// Interrupt status, write-1-to-clear, see [`irq`].
    IrqStatus = 0x00C,
    /// Hardware version.
    Version = 0x010,
    /// Array geometry: PE rows in bits 16-31, PE columns in bits 0-15.
    Config = 0x014,
    /// Raw hardware error code, valid while STATUS.ERROR is set.
    ErrorCode = 0x018,
    /// Debug control.
    DebugCtrl = 0x01C,

    // ── Instruction buffer ──────────────────────────────────────────────────
    /// Instruction buffer base address.
    InstBase = 0x100,
    /// Instruction count.
    InstSize = 0x104,
    /// Instruction pointer.
    InstPtr = 0x108,
    /// Instruction buffer control.
    InstCtrl = 0x10C,

    // ── Weight buffer ───────────────────────────────────────────────────────
    /// Weight buffer base address.
    WeightBase = 0x200,
    /// Bytes of valid weight data.
    WeightSize = 0x204,
    /// Weight buffer control.
    WeightCtrl = 0x208,

    // ── Activation buffers ──────────────────────────────────────────────────
    /// Activation input base address.
    ActInBase = 0x300,
    /// Bytes of valid activation input.
    ActInSize = 0x304,
    /// Activation output base address.
    ActOutBase = 0x308,
    /// Bytes of activation output produced.
    ActOutSize = 0x30C,
    /// Activation buffer control.
    ActCtrl = 0x310,

    // ── DMA engine ──────────────────────────────────────────────────────────
    /// DMA control, see [`dma_ctrl`].
    DmaCtrl = 0x400,
    /// DMA status, see [`dma_status`].
    DmaStatus = 0x404,
    /// DMA source address.
    DmaSrc = 0x408,
    /// DMA destination address.
    DmaDst = 0x40C,
    /// DMA transfer length in bytes.
    DmaLen = 0x410,
    /// Source row stride for 2D transfers.
    DmaSrcStride = 0x414,
    /// Destination row stride for 2D transfers.
    DmaDstStride = 0x418,

    // ── PE array ────────────────────────────────────────────────────────────
    /// PE array control, see [`pe_ctrl`].
    PeCtrl = 0x500,
    /// PE array status.
    PeStatus = 0x504,
    /// PE array configuration.
    PeConfig = 0x508,

    // ── Performance counters ────────────────────────────────────────────────
    /// Counter control, see [`perf_ctrl`].
    PerfCtrl = 0x600,
    /// Cycle counter, low half.
    PerfCyclesLo = 0x604,
    /// Cycle counter, high half.
    PerfCyclesHi = 0x608,
    /// Retired instruction count.
    PerfInstCnt = 0x60C,
    /// MAC operation counter, low half.
    PerfMacLo = 0x610,
    /// MAC operation counter, high half.
    PerfMacHi = 0x614,
    /// Stall cycle count.
    PerfStallCnt = 0x618,
    /// Completed DMA transfer count.
    PerfDmaCnt = 0x61C,

    // ── Layer configuration ─────────────────────────────────────────────────
    /// Layer type, see [`layer_type`].
    LayerType = 0x700,
    /// Input channels.
    LayerInCh = 0x704,
    /// Output channels.
    LayerOutCh = 0x708,
    /// Input height.
    LayerInH = 0x70C,
    /// Input width.
    LayerInW = 0x710,
    /// Output height.
    LayerOutH = 0x714,
    /// Output width.
    LayerOutW = 0x718,
    /// Kernel size, `(kh << 8) | kw`.
    LayerKernel = 0x71C,
    /// Stride, `(sh << 8) | sw`.
    LayerStride = 0x720,
    /// Padding, `top << 24 | bottom << 16 | left << 8 | right`.
    LayerPadding = 0x724,
    /// Activation type, see [`act_type`].
    LayerActType = 0x728,
    /// Pooling type, see [`pool_type`].
    LayerPoolType = 0x72C,
    /// Output quantization scale (fixed point).
    LayerQuantScale = 0x730,
    /// Output quantization zero point.
    LayerQuantZero = 0x734,
}

impl Reg {
    /// Every register, in offset order.
    pub const ALL: [Self; 52] = [
        Self::Ctrl,
        Self::Status,
        Self::IrqEn,
        Self::IrqStatus,
        Self::Version,
        Self::Config,
        Self::ErrorCode,
        Self::DebugCtrl,
        Self::InstBase,
        Self::InstSize,
        Self::InstPtr,
        Self::InstCtrl,
        Self::WeightBase,
        Self::WeightSize,
        Self::WeightCtrl,
        Self::ActInBase,
        Self::ActInSize,
        Self::ActOutBase,
        Self::ActOutSize,
        Self::ActCtrl,
        Self::DmaCtrl,
        Self::DmaStatus,
        Self::DmaSrc,
        Self::DmaDst,
        Self::DmaLen,
        Self::DmaSrcStride,
        Self::DmaDstStride,
        Self::PeCtrl,
        Self::PeStatus,
        Self::PeConfig,
        Self::PerfCtrl,
        Self::PerfCyclesLo,
        Self::PerfCyclesHi,
        Self::PerfInstCnt,
        Self::PerfMacLo,
        Self::PerfMacHi,
        Self::PerfStallCnt,
        Self::PerfDmaCnt,
        Self::LayerType,
        Self::LayerInCh,
        Self::LayerOutCh,
        Self::LayerInH,
        Self::LayerInW,
        Self::LayerOutH,
        Self::LayerOutW,
        Self::LayerKernel,
        Self::LayerStride,
        Self::LayerPadding,
        Self::LayerActType,
        Self::LayerPoolType,
        Self::LayerQuantScale,
        Self::LayerQuantZero,
    ];

    /// Byte offset from the block base.
    #[must_use]
    pub const fn offset(self) -> usize {
        self as usize
    }

    /// Look up the register at `offset`, if any.
    #[must_use]
    pub fn from_offset(offset: usize) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.offset() == offset)
    }
}

// ── Control register bits ────────────────────────────────────────────────────

/// [`Reg::Ctrl`] bits.
pub mod ctrl {
    /// Device enable.
    pub const ENABLE:      u32 = 1 << 0;
    /// Start executing the instruction buffer.
    pub const START:       u32 = 1 << 1;
    /// Hold the core in reset while set.
    pub const RESET:       u32 = 1 << 2;
    /// Abort the running program.
    pub const ABORT:       u32 = 1 << 3;
    /// Execute one instruction per START.
    pub const SINGLE_STEP: u32 = 1 << 4;
    /// Enable debug features.
    pub const DEBUG_EN:    u32 = 1 << 5;
}

// ── Status register bits ─────────────────────────────────────────────────────

/// [`Reg::Status`] bits.
pub mod status {
    /// Core is executing.
    pub const BUSY:        u32 = 1 << 0;
    /// Program reached HALT.
    pub const DONE:        u32 = 1 << 1;
    /// Hardware fault, see [`super::Reg::ErrorCode`].
    pub const ERROR:       u32 = 1 << 2;
    /// Core is idle.
    pub const IDLE:        u32 = 1 << 3;
    /// Internal state field mask (bits 4-7).
    pub const STATE_MASK:  u32 = 0xF << STATE_SHIFT;
    /// Internal state field shift.
    pub const STATE_SHIFT: u32 = 4;

    /// Extract the internal state field.
    #[must_use]
    pub const fn state_field(status: u32) -> u8 {
        ((status & STATE_MASK) >> STATE_SHIFT) as u8
    }
}

// ── Interrupt bits (IRQ_EN and IRQ_STATUS) ───────────────────────────────────

/// [`Reg::IrqEn`] / [`Reg::IrqStatus`] bits.
pub mod irq {
    /// Program completed.
    pub const DONE:      u32 = 1 << 0;
    /// Hardware fault.
    pub const ERROR:     u32 = 1 << 1;
    /// DMA transfer completed.
    pub const DMA_DONE:  u32 = 1 << 2;
    /// DMA transfer failed.
    pub const DMA_ERROR: u32 = 1 << 3;
    /// Watchdog expired.
    pub const WATCHDOG:  u32 = 1 << 4;
    /// Written to IRQ_STATUS to clear everything pending.
    pub const CLEAR_ALL: u32 = 0xFFFF_FFFF;
}

// ── DMA bits ─────────────────────────────────────────────────────────────────

/// [`Reg::DmaCtrl`] bits.
pub mod dma_ctrl {
    /// Start the programmed transfer.
    pub const START:         u32 = 1 << 0;
    /// Abort the transfer in flight.
    pub const ABORT:         u32 = 1 << 1;
    /// Raise DMA_DONE / DMA_ERROR interrupts.
    pub const IRQ_EN:        u32 = 1 << 2;
    /// Strided 2D transfer.
    pub const MODE_2D:       u32 = 1 << 3;
    /// Channel select field shift (bits 4-5).
    pub const CHANNEL_SHIFT: u32 = 4;
    /// Channel select field mask.
    pub const CHANNEL_MASK:  u32 = 0x3 << CHANNEL_SHIFT;
}

/// [`Reg::DmaStatus`] bits.
pub mod dma_status {
    /// Transfer in flight.
    pub const BUSY:  u32 = 1 << 0;
    /// Last transfer completed.
    pub const DONE:  u32 = 1 << 1;
    /// Last transfer failed.
    pub const ERROR: u32 = 1 << 2;
}

/// DMA channel selector values.
pub mod dma_channel {
    /// Weight buffer channel.
    pub const WEIGHT:  u32 = 0;
    /// Activation input channel.
    pub const ACT_IN:  u32 = 1;
    /// Activation output channel.
    pub const ACT_OUT: u32 = 2;
}

// ── PE array and counters ────────────────────────────────────────────────────

/// [`Reg::PeCtrl`] bits.
pub mod pe_ctrl {
    /// Enable the PE array.
    pub const ENABLE:      u32 = 1 << 0;
    /// Clear accumulators.
    pub const CLEAR_ACC:   u32 = 1 << 1;
    /// Latch weights into the array.
    pub const LOAD_WEIGHT: u32 = 1 << 2;
}

/// [`Reg::PerfCtrl`] bits.
pub mod perf_ctrl {
    /// Counters run while set.
    pub const ENABLE: u32 = 1 << 0;
    /// Zero all counters.
    pub const RESET:  u32 = 1 << 1;
}

// ── Layer configuration values ───────────────────────────────────────────────

/// [`Reg::LayerType`] values.
pub mod layer_type {
    /// Standard 2D convolution.
    pub const CONV:    u32 = 0;
    /// Depthwise convolution.
    pub const DWCONV:  u32 = 1;
    /// Fully connected.
    pub const FC:      u32 = 2;
    /// Pooling; kind in [`Reg::LayerPoolType`].
    pub const POOL:    u32 = 3;
    /// Elementwise binary op.
    pub const ELTWISE: u32 = 4;
    /// Softmax.
    pub const SOFTMAX: u32 = 5;
}

/// [`Reg::LayerActType`] values.
pub mod act_type {
    /// No activation.
    pub const NONE:       u32 = 0;
    /// `max(x, 0)`.
    pub const RELU:       u32 = 1;
    /// `min(max(x, 0), 6)`.
    pub const RELU6:      u32 = 2;
    /// Logistic sigmoid.
    pub const SIGMOID:    u32 = 3;
    /// Hyperbolic tangent.
    pub const TANH:       u32 = 4;
    /// Leaky ReLU.
    pub const LEAKY_RELU: u32 = 5;
    /// `x · sigmoid(x)`.
    pub const SWISH:      u32 = 6;
    /// Gaussian error linear unit.
    pub const GELU:       u32 = 7;
}

/// [`Reg::LayerPoolType`] values.
pub mod pool_type {
    /// Not a pooling layer.
    pub const NONE:       u32 = 0;
    /// Window maximum.
    pub const MAX:        u32 = 1;
    /// Window average.
    pub const AVG:        u32 = 2;
    /// Average over the whole plane.
    pub const GLOBAL_AVG: u32 = 3;
}

/// Pack PE geometry the way [`Reg::Config`] reports it.
#[must_use]
pub const fn config_word(pe_rows: u16, pe_cols: u16) -> u32 {
    ((pe_rows as u32) << 16) | pe_cols as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_offsets_non_overlapping() {
        for pair in Reg::ALL.windows(2) {
            assert!(pair[0].offset() + 4 <= pair[1].offset(), "{pair:?}");
        }
        assert!(Reg::LayerQuantZero.offset() + 4 <= REG_WINDOW_BYTES);
    }

    #[test]
    fn wire_contract_offsets() {
        assert_eq!(Reg::Status.offset(), 0x004);
        assert_eq!(Reg::Config.offset(), 0x014);
        assert_eq!(Reg::InstPtr.offset(), 0x108);
        assert_eq!(Reg::ActOutSize.offset(), 0x30C);
        assert_eq!(Reg::DmaDstStride.offset(), 0x418);
        assert_eq!(Reg::PerfDmaCnt.offset(), 0x61C);
        assert_eq!(Reg::LayerQuantZero.offset(), 0x734);
    }

    #[test]
    fn from_offset_finds_every_register() {
        for reg in Reg::ALL {
            assert_eq!(Reg::from_offset(reg.offset()), Some(reg));
        }
        assert_eq!(Reg::from_offset(0x002), None);
    }

    #[test]
    fn status_state_field() {
        let word = status::BUSY | (0x4 << status::STATE_SHIFT);
        assert_eq!(status::state_field(word), 4);
        assert_eq!(config_word(16, 8), 0x0010_0008);
    }
}
