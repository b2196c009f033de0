//! EdgeNPU instruction set.
//!
//! Every instruction is one 64-bit word:
//!
//! ```text
//!  63      56 55      48 47                                         0
//! ┌──────────┬──────────┬────────────────────────────────────────────┐
//! │  opcode  │  flags   │                  operand                   │
//! └──────────┴──────────┴────────────────────────────────────────────┘
//! ```
//!
//! Opcodes are partitioned into families by range. Operand layouts per
//! family live in [`crate::operand`].

use std::fmt;

use crate::operand::{DmaOperand, LoadWeightOperand, LoopOperand, PoolOperand};

/// Opcode field shift.
pub const OPCODE_SHIFT: u32 = 56;
/// Flags field shift.
pub const FLAGS_SHIFT: u32 = 48;
/// Operand field mask (48 bits).
pub const OPERAND_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Instruction flag bits (bits 48-55 of the word).
pub mod flags {
    /// Last instruction of the program.
    pub const LAST:  u8 = 1 << 0;
    /// Raise an interrupt on completion.
    pub const IRQ:   u8 = 1 << 1;
    /// Chain with the next instruction.
    pub const CHAIN: u8 = 1 << 2;
    /// Do not block the pipeline.
    pub const ASYNC: u8 = 1 << 3;
    /// Fuse ReLU into the result.
    pub const RELU:  u8 = 1 << 4;
    /// Add bias.
    pub const BIAS:  u8 = 1 << 5;
    /// Requantize the result.
    pub const QUANT: u8 = 1 << 6;
    /// Accumulate into existing partial sums.
    pub const ACCUM: u8 = 1 << 7;
}

/// Opcode family, by opcode range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpFamily {
    /// 0x00-0x0F
    Control,
    /// 0x10-0x1F
    Dma,
    /// 0x20-0x3F
    Compute,
    /// 0x40-0x4F
    Activation,
    /// 0x50-0x5F
    Pooling,
    /// 0x60-0x6F
    Elementwise,
    /// 0x70-0x7F
    Normalization,
    /// 0x80-0x8F
    Quantization,
    /// 0x90-0x9F
    Reshape,
}

impl OpFamily {
    /// Family owning the raw opcode byte, if the byte is inside a defined range.
    #[must_use]
    pub const fn of(raw: u8) -> Option<Self> {
        match raw {
            0x00..=0x0F => Some(Self::Control),
            0x10..=0x1F => Some(Self::Dma),
            0x20..=0x3F => Some(Self::Compute),
            0x40..=0x4F => Some(Self::Activation),
            0x50..=0x5F => Some(Self::Pooling),
            0x60..=0x6F => Some(Self::Elementwise),
            0x70..=0x7F => Some(Self::Normalization),
            0x80..=0x8F => Some(Self::Quantization),
            0x90..=0x9F => Some(Self::Reshape),
            _ => None,
        }
    }
}

macro_rules! opcodes {
    ($( $(#[$doc:meta])* $name:ident = $val:literal => $mnemonic:literal ),* $(,)?) => {
        /// Instruction opcode.
        ///
        /// Bytes outside the defined set decode to [`Opcode::Unrecognized`]
        /// so arbitrary buffer contents can always be disassembled.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $( $(#[$doc])* $name, )*
            /// Byte not assigned to any opcode.
            Unrecognized(u8),
        }

        impl Opcode {
            /// Decode an opcode byte. Never fails.
            #[must_use]
            pub const fn from_u8(raw: u8) -> Self {
                match raw {
                    $( $val => Self::$name, )*
                    other => Self::Unrecognized(other),
                }
            }

            /// Opcode byte.
            #[must_use]
            pub const fn as_u8(self) -> u8 {
                match self {
                    $( Self::$name => $val, )*
                    Self::Unrecognized(raw) => raw,
                }
            }

            /// Assembly mnemonic.
            #[must_use]
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $( Self::$name => $mnemonic, )*
                    Self::Unrecognized(_) => "UNKNOWN",
                }
            }
        }
    };
}

opcodes! {
    // ── Control ──
    /// No operation.
    Nop = 0x00 => "NOP",
    /// Stop execution.
    Halt = 0x01 => "HALT",
    /// Pipeline barrier.
    Sync = 0x02 => "SYNC",
    /// Wait for the outstanding DMA transfer.
    WaitDma = 0x03 => "WAIT_DMA",
    /// Wait for the PE array.
    WaitPe = 0x04 => "WAIT_PE",
    /// Raise an interrupt.
    Irq = 0x05 => "IRQ",
    /// Open a hardware loop; operand is the iteration count.
    LoopStart = 0x06 => "LOOP_START",
    /// Close a hardware loop; operand is the target index.
    LoopEnd = 0x07 => "LOOP_END",
    /// Conditional branch.
    Branch = 0x08 => "BRANCH",
    /// Unconditional jump.
    Jump = 0x09 => "JUMP",

    // ── DMA ──
    /// DMA into the weight buffer.
    DmaLoadW = 0x10 => "DMA_LOAD_W",
    /// DMA into the activation buffer.
    DmaLoadA = 0x11 => "DMA_LOAD_A",
    /// DMA out of the activation buffer.
    DmaStore = 0x12 => "DMA_STORE",
    /// Buffer-to-buffer copy.
    DmaCopy = 0x13 => "DMA_COPY",
    /// Fill a region with a constant.
    DmaFill = 0x14 => "DMA_FILL",
    /// Strided 2D load.
    Dma2dLoad = 0x15 => "DMA_2D_LOAD",
    /// Strided 2D store.
    Dma2dStore = 0x16 => "DMA_2D_STORE",

    // ── Compute ──
    /// Convolution.
    Conv = 0x20 => "CONV",
    /// Depthwise convolution.
    DwConv = 0x21 => "DWCONV",
    /// General matrix multiply.
    Gemm = 0x22 => "GEMM",
    /// Fully-connected.
    Fc = 0x23 => "FC",
    /// Matrix multiply.
    Matmul = 0x24 => "MATMUL",
    /// Multiply-accumulate.
    Mac = 0x25 => "MAC",
    /// Clear PE accumulators.
    ClearAcc = 0x26 => "CLEAR_ACC",
    /// Latch weights from the weight buffer into the PE array.
    LoadWeight = 0x27 => "LOAD_WEIGHT",
    /// Run the PE array over the loaded tile.
    Compute = 0x28 => "COMPUTE",
    /// Flush accumulators to the activation output buffer.
    Drain = 0x29 => "DRAIN",

    // ── Activation ──
    /// ReLU.
    Relu = 0x40 => "RELU",
    /// ReLU6.
    Relu6 = 0x41 => "RELU6",
    /// Sigmoid.
    Sigmoid = 0x42 => "SIGMOID",
    /// Tanh.
    Tanh = 0x43 => "TANH",
    /// Leaky ReLU.
    LeakyRelu = 0x44 => "LEAKY_RELU",
    /// Swish.
    Swish = 0x45 => "SWISH",
    /// GELU.
    Gelu = 0x46 => "GELU",

    // ── Pooling ──
    /// Max pooling.
    MaxPool = 0x50 => "MAXPOOL",
    /// Average pooling.
    AvgPool = 0x51 => "AVGPOOL",
    /// Global average pooling.
    GlobalAvgPool = 0x52 => "GLOBAL_AVGPOOL",
    /// Global max pooling.
    GlobalMaxPool = 0x53 => "GLOBAL_MAXPOOL",

    // ── Elementwise ──
    /// Add.
    Add = 0x60 => "ADD",
    /// Subtract.
    Sub = 0x61 => "SUB",
    /// Multiply.
    Mul = 0x62 => "MUL",
    /// Divide.
    Div = 0x63 => "DIV",
    /// Maximum.
    Max = 0x64 => "MAX",
    /// Minimum.
    Min = 0x65 => "MIN",
    /// Absolute value.
    Abs = 0x66 => "ABS",

    // ── Normalization ──
    /// Batch normalization.
    BatchNorm = 0x70 => "BATCHNORM",
    /// Layer normalization.
    LayerNorm = 0x71 => "LAYERNORM",
    /// Softmax.
    Softmax = 0x72 => "SOFTMAX",

    // ── Quantization ──
    /// Quantize.
    Quantize = 0x80 => "QUANTIZE",
    /// Dequantize.
    Dequantize = 0x81 => "DEQUANTIZE",
    /// Requantize.
    Requantize = 0x82 => "REQUANTIZE",
    /// Scale.
    Scale = 0x83 => "SCALE",
    /// Bias add.
    BiasAdd = 0x84 => "BIAS_ADD",

    // ── Reshape ──
    /// Reshape.
    Reshape = 0x90 => "RESHAPE",
    /// Transpose.
    Transpose = 0x91 => "TRANSPOSE",
    /// Concatenate.
    Concat = 0x92 => "CONCAT",
    /// Split.
    Split = 0x93 => "SPLIT",
    /// Pad.
    Pad = 0x94 => "PAD",
}

impl Opcode {
    /// Family of this opcode; `None` for unrecognized bytes.
    #[must_use]
    pub const fn family(self) -> Option<OpFamily> {
        match self {
            Self::Unrecognized(_) => None,
            known => OpFamily::of(known.as_u8()),
        }
    }

    /// True for opcodes outside the defined set.
    #[must_use]
    pub const fn is_unrecognized(self) -> bool {
        matches!(self, Self::Unrecognized(_))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrecognized(raw) => write!(f, "UNKNOWN(0x{raw:02x})"),
            known => f.write_str(known.mnemonic()),
        }
    }
}

/// Pack the three fields into a word. The operand is masked to 48 bits.
#[must_use]
pub const fn encode(opcode: Opcode, flags: u8, operand: u64) -> Instruction {
    Instruction(
        ((opcode.as_u8() as u64) << OPCODE_SHIFT)
            | ((flags as u64) << FLAGS_SHIFT)
            | (operand & OPERAND_MASK),
    )
}

/// Split a word into `(opcode, flags, operand)`. Never fails.
#[must_use]
pub const fn decode(word: u64) -> (Opcode, u8, u64) {
    let inst = Instruction(word);
    (inst.opcode(), inst.flags(), inst.operand())
}

/// One encoded instruction word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Instruction(u64);

impl Instruction {
    /// Wrap a raw word.
    #[must_use]
    pub const fn from_word(word: u64) -> Self {
        Self(word)
    }

    /// Raw word.
    #[must_use]
    pub const fn word(self) -> u64 {
        self.0
    }

    /// Opcode field.
    #[must_use]
    pub const fn opcode(self) -> Opcode {
        Opcode::from_u8((self.0 >> OPCODE_SHIFT) as u8)
    }

    /// Flags field.
    #[must_use]
    pub const fn flags(self) -> u8 {
        (self.0 >> FLAGS_SHIFT) as u8
    }

    /// Operand field.
    #[must_use]
    pub const fn operand(self) -> u64 {
        self.0 & OPERAND_MASK
    }

    /// Single-bit flag test.
    #[must_use]
    pub const fn has_flag(self, flag: u8) -> bool {
        self.flags() & flag != 0
    }

    /// LAST flag set.
    #[must_use]
    pub const fn is_last(self) -> bool {
        self.has_flag(flags::LAST)
    }

    /// IRQ flag set.
    #[must_use]
    pub const fn needs_irq(self) -> bool {
        self.has_flag(flags::IRQ)
    }

    /// CHAIN flag set.
    #[must_use]
    pub const fn is_chained(self) -> bool {
        self.has_flag(flags::CHAIN)
    }

    /// ASYNC flag set.
    #[must_use]
    pub const fn is_async(self) -> bool {
        self.has_flag(flags::ASYNC)
    }

    /// RELU fusion flag set.
    #[must_use]
    pub const fn fuses_relu(self) -> bool {
        self.has_flag(flags::RELU)
    }

    /// ACCUM flag set.
    #[must_use]
    pub const fn accumulates(self) -> bool {
        self.has_flag(flags::ACCUM)
    }

    // ── Builders ────────────────────────────────────────────────────────────

    /// `NOP`
    #[must_use]
    pub const fn nop() -> Self {
        encode(Opcode::Nop, 0, 0)
    }

    /// `HALT`, always tagged LAST.
    #[must_use]
    pub const fn halt() -> Self {
        encode(Opcode::Halt, flags::LAST, 0)
    }

    /// `SYNC`
    #[must_use]
    pub const fn sync() -> Self {
        encode(Opcode::Sync, 0, 0)
    }

    /// `WAIT_DMA`
    #[must_use]
    pub const fn wait_dma() -> Self {
        encode(Opcode::WaitDma, 0, 0)
    }

    /// `LOOP_START count`
    #[must_use]
    pub const fn loop_start(count: u32) -> Self {
        encode(Opcode::LoopStart, 0, LoopOperand(count).pack())
    }

    /// `LOOP_END target`
    #[must_use]
    pub const fn loop_end(target: u32) -> Self {
        encode(Opcode::LoopEnd, 0, LoopOperand(target).pack())
    }

    /// `DMA_LOAD_W src, dst, len`
    ///
    /// Fields are masked to their widths; see [`DmaOperand::fits`].
    #[must_use]
    pub const fn dma_load_w(src: u32, dst: u32, len: u32) -> Self {
        encode(Opcode::DmaLoadW, 0, DmaOperand::new(src, dst, len).pack())
    }

    /// `DMA_LOAD_A src, dst, len`
    #[must_use]
    pub const fn dma_load_a(src: u32, dst: u32, len: u32) -> Self {
        encode(Opcode::DmaLoadA, 0, DmaOperand::new(src, dst, len).pack())
    }

    /// `DMA_STORE src, dst, len`
    #[must_use]
    pub const fn dma_store(src: u32, dst: u32, len: u32) -> Self {
        encode(Opcode::DmaStore, 0, DmaOperand::new(src, dst, len).pack())
    }

    /// `CLEAR_ACC`
    #[must_use]
    pub const fn clear_acc() -> Self {
        encode(Opcode::ClearAcc, 0, 0)
    }

    /// `LOAD_WEIGHT addr, count`
    #[must_use]
    pub const fn load_weight(addr: u32, count: u32) -> Self {
        encode(Opcode::LoadWeight, 0, LoadWeightOperand::new(addr, count).pack())
    }

    /// `COMPUTE` with fusion flags.
    #[must_use]
    pub const fn compute(flags: u8) -> Self {
        encode(Opcode::Compute, flags, 0)
    }

    /// `DRAIN addr`
    #[must_use]
    pub const fn drain(addr: u32) -> Self {
        encode(Opcode::Drain, 0, addr as u64)
    }

    /// Pooling instruction with a packed kernel/stride operand.
    #[must_use]
    pub const fn pool(opcode: Opcode, operand: PoolOperand) -> Self {
        encode(opcode, 0, operand.pack())
    }

    /// Binary elementwise instruction with fusion flags.
    #[must_use]
    pub const fn eltwise(opcode: Opcode, flags: u8) -> Self {
        encode(opcode, flags, 0)
    }
}

impl From<u64> for Instruction {
    fn from(word: u64) -> Self {
        Self(word)
    }
}

impl From<Instruction> for u64 {
    fn from(inst: Instruction) -> Self {
        inst.0
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instruction({:#018x})", self.0)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<14} flags=0x{:02x} operand=0x{:012x}",
            self.opcode().to_string(),
            self.flags(),
            self.operand()
        )
    }
}
