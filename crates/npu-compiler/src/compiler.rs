//! Layer-to-instruction lowering
//!
//! Convolutions are tiled over output channels (PE columns) and input
//! channels (PE rows):
//!
//! ```text
//! CLEAR_ACC
//! for each oc tile:
//!     DMA_LOAD_W  weight + oc_start·in_ch·kh·kw, 0, oc_count·in_ch·kh·kw
//!     WAIT_DMA    (after one or more DMA_LOAD_W)
//!     for each ic tile:
//!         LOAD_WEIGHT 0, oc_count
//!         COMPUTE     (activation flags on the last ic tile only)
//!     DRAIN       output + oc_start·out_h·out_w
//!     CLEAR_ACC   (not after the last oc tile)
//! HALT
//! ```
//!
//! Fully-connected layers become a 1×1 convolution over the flattened input.
//! Pooling and elementwise layers are single-tile DMA-in / op / DMA-out
//! sequences.
//!
//! A transfer longer than [`DmaOperand::MAX_LEN`] is split into consecutive
//! DMA instructions sharing one `WAIT_DMA`. An address that does not fit its
//! operand field is an [`CompileError::InvalidLayer`].

use npu_chip::isa::Instruction;
use npu_chip::operand::{DmaOperand, PoolOperand};
use npu_chip::HardwareProfile;
use tracing::debug;

use crate::error::{CompileError, Result};
use crate::layer::{ConvParams, LayerDescriptor, LayerKind};
use crate::sequence::InstructionSequence;

/// Default bound for convolution and fully-connected sequences
pub const CONV_SEQUENCE_BOUND: usize = 256;
/// Default bound for pooling and elementwise sequences
pub const SIMPLE_SEQUENCE_BOUND: usize = 32;

/// Compiler configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilerConfig {
    /// PE rows; input-channel tile size
    pub pe_rows: u32,
    /// PE columns; output-channel tile size
    pub pe_cols: u32,
    /// Instruction bound for convolution sequences
    pub conv_bound: usize,
    /// Instruction bound for pooling and elementwise sequences
    pub simple_bound: usize,
}

impl CompilerConfig {
    /// Tiling for the given hardware, default bounds
    #[must_use]
    pub const fn from_profile(hw: &HardwareProfile) -> Self {
        Self {
            pe_rows: hw.pe_rows as u32,
            pe_cols: hw.pe_cols as u32,
            conv_bound: CONV_SEQUENCE_BOUND,
            simple_bound: SIMPLE_SEQUENCE_BOUND,
        }
    }

    /// Override both sequence bounds
    #[must_use]
    pub const fn with_bounds(mut self, conv_bound: usize, simple_bound: usize) -> Self {
        self.conv_bound = conv_bound;
        self.simple_bound = simple_bound;
        self
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self::from_profile(&HardwareProfile::REFERENCE)
    }
}

/// Tile counts for a convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    /// Output-channel tiles
    pub oc_tiles: u32,
    /// Input-channel tiles per output-channel tile
    pub ic_tiles: u32,
    /// Channels in the last output-channel tile
    pub last_oc_count: u32,
    /// `DMA_LOAD_W` instructions across all tiles
    pub weight_loads: u32,
}

impl TilePlan {
    /// Instructions the plan lowers to
    #[must_use]
    pub const fn instruction_count(&self) -> usize {
        // Each tile: WAIT, ic × (LOAD_WEIGHT, COMPUTE), DRAIN, CLEAR_ACC.
        // The leading CLEAR_ACC stands in for the one omitted after the last tile.
        let per_tile = 3 + 2 * self.ic_tiles as usize;
        self.oc_tiles as usize * per_tile + self.weight_loads as usize + 1
    }
}

/// Single-layer compiler
#[derive(Debug, Clone, Default)]
pub struct LayerCompiler {
    config: CompilerConfig,
}

impl LayerCompiler {
    /// Create compiler with configuration
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    /// Compiler configuration
    pub const fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Lower one layer, dispatching on its kind.
    ///
    /// # Errors
    ///
    /// Returns error if the layer is invalid, has no lowering, or its
    /// sequence would exceed the configured bound.
    pub fn compile_layer(&self, layer: &LayerDescriptor) -> Result<InstructionSequence> {
        layer.validate()?;
        if self.config.pe_rows == 0 || self.config.pe_cols == 0 {
            return Err(CompileError::invalid_layer("PE array has a zero dimension"));
        }

        let seq = match layer.kind {
            LayerKind::Conv2d | LayerKind::DepthwiseConv2d => self.compile_conv(layer)?,
            LayerKind::FullyConnected => self.compile_conv(&fc_as_conv(layer))?,
            LayerKind::MaxPool
            | LayerKind::AvgPool
            | LayerKind::GlobalAvgPool
            | LayerKind::GlobalMaxPool => self.compile_pool(layer)?,
            LayerKind::Eltwise(_) => self.compile_eltwise(layer)?,
            other => return Err(CompileError::unsupported(format!("{other:?}"))),
        };

        debug!("Compiled {:?}: {} instructions", layer.kind, seq.len());
        Ok(seq)
    }

    /// Tile counts for a convolution-shaped layer
    #[must_use]
    pub fn plan_conv(&self, layer: &LayerDescriptor) -> TilePlan {
        let out_ch = layer.output.c;
        let in_ch = layer.input.c;
        let oc_tiles = out_ch.div_ceil(self.config.pe_cols);
        let ic_tiles = in_ch.div_ceil(self.config.pe_rows);
        let rem = out_ch % self.config.pe_cols;
        let last_oc_count = if rem == 0 { self.config.pe_cols.min(out_ch) } else { rem };
        let per_oc = layer.conv.weights_per_output(in_ch);
        let full_tile = dma_chunks(u64::from(self.config.pe_cols) * per_oc);
        let weight_loads = u64::from(oc_tiles.saturating_sub(1)) * full_tile
            + dma_chunks(u64::from(last_oc_count) * per_oc);
        TilePlan {
            oc_tiles,
            ic_tiles,
            last_oc_count,
            weight_loads: u32::try_from(weight_loads).unwrap_or(u32::MAX),
        }
    }

    fn compile_conv(&self, layer: &LayerDescriptor) -> Result<InstructionSequence> {
        let mut seq = InstructionSequence::with_bound(self.config.conv_bound);
        let plan = self.plan_conv(layer);
        let in_ch = layer.input.c;
        let out_ch = layer.output.c;
        let per_oc = layer.conv.weights_per_output(in_ch);
        let plane = layer.output.plane();
        let fuse = layer.activation.fusion_flags();

        seq.push(Instruction::clear_acc())?;

        for oc_t in 0..plan.oc_tiles {
            let oc_start = oc_t * self.config.pe_cols;
            let oc_count = (oc_start + self.config.pe_cols).min(out_ch) - oc_start;

            let weight_offset = to_u32(u64::from(oc_start) * per_oc, "weight offset")?;
            let weight_size = to_u32(u64::from(oc_count) * per_oc, "weight tile size")?;
            push_dma(
                &mut seq,
                Instruction::dma_load_w,
                offset_addr(layer.weight.addr, weight_offset, "weight address")?,
                0,
                weight_size,
            )?;
            seq.push(Instruction::wait_dma())?;

            for ic_t in 0..plan.ic_tiles {
                seq.push(Instruction::load_weight(0, oc_count))?;
                let flags = if ic_t == plan.ic_tiles - 1 { fuse } else { 0 };
                seq.push(Instruction::compute(flags))?;
            }

            let out_offset = to_u32(u64::from(oc_start) * plane, "output offset")?;
            seq.push(Instruction::drain(offset_addr(
                layer.output.addr,
                out_offset,
                "output address",
            )?))?;

            if oc_t + 1 < plan.oc_tiles {
                seq.push(Instruction::clear_acc())?;
            }
        }

        seq.push(Instruction::halt())?;
        Ok(seq)
    }

    fn compile_pool(&self, layer: &LayerDescriptor) -> Result<InstructionSequence> {
        let opcode = layer
            .kind
            .pool_opcode()
            .ok_or_else(|| CompileError::unsupported(format!("{:?}", layer.kind)))?;
        let mut seq = InstructionSequence::with_bound(self.config.simple_bound);
        let in_size = to_u32(layer.input.byte_size(), "input size")?;
        let out_size = to_u32(layer.output.byte_size(), "output size")?;
        let p = &layer.pool;

        push_dma(&mut seq, Instruction::dma_load_a, layer.input.addr, 0, in_size)?;
        seq.push(Instruction::wait_dma())?;
        seq.push(Instruction::pool(
            opcode,
            PoolOperand::new(p.kernel_h, p.kernel_w, p.stride_h, p.stride_w),
        ))?;
        push_dma(&mut seq, Instruction::dma_store, 0, layer.output.addr, out_size)?;
        seq.push(Instruction::wait_dma())?;
        seq.push(Instruction::halt())?;
        Ok(seq)
    }

    fn compile_eltwise(&self, layer: &LayerDescriptor) -> Result<InstructionSequence> {
        let LayerKind::Eltwise(op) = layer.kind else {
            return Err(CompileError::unsupported(format!("{:?}", layer.kind)));
        };
        let second = layer
            .input2
            .ok_or_else(|| CompileError::invalid_layer("elementwise layer needs a second input"))?;
        let mut seq = InstructionSequence::with_bound(self.config.simple_bound);
        let in_size = to_u32(layer.input.byte_size(), "input size")?;
        let out_size = to_u32(layer.output.byte_size(), "output size")?;

        push_dma(&mut seq, Instruction::dma_load_a, layer.input.addr, 0, in_size)?;
        seq.push(Instruction::wait_dma())?;
        push_dma(&mut seq, Instruction::dma_load_a, second.addr, in_size, in_size)?;
        seq.push(Instruction::wait_dma())?;
        seq.push(Instruction::eltwise(op.opcode(), layer.activation.fusion_flags()))?;
        push_dma(&mut seq, Instruction::dma_store, 0, layer.output.addr, out_size)?;
        seq.push(Instruction::wait_dma())?;
        seq.push(Instruction::halt())?;
        Ok(seq)
    }
}

/// Reshape a fully-connected layer into an equivalent 1×1 convolution.
#[must_use]
pub fn fc_as_conv(layer: &LayerDescriptor) -> LayerDescriptor {
    let mut conv = layer.clone();
    conv.kind = LayerKind::Conv2d;
    conv.conv = ConvParams::square(1);
    conv.input.c = layer.input.c * layer.input.h * layer.input.w;
    conv.input.h = 1;
    conv.input.w = 1;
    conv.output.h = 1;
    conv.output.w = 1;
    conv
}

/// Compile with the default configuration.
///
/// # Errors
///
/// See [`LayerCompiler::compile_layer`].
pub fn compile_layer(layer: &LayerDescriptor) -> Result<InstructionSequence> {
    LayerCompiler::default().compile_layer(layer)
}

fn to_u32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| CompileError::invalid_layer(format!("{what} {value} exceeds 32 bits")))
}

fn offset_addr(base: u32, offset: u32, what: &str) -> Result<u32> {
    base.checked_add(offset)
        .ok_or_else(|| CompileError::invalid_layer(format!("{what} overflows 32 bits")))
}

/// DMA instructions needed for `len` bytes; an empty transfer still takes one.
fn dma_chunks(len: u64) -> u64 {
    len.div_ceil(u64::from(DmaOperand::MAX_LEN)).max(1)
}

/// Emit `len` bytes from `src` to `dst` as consecutive DMA instructions.
fn push_dma(
    seq: &mut InstructionSequence,
    build: fn(u32, u32, u32) -> Instruction,
    src: u32,
    dst: u32,
    len: u32,
) -> Result<()> {
    let mut done = 0;
    loop {
        let chunk = (len - done).min(DmaOperand::MAX_LEN);
        let op = DmaOperand::new(
            offset_addr(src, done, "DMA source")?,
            offset_addr(dst, done, "DMA destination")?,
            chunk,
        );
        if !op.fits() {
            return Err(CompileError::invalid_layer(format!(
                "DMA {:#x} -> {:#x} outside operand range (src <= {:#x}, dst <= {:#x})",
                op.src,
                op.dst,
                DmaOperand::MAX_SRC,
                DmaOperand::MAX_DST
            )));
        }
        seq.push(build(op.src, op.dst, op.len))?;
        done += chunk;
        if done >= len {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Activation, EltwiseOp, PoolParams};
    use crate::tensor::TensorDescriptor;
    use npu_chip::isa::flags;
    use npu_chip::operand::LoadWeightOperand;
    use npu_chip::Opcode;

    fn conv_layer(in_ch: u32, out_ch: u32) -> LayerDescriptor {
        LayerDescriptor::conv2d(
            TensorDescriptor::new(0x1000, in_ch, 8, 8),
            TensorDescriptor::new(0x8000, out_ch, 8, 8),
            TensorDescriptor::new(0x2_0000, out_ch, in_ch, 9),
            ConvParams::square(3).with_padding(1),
        )
    }

    fn opcodes(seq: &InstructionSequence) -> Vec<Opcode> {
        seq.iter().map(|i| i.opcode()).collect()
    }

    fn count(seq: &InstructionSequence, op: Opcode) -> usize {
        seq.iter().filter(|i| i.opcode() == op).count()
    }

    #[test]
    fn conv_32x32_on_16x16_tiles_two_by_two() {
        let seq = compile_layer(&conv_layer(32, 32)).unwrap();
        assert_eq!(count(&seq, Opcode::DmaLoadW), 2);
        assert_eq!(count(&seq, Opcode::WaitDma), 2);
        assert_eq!(count(&seq, Opcode::LoadWeight), 4);
        assert_eq!(count(&seq, Opcode::Compute), 4);
        assert_eq!(count(&seq, Opcode::Drain), 2);
        assert_eq!(count(&seq, Opcode::ClearAcc), 2);
        assert_eq!(count(&seq, Opcode::Halt), 1);
        assert_eq!(seq.len(), 17);
        assert_eq!(seq[0].opcode(), Opcode::ClearAcc);
        assert_eq!(seq[seq.len() - 1].opcode(), Opcode::Halt);
    }

    #[test]
    fn conv_sequence_order() {
        use Opcode as O;
        let seq = compile_layer(&conv_layer(32, 32)).unwrap();
        let tile = [O::DmaLoadW, O::WaitDma, O::LoadWeight, O::Compute, O::LoadWeight, O::Compute, O::Drain];
        let mut expected = vec![O::ClearAcc];
        expected.extend(tile);
        expected.push(O::ClearAcc);
        expected.extend(tile);
        expected.push(O::Halt);
        assert_eq!(opcodes(&seq), expected);
    }

    #[test]
    fn relu_only_on_last_input_tile() {
        let layer = conv_layer(32, 32).with_activation(Activation::Relu);
        let seq = compile_layer(&layer).unwrap();
        let computes: Vec<_> = seq.iter().filter(|i| i.opcode() == Opcode::Compute).collect();
        let fused: Vec<bool> = computes.iter().map(|i| i.fuses_relu()).collect();
        assert_eq!(fused, vec![false, true, false, true]);
    }

    #[test]
    fn non_fusable_activation_sets_no_flags() {
        let layer = conv_layer(32, 32).with_activation(Activation::Sigmoid);
        let seq = compile_layer(&layer).unwrap();
        assert!(seq.iter().all(|i| i.flags() == 0 || i.opcode() == Opcode::Halt));
    }

    #[test]
    fn partial_tile_uses_remainder() {
        let seq = compile_layer(&conv_layer(20, 40)).unwrap();
        let loads: Vec<_> = seq
            .iter()
            .filter(|i| i.opcode() == Opcode::LoadWeight)
            .map(|i| LoadWeightOperand::unpack(i.operand()).count)
            .collect();
        // 3 oc tiles (16, 16, 8) × 2 ic tiles
        assert_eq!(loads, vec![16, 16, 16, 16, 8, 8]);
    }

    #[test]
    fn weight_and_drain_offsets() {
        let layer = conv_layer(32, 32);
        let seq = compile_layer(&layer).unwrap();
        let loads: Vec<_> = seq
            .iter()
            .filter(|i| i.opcode() == Opcode::DmaLoadW)
            .map(|i| DmaOperand::unpack(i.operand()).src)
            .collect();
        // oc_start · in_ch · 3 · 3
        assert_eq!(loads, vec![0x2_0000, 0x2_0000 + 16 * 32 * 9]);

        let drains: Vec<_> = seq
            .iter()
            .filter(|i| i.opcode() == Opcode::Drain)
            .map(|i| i.operand())
            .collect();
        assert_eq!(drains, vec![0x8000, 0x8000 + 16 * 64]);
    }

    #[test]
    fn plan_matches_emitted_length() {
        let compiler = LayerCompiler::default();
        for (ic, oc) in [(1, 1), (16, 16), (17, 33), (64, 48), (128, 40)] {
            let layer = conv_layer(ic, oc);
            let plan = compiler.plan_conv(&layer);
            assert_eq!(compiler.compile_layer(&layer).unwrap().len(), plan.instruction_count());
        }
    }

    #[test]
    fn oversize_conv_is_an_error_not_truncated() {
        // 64 oc tiles × 4 ic tiles → far past 256
        let mut layer = conv_layer(64, 1024);
        layer.weight.addr = 0;
        let err = compile_layer(&layer).unwrap_err();
        assert_eq!(err, CompileError::SequenceOverflow { bound: 256 });
    }

    #[test]
    fn custom_bound_applies() {
        let compiler = LayerCompiler::new(CompilerConfig::default().with_bounds(16, 32));
        assert!(compiler.compile_layer(&conv_layer(32, 32)).is_err());
        assert!(compiler.compile_layer(&conv_layer(16, 16)).is_ok());
    }

    #[test]
    fn fc_lowers_to_flattened_1x1_conv() {
        let fc = LayerDescriptor::fully_connected(
            TensorDescriptor::new(0, 4, 4, 4),
            TensorDescriptor::new(0x400, 10, 1, 1),
            TensorDescriptor::new(0x1000, 10, 64, 1),
        )
        .with_activation(Activation::Relu6);
        let as_conv = fc_as_conv(&fc);
        assert_eq!(as_conv.input.c, 64);
        assert_eq!((as_conv.input.h, as_conv.input.w), (1, 1));
        assert_eq!(as_conv.conv, ConvParams::square(1));

        let seq = compile_layer(&fc).unwrap();
        assert_eq!(seq, compile_layer(&as_conv).unwrap());
        // 64 inputs → 4 ic tiles, 10 outputs → 1 oc tile
        assert_eq!(count(&seq, Opcode::Compute), 4);
        let w = seq.iter().find(|i| i.opcode() == Opcode::DmaLoadW).unwrap();
        assert_eq!(DmaOperand::unpack(w.operand()), DmaOperand::new(0x1000, 0, 10 * 64));
    }

    #[test]
    fn weight_tile_length_is_exact() {
        let seq = compile_layer(&conv_layer(32, 32)).unwrap();
        let lens: Vec<_> = seq
            .iter()
            .filter(|i| i.opcode() == Opcode::DmaLoadW)
            .map(|i| DmaOperand::unpack(i.operand()).len)
            .collect();
        assert_eq!(lens, vec![16 * 32 * 9, 16 * 32 * 9]);
    }

    #[test]
    fn long_weight_tile_is_split_under_one_wait() {
        // 16 · 128 · 9 = 18432 bytes per tile
        let seq = compile_layer(&conv_layer(128, 16)).unwrap();
        let loads: Vec<_> = seq
            .iter()
            .filter(|i| i.opcode() == Opcode::DmaLoadW)
            .map(|i| DmaOperand::unpack(i.operand()))
            .collect();
        let max = DmaOperand::MAX_LEN;
        assert_eq!(
            loads,
            vec![
                DmaOperand::new(0x2_0000, 0, max),
                DmaOperand::new(0x2_0000 + max, max, 18432 - max),
            ]
        );
        assert_eq!(count(&seq, Opcode::WaitDma), 1);
        assert_eq!(seq[1].opcode(), Opcode::DmaLoadW);
        assert_eq!(seq[2].opcode(), Opcode::DmaLoadW);
        assert_eq!(seq[3].opcode(), Opcode::WaitDma);
    }

    #[test]
    fn out_of_range_dma_address_is_rejected() {
        let mut layer = conv_layer(16, 16);
        layer.weight.addr = DmaOperand::MAX_SRC + 1;
        assert!(matches!(compile_layer(&layer), Err(CompileError::InvalidLayer { .. })));

        let pool = LayerDescriptor::pool(
            LayerKind::MaxPool,
            TensorDescriptor::new(0x100, 2, 4, 4),
            TensorDescriptor::new(DmaOperand::MAX_DST + 1, 2, 2, 2),
            PoolParams::square(2, 2),
        )
        .unwrap();
        assert!(matches!(compile_layer(&pool), Err(CompileError::InvalidLayer { .. })));
    }

    #[test]
    fn pool_sequence() {
        let layer = LayerDescriptor::pool(
            LayerKind::MaxPool,
            TensorDescriptor::new(0x100, 2, 4, 4),
            TensorDescriptor::new(0x200, 2, 2, 2),
            PoolParams::square(2, 2),
        )
        .unwrap();
        let seq = compile_layer(&layer).unwrap();
        assert_eq!(
            opcodes(&seq),
            vec![Opcode::DmaLoadA, Opcode::WaitDma, Opcode::MaxPool, Opcode::DmaStore, Opcode::WaitDma, Opcode::Halt]
        );
        assert_eq!(PoolOperand::unpack(seq[2].operand()), PoolOperand::new(2, 2, 2, 2));
        assert_eq!(DmaOperand::unpack(seq[0].operand()), DmaOperand::new(0x100, 0, 32));
        assert_eq!(DmaOperand::unpack(seq[3].operand()), DmaOperand::new(0, 0x200, 8));
    }

    #[test]
    fn global_pool_uses_its_own_opcode() {
        for (kind, op) in [
            (LayerKind::GlobalAvgPool, Opcode::GlobalAvgPool),
            (LayerKind::GlobalMaxPool, Opcode::GlobalMaxPool),
        ] {
            let layer = LayerDescriptor::pool(
                kind,
                TensorDescriptor::new(0, 8, 7, 7),
                TensorDescriptor::new(0x400, 8, 1, 1),
                PoolParams::default(),
            )
            .unwrap();
            let seq = compile_layer(&layer).unwrap();
            assert_eq!(seq[2].opcode(), op);
        }
    }

    #[test]
    fn eltwise_places_second_input_after_first() {
        let a = TensorDescriptor::new(0x100, 2, 4, 4);
        let b = TensorDescriptor::new(0x300, 2, 4, 4);
        let out = TensorDescriptor::new(0x500, 2, 4, 4);
        let layer = LayerDescriptor::eltwise(EltwiseOp::Add, a, b, out).with_activation(Activation::Relu);
        let seq = compile_layer(&layer).unwrap();
        assert_eq!(seq.len(), 8);
        assert_eq!(DmaOperand::unpack(seq[0].operand()), DmaOperand::new(0x100, 0, 32));
        assert_eq!(DmaOperand::unpack(seq[2].operand()), DmaOperand::new(0x300, 32, 32));
        assert_eq!(seq[4].opcode(), Opcode::Add);
        assert_eq!(seq[4].flags(), flags::RELU);
        assert_eq!(seq[7], Instruction::halt());
    }

    #[test]
    fn unsupported_kinds_are_rejected() {
        let mut layer = conv_layer(4, 4);
        layer.kind = LayerKind::Softmax;
        assert!(matches!(compile_layer(&layer), Err(CompileError::UnsupportedLayer { .. })));
    }
}
