//! Model binary loading
//!
//! A model is a 64-byte little-endian header followed by the instruction
//! stream, the weights and the bias (see [`npu_chip::format`]). Parsing is
//! pure: [`ModelImage::parse`] validates everything before [`Npu::load_model`]
//! writes a single byte to the device.

use crate::clock::Clock;
use crate::error::{NpuError, Result};
use crate::mmio::NpuBus;
use crate::runtime::Npu;
use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
use npu_chip::format::{self, HEADER_BYTES, MAGIC, VERSION};
use npu_chip::{hw, Instruction};
use npu_compiler::InstructionSequence;
use tracing::{debug, info, warn};

/// On-disk header, little-endian
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RawModelHeader {
    magic: u32,
    version: u16,
    num_layers: u16,
    weight_size: u32,
    inst_count: u32,
    input_size: u32,
    output_size: u32,
    workspace_size: u32,
    checksum: u32,
    bias_size: u32,
    reserved: [u8; 28],
}

const _: () = assert!(std::mem::size_of::<RawModelHeader>() == HEADER_BYTES);

/// Decoded model header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelHeader {
    /// Format version
    pub version: u16,
    /// Layers in the model
    pub num_layers: u16,
    /// Weight payload bytes
    pub weight_size: u32,
    /// Instructions in the stream
    pub inst_count: u32,
    /// Expected input bytes
    pub input_size: u32,
    /// Produced output bytes
    pub output_size: u32,
    /// Scratch bytes needed
    pub workspace_size: u32,
    /// Wrapping byte sum of the body, 0 if absent
    pub checksum: u32,
    /// Bias payload bytes
    pub bias_size: u32,
}

impl ModelHeader {
    /// Decode and check magic and version.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::InvalidModel`] for a short buffer, a wrong magic or
    /// a version newer than [`VERSION`].
    pub fn parse(data: &[u8]) -> Result<Self> {
        let head = data.get(..HEADER_BYTES).ok_or_else(|| {
            NpuError::invalid_model(format!(
                "{} bytes is shorter than the {HEADER_BYTES}-byte header",
                data.len()
            ))
        })?;
        let raw: RawModelHeader = bytemuck::pod_read_unaligned(head);

        let magic = u32::from_le(raw.magic);
        if magic != MAGIC {
            return Err(NpuError::invalid_model(format!(
                "bad magic {magic:#010x}, expected {MAGIC:#010x}"
            )));
        }
        let version = u16::from_le(raw.version);
        if version > VERSION {
            return Err(NpuError::invalid_model(format!(
                "format version {version:#06x} is newer than supported {VERSION:#06x}"
            )));
        }

        Ok(Self {
            version,
            num_layers: u16::from_le(raw.num_layers),
            weight_size: u32::from_le(raw.weight_size),
            inst_count: u32::from_le(raw.inst_count),
            input_size: u32::from_le(raw.input_size),
            output_size: u32::from_le(raw.output_size),
            workspace_size: u32::from_le(raw.workspace_size),
            checksum: u32::from_le(raw.checksum),
            bias_size: u32::from_le(raw.bias_size),
        })
    }

    /// Encode to the on-disk layout
    pub fn to_bytes(&self) -> [u8; HEADER_BYTES] {
        let raw = RawModelHeader {
            magic: MAGIC.to_le(),
            version: self.version.to_le(),
            num_layers: self.num_layers.to_le(),
            weight_size: self.weight_size.to_le(),
            inst_count: self.inst_count.to_le(),
            input_size: self.input_size.to_le(),
            output_size: self.output_size.to_le(),
            workspace_size: self.workspace_size.to_le(),
            checksum: self.checksum.to_le(),
            bias_size: self.bias_size.to_le(),
            reserved: [0; 28],
        };
        let mut out = [0u8; HEADER_BYTES];
        out.copy_from_slice(bytemuck::bytes_of(&raw));
        out
    }

    /// Bytes the header says follow it
    pub fn body_len(&self) -> u64 {
        u64::from(self.inst_count) * hw::INST_BYTES as u64
            + u64::from(self.weight_size)
            + u64::from(self.bias_size)
    }
}

/// A validated model: header plus zero-copy views of its payloads
#[derive(Debug, Clone)]
pub struct ModelImage {
    /// Header
    pub header: ModelHeader,
    /// Decoded instruction stream
    pub instructions: InstructionSequence,
    /// Weight payload
    pub weights: Bytes,
    /// Bias payload
    pub bias: Bytes,
}

impl ModelImage {
    /// Parse and validate a complete model binary.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::InvalidModel`] for header errors, a truncated body
    /// or a checksum mismatch, and [`NpuError::InvalidOp`] for an unrecognized
    /// opcode in the instruction stream.
    pub fn parse(data: impl Into<Bytes>) -> Result<Self> {
        let data: Bytes = data.into();
        let header = ModelHeader::parse(&data)?;

        let available = (data.len() - HEADER_BYTES) as u64;
        if header.body_len() > available {
            return Err(NpuError::invalid_model(format!(
                "truncated body: header declares {} bytes, {available} present",
                header.body_len()
            )));
        }
        #[allow(clippy::cast_possible_truncation)]
        let body = data.slice(HEADER_BYTES..HEADER_BYTES + header.body_len() as usize);

        if header.checksum != 0 {
            let actual = format::checksum(&body);
            if actual != header.checksum {
                return Err(NpuError::invalid_model(format!(
                    "checksum {actual:#010x} does not match header {:#010x}",
                    header.checksum
                )));
            }
        }

        let inst_bytes = header.inst_count as usize * hw::INST_BYTES;
        let weight_end = inst_bytes + header.weight_size as usize;
        let mut insts = Vec::with_capacity(header.inst_count as usize);
        for (i, chunk) in body[..inst_bytes].chunks_exact(hw::INST_BYTES).enumerate() {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            let inst = Instruction::from_word(u64::from_le_bytes(word));
            if inst.opcode().is_unrecognized() {
                return Err(NpuError::invalid_op(format!(
                    "unrecognized opcode {:#04x} at instruction {i}",
                    inst.opcode().as_u8()
                )));
            }
            insts.push(inst);
        }
        let bound = insts.len();
        let instructions = InstructionSequence::from_instructions(insts, bound)?;

        debug!(
            "parsed model v{:#06x}: {} layers, {} instructions, {} weight bytes",
            header.version, header.num_layers, header.inst_count, header.weight_size
        );
        Ok(Self {
            header,
            instructions,
            weights: body.slice(inst_bytes..weight_end),
            bias: body.slice(weight_end..),
        })
    }
}

/// Parse a model binary and return its instruction stream. Touches no hardware.
///
/// # Errors
///
/// See [`ModelImage::parse`].
pub fn load_model(data: &[u8]) -> Result<InstructionSequence> {
    ModelImage::parse(Bytes::copy_from_slice(data)).map(|image| image.instructions)
}

impl<B: NpuBus, C: Clock> Npu<B, C> {
    /// Validate a model binary, then load its instructions, weights and bias.
    ///
    /// The bias is placed directly after the weights.
    ///
    /// # Errors
    ///
    /// Returns any parse error, or [`NpuError::Overflow`] if the model does not
    /// fit the configured buffers; nothing is written in either case. A copy
    /// that fails part-way clears INST_SIZE and WEIGHT_SIZE before returning.
    pub fn load_model(&mut self, data: &[u8]) -> Result<ModelHeader> {
        self.ensure_loadable("load model")?;
        let image = ModelImage::parse(Bytes::copy_from_slice(data)).map_err(|e| self.fail(e))?;
        let header = image.header;

        if header.inst_count > self.config.inst_buf_entries {
            return Err(self.fail(NpuError::Overflow {
                what: "instruction buffer",
                requested: u64::from(header.inst_count) * hw::INST_BYTES as u64,
                capacity: u64::from(self.config.inst_buf_entries) * hw::INST_BYTES as u64,
            }));
        }
        let payload = u64::from(header.weight_size) + u64::from(header.bias_size);
        if payload > u64::from(self.config.weight_buf_size) {
            return Err(self.fail(NpuError::Overflow {
                what: "weight buffer",
                requested: payload,
                capacity: u64::from(self.config.weight_buf_size),
            }));
        }

        if let Err(e) = self.copy_image(&image) {
            warn!("model load failed part-way: {e}");
            self.discard_program();
            return Err(self.fail(e));
        }
        self.ctx.total_layers = u32::from(header.num_layers);

        info!(
            "✅ Model loaded: {} instructions, {} weight bytes, {} bias bytes",
            header.inst_count, header.weight_size, header.bias_size
        );
        Ok(header)
    }

    fn copy_image(&mut self, image: &ModelImage) -> Result<()> {
        if !image.instructions.is_empty() {
            self.load_instructions(&image.instructions)?;
        }
        if !image.weights.is_empty() {
            self.load_weights(&image.weights, 0)?;
        }
        if !image.bias.is_empty() {
            self.load_weights(&image.bias, image.header.weight_size)?;
        }
        Ok(())
    }
}

/// Writes model binaries in the format [`ModelImage::parse`] reads
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    insts: Vec<Instruction>,
    weights: Vec<u8>,
    bias: Vec<u8>,
    num_layers: u16,
    input_size: u32,
    output_size: u32,
    workspace_size: u32,
    checksum: bool,
}

impl ModelBuilder {
    /// Empty model
    pub fn new() -> Self {
        Self::default()
    }

    /// Append instructions, counting one layer
    #[must_use]
    pub fn layer(mut self, insts: &[Instruction]) -> Self {
        self.insts.extend_from_slice(insts);
        self.num_layers = self.num_layers.saturating_add(1);
        self
    }

    /// Weight payload
    #[must_use]
    pub fn weights(mut self, weights: impl Into<Vec<u8>>) -> Self {
        self.weights = weights.into();
        self
    }

    /// Bias payload
    #[must_use]
    pub fn bias(mut self, bias: impl Into<Vec<u8>>) -> Self {
        self.bias = bias.into();
        self
    }

    /// Declared input and output sizes
    #[must_use]
    pub const fn io_sizes(mut self, input: u32, output: u32) -> Self {
        self.input_size = input;
        self.output_size = output;
        self
    }

    /// Declared workspace size
    #[must_use]
    pub const fn workspace(mut self, bytes: u32) -> Self {
        self.workspace_size = bytes;
        self
    }

    /// Emit a body checksum
    #[must_use]
    pub const fn with_checksum(mut self) -> Self {
        self.checksum = true;
        self
    }

    /// Serialize.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::InvalidParam`] if a section exceeds `u32::MAX`.
    pub fn build(&self) -> Result<Vec<u8>> {
        let size = |len: usize, what: &str| {
            u32::try_from(len).map_err(|_| NpuError::invalid_param(format!("{what} too large")))
        };
        let mut body = Vec::with_capacity(
            self.insts.len() * hw::INST_BYTES + self.weights.len() + self.bias.len(),
        );
        for inst in &self.insts {
            body.extend_from_slice(&inst.word().to_le_bytes());
        }
        body.extend_from_slice(&self.weights);
        body.extend_from_slice(&self.bias);

        let header = ModelHeader {
            version: VERSION,
            num_layers: self.num_layers,
            weight_size: size(self.weights.len(), "weights")?,
            inst_count: size(self.insts.len(), "instruction stream")?,
            input_size: self.input_size,
            output_size: self.output_size,
            workspace_size: self.workspace_size,
            checksum: if self.checksum { format::checksum(&body) } else { 0 },
            bias_size: size(self.bias.len(), "bias")?,
        };

        let mut out = Vec::with_capacity(HEADER_BYTES + body.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use npu_chip::format::offsets;
    use std::mem::offset_of;

    fn sample() -> Vec<u8> {
        ModelBuilder::new()
            .layer(&[Instruction::clear_acc(), Instruction::compute(0), Instruction::halt()])
            .weights(vec![1, 2, 3, 4])
            .bias(vec![9, 9])
            .io_sizes(64, 16)
            .with_checksum()
            .build()
            .unwrap()
    }

    #[test]
    fn raw_header_matches_wire_offsets() {
        assert_eq!(offset_of!(RawModelHeader, version), offsets::VERSION);
        assert_eq!(offset_of!(RawModelHeader, num_layers), offsets::NUM_LAYERS);
        assert_eq!(offset_of!(RawModelHeader, weight_size), offsets::WEIGHT_SIZE);
        assert_eq!(offset_of!(RawModelHeader, inst_count), offsets::INST_COUNT);
        assert_eq!(offset_of!(RawModelHeader, input_size), offsets::INPUT_SIZE);
        assert_eq!(offset_of!(RawModelHeader, output_size), offsets::OUTPUT_SIZE);
        assert_eq!(offset_of!(RawModelHeader, workspace_size), offsets::WORKSPACE_SIZE);
        assert_eq!(offset_of!(RawModelHeader, checksum), offsets::CHECKSUM);
        assert_eq!(offset_of!(RawModelHeader, bias_size), offsets::BIAS_SIZE);
        assert_eq!(offset_of!(RawModelHeader, reserved), offsets::RESERVED);
    }

    #[test]
    fn builder_output_parses() {
        let bytes = sample();
        assert_eq!(&bytes[..4], b"EUPN");
        assert_eq!(bytes.len(), HEADER_BYTES + 3 * 8 + 4 + 2);

        let image = ModelImage::parse(bytes).unwrap();
        assert_eq!(image.header.num_layers, 1);
        assert_eq!(image.header.input_size, 64);
        assert_eq!(image.instructions.len(), 3);
        assert!(image.instructions[2].is_last());
        assert_eq!(&image.weights[..], &[1, 2, 3, 4]);
        assert_eq!(&image.bias[..], &[9, 9]);
    }

    #[test]
    fn corrupted_magic_rejected() {
        let mut bytes = sample();
        bytes[0] ^= 0xFF;
        assert!(matches!(load_model(&bytes), Err(NpuError::InvalidModel { .. })));
    }

    #[test]
    fn newer_version_rejected() {
        let mut bytes = sample();
        bytes[offsets::VERSION..offsets::VERSION + 2].copy_from_slice(&0x0200u16.to_le_bytes());
        let err = load_model(&bytes).unwrap_err();
        assert!(err.to_string().contains("newer"));
    }

    #[test]
    fn truncated_body_rejected() {
        let bytes = sample();
        assert!(matches!(
            load_model(&bytes[..bytes.len() - 1]),
            Err(NpuError::InvalidModel { .. })
        ));
        assert!(load_model(&bytes[..10]).is_err());
    }

    #[test]
    fn checksum_mismatch_rejected() {
        let mut bytes = sample();
        let last = bytes.len() - 1;
        bytes[last] = bytes[last].wrapping_add(1);
        let err = load_model(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn zero_checksum_means_unchecked() {
        let mut bytes = ModelBuilder::new().layer(&[Instruction::halt()]).build().unwrap();
        bytes.push(0xEE);
        assert_eq!(load_model(&bytes).unwrap().len(), 1);
    }

    #[test]
    fn unrecognized_opcode_rejected() {
        let bad = Instruction::from_word(0xFE00_0000_0000_0000);
        let bytes = ModelBuilder::new().layer(&[bad]).build().unwrap();
        assert!(matches!(load_model(&bytes), Err(NpuError::InvalidOp { .. })));
    }
}
