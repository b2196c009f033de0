#![deny(unsafe_code)]

//! Single-layer compiler for the EdgeNPU instruction set
//!
//! Lowers one [`LayerDescriptor`] at a time into a bounded
//! [`InstructionSequence`], tiling channel dimensions to the PE array.
//!
//! # Supported lowerings
//!
//! | Layer | Lowering |
//! |-------|----------|
//! | Conv2d, depthwise | oc × ic tiles sized to PE columns × rows |
//! | Fully-connected | 1×1 convolution over the flattened input |
//! | Max / avg / global pooling | DMA in, pool op, DMA out |
//! | Elementwise | two DMA loads, binary op, DMA out |
//!
//! # Example
//!
//! ```
//! use npu_compiler::{compile_layer, ConvParams, LayerDescriptor, TensorDescriptor};
//!
//! let layer = LayerDescriptor::conv2d(
//!     TensorDescriptor::new(0x0000, 32, 8, 8),
//!     TensorDescriptor::new(0x8000, 32, 8, 8),
//!     TensorDescriptor::new(0x1_0000, 32, 32, 9),
//!     ConvParams::square(3).with_padding(1),
//! );
//! let seq = compile_layer(&layer).unwrap();
//! assert_eq!(seq.len(), 17);
//! print!("{}", seq.listing());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod compiler;
mod error;
mod layer;
mod sequence;
mod tensor;

pub use compiler::{
    compile_layer, fc_as_conv, CompilerConfig, LayerCompiler, TilePlan, CONV_SEQUENCE_BOUND,
    SIMPLE_SEQUENCE_BOUND,
};
pub use error::{CompileError, Result};
pub use layer::{
    Activation, ConvParams, EltwiseOp, LayerDescriptor, LayerKind, OutputQuant, PoolParams,
    RoundMode,
};
pub use sequence::InstructionSequence;
pub use tensor::{DType, Layout, TensorDescriptor};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        compile_layer, Activation, ConvParams, InstructionSequence, LayerCompiler,
        LayerDescriptor, LayerKind, PoolParams, Result, TensorDescriptor,
    };
}
