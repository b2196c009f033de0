//! Silicon model for the EdgeNPU accelerator.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the device: register offsets and bit definitions, the 64-bit
//! instruction encoding, typed operand layouts, the reference hardware
//! profile, and the model binary layout.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | Register map (0x000-0x734) and bit definitions |
//! | [`isa`] | Opcodes, flags, [`isa::encode`] / [`isa::decode`] |
//! | [`operand`] | DMA, pool, conv, FC and weight-load operand packing |
//! | [`hw`] | PE geometry, buffer capacities, physical base addresses |
//! | [`format`] | Model binary header layout and checksum |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod format;
pub mod hw;
pub mod isa;
pub mod operand;
pub mod regs;

pub use hw::HardwareProfile;
pub use isa::{decode, encode, flags, Instruction, OpFamily, Opcode};
pub use regs::Reg;
