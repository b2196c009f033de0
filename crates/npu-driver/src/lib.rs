//! Register-level driver and execution runtime for the EdgeNPU accelerator.
//!
//! The driver owns one register block and its on-chip buffers through an
//! [`NpuBus`] backend and walks the core through its lifecycle:
//!
//! ```text
//! Reset ──init──▶ Idle ──load──▶ Loading ──start──▶ Running ──wait──▶ Done
//!                  ▲                                   │
//!                  └──────────── reset / abort ◀── Error
//! ```
//!
//! # Backends
//!
//! ```text
//! MmioBus  — volatile 32-bit access through a rustix memory map (/dev/mem)
//! SimBus   — simulated register file and buffers, used by every test
//! ```
//!
//! # Quick start
//!
//! ```
//! use npu_driver::sim::{SimBus, SimClock};
//! use npu_driver::{Npu, RuntimeConfig};
//! use npu_compiler::{ConvParams, LayerDescriptor, TensorDescriptor};
//!
//! # fn main() -> npu_driver::Result<()> {
//! let mut npu = Npu::with_clock(SimBus::new(), SimClock::new());
//! npu.init(RuntimeConfig::default())?;
//!
//! let layer = LayerDescriptor::conv2d(
//!     TensorDescriptor::new(0x1000, 32, 8, 8),
//!     TensorDescriptor::new(0x8000, 32, 8, 8),
//!     TensorDescriptor::new(0x2_0000, 32, 32, 9),
//!     ConvParams::square(3).with_padding(1),
//! );
//! let perf = npu.compile_and_run(&layer)?;
//! println!("{perf}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod boot;
mod clock;
pub mod dma;
mod error;
mod exec;
mod loading;
pub mod mmio;
mod perf;
mod registers;
mod runtime;
pub mod sim;

pub use boot::HardwareInfo;
pub use clock::{Clock, SystemClock};
pub use dma::{DmaChannel, DmaCoordinator, DmaDescriptor};
pub use error::{NpuError, Result};
pub use loading::{load_model, ModelBuilder, ModelHeader, ModelImage};
pub use mmio::{DeviceMemory, MmioBus, MmioConfig, NpuBus, RegisterBlock};
pub use perf::PerfStats;
pub use registers::Registers;
pub use runtime::{
    CompletionHandler, ExecutionContext, Npu, NpuState, RuntimeConfig, DIRECT_WEIGHT_LIMIT,
    IDLE_TIMEOUT_US, TRANSFER_TIMEOUT_US,
};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        load_model, Clock, CompletionHandler, DmaDescriptor, ModelBuilder, Npu, NpuBus, NpuError,
        NpuState, PerfStats, Result, RuntimeConfig,
    };
}
