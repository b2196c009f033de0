//! DMA coordinator
//!
//! The engine has a single outstanding-transfer slot shared by all channels.
//! [`DmaCoordinator::start`] waits (bounded) for a previous transfer before
//! programming the next one, and counts every transfer it starts.

use crate::clock::{poll, Clock};
use crate::error::{NpuError, Result};
use crate::mmio::RegisterBlock;
use crate::registers::Registers;
use npu_chip::regs::{dma_channel, dma_ctrl, dma_status};
use npu_chip::Reg;
use tracing::debug;

/// Bound on the implicit wait for a previous transfer, in microseconds
pub const BUSY_WAIT_US: u64 = 100_000;
/// Default status poll interval, in microseconds
pub const DMA_POLL_INTERVAL_US: u64 = 10;

/// DMA channel selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaChannel {
    /// Host to weight buffer
    Weight,
    /// Host to activation input
    ActIn,
    /// Activation output to host
    ActOut,
}

impl DmaChannel {
    /// Value of the DMA_CTRL channel-select field
    pub const fn select(self) -> u32 {
        match self {
            Self::Weight => dma_channel::WEIGHT,
            Self::ActIn => dma_channel::ACT_IN,
            Self::ActOut => dma_channel::ACT_OUT,
        }
    }
}

/// Descriptor flags
pub mod flags {
    /// Strided 2D transfer
    pub const MODE_2D: u8 = 1 << 0;
    /// Interrupt on completion
    pub const IRQ: u8 = 1 << 1;
    /// Chained descriptor
    pub const CHAIN: u8 = 1 << 2;
}

/// One transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDescriptor {
    /// Source bus address
    pub src: u32,
    /// Destination bus address
    pub dst: u32,
    /// Bytes to move
    pub len: u32,
    /// Source row stride (2D only)
    pub src_stride: u16,
    /// Destination row stride (2D only)
    pub dst_stride: u16,
    /// Elements per row (2D only)
    pub width: u16,
    /// Rows (2D only)
    pub height: u16,
    /// Bytes per element (2D only)
    pub elem_bytes: u8,
    /// Channel
    pub channel: DmaChannel,
    /// See [`flags`]
    pub flags: u8,
}

impl DmaDescriptor {
    /// Contiguous transfer
    pub const fn linear(channel: DmaChannel, src: u32, dst: u32, len: u32) -> Self {
        Self {
            src,
            dst,
            len,
            src_stride: 0,
            dst_stride: 0,
            width: 0,
            height: 0,
            elem_bytes: 1,
            channel,
            flags: 0,
        }
    }

    /// Strided transfer of `height` rows of `width` elements.
    ///
    /// `len` is derived from the shape.
    pub const fn strided(
        channel: DmaChannel,
        src: u32,
        dst: u32,
        width: u16,
        height: u16,
        elem_bytes: u8,
        strides: (u16, u16),
    ) -> Self {
        Self {
            src,
            dst,
            len: width as u32 * height as u32 * elem_bytes as u32,
            src_stride: strides.0,
            dst_stride: strides.1,
            width,
            height,
            elem_bytes,
            channel,
            flags: flags::MODE_2D,
        }
    }

    /// Request an interrupt on completion
    #[must_use]
    pub const fn with_irq(mut self) -> Self {
        self.flags |= flags::IRQ;
        self
    }

    /// True if the 2D flag is set
    pub const fn is_2d(&self) -> bool {
        self.flags & flags::MODE_2D != 0
    }

    /// Check the descriptor before any register is touched.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::InvalidParam`] for a zero length, 2D fields without
    /// the 2D flag, or a 2D shape that disagrees with `len`.
    pub fn validate(&self) -> Result<()> {
        if self.len == 0 {
            return Err(NpuError::invalid_param("DMA length is 0"));
        }
        let has_2d_fields =
            self.src_stride != 0 || self.dst_stride != 0 || self.width != 0 || self.height != 0;
        if !self.is_2d() {
            if has_2d_fields {
                return Err(NpuError::invalid_param(
                    "DMA strides or shape set without the 2D flag",
                ));
            }
            return Ok(());
        }
        let shaped =
            u64::from(self.width) * u64::from(self.height) * u64::from(self.elem_bytes);
        if shaped != u64::from(self.len) {
            return Err(NpuError::invalid_param(format!(
                "2D DMA shape {}x{}x{} = {shaped} bytes disagrees with length {}",
                self.width, self.height, self.elem_bytes, self.len
            )));
        }
        Ok(())
    }

    /// DMA_CTRL value that starts this transfer
    pub const fn ctrl_word(&self) -> u32 {
        let mut word = dma_ctrl::START | (self.channel.select() << dma_ctrl::CHANNEL_SHIFT);
        if self.is_2d() {
            word |= dma_ctrl::MODE_2D;
        }
        if self.flags & flags::IRQ != 0 {
            word |= dma_ctrl::IRQ_EN;
        }
        word
    }
}

/// Programs the DMA engine and tracks transfer counts
#[derive(Debug, Clone, Default)]
pub struct DmaCoordinator {
    transfers: u64,
    poll_interval_us: u64,
}

impl DmaCoordinator {
    /// Coordinator polling every `poll_interval_us`
    pub const fn new(poll_interval_us: u64) -> Self {
        Self {
            transfers: 0,
            poll_interval_us,
        }
    }

    /// Transfers started so far
    pub const fn transfers(&self) -> u64 {
        self.transfers
    }

    /// Zero the transfer count
    pub fn reset_count(&mut self) {
        self.transfers = 0;
    }

    /// True while a transfer is in flight
    pub fn is_busy<B: RegisterBlock + ?Sized>(bus: &B) -> bool {
        bus.test_bits(Reg::DmaStatus, dma_status::BUSY)
    }

    /// Validate and start `desc`.
    ///
    /// If a transfer is in flight, waits up to [`BUSY_WAIT_US`] for it first.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::InvalidParam`] for a malformed descriptor,
    /// [`NpuError::Busy`] if the previous transfer outlasts the wait, or
    /// [`NpuError::Dma`] if it ends in an engine error.
    pub fn start<B, C>(&mut self, bus: &mut B, clock: &mut C, desc: &DmaDescriptor) -> Result<()>
    where
        B: RegisterBlock + ?Sized,
        C: Clock + ?Sized,
    {
        desc.validate()?;
        if Self::is_busy(bus) {
            debug!("DMA busy, waiting for previous transfer");
            self.wait(bus, clock, BUSY_WAIT_US).map_err(|e| match e {
                NpuError::Timeout { .. } => NpuError::busy("start DMA"),
                other => other,
            })?;
        }

        bus.write(Reg::DmaSrc, desc.src);
        bus.write(Reg::DmaDst, desc.dst);
        bus.write(Reg::DmaLen, desc.len);
        if desc.is_2d() {
            bus.write(Reg::DmaSrcStride, u32::from(desc.src_stride));
            bus.write(Reg::DmaDstStride, u32::from(desc.dst_stride));
        }
        bus.write(Reg::DmaCtrl, desc.ctrl_word());
        self.transfers += 1;

        debug!(
            "DMA {:?}: {:#x} -> {:#x} ({} bytes){}",
            desc.channel,
            desc.src,
            desc.dst,
            desc.len,
            if desc.is_2d() { " 2D" } else { "" }
        );
        Ok(())
    }

    /// Poll DMA_STATUS until done or error. `timeout_us == 0` waits forever.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::Dma`] on an error bit, [`NpuError::Timeout`] past the deadline.
    pub fn wait<B, C>(&self, bus: &B, clock: &mut C, timeout_us: u64) -> Result<()>
    where
        B: RegisterBlock + ?Sized,
        C: Clock + ?Sized,
    {
        let interval = self.poll_interval_us.max(1);
        poll(clock, interval, timeout_us, || {
            let status = bus.read(Reg::DmaStatus);
            if status & dma_status::DONE != 0 {
                Some(Ok(()))
            } else if status & dma_status::ERROR != 0 {
                Some(Err(NpuError::dma(format!("engine reported error (status {status:#x})"))))
            } else {
                None
            }
        })
    }
}
