//! Bring-up and diagnostics
//!
//! Full boot sequence:
//!
//! 1. hardware reset, wait for IDLE
//! 2. identity check ([`Npu::verify_hardware`])
//! 3. clear interrupts, reset the DMA engine, clear PE accumulators
//! 4. clear buffer registers, restart the performance counters
//! 5. enable the core

use crate::clock::Clock;
use crate::error::{NpuError, Result};
use crate::mmio::NpuBus;
use crate::registers::Registers;
use crate::runtime::{Npu, NpuState, IDLE_TIMEOUT_US, RESET_PULSE_US};
use npu_chip::regs::{ctrl, dma_ctrl, irq, pe_ctrl, perf_ctrl, status};
use npu_chip::{HardwareProfile, Reg};
use std::fmt;
use tracing::{debug, info, warn};

/// Identity reported by VERSION and CONFIG
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareInfo {
    /// Raw VERSION register
    pub version: u32,
    /// Geometry from CONFIG, reference buffer sizes
    pub profile: HardwareProfile,
}

impl fmt::Display for HardwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EdgeNPU v{}.{} ({}x{} PEs)",
            self.version >> 16,
            self.version & 0xFFFF,
            self.profile.pe_rows,
            self.profile.pe_cols
        )
    }
}

const BUFFER_REGS: [Reg; 9] = [
    Reg::InstBase,
    Reg::InstSize,
    Reg::InstPtr,
    Reg::WeightBase,
    Reg::WeightSize,
    Reg::ActInBase,
    Reg::ActInSize,
    Reg::ActOutBase,
    Reg::ActOutSize,
];

impl<B: NpuBus, C: Clock> Npu<B, C> {
    /// Read VERSION and CONFIG without judging them
    pub fn hardware_info(&self) -> HardwareInfo {
        HardwareInfo {
            version: self.bus.read(Reg::Version),
            profile: HardwareProfile::from_config(self.bus.read(Reg::Config)),
        }
    }

    /// Check that the register block answers and reports a sane geometry.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::HwFault`] with the offending raw value if VERSION
    /// reads as 0 or all ones, or a PE dimension is outside `1..=64`.
    pub fn verify_hardware(&self) -> Result<HardwareInfo> {
        let info = self.hardware_info();
        if info.version == 0 || info.version == u32::MAX {
            warn!("VERSION reads {:#x}, no device answering", info.version);
            return Err(NpuError::HwFault { code: info.version });
        }
        if !info.profile.geometry_is_plausible() {
            warn!(
                "implausible PE geometry {}x{}",
                info.profile.pe_rows, info.profile.pe_cols
            );
            return Err(NpuError::HwFault {
                code: info.profile.config_word(),
            });
        }
        debug!("verified {info}");
        Ok(info)
    }

    /// Reset, verify, clear and enable the core, then self-test it.
    ///
    /// Leaves the runtime uninitialized; call `init` afterwards.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub fn boot(&mut self) -> Result<HardwareInfo> {
        self.bus.set_bits(Reg::Ctrl, ctrl::RESET);
        self.clock.delay_us(RESET_PULSE_US);
        self.bus.clear_bits(Reg::Ctrl, ctrl::RESET);
        self.clock.delay_us(RESET_PULSE_US);
        self.wait_idle(IDLE_TIMEOUT_US)?;

        let info = self.verify_hardware()?;

        self.bus.write(Reg::IrqEn, 0);
        self.bus.write(Reg::IrqStatus, irq::CLEAR_ALL);

        self.bus.write(Reg::DmaCtrl, dma_ctrl::ABORT);
        self.clock.delay_us(1);
        self.bus.write(Reg::DmaCtrl, 0);
        for reg in [Reg::DmaSrc, Reg::DmaDst, Reg::DmaLen, Reg::DmaSrcStride, Reg::DmaDstStride] {
            self.bus.write(reg, 0);
        }

        self.bus.write(Reg::PeCtrl, 0);
        self.bus.set_bits(Reg::PeCtrl, pe_ctrl::CLEAR_ACC);
        self.clock.delay_us(1);
        self.bus.clear_bits(Reg::PeCtrl, pe_ctrl::CLEAR_ACC);

        for reg in BUFFER_REGS {
            self.bus.write(reg, 0);
        }
        self.bus.write(Reg::PerfCtrl, perf_ctrl::RESET);
        self.clock.delay_us(1);
        self.bus.write(Reg::PerfCtrl, perf_ctrl::ENABLE);

        self.bus.set_bits(Reg::Ctrl, ctrl::ENABLE);
        self.self_test()?;

        info!("✅ Booted {info}");
        Ok(info)
    }

    /// Write/readback test of scratch-safe registers.
    ///
    /// Every register touched is restored to its previous value.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::HwFault`] carrying the offset of the first
    /// register that did not read back what was written.
    pub fn self_test(&mut self) -> Result<()> {
        const PATTERNS: [(Reg, u32); 5] = [
            (Reg::InstBase, 0xA5A5_A5A5),
            (Reg::DmaSrc, 0x1000),
            (Reg::DmaDst, 0x2000),
            (Reg::DmaLen, 256),
            (Reg::IrqEn, irq::DONE),
        ];

        let saved: Vec<u32> = PATTERNS.iter().map(|(reg, _)| self.bus.read(*reg)).collect();
        let mut result = Ok(());
        for (reg, pattern) in PATTERNS {
            self.bus.write(reg, pattern);
            if self.bus.read(reg) != pattern {
                warn!("self-test: {reg:?} did not read back {pattern:#x}");
                #[allow(clippy::cast_possible_truncation)]
                let code = reg.offset() as u32;
                result = Err(NpuError::HwFault { code });
                break;
            }
        }
        for ((reg, _), value) in PATTERNS.iter().zip(saved) {
            self.bus.write(*reg, value);
        }

        self.bus.set_bits(Reg::PeCtrl, pe_ctrl::CLEAR_ACC);
        self.clock.delay_us(1);
        self.bus.clear_bits(Reg::PeCtrl, pe_ctrl::CLEAR_ACC);

        if result.is_ok() {
            debug!("self-test passed");
        }
        result
    }

    /// State the core reports in STATUS[7:4]
    pub fn hardware_state(&self) -> Option<NpuState> {
        NpuState::from_code(status::state_field(self.bus.read(Reg::Status)))
    }

    /// Low-power mode: disable the core, counters and interrupts
    pub fn sleep(&mut self) {
        self.bus.clear_bits(Reg::Ctrl, ctrl::ENABLE);
        self.bus.write(Reg::PerfCtrl, 0);
        self.bus.write(Reg::IrqEn, 0);
        debug!("NPU sleeping");
    }

    /// Leave low-power mode and wait for IDLE.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::Timeout`] or [`NpuError::HwFault`] from the idle wait.
    pub fn wake(&mut self) -> Result<()> {
        self.bus.set_bits(Reg::Ctrl, ctrl::ENABLE);
        self.bus.write(Reg::PerfCtrl, perf_ctrl::ENABLE);
        if self.config.enable_irq && self.state() != NpuState::Reset {
            self.bus.write(Reg::IrqEn, irq::DONE | irq::ERROR | irq::DMA_DONE);
        }
        self.wait_idle(IDLE_TIMEOUT_US)?;
        debug!("NPU awake");
        Ok(())
    }
}
