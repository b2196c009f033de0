//! Simulated EdgeNPU
//!
//! [`SimBus`] is a register file plus device memory that behaves like the
//! reference core closely enough to drive the whole runtime without
//! hardware:
//!
//! - `CTRL.START` runs the loaded program: it walks the instruction buffer up
//!   to `HALT`, accumulates performance counters, and sets `STATUS.DONE`,
//!   `STATUS.IDLE` and `IRQ_STATUS.DONE`
//! - `CTRL.RESET` and `CTRL.ABORT` return the core to idle
//! - `DMA_CTRL.START` copies `DMA_LEN` bytes between mapped windows
//! - `IRQ_STATUS` is write-1-to-clear, `VERSION` / `CONFIG` / `STATUS` are read-only
//!
//! Faults, hangs and completion latency can be scripted, and every register
//! write is logged for inspection.
//!
//! [`SimClock`] is a virtual microsecond clock: delays advance time instantly,
//! so timeout tests are deterministic and fast.

use crate::clock::Clock;
use crate::error::{NpuError, Result};
use crate::mmio::{DeviceMemory, RegisterBlock};
use npu_chip::regs::{ctrl, dma_ctrl, dma_status, irq, perf_ctrl, status, REG_WINDOW_BYTES};
use npu_chip::{hw, HardwareProfile, Opcode, Reg};
use std::cell::Cell;
use tracing::{debug, trace};

/// VERSION register value reported by the simulator
pub const SIM_VERSION: u32 = 0x0001_0000;
/// Bus address of the simulated host staging window
pub const SIM_STAGING_BASE: u32 = 0x8000_0000;
/// Size of the simulated host staging window
pub const SIM_STAGING_BYTES: usize = 1024 * 1024;

/// Cycles charged per retired instruction
const CYCLES_PER_INST: u64 = 4;
/// Extra cycles charged per `COMPUTE`
const CYCLES_PER_COMPUTE: u64 = 16;
/// Stall cycles charged per `WAIT_DMA`
const STALL_PER_DMA_WAIT: u64 = 8;

// NpuState codes reported in STATUS[7:4]
const STATE_IDLE: u32 = 2;
const STATE_RUNNING: u32 = 4;
const STATE_DONE: u32 = 6;
const STATE_ERROR: u32 = 7;

#[derive(Debug)]
struct Window {
    base: u32,
    data: Vec<u8>,
}

impl Window {
    fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            data: vec![0; size],
        }
    }

    fn offset_of(&self, addr: u32, len: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)? as usize;
        (offset.checked_add(len)? <= self.data.len()).then_some(offset)
    }
}

/// Simulated register file and device memory
#[derive(Debug)]
pub struct SimBus {
    regs: Vec<u32>,
    profile: HardwareProfile,
    /// inst, weight, act, staging
    windows: [Window; 4],
    log: Vec<(Reg, u32)>,
    fault: Option<u32>,
    dma_fault: bool,
    dma_hang: bool,
    hang: bool,
    latency_polls: u32,
    /// STATUS reads left before a started program reports completion
    pending_polls: Cell<u32>,
    status_reads: Cell<u64>,
}

impl SimBus {
    /// Simulator with the reference hardware profile
    pub fn new() -> Self {
        Self::with_profile(HardwareProfile::REFERENCE)
    }

    /// Simulator with a custom geometry and buffer sizes
    pub fn with_profile(profile: HardwareProfile) -> Self {
        let mut regs = vec![0; REG_WINDOW_BYTES / 4];
        regs[Reg::Version.offset() / 4] = SIM_VERSION;
        regs[Reg::Config.offset() / 4] = profile.config_word();
        regs[Reg::Status.offset() / 4] = status::IDLE | (STATE_IDLE << status::STATE_SHIFT);
        Self {
            regs,
            profile,
            windows: [
                Window::new(hw::INST_BUF_BASE, profile.inst_buf_bytes() as usize),
                Window::new(hw::WEIGHT_BUF_BASE, profile.weight_buf_bytes as usize),
                Window::new(hw::ACT_BUF_BASE, profile.act_buf_bytes as usize),
                Window::new(SIM_STAGING_BASE, SIM_STAGING_BYTES),
            ],
            log: Vec::new(),
            fault: None,
            dma_fault: false,
            dma_hang: false,
            hang: false,
            latency_polls: 0,
            pending_polls: Cell::new(0),
            status_reads: Cell::new(0),
        }
    }

    /// Hardware profile this simulator reports
    pub const fn profile(&self) -> &HardwareProfile {
        &self.profile
    }

    /// Read a register without side effects
    pub fn peek(&self, reg: Reg) -> u32 {
        self.regs[reg.offset() / 4]
    }

    /// Set a register without side effects or logging
    pub fn poke(&mut self, reg: Reg, value: u32) {
        self.regs[reg.offset() / 4] = value;
    }

    /// Every register write since creation or the last [`Self::clear_log`]
    pub fn writes(&self) -> &[(Reg, u32)] {
        &self.log
    }

    /// Values written to `reg`, oldest first
    pub fn writes_to(&self, reg: Reg) -> Vec<u32> {
        self.log
            .iter()
            .filter(|(r, _)| *r == reg)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Forget logged writes
    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Number of STATUS reads so far
    pub fn status_reads(&self) -> u64 {
        self.status_reads.get()
    }

    /// Fail the next started program with `code` in ERROR_CODE
    pub fn inject_fault(&mut self, code: u32) {
        self.fault = Some(code);
    }

    /// Fail the next DMA transfer
    pub fn inject_dma_fault(&mut self) {
        self.dma_fault = true;
    }

    /// Started programs never complete while set
    pub fn set_hang(&mut self, hang: bool) {
        self.hang = hang;
    }

    /// DMA transfers never complete while set
    pub fn set_dma_hang(&mut self, hang: bool) {
        self.dma_hang = hang;
    }

    /// Report BUSY for `polls` STATUS reads after each START
    pub fn set_latency_polls(&mut self, polls: u32) {
        self.latency_polls = polls;
    }

    /// Assert IRQ_STATUS bits as if the device raised them
    pub fn raise_irq(&mut self, bits: u32) {
        self.regs[Reg::IrqStatus.offset() / 4] |= bits;
    }

    fn reg_mut(&mut self, reg: Reg) -> &mut u32 {
        &mut self.regs[reg.offset() / 4]
    }

    fn set_status(&mut self, bits: u32, state: u32) {
        *self.reg_mut(Reg::Status) = bits | (state << status::STATE_SHIFT);
    }

    fn locate(&self, addr: u32, len: usize) -> Option<(usize, usize)> {
        self.windows
            .iter()
            .enumerate()
            .find_map(|(i, w)| w.offset_of(addr, len).map(|off| (i, off)))
    }

    fn on_ctrl(&mut self, value: u32) {
        if value & (ctrl::RESET | ctrl::ABORT) != 0 {
            self.pending_polls.set(0);
            *self.reg_mut(Reg::ErrorCode) = 0;
            self.set_status(status::IDLE, STATE_IDLE);
            return;
        }
        if value & ctrl::START != 0 {
            *self.reg_mut(Reg::Ctrl) = value & !ctrl::START;
            self.run_program();
        }
    }

    fn run_program(&mut self) {
        if self.hang {
            debug!("sim: program started, hanging");
            self.set_status(status::BUSY, STATE_RUNNING);
            return;
        }
        if let Some(code) = self.fault.take() {
            debug!("sim: program started, faulting with {code:#x}");
            *self.reg_mut(Reg::ErrorCode) = code;
            self.set_status(status::ERROR, STATE_ERROR);
            self.raise_irq(irq::ERROR);
            return;
        }

        let count = self.peek(Reg::InstSize) as usize;
        let inst = &self.windows[0].data;
        let (mut retired, mut computes, mut dma_waits) = (0u64, 0u64, 0u64);
        for chunk in inst.chunks_exact(hw::INST_BYTES).take(count) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            let (opcode, _, _) = npu_chip::decode(u64::from_le_bytes(word));
            retired += 1;
            match opcode {
                Opcode::Compute => computes += 1,
                Opcode::WaitDma => dma_waits += 1,
                Opcode::Halt => break,
                _ => {}
            }
        }
        debug!("sim: program retired {retired} instructions");

        if self.peek(Reg::PerfCtrl) & perf_ctrl::ENABLE != 0 {
            let stall = dma_waits * STALL_PER_DMA_WAIT;
            let cycles = retired * CYCLES_PER_INST + computes * CYCLES_PER_COMPUTE + stall;
            let macs = computes * u64::from(self.profile.pe_count());
            self.add_counter64(Reg::PerfCyclesLo, Reg::PerfCyclesHi, cycles);
            self.add_counter64(Reg::PerfMacLo, Reg::PerfMacHi, macs);
            add32(self.reg_mut(Reg::PerfInstCnt), retired);
            add32(self.reg_mut(Reg::PerfStallCnt), stall);
        }
        *self.reg_mut(Reg::InstPtr) = u32::try_from(retired).unwrap_or(u32::MAX);
        self.set_status(status::DONE | status::IDLE, STATE_DONE);
        self.raise_irq(irq::DONE);
        self.pending_polls.set(self.latency_polls);
    }

    fn add_counter64(&mut self, lo: Reg, hi: Reg, delta: u64) {
        let value = ((u64::from(self.peek(hi)) << 32) | u64::from(self.peek(lo))).wrapping_add(delta);
        #[allow(clippy::cast_possible_truncation)]
        {
            *self.reg_mut(lo) = value as u32;
            *self.reg_mut(hi) = (value >> 32) as u32;
        }
    }

    fn on_dma_ctrl(&mut self, value: u32) {
        if value & dma_ctrl::ABORT != 0 {
            *self.reg_mut(Reg::DmaStatus) = 0;
            return;
        }
        if value & dma_ctrl::START == 0 {
            return;
        }
        *self.reg_mut(Reg::DmaCtrl) = value & !dma_ctrl::START;
        if self.dma_hang {
            *self.reg_mut(Reg::DmaStatus) = dma_status::BUSY;
            return;
        }

        let (src, dst, len) = (
            self.peek(Reg::DmaSrc),
            self.peek(Reg::DmaDst),
            self.peek(Reg::DmaLen) as usize,
        );
        // 2D transfers are modelled as a linear copy of DMA_LEN bytes
        let copied = !std::mem::take(&mut self.dma_fault) && self.dma_copy(src, dst, len);
        if copied {
            trace!("sim: DMA {src:#x} -> {dst:#x} ({len} bytes)");
            *self.reg_mut(Reg::DmaStatus) = dma_status::DONE;
            add32(self.reg_mut(Reg::PerfDmaCnt), 1);
            self.raise_irq(irq::DMA_DONE);
        } else {
            debug!("sim: DMA {src:#x} -> {dst:#x} ({len} bytes) failed");
            *self.reg_mut(Reg::DmaStatus) = dma_status::ERROR;
            self.raise_irq(irq::DMA_ERROR);
        }
    }

    fn dma_copy(&mut self, src: u32, dst: u32, len: usize) -> bool {
        let (Some((si, so)), Some((di, doff))) = (self.locate(src, len), self.locate(dst, len))
        else {
            return false;
        };
        let bytes = self.windows[si].data[so..so + len].to_vec();
        self.windows[di].data[doff..doff + len].copy_from_slice(&bytes);
        true
    }

    fn on_perf_ctrl(&mut self, value: u32) {
        if value & perf_ctrl::RESET != 0 {
            for reg in [
                Reg::PerfCyclesLo,
                Reg::PerfCyclesHi,
                Reg::PerfInstCnt,
                Reg::PerfMacLo,
                Reg::PerfMacHi,
                Reg::PerfStallCnt,
                Reg::PerfDmaCnt,
            ] {
                *self.reg_mut(reg) = 0;
            }
        }
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

fn add32(slot: &mut u32, delta: u64) {
    *slot = slot.wrapping_add(u32::try_from(delta).unwrap_or(u32::MAX));
}

impl RegisterBlock for SimBus {
    fn read32(&self, offset: usize) -> u32 {
        let Some(&value) = self.regs.get(offset / 4) else {
            return 0;
        };
        let pending = self.pending_polls.get();
        if offset == Reg::Status.offset() {
            self.status_reads.set(self.status_reads.get() + 1);
            if pending > 0 {
                self.pending_polls.set(pending - 1);
                return status::BUSY | (STATE_RUNNING << status::STATE_SHIFT);
            }
        }
        if offset == Reg::IrqStatus.offset() && pending > 0 {
            return value & !irq::DONE;
        }
        value
    }

    fn write32(&mut self, offset: usize, value: u32) {
        let Some(reg) = Reg::from_offset(offset) else {
            return;
        };
        self.log.push((reg, value));
        match reg {
            Reg::Version | Reg::Config | Reg::Status | Reg::DmaStatus => {}
            Reg::IrqStatus => *self.reg_mut(reg) &= !value,
            Reg::Ctrl => {
                *self.reg_mut(reg) = value;
                self.on_ctrl(value);
            }
            Reg::DmaCtrl => {
                *self.reg_mut(reg) = value;
                self.on_dma_ctrl(value);
            }
            Reg::PerfCtrl => {
                *self.reg_mut(reg) = value;
                self.on_perf_ctrl(value);
            }
            _ => *self.reg_mut(reg) = value,
        }
    }
}

impl DeviceMemory for SimBus {
    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let (i, offset) = self.locate(addr, data.len()).ok_or_else(|| {
            NpuError::invalid_param(format!("device range {addr:#x}+{:#x} is not mapped", data.len()))
        })?;
        self.windows[i].data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_bytes(&self, addr: u32, out: &mut [u8]) -> Result<()> {
        let (i, offset) = self.locate(addr, out.len()).ok_or_else(|| {
            NpuError::invalid_param(format!("device range {addr:#x}+{:#x} is not mapped", out.len()))
        })?;
        out.copy_from_slice(&self.windows[i].data[offset..offset + out.len()]);
        Ok(())
    }

    fn staging_addr(&self) -> u32 {
        SIM_STAGING_BASE
    }

    fn staging_len(&self) -> usize {
        SIM_STAGING_BYTES
    }
}

/// Virtual microsecond clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SimClock {
    now: u64,
}

impl SimClock {
    /// Clock at time zero
    pub const fn new() -> Self {
        Self { now: 0 }
    }
}

impl Clock for SimClock {
    fn now_us(&self) -> u64 {
        self.now
    }

    fn delay_us(&mut self, us: u64) {
        self.now = self.now.saturating_add(us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use npu_chip::Instruction;

    fn load_program(bus: &mut SimBus, insts: &[Instruction]) {
        let bytes: Vec<u8> = insts.iter().flat_map(|i| i.word().to_le_bytes()).collect();
        bus.write_bytes(hw::INST_BUF_BASE, &bytes).unwrap();
        bus.write32(Reg::InstSize.offset(), u32::try_from(insts.len()).unwrap());
    }

    #[test]
    fn reports_identity_and_idle() {
        let bus = SimBus::new();
        assert_eq!(bus.read32(Reg::Version.offset()), SIM_VERSION);
        assert_eq!(bus.read32(Reg::Config.offset()), 0x0010_0010);
        assert_ne!(bus.read32(Reg::Status.offset()) & status::IDLE, 0);
    }

    #[test]
    fn read_only_registers_ignore_writes() {
        let mut bus = SimBus::new();
        bus.write32(Reg::Version.offset(), 0);
        assert_eq!(bus.peek(Reg::Version), SIM_VERSION);
        assert_eq!(bus.writes_to(Reg::Version), vec![0]);
    }

    #[test]
    fn start_runs_program_to_halt() {
        let mut bus = SimBus::new();
        load_program(
            &mut bus,
            &[Instruction::clear_acc(), Instruction::compute(0), Instruction::halt(), Instruction::nop()],
        );
        bus.write32(Reg::PerfCtrl.offset(), perf_ctrl::ENABLE);
        bus.write32(Reg::Ctrl.offset(), ctrl::ENABLE | ctrl::START);

        let st = bus.read32(Reg::Status.offset());
        assert_ne!(st & status::DONE, 0);
        assert_eq!(status::state_field(st), 6);
        assert_ne!(bus.peek(Reg::IrqStatus) & irq::DONE, 0);
        assert_eq!(bus.peek(Reg::PerfInstCnt), 3);
        assert_eq!(bus.peek(Reg::PerfMacLo), 256);
        assert_eq!(bus.peek(Reg::Ctrl) & ctrl::START, 0);
    }

    #[test]
    fn irq_status_is_write_one_to_clear() {
        let mut bus = SimBus::new();
        bus.raise_irq(irq::DONE | irq::DMA_DONE);
        bus.write32(Reg::IrqStatus.offset(), irq::DONE);
        assert_eq!(bus.peek(Reg::IrqStatus), irq::DMA_DONE);
    }

    #[test]
    fn scripted_fault_sets_error_code() {
        let mut bus = SimBus::new();
        bus.inject_fault(0x2A);
        bus.write32(Reg::Ctrl.offset(), ctrl::START);
        assert_ne!(bus.peek(Reg::Status) & status::ERROR, 0);
        assert_eq!(bus.peek(Reg::ErrorCode), 0x2A);
        bus.write32(Reg::Ctrl.offset(), ctrl::RESET);
        assert_eq!(bus.peek(Reg::Status) & status::ERROR, 0);
        assert_eq!(bus.peek(Reg::ErrorCode), 0);
    }

    #[test]
    fn latency_reports_busy_then_done() {
        let mut bus = SimBus::new();
        bus.set_latency_polls(2);
        bus.write32(Reg::Ctrl.offset(), ctrl::START);
        assert_eq!(bus.read32(Reg::Status.offset()) & status::DONE, 0);
        assert_eq!(bus.read32(Reg::IrqStatus.offset()) & irq::DONE, 0);
        assert_eq!(bus.read32(Reg::Status.offset()) & status::DONE, 0);
        assert_ne!(bus.read32(Reg::Status.offset()) & status::DONE, 0);
    }

    #[test]
    fn dma_copies_between_windows() {
        let mut bus = SimBus::new();
        let addr = bus.stage(&[9, 8, 7, 6]).unwrap();
        bus.write32(Reg::DmaSrc.offset(), addr);
        bus.write32(Reg::DmaDst.offset(), hw::ACT_BUF_BASE + 16);
        bus.write32(Reg::DmaLen.offset(), 4);
        bus.write32(Reg::DmaCtrl.offset(), dma_ctrl::START);

        assert_eq!(bus.peek(Reg::DmaStatus), dma_status::DONE);
        let mut out = [0u8; 4];
        bus.read_bytes(hw::ACT_BUF_BASE + 16, &mut out).unwrap();
        assert_eq!(out, [9, 8, 7, 6]);
        assert_eq!(bus.peek(Reg::PerfDmaCnt), 1);
    }

    #[test]
    fn dma_to_unmapped_address_errors() {
        let mut bus = SimBus::new();
        bus.write32(Reg::DmaSrc.offset(), 0x10);
        bus.write32(Reg::DmaDst.offset(), hw::ACT_BUF_BASE);
        bus.write32(Reg::DmaLen.offset(), 4);
        bus.write32(Reg::DmaCtrl.offset(), dma_ctrl::START);
        assert_eq!(bus.peek(Reg::DmaStatus), dma_status::ERROR);
        assert_ne!(bus.peek(Reg::IrqStatus) & irq::DMA_ERROR, 0);
    }

    #[test]
    fn perf_reset_zeroes_counters() {
        let mut bus = SimBus::new();
        bus.poke(Reg::PerfCyclesLo, 100);
        bus.poke(Reg::PerfDmaCnt, 3);
        bus.write32(Reg::PerfCtrl.offset(), perf_ctrl::RESET);
        assert_eq!(bus.peek(Reg::PerfCyclesLo), 0);
        assert_eq!(bus.peek(Reg::PerfDmaCnt), 0);
    }

    #[test]
    fn sim_clock_is_virtual() {
        let mut clock = SimClock::new();
        clock.delay_ms(3);
        clock.delay_us(10);
        assert_eq!(clock.now_us(), 3010);
    }

    #[test]
    fn stage_rejects_oversize() {
        let mut bus = SimBus::new();
        let big = vec![0u8; SIM_STAGING_BYTES + 1];
        assert!(matches!(bus.stage(&big), Err(NpuError::Overflow { .. })));
    }
}
