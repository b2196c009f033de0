//! Performance counters

use crate::clock::Clock;
use crate::mmio::RegisterBlock;
use crate::registers::Registers;
use npu_chip::regs::perf_ctrl;
use npu_chip::Reg;
use std::fmt;

/// Snapshot of the hardware counters plus software bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfStats {
    /// Cycles since the last counter reset
    pub total_cycles: u64,
    /// Cycles spent doing useful work
    pub compute_cycles: u64,
    /// Cycles stalled on memory or DMA
    pub stall_cycles: u64,
    /// Multiply-accumulate operations
    pub mac_ops: u64,
    /// Retired instructions
    pub instructions: u64,
    /// Layers executed by `compile_and_run`
    pub layers_executed: u64,
    /// DMA transfers started
    pub dma_transfers: u64,
}

impl PerfStats {
    /// `(total - stall) / total`, or 0 when no cycles were counted
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        if self.total_cycles == 0 {
            return 0.0;
        }
        self.total_cycles.saturating_sub(self.stall_cycles) as f64 / self.total_cycles as f64
    }

    /// Read the hardware counters.
    ///
    /// Software-maintained fields (`layers_executed`, `dma_transfers`) are zero.
    pub fn read<B: RegisterBlock + ?Sized>(bus: &B) -> Self {
        let total_cycles = bus.read_u64(Reg::PerfCyclesLo, Reg::PerfCyclesHi);
        let stall_cycles = u64::from(bus.read(Reg::PerfStallCnt));
        Self {
            total_cycles,
            compute_cycles: total_cycles.saturating_sub(stall_cycles),
            stall_cycles,
            mac_ops: bus.read_u64(Reg::PerfMacLo, Reg::PerfMacHi),
            instructions: u64::from(bus.read(Reg::PerfInstCnt)),
            layers_executed: 0,
            dma_transfers: 0,
        }
    }

    /// Pulse the counter reset bit and re-enable counting.
    pub fn reset_counters<B, C>(bus: &mut B, clock: &mut C)
    where
        B: RegisterBlock + ?Sized,
        C: Clock + ?Sized,
    {
        bus.write(Reg::PerfCtrl, perf_ctrl::RESET);
        clock.delay_us(10);
        bus.write(Reg::PerfCtrl, perf_ctrl::ENABLE);
    }
}

impl fmt::Display for PerfStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cycles:       {} ({} stalled)", self.total_cycles, self.stall_cycles)?;
        writeln!(f, "MAC ops:      {}", self.mac_ops)?;
        writeln!(f, "instructions: {}", self.instructions)?;
        writeln!(f, "layers:       {}", self.layers_executed)?;
        writeln!(f, "DMA:          {}", self.dma_transfers)?;
        write!(f, "utilization:  {:.1}%", self.utilization() * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBus, SimClock};

    #[test]
    fn zero_cycles_means_zero_utilization() {
        let stats = PerfStats::default();
        assert!(stats.utilization().abs() < f64::EPSILON);
    }

    #[test]
    fn utilization_excludes_stalls() {
        let stats = PerfStats {
            total_cycles: 200,
            stall_cycles: 50,
            ..PerfStats::default()
        };
        assert!((stats.utilization() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn read_combines_split_counters() {
        let mut bus = SimBus::new();
        bus.poke(Reg::PerfCyclesLo, 10);
        bus.poke(Reg::PerfCyclesHi, 1);
        bus.poke(Reg::PerfMacLo, 7);
        bus.poke(Reg::PerfStallCnt, 4);
        bus.poke(Reg::PerfInstCnt, 3);
        let stats = PerfStats::read(&bus);
        assert_eq!(stats.total_cycles, (1 << 32) + 10);
        assert_eq!(stats.compute_cycles, (1 << 32) + 6);
        assert_eq!(stats.mac_ops, 7);
        assert_eq!(stats.instructions, 3);
    }

    #[test]
    fn reset_pulses_then_enables() {
        let mut bus = SimBus::new();
        let mut clock = SimClock::new();
        bus.poke(Reg::PerfCyclesLo, 99);
        PerfStats::reset_counters(&mut bus, &mut clock);
        assert_eq!(bus.writes_to(Reg::PerfCtrl), vec![perf_ctrl::RESET, perf_ctrl::ENABLE]);
        assert_eq!(PerfStats::read(&bus), PerfStats::default());
        assert_eq!(clock.now_us(), 10);
    }
}
