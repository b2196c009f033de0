//! Typed register access
//!
//! Every access names a [`Reg`]; no caller does offset arithmetic.
//! `set_bits` / `clear_bits` are read-modify-write: the core has no
//! dedicated set/clear aliases.

use crate::mmio::RegisterBlock;
use npu_chip::Reg;
use tracing::trace;

/// Register accessors over any [`RegisterBlock`]
pub trait Registers: RegisterBlock {
    /// Read `reg`
    fn read(&self, reg: Reg) -> u32 {
        let value = self.read32(reg.offset());
        trace!("read  {reg:?} = {value:#010x}");
        value
    }

    /// Write `value` to `reg`
    fn write(&mut self, reg: Reg, value: u32) {
        trace!("write {reg:?} = {value:#010x}");
        self.write32(reg.offset(), value);
    }

    /// `reg |= mask`
    fn set_bits(&mut self, reg: Reg, mask: u32) {
        let value = self.read(reg) | mask;
        self.write(reg, value);
    }

    /// `reg &= !mask`
    fn clear_bits(&mut self, reg: Reg, mask: u32) {
        let value = self.read(reg) & !mask;
        self.write(reg, value);
    }

    /// True if any bit of `mask` is set in `reg`
    fn test_bits(&self, reg: Reg, mask: u32) -> bool {
        self.read(reg) & mask != 0
    }

    /// 64-bit counter split over a lo/hi register pair
    fn read_u64(&self, lo: Reg, hi: Reg) -> u64 {
        let low = self.read(lo);
        let high = self.read(hi);
        (u64::from(high) << 32) | u64::from(low)
    }
}

impl<T: RegisterBlock + ?Sized> Registers for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBus;
    use npu_chip::regs::ctrl;

    #[test]
    fn set_and_clear_are_read_modify_write() {
        let mut bus = SimBus::new();
        bus.write(Reg::InstCtrl, 0b1000);
        bus.set_bits(Reg::InstCtrl, 0b0011);
        assert_eq!(bus.read(Reg::InstCtrl), 0b1011);
        bus.clear_bits(Reg::InstCtrl, 0b1001);
        assert_eq!(bus.read(Reg::InstCtrl), 0b0010);
        assert_eq!(bus.writes_to(Reg::InstCtrl), vec![0b1000, 0b1011, 0b0010]);
    }

    #[test]
    fn set_bits_preserves_enable() {
        let mut bus = SimBus::new();
        bus.write(Reg::Ctrl, ctrl::ENABLE);
        bus.set_bits(Reg::Ctrl, ctrl::DEBUG_EN);
        assert!(bus.test_bits(Reg::Ctrl, ctrl::ENABLE));
        assert!(bus.test_bits(Reg::Ctrl, ctrl::DEBUG_EN));
    }

    #[test]
    fn u64_counters_combine_halves() {
        let mut bus = SimBus::new();
        bus.poke(Reg::PerfCyclesLo, 0x8000_0001);
        bus.poke(Reg::PerfCyclesHi, 0x2);
        assert_eq!(bus.read_u64(Reg::PerfCyclesLo, Reg::PerfCyclesHi), 0x2_8000_0001);
    }
}
