//! Hardware profile of the EdgeNPU core.
//!
//! Geometry and buffer capacities of the reference build. A different
//! synthesis reports its PE geometry through the CONFIG register, see
//! [`HardwareProfile::from_config`].

use crate::regs;

/// Physical base of the register block on the reference SoC.
pub const NPU_BASE: u32 = 0x4000_0000;
/// Physical base of the instruction buffer.
pub const INST_BUF_BASE: u32 = 0x4010_0000;
/// Physical base of the weight buffer.
pub const WEIGHT_BUF_BASE: u32 = 0x4020_0000;
/// Physical base of the activation buffer.
pub const ACT_BUF_BASE: u32 = 0x4030_0000;

/// Bytes per instruction word.
pub const INST_BYTES: usize = 8;
/// Largest PE dimension a sane CONFIG register may report.
pub const MAX_PE_DIM: u16 = 64;
/// Data path width in bits.
pub const DATA_WIDTH: u32 = 8;

/// PE array geometry and on-chip buffer capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareProfile {
    /// PE array rows (input-channel tile).
    pub pe_rows: u16,
    /// PE array columns (output-channel tile).
    pub pe_cols: u16,
    /// Instruction buffer entries.
    pub inst_entries: u32,
    /// Weight buffer bytes.
    pub weight_buf_bytes: u32,
    /// Activation buffer bytes (input and output halves).
    pub act_buf_bytes: u32,
}

impl HardwareProfile {
    /// Reference build: 16×16 PEs, 1024 instructions, 256 KiB buffers.
    pub const REFERENCE: Self = Self {
        pe_rows:          16,
        pe_cols:          16,
        inst_entries:     1024,
        weight_buf_bytes: 256 * 1024,
        act_buf_bytes:    256 * 1024,
    };

    /// Reference buffers with the geometry reported by CONFIG.
    #[must_use]
    pub const fn from_config(config: u32) -> Self {
        Self {
            pe_rows: (config >> 16) as u16,
            pe_cols: (config & 0xFFFF) as u16,
            ..Self::REFERENCE
        }
    }

    /// The CONFIG word this profile reports.
    #[must_use]
    pub const fn config_word(&self) -> u32 {
        regs::config_word(self.pe_rows, self.pe_cols)
    }

    /// Total processing elements.
    #[must_use]
    pub const fn pe_count(&self) -> u32 {
        self.pe_rows as u32 * self.pe_cols as u32
    }

    /// Instruction buffer bytes.
    #[must_use]
    pub const fn inst_buf_bytes(&self) -> u32 {
        self.inst_entries * INST_BYTES as u32
    }

    /// True if both PE dimensions are in `1..=MAX_PE_DIM`.
    #[must_use]
    pub const fn geometry_is_plausible(&self) -> bool {
        self.pe_rows > 0 && self.pe_rows <= MAX_PE_DIM && self.pe_cols > 0 && self.pe_cols <= MAX_PE_DIM
    }
}

impl Default for HardwareProfile {
    fn default() -> Self {
        Self::REFERENCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_profile() {
        let hw = HardwareProfile::REFERENCE;
        assert_eq!(hw.pe_count(), 256);
        assert_eq!(hw.inst_buf_bytes(), 8192);
        assert!(hw.geometry_is_plausible());
    }

    #[test]
    fn config_register_roundtrip() {
        let hw = HardwareProfile::from_config(0x0020_0008);
        assert_eq!((hw.pe_rows, hw.pe_cols), (32, 8));
        assert_eq!(hw.config_word(), 0x0020_0008);
        assert!(!HardwareProfile::from_config(0x0080_0010).geometry_is_plausible());
        assert!(!HardwareProfile::from_config(0).geometry_is_plausible());
    }
}
