// SPDX-License-Identifier: AGPL-3.0-only

//! Memory-mapped I/O for the EdgeNPU
//!
//! Two seams sit between the runtime and the device:
//!
//! - [`RegisterBlock`]: 32-bit register reads and writes at byte offsets.
//! - [`DeviceMemory`]: byte copies into device-addressed buffers plus a host
//!   staging window that DMA descriptors can point at.
//!
//! [`MmioBus`] implements both over `rustix` memory maps of a physical memory
//! device. `crate::sim::SimBus` implements both in ordinary memory for CI.

// MMIO windows are page aligned by construction, so pointer casts to u32 are aligned
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::cast_possible_truncation)]

use crate::error::{NpuError, Result};
use npu_chip::hw;
use npu_chip::regs::REG_WINDOW_BYTES;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

const PAGE_SIZE: usize = 4096;

/// 32-bit register access at byte offsets from the block base.
///
/// Implementations must not reorder or cache accesses.
pub trait RegisterBlock: Debug + Send {
    /// Read the register at `offset`.
    fn read32(&self, offset: usize) -> u32;

    /// Write `value` to the register at `offset`.
    fn write32(&mut self, offset: usize, value: u32);
}

/// Byte access to device-addressed memory.
pub trait DeviceMemory: Debug + Send {
    /// Copy `data` to device address `addr`.
    ///
    /// # Errors
    ///
    /// Returns error if the range is not backed by a mapped window.
    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<()>;

    /// Copy from device address `addr` into `out`.
    ///
    /// # Errors
    ///
    /// Returns error if the range is not backed by a mapped window.
    fn read_bytes(&self, addr: u32, out: &mut [u8]) -> Result<()>;

    /// Bus address of the host staging window.
    fn staging_addr(&self) -> u32;

    /// Size of the host staging window in bytes.
    fn staging_len(&self) -> usize;

    /// Copy host data into the staging window and return its bus address.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::Overflow`] if `data` does not fit.
    fn stage(&mut self, data: &[u8]) -> Result<u32> {
        if data.len() > self.staging_len() {
            return Err(NpuError::Overflow {
                what: "staging window",
                requested: data.len() as u64,
                capacity: self.staging_len() as u64,
            });
        }
        let addr = self.staging_addr();
        self.write_bytes(addr, data)?;
        Ok(addr)
    }
}

/// Everything the runtime needs from a device.
pub trait NpuBus: RegisterBlock + DeviceMemory {}

impl<T: RegisterBlock + DeviceMemory> NpuBus for T {}

/// One `mmap`ed physical window
pub struct MappedRegion {
    ptr: NonNull<u8>,
    size: usize,
    phys: u64,
}

impl Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("phys", &format_args!("{:#x}", self.phys))
            .finish()
    }
}

// SAFETY: Send - MappedRegion owns its mapping exclusively. The mapping is process-wide,
// so moving the owner between threads does not invalidate it.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// Map `size` bytes of `file` starting at physical address `phys`.
    ///
    /// # Errors
    ///
    /// Returns error if `phys` is not page aligned, `size` is zero, or mmap fails.
    pub fn map(file: &File, phys: u64, size: usize) -> Result<Self> {
        if phys % PAGE_SIZE as u64 != 0 {
            return Err(NpuError::invalid_param(format!(
                "window base {phys:#x} is not page aligned"
            )));
        }
        if size == 0 {
            return Err(NpuError::invalid_param("window size is 0"));
        }
        let size = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;

        // SAFETY: mmap of a device file. Invariants: (1) file is open read/write;
        // (2) phys is page aligned and size is a non-zero page multiple; (3) the result is
        // checked before use; (4) Drop unmaps exactly this range once.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                phys,
            )
        }
        .map_err(|e| NpuError::not_ready(format!("mmap of {phys:#x} failed: {e}")))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| NpuError::not_ready(format!("mmap of {phys:#x} returned null")))?;

        tracing::debug!("Mapped {phys:#x} ({size:#x} bytes) at {ptr:p}");
        Ok(Self { ptr, size, phys })
    }

    /// Mapped size in bytes
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Physical base address
    pub const fn phys(&self) -> u64 {
        self.phys
    }

    /// Volatile 32-bit read.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped size or `offset` is unaligned.
    pub fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size && offset % 4 == 0, "register offset out of bounds");
        // SAFETY: read_volatile for MMIO. Invariants: (1) ptr valid for self.size bytes;
        // (2) offset+4 <= size; (3) offset is 4-aligned on a page-aligned base.
        unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset).cast::<u32>()) }
    }

    /// Volatile 32-bit write.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped size or `offset` is unaligned.
    pub fn write32(&mut self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.size && offset % 4 == 0, "register offset out of bounds");
        // SAFETY: write_volatile for MMIO. Same invariants as read32; &mut self gives
        // exclusive access.
        unsafe { std::ptr::write_volatile(self.ptr.as_ptr().add(offset).cast::<u32>(), value) }
    }

    /// Volatile byte copy into the window.
    ///
    /// # Errors
    ///
    /// Returns error if the range leaves the window.
    pub fn copy_in(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        for (i, &byte) in data.iter().enumerate() {
            // SAFETY: offset+i < offset+len <= size, checked above.
            unsafe { std::ptr::write_volatile(self.ptr.as_ptr().add(offset + i), byte) }
        }
        Ok(())
    }

    /// Volatile byte copy out of the window.
    ///
    /// # Errors
    ///
    /// Returns error if the range leaves the window.
    pub fn copy_out(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len())?;
        for (i, slot) in out.iter_mut().enumerate() {
            // SAFETY: offset+i < offset+len <= size, checked above.
            *slot = unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset + i)) };
        }
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(NpuError::invalid_param(format!(
                "range {offset:#x}+{len:#x} outside {:#x}-byte window",
                self.size
            ))),
        }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from the successful mmap in map(); Drop runs once.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.size);
        }
        tracing::debug!("Unmapped {:#x}", self.phys);
    }
}

/// Physical layout of an MMIO-attached NPU
#[derive(Debug, Clone)]
pub struct MmioConfig {
    /// Physical memory device, usually `/dev/mem` or a UIO node
    pub mem_path: PathBuf,
    /// Register block base
    pub reg_base: u32,
    /// Instruction buffer base and size
    pub inst_buf: (u32, usize),
    /// Weight buffer base and size
    pub weight_buf: (u32, usize),
    /// Activation buffer base and size
    pub act_buf: (u32, usize),
    /// Host staging window base and size (reserved, DMA-visible memory)
    pub staging: (u32, usize),
}

impl Default for MmioConfig {
    fn default() -> Self {
        let profile = npu_chip::HardwareProfile::REFERENCE;
        Self {
            mem_path: PathBuf::from("/dev/mem"),
            reg_base: hw::NPU_BASE,
            inst_buf: (hw::INST_BUF_BASE, profile.inst_buf_bytes() as usize),
            weight_buf: (hw::WEIGHT_BUF_BASE, profile.weight_buf_bytes as usize),
            act_buf: (hw::ACT_BUF_BASE, profile.act_buf_bytes as usize),
            staging: (0x8000_0000, 1024 * 1024),
        }
    }
}

/// Register block and buffers of a physical NPU
#[derive(Debug)]
pub struct MmioBus {
    regs: MappedRegion,
    /// (bus base, window), staging last
    windows: Vec<(u32, MappedRegion)>,
    staging_len: usize,
}

impl MmioBus {
    /// Map every window described by `config`.
    ///
    /// # Errors
    ///
    /// Returns error if the memory device cannot be opened or any window fails to map.
    pub fn open(config: &MmioConfig) -> Result<Self> {
        let file = open_mem(&config.mem_path)?;
        let regs = MappedRegion::map(&file, u64::from(config.reg_base), REG_WINDOW_BYTES)?;
        let mut windows = Vec::with_capacity(4);
        for (base, size) in [config.inst_buf, config.weight_buf, config.act_buf, config.staging] {
            windows.push((base, MappedRegion::map(&file, u64::from(base), size)?));
        }
        tracing::info!(
            "Opened NPU at {:#x} via {}",
            config.reg_base,
            config.mem_path.display()
        );
        Ok(Self {
            regs,
            windows,
            staging_len: config.staging.1,
        })
    }

    fn window_for(&self, addr: u32, len: usize) -> Result<(usize, usize)> {
        for (i, (base, region)) in self.windows.iter().enumerate() {
            if addr >= *base {
                let offset = (addr - base) as usize;
                if offset + len <= region.size() {
                    return Ok((i, offset));
                }
            }
        }
        Err(NpuError::invalid_param(format!(
            "device range {addr:#x}+{len:#x} is not mapped"
        )))
    }
}

impl RegisterBlock for MmioBus {
    fn read32(&self, offset: usize) -> u32 {
        self.regs.read32(offset)
    }

    fn write32(&mut self, offset: usize, value: u32) {
        self.regs.write32(offset, value);
    }
}

impl DeviceMemory for MmioBus {
    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let (i, offset) = self.window_for(addr, data.len())?;
        self.windows[i].1.copy_in(offset, data)
    }

    fn read_bytes(&self, addr: u32, out: &mut [u8]) -> Result<()> {
        let (i, offset) = self.window_for(addr, out.len())?;
        self.windows[i].1.copy_out(offset, out)
    }

    fn staging_addr(&self) -> u32 {
        self.windows.last().map_or(0, |(base, _)| *base)
    }

    fn staging_len(&self) -> usize {
        self.staging_len
    }
}

fn open_mem(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(rustix::fs::OFlags::SYNC.bits() as i32)
        .open(path)
        .map_err(|e| {
            NpuError::not_ready(format!(
                "cannot open {}: {e} (root or a UIO node required)",
                path.display()
            ))
        })
}
