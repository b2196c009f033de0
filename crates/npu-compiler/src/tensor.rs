//! Tensor descriptors
//!
//! A descriptor names where a tensor lives and how it is laid out. It never
//! owns the data.

use std::fmt;

/// Element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    /// 8-bit signed integer
    #[default]
    Int8,
    /// 16-bit signed integer
    Int16,
    /// IEEE half precision
    Fp16,
    /// IEEE single precision
    Fp32,
}

impl DType {
    /// Bytes per element
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Int8 => 1,
            Self::Int16 | Self::Fp16 => 2,
            Self::Fp32 => 4,
        }
    }
}

/// Memory layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Layout {
    /// Batch, channel, height, width
    #[default]
    Nchw,
    /// Batch, height, width, channel
    Nhwc,
}

/// Location, shape and quantization of one tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TensorDescriptor {
    /// Device address of element 0
    pub addr: u32,
    /// Batch
    pub n: u32,
    /// Channels
    pub c: u32,
    /// Height
    pub h: u32,
    /// Width
    pub w: u32,
    /// Element type
    pub dtype: DType,
    /// Memory layout
    pub layout: Layout,
    /// Quantization scale (fixed point)
    pub scale: i32,
    /// Quantization zero point
    pub zero_point: i8,
}

impl TensorDescriptor {
    /// Int8 NCHW tensor at `addr` with batch 1.
    #[must_use]
    pub const fn new(addr: u32, c: u32, h: u32, w: u32) -> Self {
        Self {
            addr,
            n: 1,
            c,
            h,
            w,
            dtype: DType::Int8,
            layout: Layout::Nchw,
            scale: 0,
            zero_point: 0,
        }
    }

    /// Set element type
    #[must_use]
    pub const fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Set layout
    #[must_use]
    pub const fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Set quantization parameters
    #[must_use]
    pub const fn with_quant(mut self, scale: i32, zero_point: i8) -> Self {
        self.scale = scale;
        self.zero_point = zero_point;
        self
    }

    /// Element count
    #[must_use]
    pub const fn elements(&self) -> u64 {
        self.n as u64 * self.c as u64 * self.h as u64 * self.w as u64
    }

    /// Size in bytes, always derived from shape and element type
    #[must_use]
    pub const fn byte_size(&self) -> u64 {
        self.elements() * self.dtype.size() as u64
    }

    /// Elements in one channel plane
    #[must_use]
    pub const fn plane(&self) -> u64 {
        self.h as u64 * self.w as u64
    }
}

impl fmt::Display for TensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}] {:?} {:?} @ {:#010x}",
            self.n, self.c, self.h, self.w, self.dtype, self.layout, self.addr
        )
    }
}
