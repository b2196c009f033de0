//! Layer descriptors
//!
//! One [`LayerDescriptor`] describes one network layer as the model loader
//! hands it over: kind, tensors, convolution/pooling parameters, fused
//! activation and output quantization. The compiler consumes it read-only.

use npu_chip::isa::flags;
use npu_chip::regs::{act_type, layer_type, pool_type};
use npu_chip::Opcode;

use crate::error::{CompileError, Result};
use crate::tensor::TensorDescriptor;

/// Binary elementwise operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EltwiseOp {
    /// a + b
    Add,
    /// a - b
    Sub,
    /// a * b
    Mul,
    /// max(a, b)
    Max,
    /// min(a, b)
    Min,
}

impl EltwiseOp {
    /// Instruction opcode
    #[must_use]
    pub const fn opcode(self) -> Opcode {
        match self {
            Self::Add => Opcode::Add,
            Self::Sub => Opcode::Sub,
            Self::Mul => Opcode::Mul,
            Self::Max => Opcode::Max,
            Self::Min => Opcode::Min,
        }
    }
}

/// Layer kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    /// 2D convolution
    Conv2d,
    /// Depthwise 2D convolution
    DepthwiseConv2d,
    /// Fully-connected
    FullyConnected,
    /// Max pooling
    MaxPool,
    /// Average pooling
    AvgPool,
    /// Global average pooling
    GlobalAvgPool,
    /// Global max pooling
    GlobalMaxPool,
    /// Binary elementwise
    Eltwise(EltwiseOp),
    /// Channel concatenation (no lowering)
    Concat,
    /// Softmax (no lowering)
    Softmax,
    /// Batch normalization (no lowering)
    BatchNorm,
    /// Reshape (no lowering)
    Reshape,
}

impl LayerKind {
    /// Value for the LAYER_TYPE register
    #[must_use]
    pub const fn type_code(self) -> u32 {
        match self {
            Self::Conv2d => layer_type::CONV,
            Self::DepthwiseConv2d => layer_type::DWCONV,
            Self::FullyConnected => layer_type::FC,
            Self::MaxPool | Self::AvgPool | Self::GlobalAvgPool | Self::GlobalMaxPool => {
                layer_type::POOL
            }
            Self::Softmax => layer_type::SOFTMAX,
            Self::Eltwise(_) | Self::Concat | Self::BatchNorm | Self::Reshape => {
                layer_type::ELTWISE
            }
        }
    }

    /// Value for the POOL_TYPE register
    #[must_use]
    pub const fn pool_code(self) -> u32 {
        match self {
            Self::MaxPool | Self::GlobalMaxPool => pool_type::MAX,
            Self::AvgPool => pool_type::AVG,
            Self::GlobalAvgPool => pool_type::GLOBAL_AVG,
            _ => pool_type::NONE,
        }
    }

    /// Pooling opcode, for pooling kinds
    #[must_use]
    pub const fn pool_opcode(self) -> Option<Opcode> {
        match self {
            Self::MaxPool => Some(Opcode::MaxPool),
            Self::AvgPool => Some(Opcode::AvgPool),
            Self::GlobalAvgPool => Some(Opcode::GlobalAvgPool),
            Self::GlobalMaxPool => Some(Opcode::GlobalMaxPool),
            _ => None,
        }
    }

    /// True for pooling kinds
    #[must_use]
    pub const fn is_pool(self) -> bool {
        self.pool_opcode().is_some()
    }
}

/// Fused activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Activation {
    /// Identity
    #[default]
    None,
    /// ReLU
    Relu,
    /// ReLU clipped at 6
    Relu6,
    /// Sigmoid
    Sigmoid,
    /// Tanh
    Tanh,
    /// Leaky ReLU
    LeakyRelu,
    /// Swish
    Swish,
    /// GELU
    Gelu,
}

impl Activation {
    /// Value for the ACT_TYPE register
    #[must_use]
    pub const fn type_code(self) -> u32 {
        match self {
            Self::None => act_type::NONE,
            Self::Relu => act_type::RELU,
            Self::Relu6 => act_type::RELU6,
            Self::Sigmoid => act_type::SIGMOID,
            Self::Tanh => act_type::TANH,
            Self::LeakyRelu => act_type::LEAKY_RELU,
            Self::Swish => act_type::SWISH,
            Self::Gelu => act_type::GELU,
        }
    }

    /// Instruction flags that fuse this activation.
    ///
    /// Only the ReLU family can be fused; the clip of ReLU6 comes from the
    /// ACT_TYPE register.
    #[must_use]
    pub const fn fusion_flags(self) -> u8 {
        match self {
            Self::Relu | Self::Relu6 => flags::RELU,
            _ => 0,
        }
    }
}

/// Convolution parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvParams {
    /// Kernel height
    pub kernel_h: u8,
    /// Kernel width
    pub kernel_w: u8,
    /// Vertical stride
    pub stride_h: u8,
    /// Horizontal stride
    pub stride_w: u8,
    /// Top padding
    pub pad_top: u8,
    /// Bottom padding
    pub pad_bottom: u8,
    /// Left padding
    pub pad_left: u8,
    /// Right padding
    pub pad_right: u8,
    /// Vertical dilation
    pub dilation_h: u8,
    /// Horizontal dilation
    pub dilation_w: u8,
    /// Channel groups
    pub groups: u8,
}

impl ConvParams {
    /// `k×k` kernel, stride 1, no padding
    #[must_use]
    pub const fn square(k: u8) -> Self {
        Self {
            kernel_h: k,
            kernel_w: k,
            stride_h: 1,
            stride_w: 1,
            pad_top: 0,
            pad_bottom: 0,
            pad_left: 0,
            pad_right: 0,
            dilation_h: 1,
            dilation_w: 1,
            groups: 1,
        }
    }

    /// Same stride on both axes
    #[must_use]
    pub const fn with_stride(mut self, stride: u8) -> Self {
        self.stride_h = stride;
        self.stride_w = stride;
        self
    }

    /// Same padding on every side
    #[must_use]
    pub const fn with_padding(mut self, pad: u8) -> Self {
        self.pad_top = pad;
        self.pad_bottom = pad;
        self.pad_left = pad;
        self.pad_right = pad;
        self
    }

    /// KERNEL register word
    #[must_use]
    pub const fn kernel_word(&self) -> u32 {
        ((self.kernel_h as u32) << 8) | self.kernel_w as u32
    }

    /// STRIDE register word
    #[must_use]
    pub const fn stride_word(&self) -> u32 {
        ((self.stride_h as u32) << 8) | self.stride_w as u32
    }

    /// PADDING register word
    #[must_use]
    pub const fn padding_word(&self) -> u32 {
        ((self.pad_top as u32) << 24)
            | ((self.pad_bottom as u32) << 16)
            | ((self.pad_left as u32) << 8)
            | self.pad_right as u32
    }

    /// Weight elements per output channel for `in_ch` input channels
    #[must_use]
    pub const fn weights_per_output(&self, in_ch: u32) -> u64 {
        in_ch as u64 * self.kernel_h as u64 * self.kernel_w as u64
    }
}

impl Default for ConvParams {
    fn default() -> Self {
        Self::square(1)
    }
}

/// Pooling parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolParams {
    /// Window height
    pub kernel_h: u8,
    /// Window width
    pub kernel_w: u8,
    /// Vertical stride
    pub stride_h: u8,
    /// Horizontal stride
    pub stride_w: u8,
}

impl PoolParams {
    /// `k×k` window with stride `s`
    #[must_use]
    pub const fn square(k: u8, s: u8) -> Self {
        Self {
            kernel_h: k,
            kernel_w: k,
            stride_h: s,
            stride_w: s,
        }
    }
}

/// Rounding applied when requantizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundMode {
    /// Round half away from zero
    #[default]
    Nearest,
    /// Round toward negative infinity
    Floor,
    /// Round toward zero
    Truncate,
}

/// Output quantization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputQuant {
    /// Output scale (fixed point)
    pub scale: i32,
    /// Output zero point
    pub zero_point: i8,
    /// Weight zero point
    pub weight_zero_point: i8,
    /// Right shift after accumulation
    pub shift: u8,
    /// Rounding mode
    pub round: RoundMode,
}

/// One layer, as handed to the compiler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    /// Layer kind
    pub kind: LayerKind,
    /// Fused activation
    pub activation: Activation,
    /// Input tensor
    pub input: TensorDescriptor,
    /// Second input, for binary elementwise layers
    pub input2: Option<TensorDescriptor>,
    /// Output tensor
    pub output: TensorDescriptor,
    /// Weight tensor
    pub weight: TensorDescriptor,
    /// Bias tensor
    pub bias: TensorDescriptor,
    /// Convolution parameters
    pub conv: ConvParams,
    /// Pooling parameters
    pub pool: PoolParams,
    /// Output quantization
    pub quant: OutputQuant,
}

impl LayerDescriptor {
    fn base(kind: LayerKind, input: TensorDescriptor, output: TensorDescriptor) -> Self {
        Self {
            kind,
            activation: Activation::None,
            input,
            input2: None,
            output,
            weight: TensorDescriptor::default(),
            bias: TensorDescriptor::default(),
            conv: ConvParams::default(),
            pool: PoolParams::default(),
            quant: OutputQuant::default(),
        }
    }

    /// 2D convolution
    #[must_use]
    pub fn conv2d(
        input: TensorDescriptor,
        output: TensorDescriptor,
        weight: TensorDescriptor,
        conv: ConvParams,
    ) -> Self {
        Self {
            weight,
            conv,
            ..Self::base(LayerKind::Conv2d, input, output)
        }
    }

    /// Depthwise 2D convolution
    #[must_use]
    pub fn depthwise_conv2d(
        input: TensorDescriptor,
        output: TensorDescriptor,
        weight: TensorDescriptor,
        conv: ConvParams,
    ) -> Self {
        Self {
            kind: LayerKind::DepthwiseConv2d,
            ..Self::conv2d(input, output, weight, conv)
        }
    }

    /// Fully-connected
    #[must_use]
    pub fn fully_connected(
        input: TensorDescriptor,
        output: TensorDescriptor,
        weight: TensorDescriptor,
    ) -> Self {
        Self {
            weight,
            ..Self::base(LayerKind::FullyConnected, input, output)
        }
    }

    /// Pooling of any pooling kind
    ///
    /// # Errors
    ///
    /// Returns error if `kind` is not a pooling kind.
    pub fn pool(
        kind: LayerKind,
        input: TensorDescriptor,
        output: TensorDescriptor,
        pool: PoolParams,
    ) -> Result<Self> {
        if !kind.is_pool() {
            return Err(CompileError::invalid_layer(format!("{kind:?} is not a pooling kind")));
        }
        Ok(Self {
            pool,
            ..Self::base(kind, input, output)
        })
    }

    /// Binary elementwise
    #[must_use]
    pub fn eltwise(
        op: EltwiseOp,
        a: TensorDescriptor,
        b: TensorDescriptor,
        output: TensorDescriptor,
    ) -> Self {
        Self {
            input2: Some(b),
            ..Self::base(LayerKind::Eltwise(op), a, output)
        }
    }

    /// Set the fused activation
    #[must_use]
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Set the bias tensor
    #[must_use]
    pub fn with_bias(mut self, bias: TensorDescriptor) -> Self {
        self.bias = bias;
        self
    }

    /// Set output quantization
    #[must_use]
    pub fn with_quant(mut self, quant: OutputQuant) -> Self {
        self.quant = quant;
        self
    }

    /// Check the descriptor is self-consistent for its kind.
    ///
    /// # Errors
    ///
    /// Returns error on zero-sized tensors, zero kernels or strides, a
    /// missing second elementwise input, or mismatched elementwise sizes.
    pub fn validate(&self) -> Result<()> {
        if self.input.elements() == 0 {
            return Err(CompileError::invalid_layer("input tensor is empty"));
        }
        if self.output.elements() == 0 {
            return Err(CompileError::invalid_layer("output tensor is empty"));
        }
        match self.kind {
            LayerKind::Conv2d | LayerKind::DepthwiseConv2d => {
                let c = &self.conv;
                if c.kernel_h == 0 || c.kernel_w == 0 {
                    return Err(CompileError::invalid_layer("kernel size must be non-zero"));
                }
                if c.stride_h == 0 || c.stride_w == 0 {
                    return Err(CompileError::invalid_layer("stride must be non-zero"));
                }
            }
            LayerKind::MaxPool | LayerKind::AvgPool => {
                let p = &self.pool;
                if p.kernel_h == 0 || p.kernel_w == 0 || p.stride_h == 0 || p.stride_w == 0 {
                    return Err(CompileError::invalid_layer(
                        "pool window and stride must be non-zero",
                    ));
                }
            }
            LayerKind::Eltwise(_) => {
                let Some(b) = self.input2 else {
                    return Err(CompileError::invalid_layer(
                        "elementwise layer needs a second input",
                    ));
                };
                if b.byte_size() != self.input.byte_size() {
                    return Err(CompileError::invalid_layer(format!(
                        "elementwise inputs differ in size: {} vs {} bytes",
                        self.input.byte_size(),
                        b.byte_size()
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}
