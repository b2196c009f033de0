//! `npu` — command-line tool for EdgeNPU instruction streams and models.
//!
//! ```text
//! USAGE:
//!   npu encode <OPCODE> [--flags F] [--operand N]   Assemble one instruction word
//!   npu decode <WORD>...                            Disassemble raw words
//!   npu disasm <MODEL>                              List a model's instruction stream
//!   npu inspect <MODEL>                             Print a model's header
//!   npu compile <LAYER> -o <MODEL>                  Lower one layer into a model binary
//!   npu simulate <LAYER>                            Run one layer on the simulator
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use npu_chip::{encode, Instruction, Opcode};
use npu_compiler::{
    Activation, ConvParams, LayerCompiler, LayerDescriptor, LayerKind, PoolParams,
    TensorDescriptor,
};
use npu_driver::sim::{SimBus, SimClock};
use npu_driver::{ModelBuilder, ModelImage, Npu, RuntimeConfig};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "npu", about = "EdgeNPU instruction and model tool", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Assemble one instruction word.
    Encode {
        /// Mnemonic (e.g. CONV, DMA_LOAD_W) or opcode byte.
        opcode: String,
        /// Flag byte.
        #[arg(long, default_value = "0", value_parser = parse_u64)]
        flags: u64,
        /// 48-bit operand; higher bits are dropped.
        #[arg(long, default_value = "0", value_parser = parse_u64)]
        operand: u64,
    },
    /// Disassemble raw instruction words.
    Decode {
        /// Words, decimal or 0x-prefixed hex.
        #[arg(required = true, value_parser = parse_u64)]
        words: Vec<u64>,
    },
    /// List the instruction stream of a model binary.
    Disasm {
        /// Model binary.
        model: PathBuf,
    },
    /// Print the header of a model binary.
    Inspect {
        /// Model binary.
        model: PathBuf,
    },
    /// Lower one layer and write it as a model binary.
    Compile {
        #[command(flatten)]
        layer: LayerArgs,
        /// Raw weight payload to embed.
        #[arg(long)]
        weights: Option<PathBuf>,
        /// Output path.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Run one layer on the simulated device and print the counters.
    Simulate {
        #[command(flatten)]
        layer: LayerArgs,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Conv,
    Dwconv,
    Fc,
    Maxpool,
    Avgpool,
    Gap,
    Gmp,
}

#[derive(Args)]
struct LayerArgs {
    /// Layer kind.
    #[arg(long, value_enum, default_value = "conv")]
    kind: Kind,
    /// Input channels.
    #[arg(long, default_value_t = 16)]
    in_ch: u32,
    /// Output channels (ignored for pooling).
    #[arg(long, default_value_t = 16)]
    out_ch: u32,
    /// Input height.
    #[arg(long, default_value_t = 8)]
    height: u32,
    /// Input width.
    #[arg(long, default_value_t = 8)]
    width: u32,
    /// Square kernel size.
    #[arg(long, default_value_t = 3)]
    kernel: u8,
    /// Stride.
    #[arg(long, default_value_t = 1)]
    stride: u8,
    /// Symmetric padding.
    #[arg(long, default_value_t = 0)]
    pad: u8,
    /// Fuse ReLU.
    #[arg(long)]
    relu: bool,
}

impl LayerArgs {
    fn descriptor(&self) -> Result<LayerDescriptor> {
        if self.stride == 0 || self.kernel == 0 {
            bail!("kernel and stride must be non-zero");
        }
        let input = TensorDescriptor::new(0, self.in_ch, self.height, self.width);
        let out_addr = u32::try_from(input.byte_size()).context("input tensor too large")?;
        let (k, s, p) = (u32::from(self.kernel), u32::from(self.stride), u32::from(self.pad));
        let out_dim = |dim: u32, pad: u32| -> Result<u32> {
            let padded = dim + 2 * pad;
            if padded < k {
                bail!("kernel {k} larger than padded input {padded}");
            }
            Ok((padded - k) / s + 1)
        };

        let layer = match self.kind {
            Kind::Conv | Kind::Dwconv => {
                let out_ch = if matches!(self.kind, Kind::Dwconv) { self.in_ch } else { self.out_ch };
                let output = TensorDescriptor::new(
                    out_addr,
                    out_ch,
                    out_dim(self.height, p)?,
                    out_dim(self.width, p)?,
                );
                let conv = ConvParams::square(self.kernel)
                    .with_stride(self.stride)
                    .with_padding(self.pad);
                let weight = TensorDescriptor::new(0, out_ch, self.in_ch, k * k);
                if matches!(self.kind, Kind::Dwconv) {
                    LayerDescriptor::depthwise_conv2d(input, output, weight, conv)
                } else {
                    LayerDescriptor::conv2d(input, output, weight, conv)
                }
            }
            Kind::Fc => {
                let in_features = u32::try_from(input.elements()).context("input too large")?;
                LayerDescriptor::fully_connected(
                    input,
                    TensorDescriptor::new(out_addr, self.out_ch, 1, 1),
                    TensorDescriptor::new(0, self.out_ch, in_features, 1),
                )
            }
            Kind::Maxpool | Kind::Avgpool => {
                let kind = if matches!(self.kind, Kind::Maxpool) {
                    LayerKind::MaxPool
                } else {
                    LayerKind::AvgPool
                };
                let output = TensorDescriptor::new(
                    out_addr,
                    self.in_ch,
                    out_dim(self.height, 0)?,
                    out_dim(self.width, 0)?,
                );
                LayerDescriptor::pool(kind, input, output, PoolParams::square(self.kernel, self.stride))?
            }
            Kind::Gap | Kind::Gmp => {
                let kind = if matches!(self.kind, Kind::Gap) {
                    LayerKind::GlobalAvgPool
                } else {
                    LayerKind::GlobalMaxPool
                };
                let output = TensorDescriptor::new(out_addr, self.in_ch, 1, 1);
                LayerDescriptor::pool(kind, input, output, PoolParams::default())?
            }
        };
        Ok(if self.relu {
            layer.with_activation(Activation::Relu)
        } else {
            layer
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Encode { opcode, flags, operand } => cmd_encode(&opcode, flags, operand)?,
        Cmd::Decode { words } => cmd_decode(&words),
        Cmd::Disasm { model } => print!("{}", cmd_disasm(&model)?),
        Cmd::Inspect { model } => cmd_inspect(&model)?,
        Cmd::Compile { layer, weights, output } => {
            cmd_compile(&layer, weights.as_deref(), &output)?;
        }
        Cmd::Simulate { layer } => cmd_simulate(&layer)?,
    }

    Ok(())
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("'{s}': {e}"))
}

fn parse_opcode(s: &str) -> Result<Opcode> {
    if let Ok(raw) = parse_u64(s) {
        let byte = u8::try_from(raw).with_context(|| format!("opcode {raw:#x} exceeds one byte"))?;
        return Ok(Opcode::from_u8(byte));
    }
    (0..=u8::MAX)
        .map(Opcode::from_u8)
        .find(|op| !op.is_unrecognized() && op.mnemonic().eq_ignore_ascii_case(s))
        .with_context(|| format!("unknown mnemonic '{s}'"))
}

fn cmd_encode(opcode: &str, flags: u64, operand: u64) -> Result<()> {
    let opcode = parse_opcode(opcode)?;
    let flags = u8::try_from(flags).context("flags exceed one byte")?;
    let inst = encode(opcode, flags, operand);
    println!("{:#018x}  {inst}", inst.word());
    Ok(())
}

fn cmd_decode(words: &[u64]) {
    for &word in words {
        println!("{word:#018x}  {}", Instruction::from_word(word));
    }
}

fn read_model(path: &Path) -> Result<ModelImage> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    ModelImage::parse(bytes).with_context(|| format!("parsing {}", path.display()))
}

fn cmd_disasm(path: &Path) -> Result<String> {
    Ok(read_model(path)?.instructions.listing())
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let image = read_model(path)?;
    let h = &image.header;
    println!("Model        : {}", path.display());
    println!("Version      : {}.{}", h.version >> 8, h.version & 0xFF);
    println!("Layers       : {}", h.num_layers);
    println!("Instructions : {}", h.inst_count);
    println!("Weights      : {} bytes", h.weight_size);
    println!("Bias         : {} bytes", h.bias_size);
    println!("Input        : {} bytes", h.input_size);
    println!("Output       : {} bytes", h.output_size);
    println!("Workspace    : {} bytes", h.workspace_size);
    if h.checksum == 0 {
        println!("Checksum     : none");
    } else {
        println!("Checksum     : {:#010x} (verified)", h.checksum);
    }
    Ok(())
}

fn cmd_compile(args: &LayerArgs, weights: Option<&Path>, output: &Path) -> Result<()> {
    let layer = args.descriptor()?;
    let program = LayerCompiler::default()
        .compile_layer(&layer)
        .context("compiling layer")?;

    let mut builder = ModelBuilder::new().layer(&program).with_checksum().io_sizes(
        u32::try_from(layer.input.byte_size()).context("input too large")?,
        u32::try_from(layer.output.byte_size()).context("output too large")?,
    );
    if let Some(path) = weights {
        let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        builder = builder.weights(data);
    }
    let bytes = builder.build()?;
    std::fs::write(output, &bytes).with_context(|| format!("writing {}", output.display()))?;

    println!(
        "✅ {:?}: {} instructions, {} bytes -> {}",
        layer.kind,
        program.len(),
        bytes.len(),
        output.display()
    );
    Ok(())
}

fn cmd_simulate(args: &LayerArgs) -> Result<()> {
    let layer = args.descriptor()?;
    let mut npu = Npu::with_clock(SimBus::new(), SimClock::new());
    let info = npu.boot().context("booting simulator")?;
    npu.init(RuntimeConfig::from_profile(&info.profile))?;
    let perf = npu.compile_and_run(&layer).context("running layer")?;

    println!("Device: {info}");
    println!("Layer : {:?}", layer.kind);
    println!("{perf}");
    Ok(())
}
