// SPDX-License-Identifier: AGPL-3.0-only

//! Execution state machine
//!
//! [`Npu`] owns one register bus, one clock and the single
//! [`ExecutionContext`] of a device. Every operation that touches the device
//! goes through it.
//!
//! ```text
//! Reset ─init─► Init ─► Idle ─load─► Loading ─start─► Running ─wait/irq─► Done
//!                        ▲                               │                 │
//!                        │                               └──fault──► Error │
//!                        └────────────── reset / abort ◄──────────────────┘
//! ```
//!
//! Completion is observed either by polling ([`Npu::wait`]) or from an
//! interrupt ([`Npu::handle_irq`]). Use one or the other for a given run:
//! both consume the same status bits.

use crate::clock::{poll, Clock, SystemClock};
use crate::dma::{DmaChannel, DmaCoordinator, DmaDescriptor};
use crate::error::{NpuError, Result};
use crate::mmio::NpuBus;
use crate::perf::PerfStats;
use crate::registers::Registers;
use npu_chip::regs::{ctrl, irq, perf_ctrl, status};
use npu_chip::{hw, HardwareProfile, Instruction, Opcode, Reg};
use std::fmt;
use tracing::{debug, info, warn};

/// Weight loads up to this size are copied directly, larger ones use DMA
pub const DIRECT_WEIGHT_LIMIT: usize = 1024;
/// Timeout for load and drain DMA transfers
pub const TRANSFER_TIMEOUT_US: u64 = 1_000_000;
/// Timeout for the core to go idle after ABORT or RESET
pub const IDLE_TIMEOUT_US: u64 = 10_000;
/// Reset pulse width
pub const RESET_PULSE_US: u64 = 10;

/// Execution state. Discriminants match the STATUS state field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum NpuState {
    /// Not initialized
    #[default]
    Reset = 0,
    /// Initialization in progress
    Init = 1,
    /// Ready for loads
    Idle = 2,
    /// Buffers partially loaded
    Loading = 3,
    /// Program executing
    Running = 4,
    /// Output being read back
    Draining = 5,
    /// Program completed
    Done = 6,
    /// Hardware fault; reset or abort required
    Error = 7,
}

impl NpuState {
    /// Decode a STATUS state field
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Reset,
            1 => Self::Init,
            2 => Self::Idle,
            3 => Self::Loading,
            4 => Self::Running,
            5 => Self::Draining,
            6 => Self::Done,
            7 => Self::Error,
            _ => return None,
        })
    }

    /// Numeric code
    pub const fn code(self) -> u8 {
        self as u8
    }

    const fn is_initialized(self) -> bool {
        !matches!(self, Self::Reset | Self::Init)
    }
}

impl fmt::Display for NpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reset => "reset",
            Self::Init => "init",
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Buffer placement and runtime options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Instruction buffer address
    pub inst_buf_addr: u32,
    /// Instruction buffer capacity in entries
    pub inst_buf_entries: u32,
    /// Weight buffer address
    pub weight_buf_addr: u32,
    /// Weight buffer size in bytes
    pub weight_buf_size: u32,
    /// Activation buffer address; the upper half holds outputs
    pub act_buf_addr: u32,
    /// Activation buffer size in bytes
    pub act_buf_size: u32,
    /// Enable DONE / ERROR / DMA_DONE interrupts
    pub enable_irq: bool,
    /// Enable the performance counters
    pub enable_perf: bool,
    /// Status poll interval
    pub poll_interval_us: u64,
    /// Timeout used by `compile_and_run`; 0 waits forever
    pub run_timeout_us: u64,
}

impl RuntimeConfig {
    /// Buffers of `profile` at the reference physical addresses
    pub const fn from_profile(profile: &HardwareProfile) -> Self {
        Self {
            inst_buf_addr: hw::INST_BUF_BASE,
            inst_buf_entries: profile.inst_entries,
            weight_buf_addr: hw::WEIGHT_BUF_BASE,
            weight_buf_size: profile.weight_buf_bytes,
            act_buf_addr: hw::ACT_BUF_BASE,
            act_buf_size: profile.act_buf_bytes,
            enable_irq: false,
            enable_perf: true,
            poll_interval_us: 10,
            run_timeout_us: 1_000_000,
        }
    }

    /// Enable interrupts
    #[must_use]
    pub const fn with_irq(mut self) -> Self {
        self.enable_irq = true;
        self
    }

    /// Activation output base: the upper half of the activation buffer
    pub const fn act_out_addr(&self) -> u32 {
        self.act_buf_addr + self.act_buf_size / 2
    }

    fn validate(&self) -> Result<()> {
        if self.inst_buf_entries == 0 || self.weight_buf_size == 0 || self.act_buf_size < 2 {
            return Err(NpuError::invalid_param("buffer sizes must be non-zero"));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_profile(&HardwareProfile::REFERENCE)
    }
}

/// Software view of one device's execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Current state
    pub state: NpuState,
    /// Status code of the last failure, see [`NpuError::status_code`]
    pub last_error: Option<i32>,
    /// Instruction pointer at the last completion
    pub inst_ptr: u32,
    /// Instructions loaded
    pub inst_count: u32,
    /// Iteration count of the program's hardware loop
    pub loop_count: u32,
    /// First instruction of the program's hardware loop
    pub loop_start: u32,
    /// Layer being executed
    pub current_layer: u32,
    /// Layers in the loaded model
    pub total_layers: u32,
    /// Counters at the last completion
    pub perf: PerfStats,
}

/// Completion notifications from the interrupt path.
///
/// Called from [`Npu::handle_irq`], possibly in interrupt context: must not block.
pub trait CompletionHandler: Send {
    /// Program finished
    fn on_done(&mut self, perf: &PerfStats);

    /// Program faulted
    fn on_error(&mut self, error: &NpuError);
}

/// One NPU: bus, clock and execution context
pub struct Npu<B, C = SystemClock> {
    pub(crate) bus: B,
    pub(crate) clock: C,
    pub(crate) config: RuntimeConfig,
    pub(crate) ctx: ExecutionContext,
    pub(crate) dma: DmaCoordinator,
    handler: Option<Box<dyn CompletionHandler>>,
}

impl<B: fmt::Debug, C: fmt::Debug> fmt::Debug for Npu<B, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Npu")
            .field("bus", &self.bus)
            .field("clock", &self.clock)
            .field("config", &self.config)
            .field("ctx", &self.ctx)
            .field("handler", &self.handler.is_some())
            .finish_non_exhaustive()
    }
}

impl<B: NpuBus> Npu<B> {
    /// Wrap `bus` with the system clock
    pub fn new(bus: B) -> Self {
        Self::with_clock(bus, SystemClock::new())
    }
}

impl<B: NpuBus, C: Clock> Npu<B, C> {
    /// Wrap `bus` with an explicit clock
    pub fn with_clock(bus: B, clock: C) -> Self {
        let config = RuntimeConfig::default();
        Self {
            dma: DmaCoordinator::new(config.poll_interval_us),
            bus,
            clock,
            config,
            ctx: ExecutionContext::default(),
            handler: None,
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    /// Current state
    pub fn state(&self) -> NpuState {
        self.ctx.state
    }

    /// Execution context
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Active configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Underlying bus
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Underlying bus, mutably
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Clock
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Install the interrupt-path completion handler
    pub fn set_handler(&mut self, handler: Box<dyn CompletionHandler>) {
        self.handler = Some(handler);
    }

    /// Remove the completion handler
    pub fn take_handler(&mut self) -> Option<Box<dyn CompletionHandler>> {
        self.handler.take()
    }

    fn set_state(&mut self, state: NpuState) {
        if self.ctx.state != state {
            debug!("state {} -> {state}", self.ctx.state);
            self.ctx.state = state;
        }
    }

    pub(crate) fn fail(&mut self, error: NpuError) -> NpuError {
        self.ctx.last_error = Some(error.status_code());
        error
    }

    /// Forget a partially loaded program so nothing appears loaded.
    pub(crate) fn discard_program(&mut self) {
        self.bus.write(Reg::InstSize, 0);
        self.bus.write(Reg::WeightSize, 0);
        self.ctx.inst_count = 0;
        self.ctx.inst_ptr = 0;
        self.ctx.loop_start = 0;
        self.ctx.loop_count = 0;
        self.ctx.total_layers = 0;
        self.set_state(NpuState::Idle);
    }

    pub(crate) fn ensure_initialized(&self) -> Result<()> {
        if self.ctx.state.is_initialized() {
            Ok(())
        } else {
            Err(NpuError::NotInitialized)
        }
    }

    /// Loads are accepted in Idle, Loading and Done.
    pub(crate) fn ensure_loadable(&self, operation: &str) -> Result<()> {
        match self.ctx.state {
            NpuState::Reset | NpuState::Init => Err(NpuError::NotInitialized),
            NpuState::Running | NpuState::Draining => Err(NpuError::busy(operation)),
            NpuState::Error => Err(NpuError::invalid_state("error, reset or abort required")),
            NpuState::Idle | NpuState::Loading | NpuState::Done => Ok(()),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Program buffer bases, interrupts and counters, then go Idle.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::Busy`] while a program is running and
    /// [`NpuError::InvalidParam`] for zero-sized buffers; neither touches a register.
    pub fn init(&mut self, config: RuntimeConfig) -> Result<()> {
        if matches!(self.ctx.state, NpuState::Running | NpuState::Draining) {
            return Err(NpuError::busy("init"));
        }
        config.validate()?;
        self.ctx = ExecutionContext::default();
        self.set_state(NpuState::Init);
        self.dma = DmaCoordinator::new(config.poll_interval_us);
        self.config = config;

        self.program_buffers();
        if self.config.enable_perf {
            self.bus.write(Reg::PerfCtrl, perf_ctrl::ENABLE | perf_ctrl::RESET);
        }

        self.set_state(NpuState::Idle);
        info!(
            "NPU initialized (irq={}, perf={})",
            self.config.enable_irq, self.config.enable_perf
        );
        Ok(())
    }

    fn program_buffers(&mut self) {
        self.bus.write(Reg::InstBase, self.config.inst_buf_addr);
        self.bus.write(Reg::WeightBase, self.config.weight_buf_addr);
        self.bus.write(Reg::ActInBase, self.config.act_buf_addr);
        self.bus.write(Reg::ActOutBase, self.config.act_out_addr());
        let irq_mask = if self.config.enable_irq {
            irq::DONE | irq::ERROR | irq::DMA_DONE
        } else {
            0
        };
        self.bus.write(Reg::IrqEn, irq_mask);
    }

    /// Stop execution, disable interrupts and forget the context.
    pub fn deinit(&mut self) {
        if !self.ctx.state.is_initialized() {
            return;
        }
        if let Err(e) = self.stop() {
            warn!("stop during deinit failed: {e}");
        }
        self.bus.write(Reg::IrqEn, 0);
        self.ctx = ExecutionContext::default();
        self.dma.reset_count();
        info!("NPU deinitialized");
    }

    // ── Loading ───────────────────────────────────────────────────────────────

    /// Copy `insts` to the instruction buffer.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::InvalidParam`] for an empty program and
    /// [`NpuError::Overflow`] if it exceeds the buffer; neither touches a register.
    pub fn load_instructions(&mut self, insts: &[Instruction]) -> Result<()> {
        self.ensure_loadable("load instructions")?;
        if insts.is_empty() {
            return Err(NpuError::invalid_param("instruction count is 0"));
        }
        let capacity = self.config.inst_buf_entries as usize;
        if insts.len() > capacity {
            return Err(self.fail(NpuError::Overflow {
                what: "instruction buffer",
                requested: (insts.len() * hw::INST_BYTES) as u64,
                capacity: (capacity * hw::INST_BYTES) as u64,
            }));
        }
        let count = u32::try_from(insts.len())
            .map_err(|_| NpuError::invalid_param("instruction count exceeds u32"))?;

        let bytes: Vec<u8> = insts.iter().flat_map(|i| i.word().to_le_bytes()).collect();
        self.bus.write_bytes(self.config.inst_buf_addr, &bytes)?;
        self.bus.write(Reg::InstSize, count);
        self.bus.write(Reg::InstPtr, 0);

        self.ctx.inst_count = count;
        self.ctx.inst_ptr = 0;
        let (loop_start, loop_count) = find_loop(insts);
        self.ctx.loop_start = loop_start;
        self.ctx.loop_count = loop_count;
        self.set_state(NpuState::Loading);
        debug!("loaded {count} instructions");
        Ok(())
    }

    /// Copy `data` into the weight buffer at `offset`.
    ///
    /// Small loads are copied directly; larger ones are staged and moved by
    /// DMA on the weight channel.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::Overflow`] if `offset + data.len()` exceeds the
    /// weight buffer, or the DMA error of a large load.
    pub fn load_weights(&mut self, data: &[u8], offset: u32) -> Result<()> {
        self.ensure_loadable("load weights")?;
        if data.is_empty() {
            return Err(NpuError::invalid_param("weight data is empty"));
        }
        let end = u64::from(offset) + data.len() as u64;
        if end > u64::from(self.config.weight_buf_size) {
            return Err(self.fail(NpuError::Overflow {
                what: "weight buffer",
                requested: end,
                capacity: u64::from(self.config.weight_buf_size),
            }));
        }
        let dst = self.config.weight_buf_addr + offset;
        let len = len_u32(data.len())?;

        if data.len() > DIRECT_WEIGHT_LIMIT {
            let src = self.bus.stage(data)?;
            let desc = DmaDescriptor::linear(DmaChannel::Weight, src, dst, len);
            self.transfer(&desc)?;
        } else {
            self.bus.write_bytes(dst, data)?;
        }
        #[allow(clippy::cast_possible_truncation)]
        self.bus.write(Reg::WeightSize, end as u32);

        self.set_state(NpuState::Loading);
        debug!("loaded {} weight bytes at offset {offset:#x}", data.len());
        Ok(())
    }

    /// DMA `data` into the activation input buffer.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::Overflow`] if `data` exceeds half the activation
    /// buffer, or the DMA error.
    pub fn load_input(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_loadable("load input")?;
        if data.is_empty() {
            return Err(NpuError::invalid_param("input data is empty"));
        }
        let capacity = self.config.act_buf_size / 2;
        if data.len() as u64 > u64::from(capacity) {
            return Err(self.fail(NpuError::Overflow {
                what: "activation input",
                requested: data.len() as u64,
                capacity: u64::from(capacity),
            }));
        }
        let len = len_u32(data.len())?;
        let src = self.bus.stage(data)?;
        let desc = DmaDescriptor::linear(DmaChannel::ActIn, src, self.config.act_buf_addr, len);
        self.transfer(&desc)?;
        self.bus.write(Reg::ActInSize, len);

        self.set_state(NpuState::Loading);
        debug!("loaded {len} input bytes");
        Ok(())
    }

    fn transfer(&mut self, desc: &DmaDescriptor) -> Result<()> {
        self.dma
            .start(&mut self.bus, &mut self.clock, desc)
            .map_err(|e| self.fail(e))?;
        self.dma
            .wait(&self.bus, &mut self.clock, TRANSFER_TIMEOUT_US)
            .map_err(|e| self.fail(e))
    }

    /// Start, wait for and verify one DMA transfer
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotInitialized`] before `init`, otherwise the
    /// coordinator's error.
    pub fn dma_transfer(&mut self, desc: &DmaDescriptor, timeout_us: u64) -> Result<()> {
        self.ensure_initialized()?;
        self.dma.start(&mut self.bus, &mut self.clock, desc)?;
        self.dma.wait(&self.bus, &mut self.clock, timeout_us)
    }

    // ── Execution ─────────────────────────────────────────────────────────────

    /// Start executing from instruction 0.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::Busy`] while running; nothing is written in that case.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_loadable("start")?;
        self.bus.write(Reg::InstPtr, 0);
        self.ctx.inst_ptr = 0;
        self.ctx.current_layer = 0;
        self.bus.write(Reg::IrqStatus, irq::CLEAR_ALL);
        self.set_state(NpuState::Running);
        self.bus.set_bits(Reg::Ctrl, ctrl::START);
        Ok(())
    }

    /// Poll until the program completes. `timeout_us == 0` waits forever.
    ///
    /// # Errors
    ///
    /// [`NpuError::HwFault`] moves the context to Error. [`NpuError::Timeout`]
    /// leaves the state untouched.
    pub fn wait(&mut self, timeout_us: u64) -> Result<()> {
        self.ensure_initialized()?;
        let interval = self.config.poll_interval_us.max(1);
        let bus = &self.bus;
        let result = poll(&mut self.clock, interval, timeout_us, || {
            let st = bus.read(Reg::Status);
            if st & status::ERROR != 0 {
                Some(Err(NpuError::HwFault {
                    code: bus.read(Reg::ErrorCode),
                }))
            } else if st & (status::DONE | status::IDLE) != 0 {
                Some(Ok(()))
            } else {
                None
            }
        });

        match result {
            Ok(()) => {
                self.complete();
                Ok(())
            }
            Err(e @ NpuError::HwFault { .. }) => {
                warn!("NPU fault: {e}");
                self.set_state(NpuState::Error);
                Err(self.fail(e))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn complete(&mut self) {
        self.ctx.inst_ptr = self.bus.read(Reg::InstPtr);
        self.refresh_perf();
        self.set_state(NpuState::Done);
    }

    /// True if STATUS reports DONE
    pub fn is_done(&self) -> bool {
        self.ctx.state.is_initialized() && self.bus.test_bits(Reg::Status, status::DONE)
    }

    /// Abort the running program without resetting the core.
    ///
    /// The state becomes Idle even if the core does not report idle in time.
    ///
    /// # Errors
    ///
    /// Returns the error of the idle wait.
    pub fn stop(&mut self) -> Result<()> {
        self.ensure_initialized()?;
        self.bus.set_bits(Reg::Ctrl, ctrl::ABORT);
        let result = self.wait_idle(IDLE_TIMEOUT_US);
        self.bus.clear_bits(Reg::Ctrl, ctrl::ABORT);
        self.set_state(NpuState::Idle);
        result
    }

    /// Reset the core, discarding any in-flight execution.
    ///
    /// # Errors
    ///
    /// If the core faults or never goes idle the state becomes Error.
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_initialized()?;
        warn!("aborting NPU execution");
        self.bus.set_bits(Reg::Ctrl, ctrl::RESET);
        self.clock.delay_us(RESET_PULSE_US);
        self.bus.clear_bits(Reg::Ctrl, ctrl::RESET);
        self.clock.delay_us(RESET_PULSE_US);

        if let Err(e) = self.wait_idle(IDLE_TIMEOUT_US) {
            self.set_state(NpuState::Error);
            return Err(self.fail(e));
        }
        self.bus.set_bits(Reg::Ctrl, ctrl::ENABLE);
        self.set_state(NpuState::Idle);
        Ok(())
    }

    /// Reset the core and counters and go Idle. Valid in any state.
    pub fn reset(&mut self) {
        self.bus.set_bits(Reg::Ctrl, ctrl::RESET);
        self.clock.delay_us(RESET_PULSE_US);
        self.bus.write(Reg::Ctrl, ctrl::ENABLE);
        self.bus.write(Reg::IrqStatus, irq::CLEAR_ALL);
        self.program_buffers();
        self.reset_perf();
        self.ctx.last_error = None;
        self.set_state(NpuState::Idle);
        info!("NPU reset");
    }

    pub(crate) fn wait_idle(&mut self, timeout_us: u64) -> Result<()> {
        let interval = self.config.poll_interval_us.max(1);
        let bus = &self.bus;
        poll(&mut self.clock, interval, timeout_us, || {
            let st = bus.read(Reg::Status);
            if st & status::IDLE != 0 {
                Some(Ok(()))
            } else if st & status::ERROR != 0 {
                Some(Err(NpuError::HwFault {
                    code: bus.read(Reg::ErrorCode),
                }))
            } else {
                None
            }
        })
    }

    // ── Interrupts ────────────────────────────────────────────────────────────

    /// Service an NPU interrupt.
    ///
    /// Reads and clears IRQ_STATUS, updates the context and calls the
    /// completion handler at most once per event kind. Returns the bits seen.
    pub fn handle_irq(&mut self) -> u32 {
        let pending = self.bus.read(Reg::IrqStatus);
        if pending == 0 {
            return 0;
        }
        self.bus.write(Reg::IrqStatus, pending);

        if pending & irq::DONE != 0 {
            self.complete();
            if let Some(handler) = self.handler.as_mut() {
                handler.on_done(&self.ctx.perf);
            }
        }
        if pending & irq::ERROR != 0 {
            let error = NpuError::HwFault {
                code: self.bus.read(Reg::ErrorCode),
            };
            self.set_state(NpuState::Error);
            self.ctx.last_error = Some(error.status_code());
            if let Some(handler) = self.handler.as_mut() {
                handler.on_error(&error);
            }
        }
        pending
    }

    // ── Output ────────────────────────────────────────────────────────────────

    /// Bytes of output the last run produced
    pub fn output_size(&self) -> u32 {
        self.bus.read(Reg::ActOutSize)
    }

    /// Copy up to `out.len()` bytes of output via the activation-out channel.
    ///
    /// Returns the number of bytes copied, at most ACT_OUT_SIZE.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::Busy`] while running, or the DMA error.
    pub fn read_output(&mut self, out: &mut [u8]) -> Result<usize> {
        self.ensure_initialized()?;
        if out.is_empty() {
            return Err(NpuError::invalid_param("output buffer is empty"));
        }
        if matches!(self.ctx.state, NpuState::Running | NpuState::Draining) {
            return Err(NpuError::busy("read output"));
        }
        let available = self.output_size() as usize;
        let size = out.len().min(available).min(self.bus.staging_len());
        if size == 0 {
            return Ok(0);
        }

        let previous = self.ctx.state;
        self.set_state(NpuState::Draining);
        let src = self.bus.read(Reg::ActOutBase);
        let desc = DmaDescriptor::linear(DmaChannel::ActOut, src, self.bus.staging_addr(), len_u32(size)?);
        let result = self
            .transfer(&desc)
            .and_then(|()| self.bus.read_bytes(self.bus.staging_addr(), &mut out[..size]));
        match result {
            Ok(()) => {
                self.set_state(NpuState::Done);
                Ok(size)
            }
            Err(e) => {
                self.set_state(previous);
                Err(e)
            }
        }
    }

    // ── Performance ───────────────────────────────────────────────────────────

    /// Refresh and return the counters
    pub fn perf(&mut self) -> PerfStats {
        self.refresh_perf();
        self.ctx.perf
    }

    /// Zero the hardware counters and the snapshot
    pub fn reset_perf(&mut self) {
        PerfStats::reset_counters(&mut self.bus, &mut self.clock);
        self.ctx.perf = PerfStats::default();
        self.dma.reset_count();
    }

    pub(crate) fn refresh_perf(&mut self) {
        self.ctx.perf = PerfStats {
            layers_executed: self.ctx.perf.layers_executed,
            dma_transfers: self.dma.transfers(),
            ..PerfStats::read(&self.bus)
        };
    }
}

/// First `LOOP_START` in the program: (body start index, iteration count)
fn find_loop(insts: &[Instruction]) -> (u32, u32) {
    insts
        .iter()
        .position(|i| i.opcode() == Opcode::LoopStart)
        .map_or((0, 0), |idx| {
            let count = npu_chip::operand::LoopOperand::unpack(insts[idx].operand()).0;
            (u32::try_from(idx + 1).unwrap_or(u32::MAX), count)
        })
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| NpuError::invalid_param(format!("length {len} exceeds u32")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::DeviceMemory;
    use crate::sim::{SimBus, SimClock};

    fn npu() -> Npu<SimBus, SimClock> {
        let mut npu = Npu::with_clock(SimBus::new(), SimClock::new());
        npu.init(RuntimeConfig::default()).unwrap();
        npu
    }

    #[test]
    fn state_codes_roundtrip() {
        for code in 0..8 {
            assert_eq!(NpuState::from_code(code).unwrap().code(), code);
        }
        assert_eq!(NpuState::from_code(8), None);
    }

    #[test]
    fn init_programs_buffers() {
        let npu = npu();
        assert_eq!(npu.state(), NpuState::Idle);
        assert_eq!(npu.bus().peek(Reg::InstBase), hw::INST_BUF_BASE);
        assert_eq!(npu.bus().peek(Reg::ActOutBase), hw::ACT_BUF_BASE + 128 * 1024);
        assert_eq!(npu.bus().peek(Reg::IrqEn), 0);
    }

    #[test]
    fn init_with_irq_enables_mask() {
        let mut npu = Npu::with_clock(SimBus::new(), SimClock::new());
        npu.init(RuntimeConfig::default().with_irq()).unwrap();
        assert_eq!(npu.bus().peek(Reg::IrqEn), irq::DONE | irq::ERROR | irq::DMA_DONE);
    }

    #[test]
    fn operations_before_init_fail() {
        let mut npu = Npu::with_clock(SimBus::new(), SimClock::new());
        assert!(matches!(npu.start(), Err(NpuError::NotInitialized)));
        assert!(matches!(npu.load_input(&[1]), Err(NpuError::NotInitialized)));
        assert!(matches!(npu.wait(10), Err(NpuError::NotInitialized)));
        assert!(npu.bus().writes().is_empty());
    }

    #[test]
    fn zero_sized_config_rejected() {
        let mut npu = Npu::with_clock(SimBus::new(), SimClock::new());
        let config = RuntimeConfig {
            weight_buf_size: 0,
            ..RuntimeConfig::default()
        };
        assert!(matches!(npu.init(config), Err(NpuError::InvalidParam { .. })));
        assert_eq!(npu.state(), NpuState::Reset);
    }

    #[test]
    fn small_weights_copied_directly() {
        let mut npu = npu();
        npu.load_weights(&[5; 16], 32).unwrap();
        assert_eq!(npu.dma.transfers(), 0);
        assert_eq!(npu.bus().peek(Reg::WeightSize), 48);
        let mut out = [0u8; 16];
        npu.bus().read_bytes(hw::WEIGHT_BUF_BASE + 32, &mut out).unwrap();
        assert_eq!(out, [5; 16]);
    }

    #[test]
    fn large_weights_use_dma() {
        let mut npu = npu();
        let data = vec![0xA5u8; DIRECT_WEIGHT_LIMIT + 1];
        npu.load_weights(&data, 0).unwrap();
        assert_eq!(npu.dma.transfers(), 1);
        assert_eq!(npu.bus().writes_to(Reg::DmaCtrl).len(), 1);
        let mut out = vec![0u8; data.len()];
        npu.bus().read_bytes(hw::WEIGHT_BUF_BASE, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn weight_overflow_checked_before_writes() {
        let mut npu = npu();
        npu.bus_mut().clear_log();
        let err = npu.load_weights(&[0; 8], 256 * 1024 - 4).unwrap_err();
        assert!(matches!(err, NpuError::Overflow { what: "weight buffer", .. }));
        assert!(npu.bus().writes().is_empty());
        assert_eq!(npu.state(), NpuState::Idle);
    }

    #[test]
    fn input_bounded_by_half_activation_buffer() {
        let mut npu = npu();
        let err = npu.load_input(&vec![0; 128 * 1024 + 1]).unwrap_err();
        assert!(matches!(err, NpuError::Overflow { .. }));
        npu.load_input(&[1, 2, 3]).unwrap();
        assert_eq!(npu.bus().peek(Reg::ActInSize), 3);
        assert_eq!(npu.state(), NpuState::Loading);
    }

    #[test]
    fn loop_bookkeeping_recorded() {
        let mut npu = npu();
        npu.load_instructions(&[
            Instruction::clear_acc(),
            Instruction::loop_start(4),
            Instruction::compute(0),
            Instruction::loop_end(2),
            Instruction::halt(),
        ])
        .unwrap();
        assert_eq!(npu.context().loop_start, 2);
        assert_eq!(npu.context().loop_count, 4);
        assert_eq!(npu.context().inst_count, 5);
    }

    #[test]
    fn run_to_done_updates_perf() {
        let mut npu = npu();
        npu.load_instructions(&[Instruction::compute(0), Instruction::halt()]).unwrap();
        npu.start().unwrap();
        assert_eq!(npu.state(), NpuState::Running);
        npu.wait(1000).unwrap();
        assert_eq!(npu.state(), NpuState::Done);
        assert_eq!(npu.context().inst_ptr, 2);
        assert_eq!(npu.context().perf.instructions, 2);
        assert!(npu.is_done());
    }

    #[test]
    fn fault_moves_to_error_and_blocks_loads() {
        let mut npu = npu();
        npu.load_instructions(&[Instruction::halt()]).unwrap();
        npu.bus_mut().inject_fault(0x77);
        npu.start().unwrap();
        assert!(matches!(npu.wait(1000), Err(NpuError::HwFault { code: 0x77 })));
        assert_eq!(npu.state(), NpuState::Error);
        assert_eq!(npu.context().last_error, Some(-5));
        assert!(matches!(npu.start(), Err(NpuError::InvalidState { .. })));

        npu.reset();
        assert_eq!(npu.state(), NpuState::Idle);
        assert_eq!(npu.context().last_error, None);
        npu.start().unwrap();
        npu.wait(1000).unwrap();
    }

    #[test]
    fn stop_returns_to_idle() {
        let mut npu = npu();
        npu.load_instructions(&[Instruction::halt()]).unwrap();
        npu.bus_mut().set_hang(true);
        npu.start().unwrap();
        npu.stop().unwrap();
        assert_eq!(npu.state(), NpuState::Idle);
        assert_eq!(npu.bus().peek(Reg::Ctrl) & ctrl::ABORT, 0);
    }

    #[test]
    fn abort_resets_and_reenables() {
        let mut npu = npu();
        npu.load_instructions(&[Instruction::halt()]).unwrap();
        npu.bus_mut().set_hang(true);
        npu.start().unwrap();
        npu.abort().unwrap();
        assert_eq!(npu.state(), NpuState::Idle);
        let ctrl_reg = npu.bus().peek(Reg::Ctrl);
        assert_eq!(ctrl_reg & ctrl::RESET, 0);
        assert_ne!(ctrl_reg & ctrl::ENABLE, 0);
    }

    #[test]
    fn read_output_clamps_to_available() {
        let mut npu = npu();
        let out_base = npu.config().act_out_addr();
        npu.bus_mut().write_bytes(out_base, &[1, 2, 3, 4]).unwrap();
        npu.bus_mut().poke(Reg::ActOutSize, 4);

        let mut out = [0u8; 8];
        assert_eq!(npu.read_output(&mut out).unwrap(), 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
        assert_eq!(npu.state(), NpuState::Done);
    }

    #[test]
    fn deinit_clears_context() {
        let mut npu = npu();
        npu.load_instructions(&[Instruction::halt()]).unwrap();
        npu.deinit();
        assert_eq!(npu.state(), NpuState::Reset);
        assert_eq!(npu.context(), &ExecutionContext::default());
        assert_eq!(npu.bus().peek(Reg::IrqEn), 0);
    }
}
