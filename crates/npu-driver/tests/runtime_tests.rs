//! End-to-end runtime behaviour against the simulated device

use npu_chip::regs::{irq, status};
use npu_chip::{Instruction, Reg};
use npu_compiler::{compile_layer, ConvParams, LayerDescriptor, TensorDescriptor};
use npu_driver::sim::{SimBus, SimClock};
use npu_driver::{
    load_model, Clock, CompletionHandler, DeviceMemory, ModelBuilder, Npu, NpuError, NpuState,
    PerfStats, RuntimeConfig,
};
use std::sync::{Arc, Mutex};

fn ready() -> Npu<SimBus, SimClock> {
    let mut npu = Npu::with_clock(SimBus::new(), SimClock::new());
    npu.init(RuntimeConfig::default()).unwrap();
    npu
}

fn program() -> Vec<Instruction> {
    vec![
        Instruction::clear_acc(),
        Instruction::load_weight(0, 256),
        Instruction::compute(0),
        Instruction::drain(0),
        Instruction::halt(),
    ]
}

#[test]
fn start_while_running_is_busy_and_writes_nothing() {
    let mut npu = ready();
    npu.bus_mut().set_hang(true);
    npu.load_instructions(&program()).unwrap();
    npu.start().unwrap();
    assert_eq!(npu.state(), NpuState::Running);

    npu.bus_mut().clear_log();
    assert!(matches!(npu.start(), Err(NpuError::Busy { .. })));
    assert!(npu.bus().writes_to(Reg::InstPtr).is_empty());
    assert!(npu.bus().writes_to(Reg::IrqStatus).is_empty());
    assert_eq!(npu.state(), NpuState::Running);
}

#[test]
fn loaders_while_running_are_busy_and_write_nothing() {
    let mut npu = ready();
    npu.bus_mut().set_hang(true);
    npu.load_instructions(&program()).unwrap();
    npu.start().unwrap();
    assert_eq!(npu.state(), NpuState::Running);

    npu.bus_mut().clear_log();
    assert!(matches!(npu.load_instructions(&program()), Err(NpuError::Busy { .. })));
    assert!(matches!(npu.load_weights(&[1; 64], 0), Err(NpuError::Busy { .. })));
    assert!(matches!(npu.load_weights(&[1; 2048], 0), Err(NpuError::Busy { .. })));
    assert!(matches!(npu.load_input(&[2; 16]), Err(NpuError::Busy { .. })));
    assert!(npu.bus().writes().is_empty());
    assert_eq!(npu.state(), NpuState::Running);
    assert_eq!(npu.context().inst_count, 5);
}

#[test]
fn init_while_running_is_busy_and_writes_nothing() {
    let mut npu = ready();
    npu.bus_mut().set_hang(true);
    npu.load_instructions(&program()).unwrap();
    npu.start().unwrap();

    npu.bus_mut().clear_log();
    assert!(matches!(npu.init(RuntimeConfig::default()), Err(NpuError::Busy { .. })));
    assert!(npu.bus().writes().is_empty());
    assert_eq!(npu.state(), NpuState::Running);
    assert_eq!(npu.context().inst_count, 5);

    npu.abort().unwrap();
    npu.init(RuntimeConfig::default()).unwrap();
    assert_eq!(npu.state(), NpuState::Idle);
}

#[test]
fn wait_on_hung_core_times_out_at_deadline() {
    let mut npu = ready();
    npu.bus_mut().set_hang(true);
    npu.load_instructions(&program()).unwrap();
    npu.start().unwrap();

    let before = npu.clock().now_us();
    let err = npu.wait(1000).unwrap_err();
    assert!(matches!(err, NpuError::Timeout { duration_us: 1000 }));
    let elapsed = npu.clock().now_us() - before;
    assert!((1000..1010).contains(&elapsed), "elapsed {elapsed}");
    assert_eq!(npu.state(), NpuState::Running);
    assert_eq!(npu.context().last_error, Some(err.status_code()));

    npu.abort().unwrap();
    assert_eq!(npu.state(), NpuState::Idle);
}

#[test]
fn oversized_program_leaves_registers_untouched() {
    let mut npu = ready();
    npu.bus_mut().clear_log();
    let program = vec![Instruction::nop(); 1025];
    let err = npu.load_instructions(&program).unwrap_err();
    assert!(matches!(err, NpuError::Overflow { requested: 8200, capacity: 8192, .. }));
    assert!(npu.bus().writes().is_empty());
    assert_eq!(npu.state(), NpuState::Idle);
}

#[test]
fn corrupted_model_is_rejected_before_any_copy() {
    let mut bytes = ModelBuilder::new()
        .layer(&program())
        .weights(vec![7; 64])
        .with_checksum()
        .build()
        .unwrap();
    bytes[0] = b'X';

    assert!(matches!(load_model(&bytes), Err(NpuError::InvalidModel { .. })));

    let mut npu = ready();
    npu.bus_mut().clear_log();
    assert!(matches!(npu.load_model(&bytes), Err(NpuError::InvalidModel { .. })));
    assert!(npu.bus().writes().is_empty());
    let mut first = [0u8; 8];
    npu.bus().read_bytes(npu.config().inst_buf_addr, &mut first).unwrap();
    assert_eq!(first, [0; 8]);
}

#[test]
fn model_too_large_for_buffers_is_rejected_whole() {
    let mut npu = ready();
    let bytes = ModelBuilder::new()
        .layer(&program())
        .weights(vec![1; 256 * 1024])
        .bias(vec![2; 4])
        .build()
        .unwrap();
    npu.bus_mut().clear_log();
    assert!(matches!(
        npu.load_model(&bytes),
        Err(NpuError::Overflow { what: "weight buffer", .. })
    ));
    assert!(npu.bus().writes().is_empty());
}

#[test]
fn model_overflow_records_last_error() {
    let mut npu = ready();
    let bytes = ModelBuilder::new()
        .layer(&[Instruction::nop(); 1025])
        .build()
        .unwrap();
    let err = npu.load_model(&bytes).unwrap_err();
    assert!(matches!(err, NpuError::Overflow { what: "instruction buffer", .. }));
    assert_eq!(npu.context().last_error, Some(err.status_code()));
}

#[test]
fn weight_dma_fault_leaves_nothing_loaded() {
    let mut npu = ready();
    // Over the direct-copy limit, so the weights go through DMA
    let bytes = ModelBuilder::new()
        .layer(&program())
        .weights(vec![5; 2048])
        .bias(vec![1; 8])
        .build()
        .unwrap();
    npu.bus_mut().inject_dma_fault();

    let err = npu.load_model(&bytes).unwrap_err();
    assert!(matches!(err, NpuError::Dma { .. }), "{err:?}");
    assert_eq!(npu.bus().peek(Reg::InstSize), 0);
    assert_eq!(npu.bus().peek(Reg::WeightSize), 0);
    assert_eq!(npu.context().inst_count, 0);
    assert_eq!(npu.context().total_layers, 0);
    assert_eq!(npu.context().last_error, Some(err.status_code()));
    assert_eq!(npu.state(), NpuState::Idle);

    // The fault was one-shot; a retry loads cleanly
    npu.load_model(&bytes).unwrap();
    assert_eq!(npu.context().inst_count, 5);
    assert_eq!(npu.bus().peek(Reg::WeightSize), 2056);
}

#[test]
fn model_load_run_and_read_back() {
    let mut npu = ready();
    let bytes = ModelBuilder::new()
        .layer(&program())
        .weights((0..=255u8).collect::<Vec<_>>())
        .bias(vec![0xB1, 0xA5])
        .io_sizes(16, 4)
        .with_checksum()
        .build()
        .unwrap();

    let header = npu.load_model(&bytes).unwrap();
    assert_eq!(header.inst_count, 5);
    assert_eq!(npu.context().total_layers, 1);
    assert_eq!(npu.context().inst_count, 5);
    assert_eq!(npu.bus().peek(Reg::WeightSize), 258);

    let mut bias = [0u8; 2];
    npu.bus().read_bytes(npu.config().weight_buf_addr + 256, &mut bias).unwrap();
    assert_eq!(bias, [0xB1, 0xA5]);

    npu.load_input(&[3; 16]).unwrap();
    npu.start().unwrap();
    npu.wait(0).unwrap();
    assert_eq!(npu.state(), NpuState::Done);
    assert_eq!(npu.context().inst_ptr, 5);

    let out_addr = npu.config().act_out_addr();
    npu.bus_mut().write_bytes(out_addr, &[9, 8, 7, 6]).unwrap();
    npu.bus_mut().poke(Reg::ActOutSize, 4);
    let mut out = [0u8; 16];
    assert_eq!(npu.read_output(&mut out).unwrap(), 4);
    assert_eq!(&out[..4], &[9, 8, 7, 6]);
    assert_eq!(npu.state(), NpuState::Done);
    assert_eq!(npu.perf().dma_transfers, 2);
}

#[test]
fn read_output_with_nothing_produced_returns_zero() {
    let mut npu = ready();
    let mut out = [0u8; 4];
    assert_eq!(npu.read_output(&mut out).unwrap(), 0);
}

#[test]
fn conv_32x32_tiles_and_runs() {
    let layer = LayerDescriptor::conv2d(
        TensorDescriptor::new(0x1000, 32, 8, 8),
        TensorDescriptor::new(0x8000, 32, 8, 8),
        TensorDescriptor::new(0x2_0000, 32, 32, 9),
        ConvParams::square(3).with_padding(1),
    );
    let seq = compile_layer(&layer).unwrap();
    assert_eq!(seq.len(), 17);

    let mut npu = ready();
    let perf = npu.compile_and_run(&layer).unwrap();
    assert_eq!(perf.instructions, seq.len() as u64);
    assert_eq!(perf.mac_ops, 4 * 256);
    assert!(perf.utilization() > 0.0 && perf.utilization() < 1.0);
}

#[test]
fn fresh_counters_report_zero_utilization() {
    let mut npu = ready();
    let perf = npu.perf();
    assert_eq!(perf, PerfStats::default());
    assert!(perf.utilization().abs() < f64::EPSILON);
}

#[test]
fn fault_requires_reset() {
    let mut npu = ready();
    npu.load_instructions(&program()).unwrap();
    npu.bus_mut().inject_fault(0x0BAD);
    npu.start().unwrap();
    assert!(matches!(npu.wait(1000), Err(NpuError::HwFault { code: 0x0BAD })));
    assert_eq!(npu.state(), NpuState::Error);
    assert!(matches!(npu.start(), Err(NpuError::InvalidState { .. })));

    npu.reset();
    assert_eq!(npu.state(), NpuState::Idle);
    assert_eq!(npu.context().last_error, None);
    npu.load_instructions(&program()).unwrap();
    npu.start().unwrap();
    npu.wait(1000).unwrap();
}

#[test]
fn delayed_completion_is_polled() {
    let mut npu = ready();
    npu.bus_mut().set_latency_polls(3);
    npu.load_instructions(&program()).unwrap();
    npu.start().unwrap();
    let (reads, t0) = (npu.bus().status_reads(), npu.clock().now_us());
    npu.wait(10_000).unwrap();
    assert_eq!(npu.bus().status_reads() - reads, 4);
    assert_eq!(npu.clock().now_us() - t0, 30);
}

#[derive(Default)]
struct Recorder {
    done: Vec<PerfStats>,
    errors: Vec<i32>,
}

struct Shared(Arc<Mutex<Recorder>>);

impl CompletionHandler for Shared {
    fn on_done(&mut self, perf: &PerfStats) {
        self.0.lock().unwrap().done.push(*perf);
    }

    fn on_error(&mut self, error: &NpuError) {
        self.0.lock().unwrap().errors.push(error.status_code());
    }
}

#[test]
fn interrupt_path_notifies_handler() {
    let mut npu = Npu::with_clock(SimBus::new(), SimClock::new());
    npu.init(RuntimeConfig::default().with_irq()).unwrap();
    assert_eq!(npu.bus().peek(Reg::IrqEn), irq::DONE | irq::ERROR | irq::DMA_DONE);

    let seen = Arc::new(Mutex::new(Recorder::default()));
    npu.set_handler(Box::new(Shared(Arc::clone(&seen))));

    npu.load_instructions(&program()).unwrap();
    npu.start().unwrap();
    let pending = npu.handle_irq();
    assert_ne!(pending & irq::DONE, 0);
    assert_eq!(npu.bus().peek(Reg::IrqStatus), 0);
    assert_eq!(npu.state(), NpuState::Done);
    assert_eq!(npu.handle_irq(), 0);

    npu.bus_mut().inject_fault(0x77);
    npu.start().unwrap();
    npu.handle_irq();
    assert_eq!(npu.state(), NpuState::Error);
    assert_ne!(npu.bus().peek(Reg::Status) & status::ERROR, 0);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.done.len(), 1);
    assert_eq!(seen.done[0].instructions, 5);
    assert_eq!(seen.errors, vec![NpuError::HwFault { code: 0x77 }.status_code()]);
}

#[test]
fn boot_then_run() {
    let mut npu = Npu::with_clock(SimBus::new(), SimClock::new());
    let info = npu.boot().unwrap();
    assert_eq!(info.profile.pe_count(), 256);
    npu.init(RuntimeConfig::from_profile(&info.profile)).unwrap();
    npu.load_instructions(&program()).unwrap();
    npu.start().unwrap();
    npu.wait(1000).unwrap();
    npu.deinit();
    assert_eq!(npu.state(), NpuState::Reset);
}

#[test]
#[ignore = "Requires hardware"]
fn mmio_bus_reads_identity() {
    let bus = npu_driver::MmioBus::open(&npu_driver::MmioConfig::default()).unwrap();
    let npu: Npu<_> = Npu::new(bus);
    let info = npu.verify_hardware().unwrap();
    println!("{info}");
}
