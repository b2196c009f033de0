//! Single-layer execution: program the layer registers, compile, run

use crate::clock::Clock;
use crate::error::Result;
use crate::mmio::NpuBus;
use crate::perf::PerfStats;
use crate::registers::Registers;
use crate::runtime::Npu;
use npu_chip::Reg;
use npu_compiler::{CompilerConfig, LayerCompiler, LayerDescriptor};
use tracing::{debug, info};

impl<B: NpuBus, C: Clock> Npu<B, C> {
    /// Write the per-layer configuration registers for `layer`.
    ///
    /// POOL_TYPE is only written for pooling kinds.
    pub fn configure_layer(&mut self, layer: &LayerDescriptor) {
        let (input, output) = (&layer.input, &layer.output);
        let regs = [
            (Reg::LayerType, layer.kind.type_code()),
            (Reg::LayerInCh, input.c),
            (Reg::LayerOutCh, output.c),
            (Reg::LayerInH, input.h),
            (Reg::LayerInW, input.w),
            (Reg::LayerOutH, output.h),
            (Reg::LayerOutW, output.w),
            (Reg::LayerKernel, layer.conv.kernel_word()),
            (Reg::LayerStride, layer.conv.stride_word()),
            (Reg::LayerPadding, layer.conv.padding_word()),
            (Reg::LayerActType, layer.activation.type_code()),
        ];
        for (reg, value) in regs {
            self.bus.write(reg, value);
        }
        if layer.kind.is_pool() {
            self.bus.write(Reg::LayerPoolType, layer.kind.pool_code());
        }
        #[allow(clippy::cast_sign_loss)]
        {
            self.bus.write(Reg::LayerQuantScale, layer.quant.scale as u32);
            self.bus.write(Reg::LayerQuantZero, u32::from(layer.quant.zero_point as u8));
        }
        debug!(
            "configured {:?}: {}x{}x{} -> {}x{}x{}",
            layer.kind, input.c, input.h, input.w, output.c, output.h, output.w
        );
    }

    /// Compile `layer` for this core's PE array, run it to completion and
    /// return the refreshed counters.
    ///
    /// # Errors
    ///
    /// Returns a compile error before any register is touched, then any error
    /// from loading, starting or waiting.
    pub fn compile_and_run(&mut self, layer: &LayerDescriptor) -> Result<PerfStats> {
        self.ensure_loadable("compile and run")?;
        let compiler = LayerCompiler::new(CompilerConfig::from_profile(&self.hardware_info().profile));
        let program = compiler.compile_layer(layer)?;

        self.configure_layer(layer);
        self.load_instructions(&program)?;
        self.start()?;
        self.wait(self.config.run_timeout_us)?;

        self.ctx.perf.layers_executed += 1;
        let perf = self.ctx.perf;
        info!(
            "✅ {:?} done: {} instructions, {} cycles",
            layer.kind, perf.instructions, perf.total_cycles
        );
        Ok(perf)
    }
}
