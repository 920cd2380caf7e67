//! Per-epoch kernel compilation and the typed wrappers around its buffers.

use anyhow::anyhow;
use log::debug;
use opencl3::command_queue::CommandQueue;
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, ClMem, CL_MEM_READ_ONLY, CL_MEM_WRITE_ONLY};
use opencl3::program::Program;
use opencl3::types::{cl_uint, cl_ulong, CL_BLOCKING};

use crate::catalog::ClPlatformKind;
use crate::error::{MinerError, Result};
use crate::results::{
    clamp_count, decode_results, AbortHandle, Harvest, COUNT_OFFSET_BYTES, MAX_SEARCH_RESULTS,
    SEARCH_BUFFER_WORDS,
};
use crate::session::{DeviceSession, ExecutionMode};

const KERNEL_TEMPLATE: &str = include_str!("keccak.cl");
const KERNEL_NAME: &str = "search";
const ACCESSES: u32 = 64;

/// Macro values injected ahead of the kernel source. Order is fixed so a
/// given configuration always produces the same preamble (and the same
/// driver cache key).
pub(crate) fn kernel_defines(
    worksize: usize,
    platform: ClPlatformKind,
    nv_compute: u32,
    mode: ExecutionMode,
) -> Vec<(&'static str, u32)> {
    let mut defines = vec![
        ("WORKSIZE", worksize as u32),
        ("ACCESSES", ACCESSES),
        ("MAX_OUTPUTS", MAX_SEARCH_RESULTS),
        ("PLATFORM", platform.code()),
        ("COMPUTE", nv_compute),
    ];
    if platform == ClPlatformKind::Clover {
        defines.push(("LEGACY", 1));
    }
    if mode != ExecutionMode::PersistentKernel {
        defines.push(("FAST_EXIT", 1));
    }
    defines
}

pub(crate) fn apply_defines(template: &str, defines: &[(&str, u32)]) -> String {
    let mut source = String::with_capacity(template.len() + defines.len() * 32);
    for (name, value) in defines {
        source.push_str(&format!("#define {name} {value}u\n"));
    }
    source.push_str(template);
    source
}

/// NVIDIA builds cap the register allocation; everything else takes the
/// driver defaults.
pub(crate) fn build_options(platform: ClPlatformKind, nv_compute: u32) -> String {
    if platform == ClPlatformKind::Nvidia {
        let cap = if nv_compute >= 35 { 72 } else { 63 };
        format!("-cl-nv-maxrregcount={cap}")
    } else {
        String::new()
    }
}

/// A compiled kernel plus its device-side buffers and command queues.
/// Rebuilt from scratch on every epoch change; dropping it releases
/// everything in reverse creation order.
pub(crate) struct EpochProgram {
    kernel: Kernel,
    #[allow(dead_code)]
    program: Program,
    header_buffer: Buffer<u8>,
    search_buffer: Buffer<cl_uint>,
    queue: CommandQueue,
    /// Second queue reserved for the out-of-band abort write so it never
    /// queues behind a long-running kernel.
    abort_queue: CommandQueue,
}

impl EpochProgram {
    /// Compile the macro-expanded kernel for the bound device and allocate
    /// its buffers. A compile error surfaces as [`MinerError::Build`] with
    /// the driver's build log attached.
    pub(crate) fn build(session: &DeviceSession) -> Result<Self> {
        let nv_compute =
            session.descriptor.nv_compute_major * 10 + session.descriptor.nv_compute_minor;
        let defines = kernel_defines(
            session.local_work_size,
            session.descriptor.platform_kind,
            nv_compute,
            session.mode,
        );
        let source = apply_defines(KERNEL_TEMPLATE, &defines);
        let options = build_options(session.descriptor.platform_kind, nv_compute);
        debug!("building kernel with options {options:?}");

        let program = Program::create_and_build_from_source(&session.context, &source, &options)
            .map_err(|log| MinerError::Build { log })?;
        let kernel = Kernel::create(&program, KERNEL_NAME)
            .map_err(|err| anyhow!("failed to create kernel: {err:?}"))?;

        let queue = CommandQueue::create_default_with_properties(&session.context, 0, 0)
            .map_err(|err| anyhow!("failed to create command queue: {err:?}"))?;
        let abort_queue = CommandQueue::create_default_with_properties(&session.context, 0, 0)
            .map_err(|err| anyhow!("failed to create abort queue: {err:?}"))?;

        let header_buffer = unsafe {
            Buffer::<u8>::create(&session.context, CL_MEM_READ_ONLY, 32, std::ptr::null_mut())
                .map_err(|err| anyhow!("failed to allocate header buffer: {err:?}"))?
        };
        let search_buffer = unsafe {
            Buffer::<cl_uint>::create(
                &session.context,
                CL_MEM_WRITE_ONLY,
                SEARCH_BUFFER_WORDS,
                std::ptr::null_mut(),
            )
            .map_err(|err| anyhow!("failed to allocate search buffer: {err:?}"))?
        };

        let mut this = Self {
            kernel,
            program,
            header_buffer,
            search_buffer,
            queue,
            abort_queue,
        };
        // Fresh buffers hold garbage; the first probe must see count == 0.
        this.reset_words(0, SEARCH_BUFFER_WORDS)?;
        Ok(this)
    }

    /// Probe the counter words, harvest any reported results, then reset the
    /// counters for the launch already in flight. Persistent kernels keep
    /// their cumulative hash counter and abort flag; single-shot clears all
    /// three words.
    pub(crate) fn poll(&mut self, mode: ExecutionMode) -> Result<Harvest> {
        let probe_words = match mode {
            ExecutionMode::PersistentKernel => 1,
            ExecutionMode::SingleShot => 2,
        };
        let mut probe = [0 as cl_uint; 2];
        unsafe {
            self.queue
                .enqueue_read_buffer(
                    &self.search_buffer,
                    CL_BLOCKING,
                    COUNT_OFFSET_BYTES,
                    &mut probe[..probe_words],
                    &[],
                )
                .map_err(|err| anyhow!("failed to read result counters: {err:?}"))?;
        }
        let count = clamp_count(probe[0]);
        let hash_count = probe[1];

        let results = if count > 0 {
            let mut words = vec![0 as cl_uint; count as usize * 16];
            unsafe {
                self.queue
                    .enqueue_read_buffer(&self.search_buffer, CL_BLOCKING, 0, &mut words, &[])
                    .map_err(|err| anyhow!("failed to read result slots: {err:?}"))?;
            }
            decode_results(&words, count)
        } else {
            Vec::new()
        };

        match mode {
            ExecutionMode::PersistentKernel => {
                if count > 0 {
                    self.reset_words(COUNT_OFFSET_BYTES, 1)?;
                }
            }
            ExecutionMode::SingleShot => {
                self.reset_words(COUNT_OFFSET_BYTES, 3)?;
            }
        }

        Ok(Harvest {
            results,
            hash_count,
        })
    }

    pub(crate) fn push_header(&mut self, header: &[u8; 32]) -> Result<()> {
        unsafe {
            self.queue
                .enqueue_write_buffer(&mut self.header_buffer, CL_BLOCKING, 0, header, &[])
                .map_err(|err| anyhow!("failed to write header: {err:?}"))?;
        }
        Ok(())
    }

    /// Work switches clear all three counter words before the relaunch.
    pub(crate) fn reset_counters(&mut self) -> Result<()> {
        self.reset_words(COUNT_OFFSET_BYTES, 3)
    }

    fn reset_words(&mut self, offset_bytes: usize, words: usize) -> Result<()> {
        let zeros = [0 as cl_uint; SEARCH_BUFFER_WORDS];
        unsafe {
            self.queue
                .enqueue_write_buffer(
                    &mut self.search_buffer,
                    CL_BLOCKING,
                    offset_bytes,
                    &zeros[..words],
                    &[],
                )
                .map_err(|err| anyhow!("failed to reset result counters: {err:?}"))?;
        }
        Ok(())
    }

    /// Enqueue one search launch without waiting for it; the next poll's
    /// blocking read provides the ordering.
    pub(crate) fn launch(
        &self,
        target: cl_ulong,
        start_nonce: cl_uint,
        global_work_size: usize,
        local_work_size: usize,
    ) -> Result<()> {
        unsafe {
            ExecuteKernel::new(&self.kernel)
                .set_arg(&self.search_buffer.get())
                .set_arg(&self.header_buffer.get())
                .set_arg(&target)
                .set_arg(&start_nonce)
                .set_global_work_sizes(&[global_work_size])
                .set_local_work_sizes(&[local_work_size])
                .enqueue_nd_range(&self.queue)
                .map_err(|err| anyhow!("failed to launch search kernel: {err:?}"))?;
        }
        Ok(())
    }

    /// Drain outstanding device work before teardown.
    pub(crate) fn finish(&self) -> Result<()> {
        self.queue
            .finish()
            .map_err(|err| anyhow!("failed to drain command queue: {err:?}"))?;
        Ok(())
    }

    /// Raw handles for the owner-thread abort poke, valid while `self` lives.
    pub(crate) fn abort_handle(&self) -> AbortHandle {
        AbortHandle::new(self.abort_queue.get(), self.search_buffer.get())
    }
}
