//! Binding of one catalog entry to a live OpenCL context.

use anyhow::anyhow;
use log::{debug, info, warn};
use opencl3::context::Context;
use opencl3::device::{Device, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_GPU};
use opencl3::error_codes::CL_DEVICE_NOT_FOUND;
use opencl3::platform::get_platforms;
use opencl3::types::cl_device_id;

use crate::catalog::{ClPlatformKind, DeviceDescriptor};
use crate::error::{MinerError, Result};
use crate::types::format_memory;

/// Every launch covers 2^28 work items regardless of device size; the search
/// space is walked by advancing the start nonce, not by resizing launches.
pub const GLOBAL_WORK_SIZE: usize = 1 << 28;

const DEFAULT_LOCAL_WORK_SIZE: usize = 128;

/// Tunables the embedding process may override per device.
#[derive(Debug, Clone)]
pub struct Settings {
    pub local_work_size: usize,
    /// Overridden to [`GLOBAL_WORK_SIZE`] at session open.
    pub global_work_size: usize,
    /// Request the abort-interruptible long-running kernel. Only honored on
    /// AMD platforms.
    pub persistent_kernel: bool,
    /// Disable reuse of driver-cached program binaries. Forced on for
    /// platforms whose caches are unreliable.
    pub no_binary: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_work_size: DEFAULT_LOCAL_WORK_SIZE,
            global_work_size: GLOBAL_WORK_SIZE,
            persistent_kernel: false,
            no_binary: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Kernel runs to completion every launch; the abort flag is unused.
    SingleShot,
    /// Kernel loops on-device until aborted. AMD only.
    PersistentKernel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorKind {
    Nvidia,
    Amd,
    Unknown,
}

/// Handle for the external telemetry subsystem: which vendor library to
/// query and the PCI identity to query it with.
#[derive(Debug, Clone)]
pub struct HwMonitorInfo {
    pub kind: MonitorKind,
    pub pci_id: String,
}

/// A bound device: a live context plus the decisions made at bind time
/// (execution mode, effective work sizes, monitor binding). Command queues
/// are created per epoch alongside the program.
pub struct DeviceSession {
    pub descriptor: DeviceDescriptor,
    pub mode: ExecutionMode,
    pub monitor: HwMonitorInfo,
    pub local_work_size: usize,
    pub global_work_size: usize,
    pub(crate) context: Context,
}

impl DeviceSession {
    /// Bind the described device: re-resolve its handle by enumeration
    /// position, gate on the platform's OpenCL version, create the context,
    /// and fix the execution mode.
    pub fn open(descriptor: &DeviceDescriptor, settings: &Settings) -> Result<Self> {
        check_platform_version(descriptor)?;

        let id = resolve_device(descriptor)?;
        let device = Device::new(id);

        let mode = resolve_execution_mode(descriptor.platform_kind, settings.persistent_kernel);
        let local_work_size = round_to_work_multiple(settings.local_work_size);
        let global_work_size = resolve_global_work_size(settings.global_work_size);
        let tag = format!("cl-{}", descriptor.device_ordinal);

        info!(
            "{tag} Using device {} {:?} ({}) memory {}",
            descriptor.unique_id,
            descriptor.name,
            if descriptor.platform_kind == ClPlatformKind::Nvidia {
                format!("Compute {}", descriptor.nv_compute())
            } else {
                descriptor.platform_version.clone()
            },
            format_memory(descriptor.total_memory),
        );

        if !binary_cache_enabled(descriptor.platform_kind, settings.no_binary) {
            debug!("{tag} driver binary cache disabled for this platform");
        }

        let context = Context::from_device(&device)
            .map_err(|err| anyhow!("failed to create context: {err:?}"))?;

        Ok(Self {
            descriptor: descriptor.clone(),
            mode,
            monitor: monitor_info(descriptor),
            local_work_size,
            global_work_size,
            context,
        })
    }
}

/// The launch size is not tunable: nonce partitioning assumes every launch
/// covers exactly [`GLOBAL_WORK_SIZE`] items, so requests are overridden.
pub fn resolve_global_work_size(requested: usize) -> usize {
    if requested != GLOBAL_WORK_SIZE {
        warn!("requested global work size {requested} ignored; launches cover {GLOBAL_WORK_SIZE} items");
    }
    GLOBAL_WORK_SIZE
}

/// Only AMD drivers cache compiled binaries reliably enough to reuse.
pub fn binary_cache_enabled(platform: ClPlatformKind, no_binary: bool) -> bool {
    platform == ClPlatformKind::Amd && !no_binary
}

/// Local work sizes must be a multiple of the kernel's hash batch width.
pub fn round_to_work_multiple(requested: usize) -> usize {
    let requested = requested.max(1);
    requested.div_ceil(8) * 8
}

pub fn resolve_execution_mode(platform: ClPlatformKind, requested: bool) -> ExecutionMode {
    if !requested {
        return ExecutionMode::SingleShot;
    }
    if platform == ClPlatformKind::Amd {
        ExecutionMode::PersistentKernel
    } else {
        info!("persistent kernel not supported on this platform; using single-shot launches");
        ExecutionMode::SingleShot
    }
}

/// OpenCL below 1.2 cannot run the kernel. Clover misreports its level, so
/// it is warned through rather than rejected.
pub fn unsupported_platform_version(major: u32, minor: u32) -> bool {
    major < 1 || (major == 1 && minor < 2)
}

fn check_platform_version(descriptor: &DeviceDescriptor) -> Result<()> {
    if !unsupported_platform_version(descriptor.platform_major, descriptor.platform_minor) {
        return Ok(());
    }
    if descriptor.platform_kind == ClPlatformKind::Clover {
        warn!(
            "Clover reports {} which is unsupported; it might work nevertheless. USE AT OWN RISK!",
            descriptor.platform_version
        );
        return Ok(());
    }
    Err(MinerError::VersionUnsupported {
        version: descriptor.platform_version.clone(),
    })
}

fn monitor_info(descriptor: &DeviceDescriptor) -> HwMonitorInfo {
    let kind = match descriptor.platform_kind {
        ClPlatformKind::Nvidia => MonitorKind::Nvidia,
        ClPlatformKind::Amd => MonitorKind::Amd,
        ClPlatformKind::Clover | ClPlatformKind::Intel => MonitorKind::Unknown,
    };
    HwMonitorInfo {
        kind,
        pci_id: descriptor.unique_id.clone(),
    }
}

/// Device handles are not stable across processes; find the device again by
/// its enumeration position within its platform.
fn resolve_device(descriptor: &DeviceDescriptor) -> Result<cl_device_id> {
    let platforms =
        get_platforms().map_err(|err| anyhow!("failed to enumerate OpenCL platforms: {err:?}"))?;
    let platform = platforms
        .get(descriptor.platform_ordinal)
        .ok_or_else(|| anyhow!("platform {} no longer present", descriptor.platform_ordinal))?;
    let ids = match platform.get_devices(CL_DEVICE_TYPE_GPU | CL_DEVICE_TYPE_ACCELERATOR) {
        Ok(ids) => ids,
        Err(err) if err.0 == CL_DEVICE_NOT_FOUND => Vec::new(),
        Err(err) => return Err(anyhow!("failed to enumerate devices: {err:?}").into()),
    };
    ids.get(descriptor.device_ordinal).copied().ok_or_else(|| {
        anyhow!(
            "device {} on platform {} no longer present",
            descriptor.device_ordinal,
            descriptor.platform_ordinal
        )
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_size_rounds_up_to_multiple_of_eight() {
        assert_eq!(round_to_work_multiple(1), 8);
        assert_eq!(round_to_work_multiple(8), 8);
        assert_eq!(round_to_work_multiple(9), 16);
        assert_eq!(round_to_work_multiple(128), 128);
        assert_eq!(round_to_work_multiple(0), 8);
    }

    #[test]
    fn persistent_kernel_is_amd_only() {
        assert_eq!(
            resolve_execution_mode(ClPlatformKind::Amd, true),
            ExecutionMode::PersistentKernel
        );
        assert_eq!(
            resolve_execution_mode(ClPlatformKind::Nvidia, true),
            ExecutionMode::SingleShot
        );
        assert_eq!(
            resolve_execution_mode(ClPlatformKind::Intel, true),
            ExecutionMode::SingleShot
        );
        assert_eq!(
            resolve_execution_mode(ClPlatformKind::Amd, false),
            ExecutionMode::SingleShot
        );
    }

    #[test]
    fn version_gate() {
        assert!(unsupported_platform_version(1, 0));
        assert!(unsupported_platform_version(1, 1));
        assert!(!unsupported_platform_version(1, 2));
        assert!(!unsupported_platform_version(2, 0));
        assert!(!unsupported_platform_version(3, 0));
        assert!(unsupported_platform_version(0, 0));
    }

    #[test]
    fn global_size_is_fixed() {
        assert_eq!(Settings::default().global_work_size, 1 << 28);
        assert_eq!(Settings::default().local_work_size, 128);
    }

    #[test]
    fn global_size_cannot_be_overridden() {
        assert_eq!(resolve_global_work_size(1 << 20), 1 << 28);
        assert_eq!(resolve_global_work_size(0), 1 << 28);
        assert_eq!(resolve_global_work_size(GLOBAL_WORK_SIZE), GLOBAL_WORK_SIZE);
    }

    #[test]
    fn binary_cache_is_amd_only() {
        assert!(binary_cache_enabled(ClPlatformKind::Amd, false));
        assert!(!binary_cache_enabled(ClPlatformKind::Amd, true));
        assert!(!binary_cache_enabled(ClPlatformKind::Nvidia, false));
        assert!(!binary_cache_enabled(ClPlatformKind::Clover, false));
    }
}
