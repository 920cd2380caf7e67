//! Enumeration and classification of OpenCL compute devices.
//!
//! The catalog is keyed by a stable per-device identity (PCI address where
//! the vendor exposes one) so repeated scans merge into the same entries and
//! externally assigned monitor bindings survive a rescan.

use std::collections::BTreeMap;

use anyhow::anyhow;
use cl3::info_type::InfoType;
use log::{debug, warn};
use opencl3::device::{Device, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU};
use opencl3::error_codes::CL_DEVICE_NOT_FOUND;
use opencl3::platform::{get_platforms, Platform};
use opencl3::types::cl_device_id;

use crate::error::Result;

// Vendor device-info extensions with no typed accessor.
const CL_DEVICE_COMPUTE_CAPABILITY_MAJOR_NV: u32 = 0x4000;
const CL_DEVICE_COMPUTE_CAPABILITY_MINOR_NV: u32 = 0x4001;
const CL_DEVICE_PCI_BUS_ID_NV: u32 = 0x4008;
const CL_DEVICE_PCI_SLOT_ID_NV: u32 = 0x4009;
const CL_DEVICE_TOPOLOGY_AMD: u32 = 0x4037;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClPlatformKind {
    Amd,
    Clover,
    Nvidia,
    Intel,
}

impl ClPlatformKind {
    /// Numeric code injected into the kernel as the `PLATFORM` macro.
    pub fn code(self) -> u32 {
        match self {
            ClPlatformKind::Clover => 1,
            ClPlatformKind::Amd => 2,
            ClPlatformKind::Nvidia => 3,
            ClPlatformKind::Intel => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClDeviceKind {
    Gpu,
    Cpu,
    Accelerator,
}

/// Everything the session and program builder need to know about one device,
/// captured at scan time.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub name: String,
    pub unique_id: String,
    pub platform_kind: ClPlatformKind,
    pub device_kind: ClDeviceKind,
    pub platform_name: String,
    pub platform_version: String,
    pub platform_major: u32,
    pub platform_minor: u32,
    /// Index of the parent platform in enumeration order.
    pub platform_ordinal: usize,
    /// Index of the device within its platform in enumeration order.
    pub device_ordinal: usize,
    pub device_version: String,
    pub total_memory: u64,
    pub max_mem_alloc: u64,
    pub max_work_group_size: usize,
    pub max_compute_units: u32,
    /// NVIDIA compute capability, zero elsewhere.
    pub nv_compute_major: u32,
    pub nv_compute_minor: u32,
    /// Slot for an externally bound hardware-monitor index; preserved when a
    /// rescan refreshes the rest of the entry.
    pub monitor_index: Option<u32>,
}

impl DeviceDescriptor {
    pub fn nv_compute(&self) -> String {
        format!("{}.{}", self.nv_compute_major, self.nv_compute_minor)
    }
}

#[derive(Debug, Default)]
pub struct DeviceCatalog {
    devices: BTreeMap<String, DeviceDescriptor>,
}

impl DeviceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.values()
    }

    pub fn get(&self, unique_id: &str) -> Option<&DeviceDescriptor> {
        self.devices.get(unique_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn bind_monitor(&mut self, unique_id: &str, monitor_index: u32) -> bool {
        match self.devices.get_mut(unique_id) {
            Some(entry) => {
                entry.monitor_index = Some(monitor_index);
                true
            }
            None => false,
        }
    }

    /// Enumerate all platforms and merge every classifiable device into the
    /// catalog. Unrecognized platforms and devices without a derivable
    /// identity are skipped with a diagnostic; existing entries are refreshed
    /// in place, keeping their monitor binding.
    pub fn scan(&mut self) -> Result<usize> {
        let platforms =
            get_platforms().map_err(|err| anyhow!("failed to enumerate OpenCL platforms: {err:?}"))?;

        let mut discovered = 0;
        for (p_idx, platform) in platforms.iter().enumerate() {
            let platform_name = platform
                .name()
                .map_err(|err| anyhow!("failed to query platform name: {err:?}"))?;
            let Some(platform_kind) = classify_platform(&platform_name) else {
                debug!("skipping unrecognized OpenCL platform {platform_name:?}");
                continue;
            };
            let platform_version = platform
                .version()
                .map_err(|err| anyhow!("failed to query platform version: {err:?}"))?;
            let (platform_major, platform_minor) = parse_cl_version(&platform_version);

            for (d_idx, id) in platform_devices(platform)?.into_iter().enumerate() {
                match self.describe(
                    platform_kind,
                    &platform_name,
                    &platform_version,
                    platform_major,
                    platform_minor,
                    p_idx,
                    d_idx,
                    id,
                )? {
                    Some(descriptor) => {
                        discovered += 1;
                        self.upsert(descriptor);
                    }
                    None => continue,
                }
            }
        }
        Ok(discovered)
    }

    fn upsert(&mut self, mut descriptor: DeviceDescriptor) {
        if let Some(existing) = self.devices.get(&descriptor.unique_id) {
            descriptor.monitor_index = existing.monitor_index;
        }
        self.devices
            .insert(descriptor.unique_id.clone(), descriptor);
    }

    #[allow(clippy::too_many_arguments)]
    fn describe(
        &self,
        platform_kind: ClPlatformKind,
        platform_name: &str,
        platform_version: &str,
        platform_major: u32,
        platform_minor: u32,
        platform_ordinal: usize,
        device_ordinal: usize,
        id: cl_device_id,
    ) -> Result<Option<DeviceDescriptor>> {
        let device = Device::new(id);
        let name = device
            .name()
            .map_err(|err| anyhow!("failed to query device name: {err:?}"))?;
        let raw_type = device
            .dev_type()
            .map_err(|err| anyhow!("failed to query device type: {err:?}"))?;
        let device_kind = classify_device(raw_type);

        let mut nv_compute_major = 0;
        let mut nv_compute_minor = 0;
        if platform_kind == ClPlatformKind::Nvidia {
            nv_compute_major = raw_info_u32(id, CL_DEVICE_COMPUTE_CAPABILITY_MAJOR_NV).unwrap_or(0);
            nv_compute_minor = raw_info_u32(id, CL_DEVICE_COMPUTE_CAPABILITY_MINOR_NV).unwrap_or(0);
        }

        let Some(unique_id) = derive_unique_id(
            platform_kind,
            device_kind,
            platform_ordinal,
            device_ordinal,
            id,
        ) else {
            warn!("skipping device {name:?} on {platform_name:?}: no stable identity");
            return Ok(None);
        };

        let max_compute_units = correct_compute_units(
            device
                .max_compute_units()
                .map_err(|err| anyhow!("failed to query compute units: {err:?}"))?,
        );

        Ok(Some(DeviceDescriptor {
            name,
            unique_id,
            platform_kind,
            device_kind,
            platform_name: platform_name.to_string(),
            platform_version: platform_version.to_string(),
            platform_major,
            platform_minor,
            platform_ordinal,
            device_ordinal,
            device_version: device
                .version()
                .map_err(|err| anyhow!("failed to query device version: {err:?}"))?,
            total_memory: device
                .global_mem_size()
                .map_err(|err| anyhow!("failed to query device memory: {err:?}"))?,
            max_mem_alloc: device
                .max_mem_alloc_size()
                .map_err(|err| anyhow!("failed to query max allocation size: {err:?}"))?,
            max_work_group_size: device
                .max_work_group_size()
                .map_err(|err| anyhow!("failed to query max work-group size: {err:?}"))?,
            max_compute_units,
            nv_compute_major,
            nv_compute_minor,
            monitor_index: None,
        }))
    }
}

/// GPU and accelerator devices for one platform; an empty result is normal
/// for platforms that only expose CPUs.
fn platform_devices(platform: &Platform) -> Result<Vec<cl_device_id>> {
    match platform.get_devices(CL_DEVICE_TYPE_GPU | CL_DEVICE_TYPE_ACCELERATOR) {
        Ok(ids) => Ok(ids),
        Err(err) if err.0 == CL_DEVICE_NOT_FOUND => Ok(Vec::new()),
        Err(err) => Err(anyhow!("failed to enumerate devices: {err:?}").into()),
    }
}

/// Map a platform name onto one of the four recognized driver families.
pub fn classify_platform(name: &str) -> Option<ClPlatformKind> {
    if name == "AMD Accelerated Parallel Processing" {
        return Some(ClPlatformKind::Amd);
    }
    if name == "Clover" || name == "Intel Gen OCL Driver" {
        return Some(ClPlatformKind::Clover);
    }
    if name == "NVIDIA CUDA" {
        return Some(ClPlatformKind::Nvidia);
    }
    if name.contains("Intel") {
        return Some(ClPlatformKind::Intel);
    }
    None
}

pub fn classify_device(raw_type: u64) -> ClDeviceKind {
    if raw_type & CL_DEVICE_TYPE_CPU != 0 {
        ClDeviceKind::Cpu
    } else if raw_type & CL_DEVICE_TYPE_ACCELERATOR != 0 {
        ClDeviceKind::Accelerator
    } else {
        ClDeviceKind::Gpu
    }
}

/// Some drivers report 14 compute units for 36-CU parts.
pub fn correct_compute_units(reported: u32) -> u32 {
    if reported == 14 {
        36
    } else {
        reported
    }
}

/// `"OpenCL 1.2 CUDA 11.4"` → `(1, 2)`. Unparseable strings give `(0, 0)`,
/// which the version gate then rejects.
pub fn parse_cl_version(version: &str) -> (u32, u32) {
    let Some(rest) = version.strip_prefix("OpenCL ") else {
        return (0, 0);
    };
    let numbers = rest.split_whitespace().next().unwrap_or("");
    let mut parts = numbers.split('.');
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor)
}

/// PCI address `bus:slot.function` from the NVIDIA info extension words.
pub fn nvidia_pci_id(bus: u32, raw_slot: u32) -> String {
    format!("{:02x}:{:02x}.{:x}", bus, raw_slot >> 3, raw_slot & 0x7)
}

/// PCI address from the 24-byte AMD topology struct: bus, device and
/// function live in the last three bytes.
pub fn amd_pci_id(topology: &[u8]) -> Option<String> {
    if topology.len() < 24 {
        return None;
    }
    Some(format!(
        "{:02x}:{:02x}.{:x}",
        topology[21], topology[22], topology[23]
    ))
}

pub fn intel_gpu_id(platform_ordinal: usize, device_ordinal: usize) -> String {
    format!("Intel GPU {platform_ordinal}.{device_ordinal}")
}

pub fn cpu_id(platform_ordinal: usize, device_ordinal: usize) -> String {
    format!("CPU:{:02x}", platform_ordinal + device_ordinal)
}

/// Which identity derivation applies to a platform/device pairing; `None`
/// marks combinations the catalog skips (the ordinal still advances).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentityRule {
    NvidiaPci,
    AmdPci,
    IntelOrdinal,
    CpuOrdinal,
}

fn identity_rule(platform: ClPlatformKind, device: ClDeviceKind) -> Option<IdentityRule> {
    match device {
        ClDeviceKind::Cpu => Some(IdentityRule::CpuOrdinal),
        ClDeviceKind::Gpu => Some(match platform {
            ClPlatformKind::Nvidia => IdentityRule::NvidiaPci,
            ClPlatformKind::Amd | ClPlatformKind::Clover => IdentityRule::AmdPci,
            ClPlatformKind::Intel => IdentityRule::IntelOrdinal,
        }),
        ClDeviceKind::Accelerator => None,
    }
}

fn derive_unique_id(
    platform_kind: ClPlatformKind,
    device_kind: ClDeviceKind,
    platform_ordinal: usize,
    device_ordinal: usize,
    id: cl_device_id,
) -> Option<String> {
    match identity_rule(platform_kind, device_kind)? {
        IdentityRule::CpuOrdinal => Some(cpu_id(platform_ordinal, device_ordinal)),
        IdentityRule::NvidiaPci => {
            let bus = raw_info_u32(id, CL_DEVICE_PCI_BUS_ID_NV)?;
            let slot = raw_info_u32(id, CL_DEVICE_PCI_SLOT_ID_NV)?;
            Some(nvidia_pci_id(bus, slot))
        }
        IdentityRule::AmdPci => {
            let topology = raw_info_bytes(id, CL_DEVICE_TOPOLOGY_AMD)?;
            amd_pci_id(&topology)
        }
        IdentityRule::IntelOrdinal => Some(intel_gpu_id(platform_ordinal, device_ordinal)),
    }
}

fn raw_info_bytes(id: cl_device_id, param: u32) -> Option<Vec<u8>> {
    match cl3::device::get_device_info(id, param) {
        Ok(InfoType::VecUchar(bytes)) => Some(bytes),
        _ => None,
    }
}

fn raw_info_u32(id: cl_device_id, param: u32) -> Option<u32> {
    let bytes = raw_info_bytes(id, param)?;
    let words: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(u32::from_ne_bytes(words))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_classification_is_exact_for_known_names() {
        assert_eq!(
            classify_platform("AMD Accelerated Parallel Processing"),
            Some(ClPlatformKind::Amd)
        );
        assert_eq!(classify_platform("Clover"), Some(ClPlatformKind::Clover));
        assert_eq!(
            classify_platform("Intel Gen OCL Driver"),
            Some(ClPlatformKind::Clover)
        );
        assert_eq!(classify_platform("NVIDIA CUDA"), Some(ClPlatformKind::Nvidia));
        assert_eq!(
            classify_platform("Intel(R) OpenCL Graphics"),
            Some(ClPlatformKind::Intel)
        );
        assert_eq!(classify_platform("Apple"), None);
        // Substring matches must not shadow the exact names.
        assert_eq!(classify_platform("NVIDIA"), None);
    }

    #[test]
    fn platform_macro_codes() {
        assert_eq!(ClPlatformKind::Clover.code(), 1);
        assert_eq!(ClPlatformKind::Amd.code(), 2);
        assert_eq!(ClPlatformKind::Nvidia.code(), 3);
        assert_eq!(ClPlatformKind::Intel.code(), 4);
    }

    #[test]
    fn device_type_bits() {
        assert_eq!(classify_device(CL_DEVICE_TYPE_GPU), ClDeviceKind::Gpu);
        assert_eq!(classify_device(CL_DEVICE_TYPE_CPU), ClDeviceKind::Cpu);
        assert_eq!(
            classify_device(CL_DEVICE_TYPE_ACCELERATOR),
            ClDeviceKind::Accelerator
        );
    }

    #[test]
    fn compute_unit_quirk() {
        assert_eq!(correct_compute_units(14), 36);
        assert_eq!(correct_compute_units(32), 32);
        assert_eq!(correct_compute_units(15), 15);
    }

    #[test]
    fn version_parsing() {
        assert_eq!(parse_cl_version("OpenCL 1.2 CUDA 11.4.112"), (1, 2));
        assert_eq!(parse_cl_version("OpenCL 3.0"), (3, 0));
        assert_eq!(parse_cl_version("OpenCL 1.1 Mesa 20.2.6"), (1, 1));
        assert_eq!(parse_cl_version("garbage"), (0, 0));
    }

    #[test]
    fn nvidia_pci_formatting() {
        // Raw slot word packs the device in bits 7..3 and function in 2..0.
        assert_eq!(nvidia_pci_id(0x01, 0x00), "01:00.0");
        assert_eq!(nvidia_pci_id(0x65, (0x04 << 3) | 1), "65:04.1");
    }

    #[test]
    fn amd_pci_from_topology_tail() {
        let mut topology = vec![0u8; 24];
        topology[21] = 0x28;
        topology[22] = 0x00;
        topology[23] = 0x01;
        assert_eq!(amd_pci_id(&topology).as_deref(), Some("28:00.1"));
        assert_eq!(amd_pci_id(&[0u8; 10]), None);
    }

    #[test]
    fn fallback_identities() {
        assert_eq!(intel_gpu_id(1, 0), "Intel GPU 1.0");
        assert_eq!(cpu_id(1, 2), "CPU:03");
    }

    #[test]
    fn only_gpu_and_cpu_devices_get_identities() {
        assert_eq!(
            identity_rule(ClPlatformKind::Nvidia, ClDeviceKind::Gpu),
            Some(IdentityRule::NvidiaPci)
        );
        assert_eq!(
            identity_rule(ClPlatformKind::Amd, ClDeviceKind::Gpu),
            Some(IdentityRule::AmdPci)
        );
        assert_eq!(
            identity_rule(ClPlatformKind::Clover, ClDeviceKind::Gpu),
            Some(IdentityRule::AmdPci)
        );
        assert_eq!(
            identity_rule(ClPlatformKind::Intel, ClDeviceKind::Gpu),
            Some(IdentityRule::IntelOrdinal)
        );
        assert_eq!(
            identity_rule(ClPlatformKind::Intel, ClDeviceKind::Cpu),
            Some(IdentityRule::CpuOrdinal)
        );
        // Accelerator-type devices are skipped on every platform.
        assert_eq!(identity_rule(ClPlatformKind::Nvidia, ClDeviceKind::Accelerator), None);
        assert_eq!(identity_rule(ClPlatformKind::Amd, ClDeviceKind::Accelerator), None);
        assert_eq!(identity_rule(ClPlatformKind::Intel, ClDeviceKind::Accelerator), None);
    }

    fn descriptor(unique_id: &str, name: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            name: name.to_string(),
            unique_id: unique_id.to_string(),
            platform_kind: ClPlatformKind::Amd,
            device_kind: ClDeviceKind::Gpu,
            platform_name: "AMD Accelerated Parallel Processing".to_string(),
            platform_version: "OpenCL 2.0".to_string(),
            platform_major: 2,
            platform_minor: 0,
            platform_ordinal: 0,
            device_ordinal: 0,
            device_version: "OpenCL 2.0".to_string(),
            total_memory: 8 << 30,
            max_mem_alloc: 4 << 30,
            max_work_group_size: 256,
            max_compute_units: 36,
            nv_compute_major: 0,
            nv_compute_minor: 0,
            monitor_index: None,
        }
    }

    #[test]
    fn rescan_preserves_monitor_binding() {
        let mut catalog = DeviceCatalog::new();
        catalog.upsert(descriptor("28:00.0", "Radeon RX 470"));
        assert!(catalog.bind_monitor("28:00.0", 3));
        assert!(!catalog.bind_monitor("ff:00.0", 0));

        // A rescan refreshes the entry but keeps the binding.
        let mut refreshed = descriptor("28:00.0", "Radeon RX 470 (refreshed)");
        refreshed.max_compute_units = 32;
        catalog.upsert(refreshed);

        let entry = catalog.get("28:00.0").unwrap();
        assert_eq!(entry.monitor_index, Some(3));
        assert_eq!(entry.max_compute_units, 32);
        assert_eq!(catalog.len(), 1);
    }
}
