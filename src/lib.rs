//! Host-side OpenCL execution engine for a Keccak proof-of-work search.
//!
//! The crate drives one accelerator device per [`scheduler::ClMiner`]:
//! enumerate devices with a [`catalog::DeviceCatalog`], hand each miner a
//! [`farm::Farm`] implementation for work and solutions, and `kick` the miner
//! whenever new work lands. The scheduler keeps one kernel launch in flight
//! while harvesting the results of the previous one.

pub mod catalog;
pub mod error;
pub mod farm;
pub mod results;
pub mod scheduler;
pub mod session;
pub mod types;

mod program;
mod signal;

pub use catalog::{ClDeviceKind, ClPlatformKind, DeviceCatalog, DeviceDescriptor};
pub use error::{MinerError, Result};
pub use farm::Farm;
pub use scheduler::{ClMiner, MinerState};
pub use session::{DeviceSession, ExecutionMode, HwMonitorInfo, MonitorKind, Settings};
pub use types::{Solution, WorkPackage};
