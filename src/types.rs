use std::time::Instant;

/// Start nonces are truncated to 31 bits before being handed to the kernel.
/// The kernel receives the low 32 bits as its launch argument while the host
/// keeps the full value for reconstructing reported nonces.
pub const START_NONCE_MASK: u64 = 0x7fff_ffff;

/// One unit of mining work handed down by the farm.
///
/// Packages are compared by `header` to detect work changes between loop
/// iterations; a change in `epoch` forces a kernel rebuild first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPackage {
    pub epoch: u64,
    pub header: [u8; 32],
    pub boundary: [u8; 32],
    pub start_nonce: u64,
}

impl WorkPackage {
    /// The 32-bit search target, or `None` when the boundary is too loose to
    /// be meaningful (an all-zero target would accept every hash).
    pub fn target(&self) -> Option<u64> {
        let target = boundary_target(&self.boundary);
        (target != 0).then_some(target)
    }
}

/// Upper 64 bits of the big-endian boundary, masked to 32 bits:
/// `(boundary >> 192) & 0xFFFFFFFF`.
pub fn boundary_target(boundary: &[u8; 32]) -> u64 {
    let word = [boundary[4], boundary[5], boundary[6], boundary[7]];
    u64::from(u32::from_be_bytes(word))
}

/// A verified candidate reported up to the farm. Carries a snapshot of the
/// work package the kernel was searching when the candidate was produced.
#[derive(Debug, Clone)]
pub struct Solution {
    pub nonce: u64,
    pub mix_hash: [u8; 32],
    pub work: WorkPackage,
    pub found_at: Instant,
    pub device_index: usize,
}

pub fn format_memory(bytes: u64) -> String {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    let bytes = bytes as f64;
    if bytes >= GIB {
        return format!("{:.2} GB", bytes / GIB);
    }
    if bytes >= MIB {
        return format!("{:.2} MB", bytes / MIB);
    }
    format!("{bytes:.0} B")
}

pub fn format_hashrate(hps: f64) -> String {
    if hps >= 1_000_000_000.0 {
        return format!("{:.3} GH/s", hps / 1_000_000_000.0);
    }
    if hps >= 1_000_000.0 {
        return format!("{:.3} MH/s", hps / 1_000_000.0);
    }
    if hps >= 1_000.0 {
        return format!("{:.3} KH/s", hps / 1_000.0);
    }
    format!("{hps:.3} H/s")
}
