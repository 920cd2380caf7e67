//! Per-device mining scheduler: one thread driving the double-buffered
//! poll/launch loop against a bound device.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use log::{debug, error, info, warn};

use crate::catalog::DeviceDescriptor;
use crate::error::{MinerError, Result};
use crate::farm::Farm;
use crate::program::EpochProgram;
use crate::results::{AbortHandle, Harvest};
use crate::session::{DeviceSession, ExecutionMode, Settings};
use crate::signal::WakeSignal;
use crate::types::{Solution, WorkPackage, START_NONCE_MASK};

/// How long the scheduler parks when the farm has nothing, and how often a
/// paused or idle thread rechecks the stop flag.
const WORK_WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerState {
    Uninitialized,
    DeviceBound,
    ProgramBuilt,
    Running,
    Paused,
    Stopped,
}

/// Accumulated hash counter with a windowed rate snapshot on top.
#[derive(Debug)]
pub struct HashRate {
    count: AtomicU64,
    window: Mutex<RateWindow>,
}

#[derive(Debug)]
struct RateWindow {
    since: Instant,
    rate: f64,
}

impl HashRate {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            window: Mutex::new(RateWindow {
                since: Instant::now(),
                rate: 0.0,
            }),
        }
    }

    fn note(&self, hashes: u64) {
        self.count.fetch_add(hashes, Ordering::Relaxed);
    }

    /// Hashes accumulated since the last call, resetting the counter.
    pub fn take_hashes(&self) -> u64 {
        self.count.swap(0, Ordering::Relaxed)
    }

    /// Hashes per second over the window since the previous sample.
    pub fn sample(&self) -> f64 {
        let mut window = self.window.lock().unwrap();
        let now = Instant::now();
        let taken = self.take_hashes();
        let secs = now.duration_since(window.since).as_secs_f64();
        window.since = now;
        if secs > 0.0 {
            window.rate = taken as f64 / secs;
        }
        window.rate
    }
}

struct MinerShared {
    tag: String,
    stop: AtomicBool,
    state: Mutex<MinerState>,
    wake: WakeSignal,
    /// Installed while a persistent-kernel program is live; lets `kick` poke
    /// the in-buffer abort flag from the owner thread.
    abort: Mutex<Option<AbortHandle>>,
    rate: HashRate,
}

impl MinerShared {
    fn set_state(&self, state: MinerState) {
        *self.state.lock().unwrap() = state;
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// One OpenCL device miner. Owns the scheduler thread; `kick` is the owner's
/// signal that the farm has new work (or that the current work is stale).
pub struct ClMiner {
    index: usize,
    descriptor: DeviceDescriptor,
    settings: Settings,
    farm: Arc<dyn Farm>,
    shared: Arc<MinerShared>,
    handle: Option<JoinHandle<()>>,
}

impl ClMiner {
    pub fn new(
        index: usize,
        descriptor: DeviceDescriptor,
        settings: Settings,
        farm: Arc<dyn Farm>,
    ) -> Self {
        let shared = Arc::new(MinerShared {
            tag: format!("cl-{index}"),
            stop: AtomicBool::new(false),
            state: Mutex::new(MinerState::Uninitialized),
            wake: WakeSignal::new(),
            abort: Mutex::new(None),
            rate: HashRate::new(),
        });
        Self {
            index,
            descriptor,
            settings,
            farm,
            shared,
            handle: None,
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> MinerState {
        *self.shared.state.lock().unwrap()
    }

    pub fn take_hashes(&self) -> u64 {
        self.shared.rate.take_hashes()
    }

    pub fn hashrate(&self) -> f64 {
        self.shared.rate.sample()
    }

    /// Spawn the scheduler thread. Idempotent once running.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        self.shared.stop.store(false, Ordering::Relaxed);
        self.shared.wake.drain();

        let shared = Arc::clone(&self.shared);
        let descriptor = self.descriptor.clone();
        let settings = self.settings.clone();
        let farm = Arc::clone(&self.farm);
        let index = self.index;
        let handle = thread::Builder::new()
            .name(self.shared.tag.clone())
            .spawn(move || worker(shared, descriptor, settings, farm, index))
            .map_err(|err| anyhow!("failed to spawn scheduler thread: {err}"))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Wake the scheduler: new work is available or the current package went
    /// stale. On a persistent-kernel device this also sets the in-buffer
    /// abort flag so the running kernel drains early.
    pub fn kick(&self) {
        if let Some(abort) = self.shared.abort.lock().unwrap().as_ref() {
            if let Err(err) = abort.signal_abort() {
                warn!("{} abort signal failed: {err}", self.shared.tag);
            }
        }
        self.shared.wake.notify();
    }

    /// Request shutdown and join the scheduler thread.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.kick();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ClMiner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The work package a launch was bound to, with the masked start nonce its
/// arguments carried. Harvested results are interpreted against this, one
/// iteration behind the launch that is currently in flight.
struct BoundWork {
    work: WorkPackage,
    start_nonce: u64,
    target: u64,
}

/// Reconstruct solutions from a harvest, skipping a repeat of the last
/// reported nonce. Results are interpreted against the launch the harvest
/// belongs to, not the launch just enqueued.
fn extract_solutions(
    harvest: &Harvest,
    bound: &BoundWork,
    last_nonce: &mut Option<u64>,
    device_index: usize,
) -> Vec<Solution> {
    let mut solutions = Vec::new();
    for result in &harvest.results {
        let nonce = (bound.start_nonce << 32) | u64::from(result.gid);
        if *last_nonce == Some(nonce) {
            continue;
        }
        *last_nonce = Some(nonce);
        solutions.push(Solution {
            nonce,
            mix_hash: result.mix_bytes(),
            work: bound.work.clone(),
            found_at: Instant::now(),
            device_index,
        });
    }
    solutions
}

fn worker(
    shared: Arc<MinerShared>,
    descriptor: DeviceDescriptor,
    settings: Settings,
    farm: Arc<dyn Farm>,
    index: usize,
) {
    let session = match DeviceSession::open(&descriptor, &settings) {
        Ok(session) => session,
        Err(err) => {
            error!("{} failed to bind device: {err}", shared.tag);
            shared.set_state(MinerState::Stopped);
            return;
        }
    };
    shared.set_state(MinerState::DeviceBound);

    if let Err(err) = mine(&shared, &session, farm.as_ref(), index) {
        error!("{} scheduler stopped on error: {err}", shared.tag);
    }
    shared.set_state(MinerState::Stopped);
}

fn mine(
    shared: &MinerShared,
    session: &DeviceSession,
    farm: &dyn Farm,
    index: usize,
) -> Result<()> {
    let mut program: Option<EpochProgram> = None;
    let result = mining_loop(shared, session, farm, index, &mut program);

    // Release the raw abort handles before the objects they point into.
    *shared.abort.lock().unwrap() = None;
    if let Some(program) = program.take() {
        let _ = program.finish();
    }
    result
}

fn mining_loop(
    shared: &MinerShared,
    session: &DeviceSession,
    farm: &dyn Farm,
    index: usize,
    program: &mut Option<EpochProgram>,
) -> Result<()> {
    let mut program_epoch = 0u64;
    let mut bound: Option<BoundWork> = None;
    let mut last_nonce: Option<u64> = None;
    let mut next_nonce = 0u64;
    let mut announced_idle = false;

    while !shared.stopping() {
        // Harvest whatever the in-flight launch has produced so far.
        let harvest = match program.as_mut() {
            Some(program) => program.poll(session.mode)?,
            None => Harvest::default(),
        };
        if let Some(bound) = &bound {
            for solution in extract_solutions(&harvest, bound, &mut last_nonce, index) {
                info!(
                    "{} solution 0x{:016x} (header 0x{:02x}{:02x}…)",
                    shared.tag, solution.nonce, bound.work.header[0], bound.work.header[1]
                );
                farm.submit_proof(solution);
            }
            match session.mode {
                ExecutionMode::PersistentKernel => {
                    shared.rate.note(session.global_work_size as u64);
                }
                ExecutionMode::SingleShot => {
                    shared
                        .rate
                        .note(session.local_work_size as u64 * u64::from(harvest.hash_count));
                }
            }
        }

        let Some(work) = farm.work() else {
            if !announced_idle {
                info!("{} no work available; waiting", shared.tag);
                announced_idle = true;
            }
            shared.wake.wait_timeout(WORK_WAIT);
            continue;
        };
        announced_idle = false;

        // An epoch change invalidates the compiled kernel.
        if program.is_none() || program_epoch != work.epoch {
            *shared.abort.lock().unwrap() = None;
            *program = None;
            bound = None;

            match EpochProgram::build(session) {
                Ok(built) => {
                    if session.mode == ExecutionMode::PersistentKernel {
                        *shared.abort.lock().unwrap() = Some(built.abort_handle());
                    }
                    *program = Some(built);
                    program_epoch = work.epoch;
                    shared.set_state(MinerState::ProgramBuilt);
                }
                Err(MinerError::Build { log }) => {
                    error!("{} kernel build failed:\n{log}", shared.tag);
                    shared.set_state(MinerState::Paused);
                    // Parked until the owner kicks us with fresh work.
                    while !shared.stopping() {
                        if shared.wake.wait_timeout(WORK_WAIT) {
                            break;
                        }
                    }
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        let current = program.as_mut().ok_or_else(|| anyhow!("program not built"))?;

        // New header: rebind target and start nonce before the next launch.
        let switched = bound.as_ref().map(|b| b.work.header) != Some(work.header);
        let target = if switched {
            let switch_started = Instant::now();
            let Some(target) = work.target() else {
                error!("{} work package carries a zero target; ignoring it", shared.tag);
                bound = None;
                shared.wake.wait_timeout(WORK_WAIT);
                continue;
            };
            next_nonce = work.start_nonce & START_NONCE_MASK;
            current.push_header(&work.header)?;
            current.reset_counters()?;
            debug!(
                "{} work switch in {} us",
                shared.tag,
                switch_started.elapsed().as_micros()
            );
            target
        } else {
            match bound.as_ref() {
                Some(b) => b.target,
                None => continue,
            }
        };

        current.launch(
            target,
            next_nonce as u32,
            session.global_work_size,
            session.local_work_size,
        )?;
        shared.set_state(MinerState::Running);

        bound = Some(BoundWork {
            work,
            start_nonce: next_nonce,
            target,
        });
        next_nonce += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::SearchResult;

    fn bound_work(start_nonce: u64) -> BoundWork {
        BoundWork {
            work: WorkPackage {
                epoch: 7,
                header: [0xab; 32],
                boundary: {
                    let mut b = [0u8; 32];
                    b[4] = 1;
                    b
                },
                start_nonce,
            },
            start_nonce: start_nonce & START_NONCE_MASK,
            target: 0x0100_0000,
        }
    }

    fn harvest_with_gids(gids: &[u32]) -> Harvest {
        Harvest {
            results: gids
                .iter()
                .map(|&gid| SearchResult { gid, mix: [gid; 8] })
                .collect(),
            hash_count: 0,
        }
    }

    #[test]
    fn nonce_combines_start_nonce_and_gid() {
        let bound = bound_work(0x1234);
        let mut last = None;
        let solutions =
            extract_solutions(&harvest_with_gids(&[0xdead_beef]), &bound, &mut last, 0);
        assert_eq!(solutions.len(), 1);
        assert_eq!(solutions[0].nonce, (0x1234u64 << 32) | 0xdead_beef);
        assert_eq!(solutions[0].work.epoch, 7);
    }

    #[test]
    fn repeated_nonce_is_deduplicated() {
        let bound = bound_work(5);
        let mut last = None;
        let first = extract_solutions(&harvest_with_gids(&[42]), &bound, &mut last, 0);
        assert_eq!(first.len(), 1);

        // The kernel can report the same candidate again before the reset
        // lands; the repeat is dropped.
        let again = extract_solutions(&harvest_with_gids(&[42]), &bound, &mut last, 0);
        assert!(again.is_empty());

        let fresh = extract_solutions(&harvest_with_gids(&[43]), &bound, &mut last, 0);
        assert_eq!(fresh.len(), 1);
    }

    #[test]
    fn dedup_only_suppresses_consecutive_repeats() {
        let bound = bound_work(5);
        let mut last = None;
        let solutions = extract_solutions(&harvest_with_gids(&[1, 1, 2, 1]), &bound, &mut last, 0);
        let nonces: Vec<u64> = solutions.iter().map(|s| s.nonce & 0xffff_ffff).collect();
        assert_eq!(nonces, [1, 2, 1]);
    }

    #[test]
    fn start_nonce_is_masked_to_31_bits() {
        let bound = bound_work(u64::MAX);
        assert_eq!(bound.start_nonce, 0x7fff_ffff);
    }

    #[test]
    fn hash_rate_accumulates_and_swaps() {
        let rate = HashRate::new();
        rate.note(100);
        rate.note(28);
        assert_eq!(rate.take_hashes(), 128);
        assert_eq!(rate.take_hashes(), 0);
    }

    #[test]
    fn hash_rate_sample_is_finite() {
        let rate = HashRate::new();
        rate.note(1 << 20);
        std::thread::sleep(Duration::from_millis(10));
        let sample = rate.sample();
        assert!(sample.is_finite());
        assert!(sample > 0.0);
    }
}
