//! Binary layout of the shared host/device result buffer.
//!
//! The buffer is a flat array of 32-bit words the kernel and host agree on:
//!
//! ```text
//! word  0..64   four result slots, 16 words each (gid + 8 mix words + pad)
//! word  64      count:     atomically incremented by the kernel
//! word  65      hashCount: incremented once per work group in single-shot
//!                          builds (the host scales by the group width)
//! word  66      abortFlag: host-set, polled by persistent kernels
//! ```

use std::ffi::c_void;

use anyhow::anyhow;
use opencl3::types::{cl_command_queue, cl_mem, CL_BLOCKING};

use crate::error::Result;

pub const MAX_SEARCH_RESULTS: u32 = 4;
pub const RESULT_STRIDE_WORDS: usize = 16;
pub const COUNT_WORD: usize = MAX_SEARCH_RESULTS as usize * RESULT_STRIDE_WORDS;
pub const HASH_COUNT_WORD: usize = COUNT_WORD + 1;
pub const ABORT_WORD: usize = COUNT_WORD + 2;
pub const SEARCH_BUFFER_WORDS: usize = ABORT_WORD + 1;

pub const COUNT_OFFSET_BYTES: usize = COUNT_WORD * 4;
pub const ABORT_OFFSET_BYTES: usize = ABORT_WORD * 4;

/// One kernel-reported candidate: the global work-item id that produced it
/// plus the 8-word mix digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    pub gid: u32,
    pub mix: [u32; 8],
}

impl SearchResult {
    /// Mix digest as the 32-byte little-endian array reported upstream.
    pub fn mix_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(self.mix.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }
}

/// Everything read back from the device in one harvest.
#[derive(Debug, Clone, Default)]
pub struct Harvest {
    pub results: Vec<SearchResult>,
    pub hash_count: u32,
}

/// The kernel may race past `MAX_OUTPUTS` before the host resets the counter;
/// the extra slots were never written.
pub fn clamp_count(raw: u32) -> u32 {
    raw.min(MAX_SEARCH_RESULTS)
}

/// Decode `count` result slots from the word-level buffer image.
pub fn decode_results(words: &[u32], count: u32) -> Vec<SearchResult> {
    let count = clamp_count(count) as usize;
    let mut results = Vec::with_capacity(count);
    for slot in 0..count {
        let base = slot * RESULT_STRIDE_WORDS;
        let mut mix = [0u32; 8];
        mix.copy_from_slice(&words[base + 1..base + 9]);
        results.push(SearchResult {
            gid: words[base],
            mix,
        });
    }
    results
}

/// Raw handles needed to poke the abort flag from the owner thread while the
/// scheduler thread keeps using the typed wrappers. The handles stay valid
/// for as long as the scheduler keeps the owning program alive; the scheduler
/// clears the installed handle before tearing the program down.
#[derive(Debug, Clone, Copy)]
pub struct AbortHandle {
    queue: cl_command_queue,
    buffer: cl_mem,
}

// Raw pointers to retained OpenCL objects; the API is thread-safe for
// enqueue calls on distinct threads.
unsafe impl Send for AbortHandle {}

impl AbortHandle {
    pub(crate) fn new(queue: cl_command_queue, buffer: cl_mem) -> Self {
        Self { queue, buffer }
    }

    /// Set the in-buffer abort flag so a persistent kernel drains early.
    pub(crate) fn signal_abort(&self) -> Result<()> {
        let one: u32 = 1;
        unsafe {
            let event = cl3::command_queue::enqueue_write_buffer(
                self.queue,
                self.buffer,
                CL_BLOCKING,
                ABORT_OFFSET_BYTES,
                std::mem::size_of::<u32>(),
                &one as *const u32 as *const c_void,
                0,
                std::ptr::null(),
            )
            .map_err(|err| anyhow!("failed to write abort flag: {err:?}"))?;
            cl3::event::release_event(event)
                .map_err(|err| anyhow!("failed to release abort event: {err:?}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_layout_offsets() {
        assert_eq!(COUNT_WORD, 64);
        assert_eq!(HASH_COUNT_WORD, 65);
        assert_eq!(ABORT_WORD, 66);
        assert_eq!(SEARCH_BUFFER_WORDS, 67);
        assert_eq!(COUNT_OFFSET_BYTES, 256);
        assert_eq!(ABORT_OFFSET_BYTES, 264);
    }

    #[test]
    fn count_is_clamped_to_slot_capacity() {
        assert_eq!(clamp_count(0), 0);
        assert_eq!(clamp_count(3), 3);
        assert_eq!(clamp_count(4), 4);
        assert_eq!(clamp_count(17), 4);
        assert_eq!(clamp_count(u32::MAX), 4);
    }

    #[test]
    fn decode_reads_strided_slots() {
        let mut words = vec![0u32; SEARCH_BUFFER_WORDS];
        words[0] = 0xdead_0001;
        words[1..9].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        words[RESULT_STRIDE_WORDS] = 0xdead_0002;
        words[RESULT_STRIDE_WORDS + 1] = 99;

        let results = decode_results(&words, 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].gid, 0xdead_0001);
        assert_eq!(results[0].mix, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(results[1].gid, 0xdead_0002);
        assert_eq!(results[1].mix[0], 99);
    }

    #[test]
    fn decode_with_overflowed_count_stays_in_bounds() {
        let words = vec![0u32; SEARCH_BUFFER_WORDS];
        let results = decode_results(&words, 1000);
        assert_eq!(results.len(), 4);
    }

    #[test]
    fn mix_bytes_are_little_endian_per_word() {
        let result = SearchResult {
            gid: 0,
            mix: [0x0403_0201, 0, 0, 0, 0, 0, 0, 0x0807_0605],
        };
        let bytes = result.mix_bytes();
        assert_eq!(&bytes[..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[28..], &[0x05, 0x06, 0x07, 0x08]);
    }
}
