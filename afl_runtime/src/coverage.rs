//! Edge coverage recording: the location hash and the decayed
//! previous-location scheme the external supervisor expects.

use core::ops::DerefMut;

use crate::shmem::MAP_SIZE;

const LHASH_INIT: u32 = 0x811C_9DC5;
const LHASH_MAGIC_MULT: u32 = 0x0100_0193;

#[inline]
fn lhash_next(h: u32, byte: u8) -> u32 {
    (h ^ u32::from(byte)).wrapping_mul(LHASH_MAGIC_MULT)
}

/// Hash a code-site identifier (e.g. a file path) and an offset (e.g. a line
/// number) into a bucket index in `[0, MAP_SIZE)`.
///
/// Bit-exact across implementations: supervisors compare maps produced by
/// runtimes in different languages, so the mixing constants, the
/// start-to-end byte order over `key`, and the low-byte-first walk over
/// `offset` must never change. Pure and side-effect free; callable from any
/// thread.
#[must_use]
pub fn location_hash(key: &str, mut offset: u64) -> usize {
    let mut h = LHASH_INIT;
    for byte in key.bytes() {
        h = lhash_next(h, byte);
    }
    while offset != 0 {
        h = lhash_next(h, (offset & 0xFF) as u8);
        offset >>= 8;
    }
    h as usize % MAP_SIZE
}

/// Records executed edges into a coverage map.
///
/// An edge is approximated as `location ^ (previous location >> 1)`. The
/// right shift keeps a simple A→B→A loop from xor-canceling its own signal
/// and is part of the wire contract, like the 8-bit *wrapping* counter
/// increment (255 + 1 == 0 on purpose, saturation would skew the
/// supervisor's hit-count buckets).
///
/// Generic over the map storage so production code records straight into an
/// attached [`crate::shmem::AflShMem`] while tests use a heap buffer.
#[derive(Debug)]
pub struct CoverageRecorder<M> {
    map: M,
    prev_location: usize,
}

impl<M> CoverageRecorder<M>
where
    M: DerefMut<Target = [u8]>,
{
    /// Wrap a coverage map, starting with a zero previous location
    pub fn new(map: M) -> Self {
        debug_assert_eq!(map.len(), MAP_SIZE);
        Self {
            map,
            prev_location: 0,
        }
    }

    /// Record one executed code site.
    ///
    /// The only observable effect is the shared-memory counter update.
    /// Not safe for concurrent callers within one process; racing forked
    /// children are tolerated by design.
    pub fn record(&mut self, key: &str, offset: u64) {
        let location = location_hash(key, offset);
        let edge = location ^ self.prev_location;
        log::trace!("{key}:{offset} -> edge {edge:#x}");
        self.map[edge] = self.map[edge].wrapping_add(1);
        self.prev_location = location >> 1;
    }

    /// Forget the previous location, e.g. at a test-case boundary
    pub fn reset(&mut self) {
        self.prev_location = 0;
    }

    /// The underlying coverage map
    pub fn map(&self) -> &[u8] {
        &self.map
    }
}

#[cfg(test)]
mod tests {
    use super::{location_hash, CoverageRecorder};
    use crate::shmem::MAP_SIZE;

    fn fixture_map() -> Vec<u8> {
        vec![0_u8; MAP_SIZE]
    }

    #[test]
    fn test_hash_range_and_determinism() {
        for (key, offset) in [
            ("", 0),
            ("a", 0),
            ("lib/parser.rb", 17),
            ("/very/long/path/with/many/components.rs", u64::MAX),
        ] {
            let first = location_hash(key, offset);
            assert!(first < MAP_SIZE);
            assert_eq!(first, location_hash(key, offset));
        }
    }

    /// Reference values computed with an independent implementation of the
    /// documented algorithm. These pin down the mixing constants and both
    /// byte traversal directions; do not regenerate them from this crate.
    #[test]
    fn test_hash_golden_vectors() {
        for (key, offset, expected) in [
            ("", 0, 0x9DC5),
            ("a", 1, 0xD1D7),
            ("b", 2, 0x42A5),
            ("harness.rb", 1, 0x6AEA),
            ("harness.rb", 2, 0x6957),
            ("lib/parser.rb", 42, 0x30BA),
            ("lib/parser.rb", 4096, 0x20A4),
            ("/usr/lib/app/runner.rb", 65535, 0x6959),
            ("main.rs", 123_456_789, 0x8DA5),
        ] {
            assert_eq!(
                location_hash(key, offset),
                expected,
                "hash mismatch for {key}:{offset}"
            );
        }
    }

    #[test]
    fn test_first_record_hits_plain_location() {
        let mut recorder = CoverageRecorder::new(fixture_map());
        recorder.record("a", 1);
        // prev_location was 0, so the edge is the location itself
        assert_eq!(recorder.map()[location_hash("a", 1)], 1);
    }

    #[test]
    fn test_decay_propagation() {
        let mut recorder = CoverageRecorder::new(fixture_map());
        recorder.record("a", 1);
        recorder.record("b", 2);

        let decayed = location_hash("b", 2) ^ (location_hash("a", 1) >> 1);
        let undecayed = location_hash("b", 2) ^ location_hash("a", 1);
        assert_eq!(recorder.map()[decayed], 1);
        assert_eq!(recorder.map()[undecayed], 0);
    }

    #[test]
    fn test_counter_wraps_to_zero() {
        let mut recorder = CoverageRecorder::new(fixture_map());
        let slot = location_hash("hot_loop.rs", 7);
        for _ in 0..255 {
            recorder.record("hot_loop.rs", 7);
            recorder.reset();
        }
        assert_eq!(recorder.map()[slot], 255);

        recorder.record("hot_loop.rs", 7);
        assert_eq!(recorder.map()[slot], 0, "counter must wrap, not saturate");
    }

    #[test]
    fn test_reset_clears_history() {
        let mut recorder = CoverageRecorder::new(fixture_map());
        recorder.record("a", 1);
        recorder.reset();
        recorder.record("b", 2);
        // after a reset the second record behaves like a first one
        assert_eq!(recorder.map()[location_hash("b", 2)], 1);
    }
}
