//! Property-based tests for weir-core.
//!
//! Tests pool accounting, best-fit leasing and byte/metadata integrity
//! through module chains using proptest for randomized input generation.

use proptest::prelude::*;
use weir_core::{BufferPool, MediaFormat, Metadata, PoolConfig, PoolError, TopologyBuilder};

/// Two passthrough modules in series, 1 ch 16-bit, 192 bytes per port.
fn two_stage() -> (weir_core::Topology, weir_core::InPortId, weir_core::OutPortId) {
    let fmt = MediaFormat::pcm(1, 48_000, 2);
    let mut b = TopologyBuilder::new();
    let a = b.add_passthrough("a");
    let c = b.add_passthrough("c");
    let input = b.add_input(a, fmt, 192).unwrap();
    let a_out = b.add_output(a, fmt, 192).unwrap();
    let c_in = b.add_input(c, fmt, 192).unwrap();
    let output = b.add_output(c, fmt, 192).unwrap();
    b.connect(a_out, c_in).unwrap();
    (b.build().unwrap(), input, output)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// For any sequence of lease and release operations, every leased
    /// block is at least as large as requested and the counters stay
    /// consistent: allocated = leased + free.
    #[test]
    fn pool_counters_stay_consistent(
        ops in prop::collection::vec((1usize..512, any::<bool>()), 1..64),
    ) {
        let mut pool = BufferPool::new(PoolConfig::default());
        let mut held = Vec::new();

        for (size, release) in ops {
            if release && !held.is_empty() {
                let id = held.swap_remove(size % held.len());
                prop_assert!(pool.release(id).unwrap());
            } else {
                let id = pool.acquire(size).unwrap().unwrap();
                prop_assert!(pool.block_size(id).unwrap() >= size);
                prop_assert_eq!(pool.ref_count(id), Some(1));
                held.push(id);
            }

            let s = pool.stats();
            prop_assert_eq!(s.allocated_blocks, s.leased_blocks + s.free_blocks);
            prop_assert_eq!(s.leased_blocks, held.len());
            prop_assert!(s.peak_leased_blocks >= s.leased_blocks);
        }
    }

    /// A lease picks the smallest free block that fits, and only allocates
    /// when none does.
    #[test]
    fn pool_leases_best_fit(
        sizes in prop::collection::vec(1usize..1024, 1..16),
        want in 1usize..1024,
    ) {
        let mut pool = BufferPool::new(PoolConfig::default());
        let ids: Vec<_> = sizes.iter().map(|&s| pool.acquire(s).unwrap().unwrap()).collect();
        for id in ids {
            pool.release(id).unwrap();
        }

        let expected = pool.free_sizes().filter(|&s| s >= want).min();
        let allocated_before = pool.stats().allocated_blocks;
        let id = pool.acquire(want).unwrap().unwrap();

        match expected {
            Some(size) => {
                prop_assert_eq!(pool.block_size(id), Some(size));
                prop_assert_eq!(pool.stats().allocated_blocks, allocated_before);
            }
            None => {
                prop_assert_eq!(pool.block_size(id), Some(want));
                prop_assert_eq!(pool.stats().allocated_blocks, allocated_before + 1);
            }
        }
    }

    /// Extra leases keep a block out of the free list until the last one
    /// is dropped; one release too many is rejected.
    #[test]
    fn shared_lease_returns_once(extra in 1u32..8, size in 1usize..256) {
        let mut pool = BufferPool::new(PoolConfig::default());
        let id = pool.acquire(size).unwrap().unwrap();
        for _ in 0..extra {
            pool.add_ref(id).unwrap();
        }
        for _ in 0..extra {
            prop_assert!(!pool.release(id).unwrap());
            prop_assert_eq!(pool.stats().free_blocks, 0);
        }
        prop_assert!(pool.release(id).unwrap());
        prop_assert_eq!(pool.release(id), Err(PoolError::DoubleRelease(id)));
        prop_assert_eq!(pool.add_ref(id), Err(PoolError::DoubleRelease(id)));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Any whole-sample payload that fits passes through a two-module chain
    /// unchanged, and every block is back in the pool after the drain.
    #[test]
    fn chain_preserves_bytes(
        samples in prop::collection::vec(any::<u8>(), 1..=96),
    ) {
        let payload: Vec<u8> = samples.iter().flat_map(|&b| [b, b.wrapping_add(1)]).collect();
        let (mut topo, input, output) = two_stage();

        prop_assert_eq!(topo.push_input(input, &payload).unwrap(), payload.len());
        let report = topo.process_cycle().unwrap();
        prop_assert_eq!(report.process_calls, 2);
        prop_assert_eq!(report.dropped_bytes, 0);

        let mut out = Vec::new();
        let drained = topo.drain_output(output, &mut out).unwrap();
        prop_assert_eq!(drained.len, payload.len());
        prop_assert_eq!(out, payload);
        prop_assert_eq!(topo.pool().stats().leased_blocks, 0);
    }

    /// Metadata attached inside the data keeps its offset through the chain.
    #[test]
    fn metadata_keeps_offset(frames in 1u32..=96, at in 0u32..96, id in any::<u32>()) {
        let len = frames * 2;
        let offset = (at % frames) * 2;
        let (mut topo, input, output) = two_stage();

        topo.push_metadata(input, Metadata::new(id, offset)).unwrap();
        topo.push_input(input, &vec![3u8; len as usize]).unwrap();
        topo.process_cycle().unwrap();

        let mut out = Vec::new();
        let drained = topo.drain_output(output, &mut out).unwrap();
        let got: Vec<_> = drained.metadata.iter().map(|m| (m.id, m.offset)).collect();
        prop_assert_eq!(got, vec![(id, offset)]);
    }
}
