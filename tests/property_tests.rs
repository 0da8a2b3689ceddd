//! Property-based tests for permafrost
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

const MIB: usize = 1024 * 1024;

// ============================================================================
// Tree Hash Properties
// ============================================================================

mod tree_hash_properties {
    use super::*;
    use permafrost_files::tree_hash::{Digest, TreeHasher, combine, tree_hash};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        /// Hashing aligned parts and combining them equals hashing the whole
        #[test]
        fn combined_parts_match_whole(
            whole_mib in 1usize..6,
            tail in 0usize..4096,
            part_exp in 0u32..3,
            fill in any::<u8>(),
        ) {
            let data: Vec<u8> = (0..whole_mib * MIB + tail)
                .map(|i| (i as u8).wrapping_add(fill) ^ (i >> 20) as u8)
                .collect();
            let part_size = MIB << part_exp;

            let part_digests: Vec<Digest> = data
                .chunks(part_size)
                .map(|part| tree_hash(part).unwrap())
                .collect();

            prop_assert_eq!(combine(&part_digests), tree_hash(&data));
        }
    }

    fn digests(count: usize, seed: u8) -> Vec<Digest> {
        (0..count)
            .map(|i| {
                let mut digest = [seed; 32];
                digest[..8].copy_from_slice(&(i as u64).to_le_bytes());
                digest
            })
            .collect()
    }

    proptest! {
        /// Leaves supplied in any order produce the same root
        #[test]
        fn shuffled_updates_match_combine(
            (leaves, order) in (1usize..40).prop_flat_map(|n| {
                (Just(n), Just((0..n as u64).collect::<Vec<_>>()).prop_shuffle())
            }),
            seed in any::<u8>(),
        ) {
            let leaf_digests = digests(leaves, seed);
            let mut hasher = TreeHasher::new(leaves as u64);

            for (step, &index) in order.iter().enumerate() {
                prop_assert!(hasher.root().is_none() || step == leaves);
                hasher.update(index, leaf_digests[index as usize]).unwrap();
            }

            prop_assert!(hasher.is_complete());
            prop_assert_eq!(hasher.root(), combine(&leaf_digests));
            prop_assert_eq!(hasher.resident_nodes(), 1);
        }

        /// A leaf can only be supplied once
        #[test]
        fn duplicate_update_rejected(leaves in 1u64..20, pick in any::<prop::sample::Index>()) {
            let index = pick.index(leaves as usize) as u64;
            let mut hasher = TreeHasher::new(leaves);
            hasher.update(index, [0u8; 32]).unwrap();
            prop_assert!(hasher.update(index, [1u8; 32]).is_err());
        }
    }
}

// ============================================================================
// Chunk Sequencing Properties
// ============================================================================

mod sequence_properties {
    use super::*;
    use permafrost_core::TransferRecord;

    fn shuffled_offsets() -> impl Strategy<Value = (u64, u64, Vec<u64>)> {
        (1u64..64, 1u64..2000).prop_flat_map(|(chunk, total)| {
            let offsets: Vec<u64> = (0..total).step_by(chunk as usize).collect();
            (Just(chunk), Just(total), Just(offsets).prop_shuffle())
        })
    }

    proptest! {
        /// Completing every chunk in any order reaches the end with nothing pending
        #[test]
        fn any_order_converges((chunk, total, offsets) in shuffled_offsets()) {
            let mut record = TransferRecord::upload("vault", "/data/archive.bin", total, chunk).unwrap();

            for &offset in &offsets {
                prop_assert!(!record.is_sequence_complete());
                prop_assert!(record.add_sequence(offset).unwrap());
                prop_assert!(record.finished_size() <= total);
                prop_assert!(record.position % chunk == 0 || record.position == total);
            }

            prop_assert_eq!(record.position, total);
            prop_assert!(record.completed_offsets.is_empty());
            prop_assert!(record.is_sequence_complete());
            prop_assert_eq!(record.completion_percent(), 100);
        }

        /// Reporting a chunk twice changes nothing
        #[test]
        fn repeated_completion_is_idempotent((chunk, total, offsets) in shuffled_offsets()) {
            let mut record = TransferRecord::upload("vault", "/data/archive.bin", total, chunk).unwrap();

            for &offset in &offsets {
                record.add_sequence(offset).unwrap();
                let position = record.position;
                let pending = record.completed_offsets.clone();

                prop_assert!(!record.add_sequence(offset).unwrap());
                prop_assert_eq!(record.position, position);
                prop_assert_eq!(&record.completed_offsets, &pending);
            }
        }

        /// Pending chunks exactly cover what the cursor and out-of-order set do not
        #[test]
        fn pending_chunks_complement_progress(
            (chunk, total, offsets) in shuffled_offsets(),
            done_fraction in 0usize..=100,
        ) {
            let mut record = TransferRecord::upload("vault", "/data/archive.bin", total, chunk).unwrap();
            let done = offsets.len() * done_fraction / 100;
            for &offset in &offsets[..done] {
                record.add_sequence(offset).unwrap();
            }

            let pending = record.pending_chunks();
            let pending_bytes: u64 = pending.iter().map(|part| part.size).sum();
            prop_assert_eq!(pending.len(), offsets.len() - done);
            prop_assert_eq!(pending_bytes + record.finished_size(), total);
        }

        /// Offsets off the chunk grid are rejected
        #[test]
        fn misaligned_offset_rejected(chunk in 2u64..64, total in 64u64..2000, nudge in 1u64..64) {
            let mut record = TransferRecord::upload("vault", "/data/archive.bin", total, chunk).unwrap();
            let offset = chunk + nudge % chunk;
            prop_assume!(offset % chunk != 0);
            prop_assert!(record.add_sequence(offset).is_err());
            prop_assert!(record.add_sequence(total).is_err());
        }
    }
}
