//! The gradient-buffer partitioner (spec §3, §4.B): the core index algebra
//! that cuts a flat, padded gradient buffer into per-participant shards and
//! maps each locally-owned parameter across three coordinate systems.
//!
//! Every function here is pure: given identical inputs, every participant
//! computes byte-identical results, which is what lets reduce-scatter and
//! all-gather targets line up without any participant-to-participant
//! communication to agree on the partition itself.

use std::collections::HashMap;

use crate::error::ShardError;
use crate::param::{ParamId, ParamIndexEntry};
use crate::range::Range;

/// One parameter's slice across the world buffer, the local shard, and its
/// own flattened layout (spec §3 "Three-way parameter map").
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ParamRangeMap {
    pub gbuf_world: Range,
    pub gbuf_local: Range,
    pub param: Range,
    pub gbuf_world_order: u64,
}

/// The partition of a (replica, dtype) gradient buffer across the data-
/// parallel world, plus the per-parameter three-way map for parameters this
/// rank owns (even partially).
#[derive(Debug, Clone)]
pub struct GbufRangeMap {
    pub local: Range,
    pub world: Range,
    pub world_all: Vec<Range>,
    pub param_map: HashMap<ParamId, ParamRangeMap>,
    pub max_range_size: usize,
}

/// Compute the world partition for a buffer of `gbuf_size` elements across
/// `world_size` participants (spec §3 "World partition").
///
/// `shard_size = ceil(gbuf_size / world_size)`; every shard but the last is
/// exactly `shard_size`, and the last is whatever remains.
pub fn world_partition(gbuf_size: usize, world_size: usize) -> Result<Vec<Range>, ShardError> {
    assert!(world_size > 0, "world_size must be positive");
    let max_range_size = gbuf_size.div_ceil(world_size);
    (0..world_size)
        .map(|r| {
            let start = r * max_range_size;
            let end = gbuf_size.min(start + max_range_size);
            Range::new(start, end)
        })
        .collect()
}

/// Build the per-parameter three-way map for all parameters (even
/// partially) owned by `gbuf_world_range` (spec §3 "Construction").
pub fn build_param_range_map(
    param_index: &HashMap<ParamId, ParamIndexEntry>,
    gbuf_world_range: Range,
) -> Result<HashMap<ParamId, ParamRangeMap>, ShardError> {
    let mut out = HashMap::new();
    for (&id, entry) in param_index {
        let ws = entry.world_start;
        let we = entry.world_end;

        // local_start = max(0, ws - L.start)
        let local_start = ws.saturating_sub(gbuf_world_range.start);
        // local_end = min(L.size, we - L.start)
        let local_end = gbuf_world_range
            .size()
            .min(we.saturating_sub(gbuf_world_range.start));

        if local_end <= local_start {
            continue; // not owned locally
        }

        let gbuf_local = Range::new(local_start, local_end)?;
        let gbuf_world = gbuf_local.normalize(gbuf_world_range.start + local_start);
        let sub_param_start = gbuf_world_range.start.saturating_sub(ws);
        let param = gbuf_local.normalize(sub_param_start);

        out.insert(
            id,
            ParamRangeMap {
                gbuf_world,
                gbuf_local,
                param,
                gbuf_world_order: entry.world_order,
            },
        );
    }
    Ok(out)
}

/// Build the full gbuf range map for one (replica, dtype) buffer: the
/// world partition, this rank's local range, and the per-parameter map.
pub fn build_gbuf_range(
    gbuf_size: usize,
    rank: usize,
    world_size: usize,
    param_index: &HashMap<ParamId, ParamIndexEntry>,
) -> Result<GbufRangeMap, ShardError> {
    let world_all = world_partition(gbuf_size, world_size)?;
    let world = world_all[rank];
    let local = world.normalize(0);
    let max_range_size = gbuf_size.div_ceil(world_size);
    let param_map = build_param_range_map(param_index, world)?;

    Ok(GbufRangeMap { local, world, world_all, param_map, max_range_size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn idx(entries: &[(u64, u64, usize, usize)]) -> HashMap<ParamId, ParamIndexEntry> {
        entries
            .iter()
            .map(|&(id, order, start, end)| {
                (
                    ParamId(id),
                    ParamIndexEntry { world_order: order, world_start: start, world_end: end },
                )
            })
            .collect()
    }

    // Invariant 1: partition covers and tiles.
    #[test]
    fn partition_covers_and_tiles() {
        for (n, w) in [(8usize, 2usize), (10, 3), (1, 1), (0, 4), (7, 4)] {
            let shards = world_partition(n, w).unwrap();
            assert_eq!(shards.len(), w);
            let total: usize = shards.iter().map(|r| r.size()).sum();
            assert_eq!(total, n);
            for i in 0..w - 1 {
                assert_eq!(shards[i].end, shards[i + 1].start);
            }
            let sizes: Vec<usize> = shards.iter().map(|r| r.size()).collect();
            let max = sizes[..w - 1].iter().copied().max().unwrap_or(0);
            if w > 1 {
                assert!(sizes[..w - 1].iter().all(|&s| s == max));
                assert!(sizes[w - 1] <= max);
            }
        }
    }

    // Scenario A: W=2, two half-precision params of size 3 and 5, padded_numel=8.
    #[test]
    fn scenario_a_two_params_across_two_ranks() {
        let padded_numel = 8;
        let world_size = 2;
        let idx = idx(&[(1, 0, 0, 3), (2, 1, 3, 8)]);

        let rank0 = build_gbuf_range(padded_numel, 0, world_size, &idx).unwrap();
        assert_eq!(rank0.world, Range::new(0, 4).unwrap());
        let p0 = rank0.param_map[&ParamId(1)];
        assert_eq!(p0.param, Range::new(0, 3).unwrap());
        assert_eq!(p0.gbuf_world, Range::new(0, 3).unwrap());
        let p1 = rank0.param_map[&ParamId(2)];
        assert_eq!(p1.param, Range::new(0, 1).unwrap());
        assert_eq!(p1.gbuf_world, Range::new(3, 4).unwrap());

        let rank1 = build_gbuf_range(padded_numel, 1, world_size, &idx).unwrap();
        assert_eq!(rank1.world, Range::new(4, 8).unwrap());
        assert!(!rank1.param_map.contains_key(&ParamId(1)));
        let p1b = rank1.param_map[&ParamId(2)];
        assert_eq!(p1b.param, Range::new(1, 5).unwrap());
        assert_eq!(p1b.gbuf_world, Range::new(4, 8).unwrap());
        assert_eq!(p1b.gbuf_local, Range::new(0, 4).unwrap());
    }

    // Scenario B: W=3, one parameter of size 10, padded_numel=12.
    #[test]
    fn scenario_b_three_shards_one_param() {
        let padded_numel = 12;
        let world_size = 3;
        let idx = idx(&[(1, 0, 0, 10)]);

        let shards = world_partition(padded_numel, world_size).unwrap();
        assert_eq!(shards, vec![
            Range::new(0, 4).unwrap(),
            Range::new(4, 8).unwrap(),
            Range::new(8, 12).unwrap(),
        ]);

        let rank2 = build_gbuf_range(padded_numel, 2, world_size, &idx).unwrap();
        let p = rank2.param_map[&ParamId(1)];
        assert_eq!(p.param, Range::new(8, 10).unwrap());
        assert_eq!(p.gbuf_local, Range::new(0, 2).unwrap());
        assert_eq!(p.gbuf_world, Range::new(8, 10).unwrap());
    }

    // Boundary: a parameter entirely inside one shard.
    #[test]
    fn param_fully_inside_one_shard() {
        let idx = idx(&[(1, 0, 2, 6)]);
        let range_map = build_gbuf_range(16, 0, 4, &idx).unwrap();
        let p = range_map.param_map[&ParamId(1)];
        assert_eq!(p.param, Range::new(0, 4).unwrap());
        assert_eq!(p.gbuf_world, Range::new(2, 6).unwrap());
    }

    // Boundary: a parameter spanning three shards.
    #[test]
    fn param_spans_three_shards() {
        // padded_numel=12, world=3 -> shards of size 4: [0,4) [4,8) [8,12)
        // one param occupies [2, 10) i.e. numel=8, straddling all three shards.
        let idx = idx(&[(1, 0, 2, 10)]);
        let mut concatenated = Vec::new();
        for rank in 0..3 {
            let rm = build_gbuf_range(12, rank, 3, &idx).unwrap();
            if let Some(p) = rm.param_map.get(&ParamId(1)) {
                concatenated.push((rm.world.start, p.param));
            }
        }
        concatenated.sort_by_key(|&(world_start, _)| world_start);
        let pieces: Vec<Range> = concatenated.into_iter().map(|(_, p)| p).collect();
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0], Range::new(0, 2).unwrap());
        assert_eq!(pieces[1], Range::new(2, 6).unwrap());
        assert_eq!(pieces[2], Range::new(6, 8).unwrap());
        // Concatenate to [0, numel).
        let total: usize = pieces.iter().map(|r| r.size()).sum();
        assert_eq!(total, 8);
    }

    proptest! {
        // Invariant 2 & 3: three-way agreement and full coverage, for random layouts.
        #[test]
        fn three_way_agreement_and_coverage(
            world_size in 1usize..6,
            num_params in 1usize..6,
            sizes in prop::collection::vec(1usize..50, 1..6),
        ) {
            let num_params = num_params.min(sizes.len());
            let mut start = 0usize;
            let mut entries = Vec::new();
            for i in 0..num_params {
                let size = sizes[i];
                entries.push((i as u64, i as u64, start, start + size));
                start += size;
            }
            let numel = start;
            let padded_numel = numel.div_ceil(world_size) * world_size;
            let mut idx_map = idx(&entries.iter().map(|&(id, order, s, e)| (id, order, s, e)).collect::<Vec<_>>());
            // pad: extend last param's world_end is NOT padded; padding is
            // implicit slack in the buffer beyond the last param.
            let _ = &mut idx_map;

            let mut coverage: HashMap<u64, Vec<(usize, Range)>> = HashMap::new();
            for rank in 0..world_size {
                let rm = build_gbuf_range(padded_numel, rank, world_size, &idx_map).unwrap();
                for (id, prm) in &rm.param_map {
                    prop_assert_eq!(prm.gbuf_world.size(), prm.gbuf_local.size());
                    prop_assert_eq!(prm.gbuf_local.size(), prm.param.size());
                    prop_assert!(prm.gbuf_world.size() > 0);
                    prop_assert!(rm.world.contains_range(&prm.gbuf_world));
                    let (_, _, s, e) = entries[id.0 as usize];
                    prop_assert!(prm.param.end <= e - s);
                    coverage.entry(id.0).or_default().push((rank, prm.param));
                }
            }

            for (id, (_, _, s, e)) in entries.iter().enumerate() {
                let numel_p = e - s;
                let mut pieces = coverage.remove(&(id as u64)).unwrap_or_default();
                pieces.sort_by_key(|&(rank, _)| rank);
                let mut cursor = 0usize;
                for (_, range) in &pieces {
                    prop_assert_eq!(range.start, cursor);
                    cursor = range.end;
                }
                prop_assert_eq!(cursor, numel_p);
            }
        }
    }
}
