//! Reciprocal rank fusion over ranked candidate lists.

use std::collections::HashMap;

use crate::types::ChunkId;

/// RRF constant.
pub const RRF_K: f64 = 60.0;

/// Fuse ranked id lists: each appearance at 1-indexed rank `r` contributes
/// `1 / (K + r)`; contributions sum per candidate. Output is ordered by
/// descending fused score, ties broken by chunk id ascending, so fusion is
/// deterministic and insensitive to the order the input lists are given in.
pub fn rrf_fuse<L: AsRef<[ChunkId]>>(lists: &[L]) -> Vec<(ChunkId, f64)> {
    let mut scores: HashMap<ChunkId, f64> = HashMap::new();

    for list in lists {
        for (rank, chunk_id) in list.as_ref().iter().enumerate() {
            let contribution = 1.0 / (RRF_K + (rank + 1) as f64);
            *scores.entry(*chunk_id).or_insert(0.0) += contribution;
        }
    }

    let mut fused: Vec<(ChunkId, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentId;

    fn ids(n: usize) -> Vec<ChunkId> {
        let doc = DocumentId::new();
        (0..n).map(|i| ChunkId::derive(doc, i)).collect()
    }

    #[test]
    fn test_single_list_preserves_order() {
        let ids = ids(3);
        let fused = rrf_fuse(&[&ids]);
        let order: Vec<ChunkId> = fused.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn test_contributions_sum() {
        let ids = ids(3);
        let a = ids[0];
        let list_a = vec![a];
        let list_b = vec![a];

        let fused = rrf_fuse(&[&list_a, &list_b]);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].1 - 2.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_order_insensitive_to_list_order() {
        let ids = ids(3);
        let dense = vec![ids[0], ids[1], ids[2]];
        let sparse = vec![ids[2], ids[1], ids[0]];

        let forward = rrf_fuse(&[&dense, &sparse]);
        let reversed = rrf_fuse(&[&sparse, &dense]);
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_opposed_lists_tie_break_by_chunk_id() {
        let ids = ids(3);
        let dense = vec![ids[0], ids[1], ids[2]];
        let sparse = vec![ids[2], ids[1], ids[0]];

        let fused = rrf_fuse(&[&dense, &sparse]);

        // The outer candidates share 1/61 + 1/63 and tie; they must come
        // out in chunk-id order, and the same order on every run.
        let (outer_a, outer_b) = (fused[0].0.min(fused[1].0), fused[0].0.max(fused[1].0));
        assert_eq!(fused[0].0, outer_a);
        assert_eq!(fused[1].0, outer_b);
        assert!((fused[0].1 - fused[1].1).abs() < 1e-12);

        let again = rrf_fuse(&[&dense, &sparse]);
        assert_eq!(fused, again);
    }

    #[test]
    fn test_candidate_in_one_list_only() {
        let ids = ids(2);
        let dense = vec![ids[0]];
        let sparse = vec![ids[1]];

        let fused = rrf_fuse(&[&dense, &sparse]);
        assert_eq!(fused.len(), 2);
        assert!((fused[0].1 - 1.0 / 61.0).abs() < 1e-12);
        assert!((fused[1].1 - 1.0 / 61.0).abs() < 1e-12);
        // Equal scores: chunk id ascending.
        assert!(fused[0].0 < fused[1].0);
    }

    #[test]
    fn test_empty_input() {
        assert!(rrf_fuse::<Vec<ChunkId>>(&[]).is_empty());
        let empty: Vec<ChunkId> = Vec::new();
        assert!(rrf_fuse(&[&empty, &empty]).is_empty());
    }
}
