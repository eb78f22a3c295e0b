use std::ops::Range;

/// Rounds `numel` up to the next multiple of `world_size`.
///
/// Sharded buffers are padded so every rank owns a slice of identical length,
/// which is what reduce-scatter and all-gather expect.
pub fn padded_len(numel: usize, world_size: usize) -> usize {
    if world_size <= 1 {
        return numel;
    }
    numel.div_ceil(world_size) * world_size
}

/// The contiguous range of a `numel`-element buffer owned by `rank`.
///
/// `numel` must already be padded to a multiple of `world_size`.
pub fn shard_range(numel: usize, rank: usize, world_size: usize) -> Range<usize> {
    let world_size = world_size.max(1);
    let shard = numel / world_size;
    rank * shard..(rank + 1) * shard
}

/// Intersection of two ranges, or `None` when they are disjoint.
pub fn overlap(a: &Range<usize>, b: &Range<usize>) -> Option<Range<usize>> {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);
    (start < end).then_some(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_len() {
        assert_eq!(padded_len(10, 1), 10);
        assert_eq!(padded_len(10, 4), 12);
        assert_eq!(padded_len(2048, 2), 2048);
        assert_eq!(padded_len(0, 3), 0);
    }

    #[test]
    fn test_shard_range() {
        assert_eq!(shard_range(12, 0, 4), 0..3);
        assert_eq!(shard_range(12, 3, 4), 9..12);
        assert_eq!(shard_range(8, 0, 1), 0..8);
    }

    #[test]
    fn test_overlap() {
        assert_eq!(overlap(&(0..10), &(5..15)), Some(5..10));
        assert_eq!(overlap(&(0..5), &(5..10)), None);
        assert_eq!(overlap(&(3..4), &(0..10)), Some(3..4));
    }
}
