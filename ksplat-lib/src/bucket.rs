use foldhash::HashMap;
use foldhash::HashMapExt;
use glam::Vec3;
use tracing::debug;

use crate::structures::{Bucket, UncompressedSplatArray, SENTINEL_INDEX};

pub const DEFAULT_BLOCK_SIZE: f32 = 5.0;
pub const DEFAULT_BUCKET_SIZE: usize = 256;

type CellKey = (i64, i64, i64);

/// Axis-aligned bounds of every non-sentinel splat center.
pub fn compute_bounds(splats: &UncompressedSplatArray) -> Option<(Vec3, Vec3)> {
    splats.centers.iter().skip(1).fold(None, |acc, c| {
        let p = Vec3::from_array(*c);
        Some(match acc {
            Some((min, max)) => (p.min(min), p.max(max)),
            None => (p, p),
        })
    })
}

/// Partitions splats into cubes of side `block_size`, at most `bucket_size` per bucket.
///
/// Full buckets come first in the order they filled up, followed by the
/// remaining cells in the order they were first seen. Every bucket is padded
/// to `bucket_size` with [`SENTINEL_INDEX`].
pub fn compute_buckets(
    splats: &UncompressedSplatArray,
    block_size: f32,
    bucket_size: usize,
) -> Vec<Bucket> {
    let Some((min, _)) = compute_bounds(splats) else {
        return Vec::new();
    };

    let mut sealed: Vec<Bucket> = Vec::new();
    let mut open: Vec<Option<Bucket>> = Vec::new();
    let mut open_by_cell: HashMap<CellKey, usize> = HashMap::new();

    for (index, center) in splats.centers.iter().enumerate().skip(1) {
        let cell = ((Vec3::from_array(*center) - min) / block_size).floor().max(Vec3::ZERO);
        let key: CellKey = (cell.x as i64, cell.y as i64, cell.z as i64);

        let slot = *open_by_cell.entry(key).or_insert_with(|| {
            let cell_center = min + (cell + Vec3::splat(0.5)) * block_size;
            open.push(Some(Bucket {
                center: cell_center.to_array(),
                indices: Vec::with_capacity(bucket_size),
            }));
            open.len() - 1
        });

        let Some(bucket) = open[slot].as_mut() else {
            continue;
        };
        bucket.indices.push(index as u32);
        if bucket.indices.len() >= bucket_size {
            if let Some(full) = open[slot].take() {
                sealed.push(full);
            }
            open_by_cell.remove(&key);
        }
    }

    let full_count = sealed.len();
    for mut bucket in open.into_iter().flatten() {
        bucket.indices.resize(bucket_size, SENTINEL_INDEX);
        sealed.push(bucket);
    }
    debug!(
        buckets = sealed.len(),
        full = full_count,
        block_size,
        bucket_size,
        "computed buckets"
    );
    sealed
}
