// Region — axis-aligned sub-box used to address partial tensor copies
//
// A Region is only ever a copy-operation parameter. It is expressed in the
// source tensor's coordinates: a start offset and an extent per axis, up to
// three axes. Axes beyond a tensor's rank are fixed at start 0, count 1, so
// one set of triple-loop copy routines serves every rank.

use crate::error::{Error, Result};

/// An axis-aligned sub-box: start offset and extent per axis.
///
/// Axis 0 is the fastest-varying (contiguous) axis. For tensors of rank
/// below 3 the unused axes carry `start = 0, count = 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: [usize; 3],
    pub count: [usize; 3],
}

impl Region {
    /// A one-axis region over `count` contiguous elements.
    pub fn rank1(start: usize, count: usize) -> Self {
        Region {
            start: [start, 0, 0],
            count: [count, 1, 1],
        }
    }

    /// A two-axis region: `count_x` columns by `count_y` rows.
    pub fn rank2(start_x: usize, start_y: usize, count_x: usize, count_y: usize) -> Self {
        Region {
            start: [start_x, start_y, 0],
            count: [count_x, count_y, 1],
        }
    }

    /// A three-axis region.
    #[allow(clippy::too_many_arguments)]
    pub fn rank3(
        start_x: usize,
        start_y: usize,
        start_z: usize,
        count_x: usize,
        count_y: usize,
        count_z: usize,
    ) -> Self {
        Region {
            start: [start_x, start_y, start_z],
            count: [count_x, count_y, count_z],
        }
    }

    /// The region covering a whole tensor of the given dims.
    pub fn full(dims: &[usize]) -> Self {
        Region {
            start: [0, 0, 0],
            count: padded(dims),
        }
    }

    /// Number of elements addressed by this region.
    pub fn volume(&self) -> usize {
        self.count[0] * self.count[1] * self.count[2]
    }

    /// Check that `start + count` stays inside `dims` on every axis.
    pub fn check_within(&self, dims: &[usize]) -> Result<()> {
        let ext = padded(dims);
        for axis in 0..3 {
            if self.count[axis] == 0
                || self.start[axis] + self.count[axis] > ext[axis]
            {
                return Err(Error::RegionOutOfBounds {
                    start: self.start,
                    count: self.count,
                    dims: dims.to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Check that this region's extents fit inside `dims` when placed at
    /// `offset` (destination-side validation).
    pub fn check_fits_at(&self, offset: [usize; 3], dims: &[usize]) -> Result<()> {
        let ext = padded(dims);
        for axis in 0..3 {
            if offset[axis] + self.count[axis] > ext[axis] {
                return Err(Error::RegionOutOfBounds {
                    start: offset,
                    count: self.count,
                    dims: dims.to_vec(),
                });
            }
        }
        Ok(())
    }
}

/// Pad a dims slice to the canonical `[x, y, z]` triple, filling missing
/// axes with 1.
pub fn padded(dims: &[usize]) -> [usize; 3] {
    let mut ext = [1usize; 3];
    for (axis, d) in dims.iter().enumerate().take(3) {
        ext[axis] = *d;
    }
    ext
}

/// Copy a region between two flat (unpitched) buffers, row by row.
///
/// Row starts are computed from each buffer's own extents, so source and
/// destination may have different shapes; only the addressed elements move
/// and everything outside them is left untouched.
pub fn copy_flat_region(
    src: &[f32],
    src_dims: &[usize],
    dst: &mut [f32],
    dst_dims: &[usize],
    region: &Region,
    offset: [usize; 3],
) {
    let s = padded(src_dims);
    let d = padded(dst_dims);
    let run = region.count[0];
    for z in 0..region.count[2] {
        for y in 0..region.count[1] {
            let src_row = (region.start[2] + z) * s[0] * s[1]
                + (region.start[1] + y) * s[0]
                + region.start[0];
            let dst_row =
                (offset[2] + z) * d[0] * d[1] + (offset[1] + y) * d[0] + offset[0];
            dst[dst_row..dst_row + run].copy_from_slice(&src[src_row..src_row + run]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_region_covers_all_axes() {
        let r = Region::full(&[4, 3]);
        assert_eq!(r.start, [0, 0, 0]);
        assert_eq!(r.count, [4, 3, 1]);
        assert_eq!(r.volume(), 12);
    }

    #[test]
    fn bounds_checks_reject_overruns() {
        let r = Region::rank1(2, 5);
        assert!(r.check_within(&[6]).is_err());
        assert!(r.check_within(&[7]).is_ok());
        assert!(r.check_fits_at([3, 0, 0], &[7]).is_err());
    }

    #[test]
    fn flat_region_copy_skips_rows_outside_the_box() {
        // 3x3 source, copy the middle 2x2 into a 4x2 destination at x=1.
        let src = vec![1., 2., 3., 4., 5., 6., 7., 8., 9.];
        let mut dst = vec![0.0f32; 8];
        copy_flat_region(
            &src,
            &[3, 3],
            &mut dst,
            &[4, 2],
            &Region::rank2(1, 1, 2, 2),
            [1, 0, 0],
        );
        assert_eq!(dst, vec![0., 5., 6., 0., 0., 8., 9., 0.]);
    }
}
