// PitchedBuffer — device storage with row/slice pitch
//
// Rank-1 buffers are flat, like a structured buffer. Rank-2/3 buffers pad
// every row up to a 256-byte boundary, like a texture subresource, so the
// physical row stride differs from the logical extent. Every read, write
// and region routine here must step by pitch on the device side and by the
// tight extent on the host side; mixing the two shears the data.

use std::any::Any;

use vole_core::error::{Error, Result};
use vole_core::region::{padded, Region};
use vole_core::DeviceBuffer;

/// Row alignment in elements: 256 bytes at f32 width, matching the usual
/// texture-pitch granularity.
pub const ROW_ALIGN: usize = 64;

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// One device allocation: tight dims plus pitched physical storage.
#[derive(Debug)]
pub struct PitchedBuffer {
    dims: Vec<usize>,
    ext: [usize; 3],
    row_pitch: usize,
    slice_pitch: usize,
    data: Vec<f32>,
    ctx_id: usize,
}

impl PitchedBuffer {
    pub(crate) fn new(ctx_id: usize, dims: &[usize]) -> Result<Self> {
        if dims.is_empty() || dims.len() > 3 {
            return Err(Error::RankUnsupported { rank: dims.len() });
        }
        let ext = padded(dims);
        let row_pitch = if dims.len() == 1 {
            ext[0]
        } else {
            round_up(ext[0], ROW_ALIGN)
        };
        let slice_pitch = row_pitch * ext[1];
        Ok(PitchedBuffer {
            dims: dims.to_vec(),
            ext,
            row_pitch,
            slice_pitch,
            data: vec![0.0; slice_pitch * ext[2]],
            ctx_id,
        })
    }

    pub(crate) fn from_data(ctx_id: usize, dims: &[usize], data: &[f32]) -> Result<Self> {
        let mut buf = Self::new(ctx_id, dims)?;
        buf.fill_rows(data);
        Ok(buf)
    }

    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    pub fn slice_pitch(&self) -> usize {
        self.slice_pitch
    }

    /// Physical index of logical element (x, y, z).
    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        z * self.slice_pitch + y * self.row_pitch + x
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[self.index(x, y, z)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: f32) {
        let i = self.index(x, y, z);
        self.data[i] = value;
    }

    #[inline]
    pub fn update(&mut self, x: usize, y: usize, z: usize, f: impl FnOnce(f32) -> f32) {
        let i = self.index(x, y, z);
        self.data[i] = f(self.data[i]);
    }

    /// Scatter a tight host slice into the pitched layout.
    fn fill_rows(&mut self, data: &[f32]) {
        let w = self.ext[0];
        for z in 0..self.ext[2] {
            for y in 0..self.ext[1] {
                let src = (z * self.ext[1] + y) * w;
                let dst = self.index(0, y, z);
                self.data[dst..dst + w].copy_from_slice(&data[src..src + w]);
            }
        }
    }

    fn check_len(&self, data: &[f32]) -> Result<()> {
        let tight: usize = self.dims.iter().product();
        if data.len() != tight {
            return Err(Error::LengthMismatch {
                expected: tight,
                got: data.len(),
            });
        }
        Ok(())
    }
}

impl DeviceBuffer for PitchedBuffer {
    fn dims(&self) -> &[usize] {
        &self.dims
    }

    fn context_id(&self) -> usize {
        self.ctx_id
    }

    fn read(&self) -> Result<Vec<f32>> {
        let w = self.ext[0];
        let mut out = Vec::with_capacity(self.dims.iter().product());
        for z in 0..self.ext[2] {
            for y in 0..self.ext[1] {
                let src = self.index(0, y, z);
                out.extend_from_slice(&self.data[src..src + w]);
            }
        }
        Ok(out)
    }

    fn write(&mut self, data: &[f32]) -> Result<()> {
        self.check_len(data)?;
        // Recreate policy: drop the old allocation and build a fresh one,
        // as a device would when the resource cannot be updated in place.
        self.data = vec![0.0; self.slice_pitch * self.ext[2]];
        self.fill_rows(data);
        Ok(())
    }

    fn write_in_place(&mut self, data: &[f32]) -> Result<()> {
        self.check_len(data)?;
        self.fill_rows(data);
        Ok(())
    }

    fn write_region(
        &mut self,
        src: &[f32],
        src_dims: &[usize],
        region: &Region,
        offset: [usize; 3],
    ) -> Result<()> {
        region.check_within(src_dims)?;
        region.check_fits_at(offset, &self.dims)?;
        let s = padded(src_dims);
        let run = region.count[0];
        for z in 0..region.count[2] {
            for y in 0..region.count[1] {
                let src_row = (region.start[2] + z) * s[0] * s[1]
                    + (region.start[1] + y) * s[0]
                    + region.start[0];
                let dst_row = self.index(offset[0], offset[1] + y, offset[2] + z);
                self.data[dst_row..dst_row + run]
                    .copy_from_slice(&src[src_row..src_row + run]);
            }
        }
        Ok(())
    }

    fn copy_region_to(
        &self,
        dst: &mut dyn DeviceBuffer,
        region: &Region,
        offset: [usize; 3],
    ) -> Result<()> {
        region.check_within(&self.dims)?;
        let dst_dims = dst.dims().to_vec();
        region.check_fits_at(offset, &dst_dims)?;
        let dst = dst
            .as_any_mut()
            .downcast_mut::<PitchedBuffer>()
            .ok_or_else(|| Error::msg("native copy requires an emulated-device buffer"))?;
        if dst.ctx_id != self.ctx_id {
            return Err(Error::ContextMismatch);
        }
        let run = region.count[0];
        for z in 0..region.count[2] {
            for y in 0..region.count[1] {
                let src_row = self.index(
                    region.start[0],
                    region.start[1] + y,
                    region.start[2] + z,
                );
                let dst_row = dst.index(offset[0], offset[1] + y, offset[2] + z);
                dst.data[dst_row..dst_row + run]
                    .copy_from_slice(&self.data[src_row..src_row + run]);
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
