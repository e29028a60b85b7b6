//! Multi-channel raster tile buffers.
//!
//! A [`TileBuffer`] is the in-flight representation of every array in the
//! engine: sample tiles read from the backing store, resample tiles, and
//! per-query production arrays. Pixel math runs in `f64`; the Producer
//! casts a finished production array to the query's destination element
//! type on delivery via [`TileBuffer::cast`].
//!
//! Layout is band-interleaved by pixel: `rows x cols x channels`.

use crate::footprint::{Footprint, PixelSlice};

/// Destination element type of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DstDtype {
    U8,
    U16,
    I32,
    F32,
    F64,
}

/// A production array delivered in its destination element type.
///
/// Integer variants are produced with clamping casts; NaN casts to zero.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl ArrayData {
    /// Number of elements, independent of the variant.
    pub fn len(&self) -> usize {
        match self {
            Self::U8(v) => v.len(),
            Self::U16(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    /// Returns true if the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The element type of this array.
    pub fn dtype(&self) -> DstDtype {
        match self {
            Self::U8(_) => DstDtype::U8,
            Self::U16(_) => DstDtype::U16,
            Self::I32(_) => DstDtype::I32,
            Self::F32(_) => DstDtype::F32,
            Self::F64(_) => DstDtype::F64,
        }
    }
}

/// Clamp a pixel value into an integer range, mapping NaN to zero.
fn clamp_cast(v: f64, min: f64, max: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(min, max)
    }
}

/// Multi-channel raster tile bound to a footprint.
#[derive(Debug, Clone, PartialEq)]
pub struct TileBuffer {
    fp: Footprint,
    channels: usize,
    data: Vec<f64>,
}

impl TileBuffer {
    /// Allocates a buffer prefilled with `value`.
    ///
    /// Production arrays are allocated through this with the query's
    /// destination nodata, so pixels that no resample tile ever touches
    /// are nodata rather than uninitialized memory.
    pub fn filled(fp: Footprint, channels: usize, value: f64) -> Self {
        assert!(channels > 0, "channel count must be non-zero");
        Self {
            fp,
            channels,
            data: vec![value; fp.pixel_count() * channels],
        }
    }

    /// Wraps existing data, checking it matches the footprint shape.
    pub fn from_data(fp: Footprint, channels: usize, data: Vec<f64>) -> Self {
        assert!(channels > 0, "channel count must be non-zero");
        assert_eq!(
            data.len(),
            fp.pixel_count() * channels,
            "data length does not match footprint shape"
        );
        Self { fp, channels, data }
    }

    /// The footprint this buffer covers.
    pub fn fp(&self) -> &Footprint {
        &self.fp
    }

    /// Number of channels.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Raw data slice, row-major, band-interleaved by pixel.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    fn index(&self, row: usize, col: usize, ch: usize) -> usize {
        debug_assert!(row < self.fp.shape().0 && col < self.fp.shape().1 && ch < self.channels);
        (row * self.fp.shape().1 + col) * self.channels + ch
    }

    /// Value at `(row, col, channel)`.
    pub fn get(&self, row: usize, col: usize, ch: usize) -> f64 {
        self.data[self.index(row, col, ch)]
    }

    /// Sets the value at `(row, col, channel)`.
    pub fn set(&mut self, row: usize, col: usize, ch: usize, value: f64) {
        let i = self.index(row, col, ch);
        self.data[i] = value;
    }

    /// Copies `src` into the window of this buffer described by `slice`.
    ///
    /// # Panics
    ///
    /// Panics when the channel counts differ or the slice shape does not
    /// match the source buffer.
    pub fn write_slice(&mut self, slice: PixelSlice, src: &TileBuffer) {
        assert_eq!(self.channels, src.channels, "channel count mismatch");
        assert_eq!(
            (slice.rows, slice.cols),
            src.fp.shape(),
            "slice shape does not match source buffer"
        );
        let (_, cols) = self.fp.shape();
        let row_elems = slice.cols * self.channels;
        for r in 0..slice.rows {
            let dst_start = ((slice.row0 + r) * cols + slice.col0) * self.channels;
            let src_start = r * row_elems;
            self.data[dst_start..dst_start + row_elems]
                .copy_from_slice(&src.data[src_start..src_start + row_elems]);
        }
    }

    /// Casts the buffer into the destination element type.
    ///
    /// Integer targets clamp out-of-range values and map NaN to zero;
    /// float targets are plain narrowing/identity casts.
    pub fn cast(&self, dtype: DstDtype) -> ArrayData {
        match dtype {
            DstDtype::U8 => ArrayData::U8(
                self.data
                    .iter()
                    .map(|&v| clamp_cast(v, 0.0, u8::MAX as f64) as u8)
                    .collect(),
            ),
            DstDtype::U16 => ArrayData::U16(
                self.data
                    .iter()
                    .map(|&v| clamp_cast(v, 0.0, u16::MAX as f64) as u16)
                    .collect(),
            ),
            DstDtype::I32 => ArrayData::I32(
                self.data
                    .iter()
                    .map(|&v| clamp_cast(v, i32::MIN as f64, i32::MAX as f64) as i32)
                    .collect(),
            ),
            DstDtype::F32 => ArrayData::F32(self.data.iter().map(|&v| v as f32).collect()),
            DstDtype::F64 => ArrayData::F64(self.data.clone()),
        }
    }

    /// Approximate heap size in bytes, used as a cache weigher.
    pub fn size_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(w: u32, h: u32) -> Footprint {
        Footprint::new(0.0, h as f64, 1.0, w, h)
    }

    #[test]
    fn test_filled() {
        let buf = TileBuffer::filled(fp(3, 2), 2, -1.0);
        assert_eq!(buf.data().len(), 12);
        assert!(buf.data().iter().all(|&v| v == -1.0));
    }

    #[test]
    fn test_get_set() {
        let mut buf = TileBuffer::filled(fp(4, 4), 3, 0.0);
        buf.set(1, 2, 1, 42.0);
        assert_eq!(buf.get(1, 2, 1), 42.0);
        assert_eq!(buf.get(1, 2, 0), 0.0);
        assert_eq!(buf.get(2, 1, 1), 0.0);
    }

    #[test]
    #[should_panic(expected = "data length")]
    fn test_from_data_shape_check() {
        TileBuffer::from_data(fp(2, 2), 1, vec![0.0; 3]);
    }

    #[test]
    fn test_write_slice() {
        let mut dst = TileBuffer::filled(fp(4, 4), 1, 0.0);
        let src_fp = Footprint::new(1.0, 3.0, 1.0, 2, 2);
        let src = TileBuffer::from_data(src_fp, 1, vec![1.0, 2.0, 3.0, 4.0]);

        let slice = src_fp.slice_in(dst.fp()).unwrap();
        dst.write_slice(slice, &src);

        assert_eq!(dst.get(1, 1, 0), 1.0);
        assert_eq!(dst.get(1, 2, 0), 2.0);
        assert_eq!(dst.get(2, 1, 0), 3.0);
        assert_eq!(dst.get(2, 2, 0), 4.0);
        assert_eq!(dst.get(0, 0, 0), 0.0);
    }

    #[test]
    fn test_cast_clamps_integers() {
        let buf = TileBuffer::from_data(fp(2, 2), 1, vec![-5.0, 0.5, 300.0, f64::NAN]);
        match buf.cast(DstDtype::U8) {
            ArrayData::U8(v) => assert_eq!(v, vec![0, 0, 255, 0]),
            other => panic!("unexpected variant {:?}", other.dtype()),
        }
    }

    #[test]
    fn test_cast_f32() {
        let buf = TileBuffer::from_data(fp(2, 1), 1, vec![1.5, -2.5]);
        match buf.cast(DstDtype::F32) {
            ArrayData::F32(v) => assert_eq!(v, vec![1.5f32, -2.5f32]),
            other => panic!("unexpected variant {:?}", other.dtype()),
        }
    }

    #[test]
    fn test_array_data_len_dtype() {
        let buf = TileBuffer::filled(fp(3, 3), 2, 7.0);
        let arr = buf.cast(DstDtype::I32);
        assert_eq!(arr.len(), 18);
        assert!(!arr.is_empty());
        assert_eq!(arr.dtype(), DstDtype::I32);
    }
}
