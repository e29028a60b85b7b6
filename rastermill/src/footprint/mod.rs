//! Grid-aligned footprint geometry.
//!
//! A [`Footprint`] describes a rectangular tile on a fixed pixel grid: the
//! world coordinates of its top-left corner, a square pixel size, and a
//! width/height in pixels. Footprints are immutable value types; equality
//! and hashing are by grid-aligned geometry so they can serve as cache and
//! map keys throughout the engine.
//!
//! The world y axis points up while the pixel row axis points down, the
//! usual convention for north-up rasters.

use std::hash::{Hash, Hasher};

/// Relative tolerance used when deciding whether an origin sits on a grid.
const GRID_EPSILON: f64 = 1e-9;

/// Pixel-index window of one footprint inside a containing footprint.
///
/// Produced by [`Footprint::slice_in`]. Rows and columns are relative to
/// the containing footprint's top-left pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelSlice {
    /// First row of the window.
    pub row0: usize,
    /// First column of the window.
    pub col0: usize,
    /// Number of rows in the window.
    pub rows: usize,
    /// Number of columns in the window.
    pub cols: usize,
}

/// Immutable rectangular tile descriptor on a pixel grid.
///
/// # Example
///
/// ```
/// use rastermill::footprint::Footprint;
///
/// let outer = Footprint::new(0.0, 100.0, 1.0, 100, 100);
/// let inner = Footprint::new(10.0, 90.0, 1.0, 20, 20);
///
/// let slice = inner.slice_in(&outer).unwrap();
/// assert_eq!((slice.row0, slice.col0), (10, 10));
/// assert_eq!((slice.rows, slice.cols), (20, 20));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Footprint {
    /// World x coordinate of the top-left corner.
    tl_x: f64,
    /// World y coordinate of the top-left corner.
    tl_y: f64,
    /// Pixel size in world units (square pixels).
    res: f64,
    /// Width in pixels.
    w: u32,
    /// Height in pixels.
    h: u32,
}

impl Footprint {
    /// Creates a new footprint.
    ///
    /// # Arguments
    ///
    /// * `tl_x`, `tl_y` - World coordinates of the top-left corner
    /// * `res` - Pixel size in world units (must be > 0 and finite)
    /// * `w`, `h` - Width and height in pixels (must be > 0)
    ///
    /// # Panics
    ///
    /// Panics on a non-positive or non-finite resolution or a zero shape.
    pub fn new(tl_x: f64, tl_y: f64, res: f64, w: u32, h: u32) -> Self {
        assert!(res.is_finite() && res > 0.0, "resolution must be positive");
        assert!(w > 0 && h > 0, "footprint shape must be non-zero");
        Self { tl_x, tl_y, res, w, h }
    }

    /// World coordinates of the top-left corner.
    pub fn tl(&self) -> (f64, f64) {
        (self.tl_x, self.tl_y)
    }

    /// World coordinates of the bottom-right corner.
    pub fn br(&self) -> (f64, f64) {
        (
            self.tl_x + self.w as f64 * self.res,
            self.tl_y - self.h as f64 * self.res,
        )
    }

    /// Pixel size in world units.
    pub fn res(&self) -> f64 {
        self.res
    }

    /// Shape as `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.h as usize, self.w as usize)
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.w
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.h
    }

    /// Total number of pixels.
    pub fn pixel_count(&self) -> usize {
        self.w as usize * self.h as usize
    }

    /// Returns a copy translated by `(dx, dy)` world units.
    pub fn translate(&self, dx: f64, dy: f64) -> Self {
        Self {
            tl_x: self.tl_x + dx,
            tl_y: self.tl_y + dy,
            ..*self
        }
    }

    /// World coordinates of the center of pixel `(row, col)`.
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.tl_x + (col as f64 + 0.5) * self.res,
            self.tl_y - (row as f64 + 0.5) * self.res,
        )
    }

    /// Continuous pixel coordinates `(row, col)` of a world point.
    ///
    /// The returned coordinates are pixel-center based: a point at the
    /// center of pixel `(r, c)` maps to `(r as f64, c as f64)`.
    pub fn pixel_of(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (self.tl_y - y) / self.res - 0.5,
            (x - self.tl_x) / self.res - 0.5,
        )
    }

    /// The top-left corner expressed in global grid units (rounded).
    fn grid_index(&self) -> (i64, i64) {
        (
            (self.tl_x / self.res).round() as i64,
            (self.tl_y / self.res).round() as i64,
        )
    }

    /// Returns true if `other` shares this footprint's resolution and its
    /// origin lies on the same pixel lattice.
    pub fn same_grid(&self, other: &Footprint) -> bool {
        if self.res.to_bits() != other.res.to_bits() {
            return false;
        }
        let dx = (other.tl_x - self.tl_x) / self.res;
        let dy = (other.tl_y - self.tl_y) / self.res;
        (dx - dx.round()).abs() < GRID_EPSILON && (dy - dy.round()).abs() < GRID_EPSILON
    }

    /// Computes the pixel-index window of `self` within `outer`.
    ///
    /// Returns `None` when the two footprints are not on the same grid or
    /// `outer` does not fully contain `self`.
    pub fn slice_in(&self, outer: &Footprint) -> Option<PixelSlice> {
        if !self.same_grid(outer) {
            return None;
        }
        let col0 = ((self.tl_x - outer.tl_x) / self.res).round();
        let row0 = ((outer.tl_y - self.tl_y) / self.res).round();
        if col0 < 0.0 || row0 < 0.0 {
            return None;
        }
        let (col0, row0) = (col0 as usize, row0 as usize);
        if col0 + self.w as usize > outer.w as usize || row0 + self.h as usize > outer.h as usize {
            return None;
        }
        Some(PixelSlice {
            row0,
            col0,
            rows: self.h as usize,
            cols: self.w as usize,
        })
    }

    /// Human-readable grid key, used by cache stores.
    pub fn grid_key(&self) -> String {
        let (gx, gy) = self.grid_index();
        format!("fp:{}:{}:{}x{}@{}", gx, gy, self.w, self.h, self.res)
    }
}

impl PartialEq for Footprint {
    fn eq(&self, other: &Self) -> bool {
        self.res.to_bits() == other.res.to_bits()
            && self.grid_index() == other.grid_index()
            && self.w == other.w
            && self.h == other.h
    }
}

impl Eq for Footprint {}

impl Hash for Footprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.res.to_bits().hash(state);
        self.grid_index().hash(state);
        self.w.hash(state);
        self.h.hash(state);
    }
}

impl std::fmt::Display for Footprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Footprint({}, {} | {}x{} @ {})",
            self.tl_x, self.tl_y, self.w, self.h, self.res
        )
    }
}
