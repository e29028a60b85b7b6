//! Resampling kernels.
//!
//! Warps a sample tile (in the backing store's grid) onto a destination
//! footprint (in the query's output grid). The numeric contract, which the
//! scenario tests pin down:
//!
//! - an identity transform (same grid, contained) reproduces source values
//!   unchanged;
//! - destination pixels whose sampling position falls outside the source
//!   tile keep the destination nodata value;
//! - nodata in the source propagates to the destination after
//!   interpolation: a stencil touching a nodata source pixel yields
//!   nodata, never a blend of nodata with valid neighbours.

use crate::footprint::Footprint;
use crate::query::Interpolation;
use crate::tile::TileBuffer;

/// NaN-aware nodata comparison.
fn is_nodata(v: f64, nodata: f64) -> bool {
    v == nodata || (nodata.is_nan() && v.is_nan())
}

/// Resamples `sample` onto `dst_fp`, returning the warped tile.
///
/// `nodata` is both the sentinel recognized in the source and the fill
/// value for uncovered destination pixels.
pub fn resample(
    sample: &TileBuffer,
    dst_fp: Footprint,
    interpolation: Interpolation,
    nodata: f64,
) -> TileBuffer {
    let channels = sample.channels();
    let mut dst = TileBuffer::filled(dst_fp, channels, nodata);

    // Identity fast path: plain pixel copy, no interpolation.
    if dst_fp.same_grid(sample.fp()) {
        copy_same_grid(sample, &mut dst);
        return dst;
    }

    let (rows, cols) = dst_fp.shape();
    let (src_rows, src_cols) = sample.fp().shape();
    for r in 0..rows {
        for c in 0..cols {
            let (x, y) = dst_fp.pixel_center(r, c);
            let (sr, sc) = sample.fp().pixel_of(x, y);
            // Outside the source tile: leave the nodata prefill.
            if sr < -0.5 || sc < -0.5 || sr > src_rows as f64 - 0.5 || sc > src_cols as f64 - 0.5 {
                continue;
            }
            for ch in 0..channels {
                let v = match interpolation {
                    Interpolation::Nearest => {
                        let ir = (sr.round().max(0.0) as usize).min(src_rows - 1);
                        let ic = (sc.round().max(0.0) as usize).min(src_cols - 1);
                        sample.get(ir, ic, ch)
                    }
                    Interpolation::Bilinear => bilinear(sample, sr, sc, ch, nodata),
                };
                dst.set(r, c, ch, v);
            }
        }
    }
    dst
}

/// Resamples `sample` onto the region `resample_fp` of the production
/// array `dst`, writing in place.
///
/// # Panics
///
/// Panics when `resample_fp` is not contained in the destination array's
/// footprint; the query plan guarantees containment, so a miss is
/// bookkeeping corruption.
pub fn resample_into(
    sample: &TileBuffer,
    resample_fp: Footprint,
    dst: &mut TileBuffer,
    interpolation: Interpolation,
    nodata: f64,
) {
    let slice = resample_fp
        .slice_in(dst.fp())
        .expect("resample footprint not contained in production footprint");
    let tile = resample(sample, resample_fp, interpolation, nodata);
    dst.write_slice(slice, &tile);
}

fn copy_same_grid(sample: &TileBuffer, dst: &mut TileBuffer) {
    let (rows, cols) = dst.fp().shape();
    let (src_rows, src_cols) = sample.fp().shape();
    let (dc, dr) = {
        let (sx, sy) = sample.fp().tl();
        let (dx, dy) = dst.fp().tl();
        let res = dst.fp().res();
        (
            ((dx - sx) / res).round() as i64,
            ((sy - dy) / res).round() as i64,
        )
    };
    for r in 0..rows {
        let sr = r as i64 + dr;
        if sr < 0 || sr >= src_rows as i64 {
            continue;
        }
        for c in 0..cols {
            let sc = c as i64 + dc;
            if sc < 0 || sc >= src_cols as i64 {
                continue;
            }
            for ch in 0..sample.channels() {
                dst.set(r, c, ch, sample.get(sr as usize, sc as usize, ch));
            }
        }
    }
}

/// Bilinear interpolation with post-interpolation nodata masking: the four
/// stencil values are inspected first, and any nodata among them makes the
/// output nodata instead of entering the weighted sum.
fn bilinear(sample: &TileBuffer, sr: f64, sc: f64, ch: usize, nodata: f64) -> f64 {
    let (src_rows, src_cols) = sample.fp().shape();
    let clamp_r = |r: f64| (r.max(0.0) as usize).min(src_rows - 1);
    let clamp_c = |c: f64| (c.max(0.0) as usize).min(src_cols - 1);

    let r0 = sr.floor();
    let c0 = sc.floor();
    let fr = sr - r0;
    let fc = sc - c0;

    let (ra, rb) = (clamp_r(r0), clamp_r(r0 + 1.0));
    let (ca, cb) = (clamp_c(c0), clamp_c(c0 + 1.0));

    let v00 = sample.get(ra, ca, ch);
    let v01 = sample.get(ra, cb, ch);
    let v10 = sample.get(rb, ca, ch);
    let v11 = sample.get(rb, cb, ch);

    if [v00, v01, v10, v11].iter().any(|&v| is_nodata(v, nodata)) {
        return nodata;
    }

    let top = v00 * (1.0 - fc) + v01 * fc;
    let bottom = v10 * (1.0 - fc) + v11 * fc;
    top * (1.0 - fr) + bottom * fr
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(fp: Footprint, values: Vec<f64>) -> TileBuffer {
        TileBuffer::from_data(fp, 1, values)
    }

    #[test]
    fn test_identity_roundtrip_nearest() {
        let fp = Footprint::new(0.0, 4.0, 1.0, 4, 4);
        let values: Vec<f64> = (0..16).map(f64::from).collect();
        let sample = buf(fp, values.clone());

        let out = resample(&sample, fp, Interpolation::Nearest, -9999.0);
        assert_eq!(out.data(), values.as_slice());
    }

    #[test]
    fn test_identity_roundtrip_bilinear() {
        // Interpolation is a no-op under the identity transform.
        let fp = Footprint::new(2.0, 6.0, 2.0, 3, 3);
        let values: Vec<f64> = (0..9).map(|v| v as f64 * 1.5).collect();
        let sample = buf(fp, values.clone());

        let out = resample(&sample, fp, Interpolation::Bilinear, f64::NAN);
        assert_eq!(out.data(), values.as_slice());
    }

    #[test]
    fn test_uncovered_region_stays_nodata() {
        let sample_fp = Footprint::new(0.0, 2.0, 1.0, 2, 2);
        let dst_fp = Footprint::new(0.0, 4.0, 1.0, 4, 4);
        let sample = buf(sample_fp, vec![1.0, 2.0, 3.0, 4.0]);

        let out = resample(&sample, dst_fp, Interpolation::Nearest, -1.0);

        // Sample occupies the bottom-left 2x2 quadrant of the destination.
        assert_eq!(out.get(2, 0, 0), 1.0);
        assert_eq!(out.get(3, 1, 0), 4.0);
        assert_eq!(out.get(0, 0, 0), -1.0);
        assert_eq!(out.get(1, 3, 0), -1.0);
        assert_eq!(out.get(2, 2, 0), -1.0);
    }

    #[test]
    fn test_nodata_propagates_nearest() {
        let fp = Footprint::new(0.0, 2.0, 1.0, 2, 2);
        let sample = buf(fp, vec![-1.0, 5.0, 6.0, 7.0]);

        let out = resample(&sample, fp, Interpolation::Nearest, -1.0);
        assert_eq!(out.get(0, 0, 0), -1.0);
        assert_eq!(out.get(0, 1, 0), 5.0);
    }

    #[test]
    fn test_nodata_propagates_bilinear_without_blending() {
        // Destination at half-pixel offset so every stencil spans 2x2
        // source pixels; the nodata corner must poison its stencils.
        let sample_fp = Footprint::new(0.0, 4.0, 1.0, 4, 4);
        let mut values = vec![10.0; 16];
        values[5] = -1.0; // (1, 1)
        let sample = buf(sample_fp, values);

        let dst_fp = Footprint::new(0.5, 3.5, 1.0, 3, 3);
        let out = resample(&sample, dst_fp, Interpolation::Bilinear, -1.0);

        // Stencils touching (1, 1) are nodata, not a blended value.
        assert_eq!(out.get(0, 0, 0), -1.0);
        assert_eq!(out.get(1, 0, 0), -1.0);
        assert_eq!(out.get(0, 1, 0), -1.0);
        assert_eq!(out.get(1, 1, 0), -1.0);
        // A stencil of pure valid values interpolates normally.
        assert_eq!(out.get(2, 2, 0), 10.0);
    }

    #[test]
    fn test_bilinear_interpolates_midpoint() {
        let sample_fp = Footprint::new(0.0, 2.0, 1.0, 2, 2);
        let sample = buf(sample_fp, vec![0.0, 10.0, 20.0, 30.0]);

        // Half-pixel shifted single-pixel destination sits exactly between
        // the four source pixel centers.
        let dst_fp = Footprint::new(0.5, 1.5, 1.0, 1, 1);
        let out = resample(&sample, dst_fp, Interpolation::Bilinear, f64::NAN);
        assert!((out.get(0, 0, 0) - 15.0).abs() < 1e-12);
    }

    #[test]
    fn test_resample_into_writes_subrect() {
        let prod_fp = Footprint::new(0.0, 4.0, 1.0, 4, 4);
        let mut dst = TileBuffer::filled(prod_fp, 1, -1.0);

        let region = Footprint::new(2.0, 4.0, 1.0, 2, 2);
        let sample = buf(region, vec![1.0, 2.0, 3.0, 4.0]);

        resample_into(&sample, region, &mut dst, Interpolation::Nearest, -1.0);

        assert_eq!(dst.get(0, 2, 0), 1.0);
        assert_eq!(dst.get(1, 3, 0), 4.0);
        assert_eq!(dst.get(2, 2, 0), -1.0);
        assert_eq!(dst.get(0, 0, 0), -1.0);
    }

    #[test]
    fn test_multichannel_resample() {
        let fp = Footprint::new(0.0, 1.0, 1.0, 1, 1);
        let sample = TileBuffer::from_data(fp, 3, vec![1.0, 2.0, 3.0]);

        let out = resample(&sample, fp, Interpolation::Nearest, 0.0);
        assert_eq!(out.data(), &[1.0, 2.0, 3.0]);
    }
}
