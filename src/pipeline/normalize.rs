//! Image normalization: undo scan defects before recognition.
//!
//! ```text
//! image
//!  │
//!  ├─ 1. Skew     Canny edges → angle/offset vote grid (±30°) → median peak
//!  ├─ 2. Rotate   bicubic, edge-replicate, about the center (skipped < 0.5°)
//!  │              └── preserve_color: stop here
//!  ├─ 3. Gray     luma
//!  ├─ 4. Denoise  non-local means
//!  ├─ 5. CLAHE    tiled histogram equalization, bilinear between tiles
//!  ├─ 6. Otsu     global threshold → 0 / 255
//!  ├─ 7. Open     2×2 on the white background
//!  └─ 8. Overlay  clear faint marks in large low-density regions
//! ```
//!
//! ## Why a custom vote grid instead of a generic line detector?
//!
//! Only near-horizontal lines matter for skew, so the accumulator is built
//! directly over the ±30° window at 0.1° resolution. That keeps the angle
//! estimate precise enough for the 0.5° no-op threshold without sweeping the
//! whole half-turn.
//!
//! Everything here is synchronous and CPU-bound. Row loops fan out on rayon.

use crate::error::{DocStructError, Recovered};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Pixel};
use imageproc::distance_transform::Norm;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Tunables for [`normalize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    /// Canny hysteresis thresholds.
    pub canny_low: f32,
    pub canny_high: f32,
    /// Minimum votes for a line candidate.
    pub hough_threshold: u32,
    /// Candidates beyond this tilt are ignored.
    pub max_skew_degrees: f64,
    /// Estimates below this are treated as aligned.
    pub min_skew_degrees: f64,
    /// Angle resolution of the vote grid.
    pub angle_step_degrees: f64,
    /// Non-local-means filter strength; 0 disables denoising.
    pub denoise_strength: f32,
    pub denoise_patch_radius: u32,
    pub denoise_search_radius: u32,
    pub clahe_clip_limit: f32,
    pub clahe_grid: u32,
    /// Gray level at or above which ink counts as faint.
    pub overlay_light_level: u8,
    /// Closing radius joining faint marks into regions (2 ⇒ 5×5).
    pub overlay_close_radius: u8,
    /// Side of the density window.
    pub overlay_window: u32,
    /// Faint marks are only cleared where dark ink is sparser than this.
    pub overlay_max_dark_density: f32,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            canny_low: 50.0,
            canny_high: 150.0,
            hough_threshold: 200,
            max_skew_degrees: 30.0,
            min_skew_degrees: 0.5,
            angle_step_degrees: 0.1,
            denoise_strength: 10.0,
            denoise_patch_radius: 1,
            denoise_search_radius: 3,
            clahe_clip_limit: 2.0,
            clahe_grid: 8,
            overlay_light_level: 160,
            overlay_close_radius: 2,
            overlay_window: 31,
            overlay_max_dark_density: 0.10,
        }
    }
}

impl NormalizeConfig {
    pub fn validate(&self) -> Result<(), DocStructError> {
        if self.angle_step_degrees.is_nan() || self.angle_step_degrees <= 0.0 {
            return Err(DocStructError::InvalidConfig("angle_step_degrees must be > 0".into()));
        }
        if !(0.0..=45.0).contains(&self.max_skew_degrees) {
            return Err(DocStructError::InvalidConfig(format!(
                "max_skew_degrees must be 0–45, got {}",
                self.max_skew_degrees
            )));
        }
        if self.clahe_grid == 0 {
            return Err(DocStructError::InvalidConfig("clahe_grid must be ≥ 1".into()));
        }
        Ok(())
    }
}

/// Decode raw upload bytes.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, DocStructError> {
    if bytes.is_empty() {
        return Err(DocStructError::NormalizationFailure("empty image data".into()));
    }
    image::load_from_memory(bytes)
        .map_err(|e| DocStructError::NormalizationFailure(format!("cannot decode image: {e}")))
}

/// Run the full normalization chain.
///
/// With `preserve_color` only skew correction is applied and the pixel
/// format is kept. Otherwise the result is a binary `Luma8` image.
pub fn normalize(
    image: &DynamicImage,
    preserve_color: bool,
    config: &NormalizeConfig,
) -> Result<DynamicImage, DocStructError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(DocStructError::NormalizationFailure("image has no pixels".into()));
    }

    let deskewed = match deskew(image, config) {
        Recovered::Enhanced(img) => img,
        Recovered::Fallback { value, diagnostic } => {
            warn!("Skew correction skipped: {}", diagnostic);
            value
        }
    };
    if preserve_color {
        return Ok(deskewed);
    }

    let gray = deskewed.to_luma8();
    let denoised = denoise_nlm(
        &gray,
        config.denoise_strength,
        config.denoise_patch_radius,
        config.denoise_search_radius,
    );
    let equalized = clahe(&denoised, config.clahe_clip_limit, config.clahe_grid);
    let binary = binarize_otsu(&equalized);
    let opened = open_2x2(&binary);
    let cleaned = suppress_overlays(&opened, &denoised, config);
    Ok(DynamicImage::ImageLuma8(cleaned))
}

// ── Skew ─────────────────────────────────────────────────────────────────

/// Estimate the tilt of near-horizontal lines in degrees.
///
/// Positive means lines fall towards the right (clockwise on screen).
/// Returns `None` when nothing reaches the vote threshold or the median
/// candidate is below `min_skew_degrees`.
pub fn estimate_skew(gray: &GrayImage, config: &NormalizeConfig) -> Option<f64> {
    let (w, h) = gray.dimensions();
    if w < 8 || h < 8 {
        return None;
    }
    let edges = imageproc::edges::canny(gray, config.canny_low, config.canny_high);
    let points: Vec<(f64, f64)> = edges
        .enumerate_pixels()
        .filter(|(_, _, p)| p[0] > 0)
        .map(|(x, y, _)| (x as f64, y as f64))
        .collect();
    if points.is_empty() {
        return None;
    }

    let steps = (config.max_skew_degrees / config.angle_step_degrees).round() as i64;
    let angles: Vec<f64> = (-steps..=steps)
        .map(|i| i as f64 * config.angle_step_degrees)
        .collect();
    let diag = ((w as f64).hypot(h as f64)).ceil() as i64;
    let bins = (2 * diag + 1) as usize;

    // Line at tilt a: -x·sin(a) + y·cos(a) = rho.
    let grid: Vec<Vec<u32>> = angles
        .par_iter()
        .map(|deg| {
            let (sin, cos) = deg.to_radians().sin_cos();
            let mut acc = vec![0u32; bins];
            for &(x, y) in &points {
                let rho = (-x * sin + y * cos).round() as i64 + diag;
                if let Some(slot) = acc.get_mut(rho as usize) {
                    *slot += 1;
                }
            }
            acc
        })
        .collect();

    let vote = |ai: usize, ri: usize| grid[ai][ri];
    let mut candidates = Vec::new();
    for (ai, row) in grid.iter().enumerate() {
        for (ri, &v) in row.iter().enumerate() {
            if v < config.hough_threshold {
                continue;
            }
            let left = ai == 0 || v > vote(ai - 1, ri);
            let right = ai + 1 == grid.len() || v >= vote(ai + 1, ri);
            let below = ri == 0 || v > vote(ai, ri - 1);
            let above = ri + 1 == bins || v >= vote(ai, ri + 1);
            if left && right && below && above {
                candidates.push(angles[ai]);
            }
        }
    }
    if candidates.is_empty() {
        debug!("No skew candidates above {} votes", config.hough_threshold);
        return None;
    }

    candidates.sort_by(|a, b| a.total_cmp(b));
    let mid = candidates.len() / 2;
    let median = if candidates.len() % 2 == 0 {
        (candidates[mid - 1] + candidates[mid]) / 2.0
    } else {
        candidates[mid]
    };
    debug!(
        candidates = candidates.len(),
        angle = median,
        "Skew estimate"
    );
    (median.abs() >= config.min_skew_degrees).then_some(median)
}

/// Straighten `image`, falling back to the input when correction fails.
pub fn deskew(image: &DynamicImage, config: &NormalizeConfig) -> Recovered<DynamicImage> {
    let Some(angle) = estimate_skew(&image.to_luma8(), config) else {
        return Recovered::Enhanced(image.clone());
    };
    match rotate(image, angle) {
        Ok(rotated) => {
            debug!("Deskewed by {:.2}°", angle);
            Recovered::Enhanced(rotated)
        }
        Err(e) => Recovered::fallback(image.clone(), format!("rotation by {angle:.2}° failed: {e}")),
    }
}

/// Rotate about the center, counter-clockwise on screen for positive degrees.
///
/// Bicubic sampling; out-of-frame samples replicate the nearest edge pixel.
pub fn rotate(image: &DynamicImage, degrees: f64) -> Result<DynamicImage, DocStructError> {
    Ok(match image {
        DynamicImage::ImageLuma8(b) => DynamicImage::ImageLuma8(rotate_buffer(b, degrees)?),
        DynamicImage::ImageLumaA8(b) => DynamicImage::ImageLumaA8(rotate_buffer(b, degrees)?),
        DynamicImage::ImageRgb8(b) => DynamicImage::ImageRgb8(rotate_buffer(b, degrees)?),
        DynamicImage::ImageRgba8(b) => DynamicImage::ImageRgba8(rotate_buffer(b, degrees)?),
        other => DynamicImage::ImageRgba8(rotate_buffer(&other.to_rgba8(), degrees)?),
    })
}

fn rotate_buffer<P>(src: &ImageBuffer<P, Vec<u8>>, degrees: f64) -> Result<ImageBuffer<P, Vec<u8>>, DocStructError>
where
    P: Pixel<Subpixel = u8> + Send + Sync,
{
    let (w, h) = src.dimensions();
    let channels = P::CHANNEL_COUNT as usize;
    let raw = src.as_raw();
    let (sin, cos) = degrees.to_radians().sin_cos();
    let (cx, cy) = ((w as f64 - 1.0) / 2.0, (h as f64 - 1.0) / 2.0);
    let row_len = w as usize * channels;

    let mut out = vec![0u8; raw.len()];
    out.par_chunks_mut(row_len).enumerate().for_each(|(y, row)| {
        let dy = y as f64 - cy;
        for x in 0..w as usize {
            let dx = x as f64 - cx;
            let sx = cx + cos * dx - sin * dy;
            let sy = cy + sin * dx + cos * dy;
            for c in 0..channels {
                row[x * channels + c] = sample_bicubic(raw, w, h, channels, c, sx, sy);
            }
        }
    });
    ImageBuffer::from_raw(w, h, out)
        .ok_or_else(|| DocStructError::NormalizationFailure("rotated buffer has wrong size".into()))
}

/// Cubic convolution kernel with a = -0.75.
fn cubic_weight(t: f64) -> f64 {
    const A: f64 = -0.75;
    let t = t.abs();
    if t <= 1.0 {
        ((A + 2.0) * t - (A + 3.0)) * t * t + 1.0
    } else if t < 2.0 {
        ((A * t - 5.0 * A) * t + 8.0 * A) * t - 4.0 * A
    } else {
        0.0
    }
}

fn sample_bicubic(raw: &[u8], w: u32, h: u32, channels: usize, c: usize, sx: f64, sy: f64) -> u8 {
    let x0 = sx.floor();
    let y0 = sy.floor();
    let (fx, fy) = (sx - x0, sy - y0);
    let clamp = |v: i64, max: u32| v.clamp(0, max as i64 - 1) as usize;
    let mut acc = 0.0;
    for j in -1..=2i64 {
        let wy = cubic_weight(fy - j as f64);
        let yy = clamp(y0 as i64 + j, h);
        for i in -1..=2i64 {
            let wx = cubic_weight(fx - i as f64);
            let xx = clamp(x0 as i64 + i, w);
            acc += wx * wy * raw[(yy * w as usize + xx) * channels + c] as f64;
        }
    }
    acc.round().clamp(0.0, 255.0) as u8
}

// ── Denoise ──────────────────────────────────────────────────────────────

/// Non-local means: each pixel becomes a weighted mean of pixels in its
/// search window, weighted by patch similarity.
///
/// Patch distances are taken per offset from an integral image of squared
/// differences, so the cost is independent of the patch size.
fn denoise_nlm(gray: &GrayImage, strength: f32, patch_radius: u32, search_radius: u32) -> GrayImage {
    if strength <= 0.0 || search_radius == 0 {
        return gray.clone();
    }
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let src: Vec<f32> = gray.as_raw().iter().map(|&v| v as f32).collect();
    let h2 = (strength * strength) as f64;
    let pr = patch_radius as i64;
    let sr = search_radius as i64;
    let at = |x: i64, y: i64| -> f32 {
        let xx = x.clamp(0, w as i64 - 1) as usize;
        let yy = y.clamp(0, h as i64 - 1) as usize;
        src[yy * w + xx]
    };

    let mut weights = vec![0f64; w * h];
    let mut sums = vec![0f64; w * h];
    for dy in -sr..=sr {
        for dx in -sr..=sr {
            let diff: Vec<f64> = (0..w * h)
                .into_par_iter()
                .map(|i| {
                    let (x, y) = ((i % w) as i64, (i / w) as i64);
                    let d = (at(x, y) - at(x + dx, y + dy)) as f64;
                    d * d
                })
                .collect();
            let integral = integral_image(&diff, w, h);

            weights
                .par_chunks_mut(w)
                .zip(sums.par_chunks_mut(w))
                .enumerate()
                .for_each(|(y, (ws, vs))| {
                    let y = y as i64;
                    for x in 0..w as i64 {
                        let dist = box_mean(&integral, w, h, x, y, pr);
                        let weight = (-dist / h2).exp();
                        ws[x as usize] += weight;
                        vs[x as usize] += weight * at(x + dx, y + dy) as f64;
                    }
                });
        }
    }

    let out: Vec<u8> = weights
        .iter()
        .zip(&sums)
        .zip(gray.as_raw())
        .map(|((&wt, &s), &orig)| if wt > 0.0 { (s / wt).round().clamp(0.0, 255.0) as u8 } else { orig })
        .collect();
    GrayImage::from_raw(w as u32, h as u32, out).unwrap_or_else(|| gray.clone())
}

/// Summed-area table with a zero first row and column.
fn integral_image(values: &[f64], w: usize, h: usize) -> Vec<f64> {
    let stride = w + 1;
    let mut out = vec![0f64; stride * (h + 1)];
    for y in 0..h {
        let mut row = 0.0;
        for x in 0..w {
            row += values[y * w + x];
            out[(y + 1) * stride + x + 1] = out[y * stride + x + 1] + row;
        }
    }
    out
}

/// Mean over the window of radius `r` around (x, y), clipped to the image.
fn box_mean(integral: &[f64], w: usize, h: usize, x: i64, y: i64, r: i64) -> f64 {
    let stride = w + 1;
    let x0 = (x - r).max(0) as usize;
    let y0 = (y - r).max(0) as usize;
    let x1 = ((x + r + 1) as usize).min(w);
    let y1 = ((y + r + 1) as usize).min(h);
    let area = ((x1 - x0) * (y1 - y0)) as f64;
    let sum = integral[y1 * stride + x1] - integral[y0 * stride + x1] - integral[y1 * stride + x0]
        + integral[y0 * stride + x0];
    sum / area
}

// ── Contrast ─────────────────────────────────────────────────────────────

/// Contrast-limited adaptive histogram equalization.
fn clahe(gray: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    let tw = w.div_ceil(grid).max(1);
    let th = h.div_ceil(grid).max(1);
    let nx = w.div_ceil(tw) as usize;
    let ny = h.div_ceil(th) as usize;

    let mut luts = vec![[0u8; 256]; nx * ny];
    for ty in 0..ny {
        for tx in 0..nx {
            let (x0, y0) = (tx as u32 * tw, ty as u32 * th);
            let (x1, y1) = ((x0 + tw).min(w), (y0 + th).min(h));
            let area = ((x1 - x0) * (y1 - y0)).max(1);

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x, y)[0] as usize] += 1;
                }
            }

            let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > limit {
                    excess += *bin - limit;
                    *bin = limit;
                }
            }
            let (bonus, rest) = (excess / 256, excess % 256);
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += bonus + u32::from((i as u32) < rest);
            }

            let lut = &mut luts[ty * nx + tx];
            let mut cum = 0u32;
            for (i, &count) in hist.iter().enumerate() {
                cum += count;
                lut[i] = ((cum as f32 * 255.0 / area as f32).round()).min(255.0) as u8;
            }
        }
    }

    // Tile-center coordinate → (low index, high index, weight of high).
    let axis = |pos: u32, tile: u32, n: usize| -> (usize, usize, f32) {
        let g = (pos as f32 + 0.5) / tile as f32 - 0.5;
        if g <= 0.0 {
            (0, 0, 0.0)
        } else if g >= (n - 1) as f32 {
            (n - 1, n - 1, 0.0)
        } else {
            let lo = g.floor() as usize;
            (lo, lo + 1, g - lo as f32)
        }
    };

    let mut out = vec![0u8; (w * h) as usize];
    out.par_chunks_mut(w as usize).enumerate().for_each(|(y, row)| {
        let (y_lo, y_hi, fy) = axis(y as u32, th, ny);
        for (x, px) in row.iter_mut().enumerate() {
            let (x_lo, x_hi, fx) = axis(x as u32, tw, nx);
            let v = gray.get_pixel(x as u32, y as u32)[0] as usize;
            let tl = luts[y_lo * nx + x_lo][v] as f32;
            let tr = luts[y_lo * nx + x_hi][v] as f32;
            let bl = luts[y_hi * nx + x_lo][v] as f32;
            let br = luts[y_hi * nx + x_hi][v] as f32;
            let top = tl + (tr - tl) * fx;
            let bottom = bl + (br - bl) * fx;
            *px = (top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8;
        }
    });
    GrayImage::from_raw(w, h, out).unwrap_or_else(|| gray.clone())
}

// ── Binarize & clean ─────────────────────────────────────────────────────

fn binarize_otsu(gray: &GrayImage) -> GrayImage {
    let (min, max) = gray
        .as_raw()
        .iter()
        .fold((u8::MAX, u8::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    // A flat image has no second class.
    let level = if min == max { 127 } else { imageproc::contrast::otsu_level(gray) };
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([if gray.get_pixel(x, y)[0] > level { 255 } else { 0 }])
    })
}

/// Opening of the white background with a 2×2 square.
fn open_2x2(binary: &GrayImage) -> GrayImage {
    let (w, h) = binary.dimensions();
    let white = |x: i64, y: i64, img: &GrayImage, outside: bool| {
        if x < 0 || y < 0 || x >= w as i64 || y >= h as i64 {
            outside
        } else {
            img.get_pixel(x as u32, y as u32)[0] > 0
        }
    };
    let eroded = GrayImage::from_fn(w, h, |x, y| {
        let (x, y) = (x as i64, y as i64);
        let keep = [(0, 0), (1, 0), (0, 1), (1, 1)]
            .iter()
            .all(|&(dx, dy)| white(x + dx, y + dy, binary, true));
        Luma([if keep { 255 } else { 0 }])
    });
    GrayImage::from_fn(w, h, |x, y| {
        let (x, y) = (x as i64, y as i64);
        let on = [(0, 0), (-1, 0), (0, -1), (-1, -1)]
            .iter()
            .any(|&(dx, dy)| white(x + dx, y + dy, &eroded, false));
        Luma([if on { 255 } else { 0 }])
    })
}

/// Clear faint ink sitting in large regions with little dark ink around.
///
/// `reference` is the denoised grayscale before equalization, which still
/// holds the true lightness of each mark. Pixels darker than the light level
/// are never modified.
fn suppress_overlays(binary: &GrayImage, reference: &GrayImage, config: &NormalizeConfig) -> GrayImage {
    let (w, h) = binary.dimensions();
    let (wu, hu) = (w as usize, h as usize);
    let is_ink = |x: u32, y: u32| binary.get_pixel(x, y)[0] == 0;
    let is_dark = |x: u32, y: u32| reference.get_pixel(x, y)[0] < config.overlay_light_level;

    let faint = GrayImage::from_fn(w, h, |x, y| {
        Luma([if is_ink(x, y) && !is_dark(x, y) { 255 } else { 0 }])
    });
    if faint.as_raw().iter().all(|&v| v == 0) {
        return binary.clone();
    }
    let regions = imageproc::morphology::close(&faint, Norm::LInf, config.overlay_close_radius);

    let dark: Vec<f64> = (0..hu * wu)
        .map(|i| {
            let (x, y) = ((i % wu) as u32, (i / wu) as u32);
            f64::from(u8::from(is_ink(x, y) && is_dark(x, y)))
        })
        .collect();
    let integral = integral_image(&dark, wu, hu);
    let r = (config.overlay_window / 2) as i64;

    GrayImage::from_fn(w, h, |x, y| {
        let v = binary.get_pixel(x, y)[0];
        if faint.get_pixel(x, y)[0] == 0 || regions.get_pixel(x, y)[0] == 0 {
            return Luma([v]);
        }
        let density = box_mean(&integral, wu, hu, x as i64, y as i64, r);
        if density < config.overlay_max_dark_density as f64 {
            Luma([255])
        } else {
            Luma([v])
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn test_config() -> NormalizeConfig {
        NormalizeConfig {
            hough_threshold: 100,
            ..NormalizeConfig::default()
        }
    }

    /// White page with three thick horizontal rules.
    fn ruled_page() -> DynamicImage {
        let img = RgbImage::from_fn(600, 400, |x, y| {
            let on_rule = (100..500).contains(&x) && [120, 200, 280].iter().any(|&r| (r..r + 3).contains(&y));
            if on_rule {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        DynamicImage::ImageRgb8(img)
    }

    /// Tilt the page so its rules fall by `theta` degrees to the right.
    fn tilted(theta: f64) -> DynamicImage {
        rotate(&ruled_page(), -theta).unwrap()
    }

    #[test]
    fn recovers_known_skew() {
        let cfg = test_config();
        for theta in [3.0, -7.5, 15.0] {
            let est = estimate_skew(&tilted(theta).to_luma8(), &cfg)
                .unwrap_or_else(|| panic!("no estimate for {theta}"));
            assert!((est - theta).abs() < 1.0, "theta={theta} est={est}");
        }
    }

    #[test]
    fn corrected_image_has_small_residual() {
        let cfg = test_config();
        for theta in [4.0, -12.0] {
            let fixed = deskew(&tilted(theta), &cfg).into_value();
            let residual = estimate_skew(&fixed.to_luma8(), &cfg).unwrap_or(0.0);
            assert!(residual.abs() < 0.5, "theta={theta} residual={residual}");
        }
    }

    #[test]
    fn aligned_image_is_untouched_in_color_mode() {
        let page = ruled_page();
        let out = normalize(&page, true, &test_config()).unwrap();
        assert_eq!(out.as_bytes(), page.as_bytes());
    }

    #[test]
    fn tiny_tilt_is_untouched() {
        let page = tilted(0.2);
        let out = normalize(&page, true, &test_config()).unwrap();
        assert_eq!(out.as_bytes(), page.as_bytes());
    }

    #[test]
    fn blank_page_has_no_skew() {
        let blank = GrayImage::from_pixel(100, 100, Luma([255]));
        assert_eq!(estimate_skew(&blank, &test_config()), None);
    }

    #[test]
    fn rotate_zero_is_identity() {
        let page = ruled_page();
        assert_eq!(rotate(&page, 0.0).unwrap().as_bytes(), page.as_bytes());
    }

    #[test]
    fn full_pipeline_is_binary() {
        let out = normalize(&tilted(5.0), false, &test_config()).unwrap();
        let gray = out.as_luma8().expect("luma output");
        assert_eq!(gray.dimensions(), (600, 400));
        assert!(gray.as_raw().iter().all(|&v| v == 0 || v == 255));
    }

    #[test]
    fn faint_blob_removed_dark_strokes_kept() {
        let img = GrayImage::from_fn(240, 240, |x, y| {
            if (20..200).contains(&x) && (20..26).contains(&y) {
                Luma([0])
            } else if (120..220).contains(&x) && (120..220).contains(&y) {
                Luma([200])
            } else {
                Luma([255])
            }
        });
        let out = normalize(&DynamicImage::ImageLuma8(img), false, &test_config()).unwrap();
        let gray = out.as_luma8().expect("luma output");
        assert_eq!(gray.get_pixel(100, 23)[0], 0, "dark rule must survive");
        assert_eq!(gray.get_pixel(170, 170)[0], 255, "faint blob must be cleared");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_image(b"definitely not an image"),
            Err(DocStructError::NormalizationFailure(_))
        ));
        assert!(decode_image(&[]).is_err());
    }

    #[test]
    fn integral_box_mean() {
        let values = vec![1.0; 16];
        let integral = integral_image(&values, 4, 4);
        assert_eq!(box_mean(&integral, 4, 4, 0, 0, 1), 1.0);
        assert_eq!(integral[integral.len() - 1], 16.0);
    }

    #[test]
    fn config_validation() {
        let bad = NormalizeConfig {
            clahe_grid: 0,
            ..NormalizeConfig::default()
        };
        assert!(bad.validate().is_err());
        assert!(NormalizeConfig::default().validate().is_ok());
    }
}
