//! Multi-scale normalized template matching.
//!
//! Window sums come from integral images. Cross terms are summed directly for
//! small searches and come from FFT correlation once the direct cost grows,
//! so a full-screen locate stays inside one poll interval.

use image::imageops::{self, FilterType};
use image::RgbaImage;
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::Deserialize;
use std::sync::{Arc, OnceLock};

use crate::errors::{FlowError, Result};
use crate::retry::RetrySettings;

/// A window whose variance is at most this share of its energy is flat.
const FLAT_TOLERANCE: f64 = 1e-9;
/// Multiply-adds per locate above which cross terms switch to FFT.
const DIRECT_LIMIT: usize = 1 << 22;
const ROWS_PER_TASK: usize = 16;
const TRANSPOSE_TILE: usize = 16;

/// Similarity metric used to compare a template with a capture window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    /// Zero-mean normalized cross-correlation. Higher is better, 1.0 is exact.
    #[default]
    #[serde(alias = "cv2.TM_CCOEFF_NORMED")]
    CcoeffNormed,
    /// Normalized cross-correlation. Higher is better, 1.0 is exact.
    #[serde(alias = "cv2.TM_CCORR_NORMED")]
    CcorrNormed,
    /// Normalized squared difference. A distance: lower is better, 0.0 is exact.
    #[serde(alias = "cv2.TM_SQDIFF_NORMED")]
    SqdiffNormed,
}

impl MatchMethod {
    pub fn higher_is_better(self) -> bool {
        !matches!(self, MatchMethod::SqdiffNormed)
    }

    /// Whether `score` clears `confidence`. Distances are accepted when they
    /// are at most `1 - confidence`.
    pub fn accepts(self, score: f64, confidence: f64) -> bool {
        if self.higher_is_better() {
            score >= confidence
        } else {
            score <= 1.0 - confidence
        }
    }

    /// Strict improvement; ties keep the incumbent.
    fn improves(self, candidate: f64, incumbent: f64) -> bool {
        if self.higher_is_better() {
            candidate > incumbent
        } else {
            candidate < incumbent
        }
    }

    fn centered(self) -> bool {
        matches!(self, MatchMethod::CcoeffNormed)
    }
}

/// Matching parameters shared by every anchor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchingConfig {
    pub method: MatchMethod,
    /// Compare single-channel luma instead of RGB.
    pub grayscale: bool,
    /// Template scale factors, all evaluated on every locate.
    pub scales: Vec<f64>,
    pub cache_templates: bool,
    /// Pause between missed locate attempts inside `find_and_click`.
    pub retry_interval_ms: u64,
    /// Retry policy for transient screen-capture failures.
    pub capture_retry: RetrySettings,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            method: MatchMethod::default(),
            grayscale: true,
            scales: vec![0.9, 1.0, 1.1],
            cache_templates: true,
            retry_interval_ms: 300,
            capture_retry: RetrySettings {
                max_attempts: 3,
                initial_delay_ms: 100,
                ..RetrySettings::default()
            },
        }
    }
}

impl MatchingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scales.is_empty() {
            return Err(FlowError::Configuration(
                "matching.scales must list at least one scale".to_string(),
            ));
        }
        if let Some(bad) = self.scales.iter().find(|s| !s.is_finite() || **s <= 0.0) {
            return Err(FlowError::Configuration(format!(
                "matching.scales must be positive, got {bad}"
            )));
        }
        Ok(())
    }
}

/// Best location of a template inside a capture, in capture pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub score: f64,
    pub scale: f64,
}

impl Candidate {
    /// Center of the matched window, rounded down like integer pixel math.
    pub fn center(&self) -> (u32, u32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }
}

/// Pixel data split into channel planes.
struct Planes {
    width: usize,
    height: usize,
    channels: Vec<Vec<f64>>,
}

impl Planes {
    fn from_image(image: &RgbaImage, grayscale: bool) -> Self {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let channel_count = if grayscale { 1 } else { 3 };
        let mut channels = vec![Vec::with_capacity(width * height); channel_count];
        for pixel in image.pixels() {
            let [r, g, b, _] = pixel.0;
            if grayscale {
                channels[0].push(0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64);
            } else {
                channels[0].push(r as f64);
                channels[1].push(g as f64);
                channels[2].push(b as f64);
            }
        }
        Self {
            width,
            height,
            channels,
        }
    }
}

/// Summed-area tables for fast window sums and sums of squares.
struct Integral {
    stride: usize,
    sum: Vec<f64>,
    sq_sum: Vec<f64>,
}

impl Integral {
    fn new(plane: &[f64], width: usize, height: usize) -> Self {
        let stride = width + 1;
        let mut sum = vec![0.0; stride * (height + 1)];
        let mut sq_sum = vec![0.0; stride * (height + 1)];
        for y in 0..height {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..width {
                let v = plane[y * width + x];
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sq_sum[(y + 1) * stride + x + 1] = sq_sum[y * stride + x + 1] + row_sq;
            }
        }
        Self {
            stride,
            sum,
            sq_sum,
        }
    }

    fn window(&self, table: &[f64], x: usize, y: usize, w: usize, h: usize) -> f64 {
        let s = self.stride;
        table[(y + h) * s + x + w] - table[y * s + x + w] - table[(y + h) * s + x] + table[y * s + x]
    }

    fn window_sum(&self, x: usize, y: usize, w: usize, h: usize) -> f64 {
        self.window(&self.sum, x, y, w, h)
    }

    fn window_sq_sum(&self, x: usize, y: usize, w: usize, h: usize) -> f64 {
        self.window(&self.sq_sum, x, y, w, h)
    }
}

/// Variance that rounding alone could produce is reported as exactly zero.
fn flat_to_zero(variance: f64, energy: f64) -> f64 {
    if variance <= energy * FLAT_TOLERANCE {
        0.0
    } else {
        variance
    }
}

/// A scaled template ready to be slid over a haystack. For the zero-mean
/// metric the planes are centered up front so the cross term needs no
/// window mean.
struct Needle {
    width: usize,
    height: usize,
    channels: Vec<Vec<f64>>,
    energy: f64,
}

impl Needle {
    fn new(image: &RgbaImage, grayscale: bool, centered: bool) -> Self {
        let planes = Planes::from_image(image, grayscale);
        let (width, height) = (planes.width, planes.height);
        let n = (width * height) as f64;
        let mut energy = 0.0;
        let channels = planes
            .channels
            .into_iter()
            .map(|plane| {
                let sum: f64 = plane.iter().sum();
                let sq: f64 = plane.iter().map(|v| v * v).sum();
                if centered {
                    let mean = sum / n;
                    energy += flat_to_zero(sq - sum * sum / n, sq);
                    plane.iter().map(|v| v - mean).collect()
                } else {
                    energy += sq;
                    plane
                }
            })
            .collect();
        Self {
            width,
            height,
            channels,
            energy,
        }
    }
}

/// A capture prepared once and matched against any number of templates.
pub struct Haystack {
    planes: Planes,
    integrals: Vec<Integral>,
    spectra: OnceLock<Spectra>,
}

impl Haystack {
    pub fn new(capture: &RgbaImage, grayscale: bool) -> Self {
        let planes = Planes::from_image(capture, grayscale);
        let integrals = planes
            .channels
            .iter()
            .map(|plane| Integral::new(plane, planes.width, planes.height))
            .collect();
        Self {
            planes,
            integrals,
            spectra: OnceLock::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.planes.width as u32
    }

    pub fn height(&self) -> u32 {
        self.planes.height as u32
    }

    fn grayscale(&self) -> bool {
        self.planes.channels.len() == 1
    }

    fn fits(&self, needle: &Needle) -> bool {
        needle.width <= self.planes.width && needle.height <= self.planes.height
    }

    /// Number of (columns, rows) at which `needle` can be placed.
    fn placements(&self, needle: &Needle) -> (usize, usize) {
        (
            self.planes.width - needle.width + 1,
            self.planes.height - needle.height + 1,
        )
    }

    /// Summed window energy over all channels, centered for the zero-mean
    /// metric.
    fn window_energy(&self, x: usize, y: usize, w: usize, h: usize, centered: bool) -> f64 {
        let n = (w * h) as f64;
        self.integrals
            .iter()
            .map(|integral| {
                let sq = integral.window_sq_sum(x, y, w, h);
                if centered {
                    let s = integral.window_sum(x, y, w, h);
                    flat_to_zero(sq - s * s / n, sq)
                } else {
                    sq
                }
            })
            .sum()
    }

    /// Cross terms of every needle at every placement, row-major per needle.
    fn cross_terms(&self, needles: &[&Needle]) -> Vec<Vec<f64>> {
        let work: usize = needles
            .iter()
            .map(|needle| {
                let (cols, rows) = self.placements(needle);
                cols * rows * needle.width * needle.height * needle.channels.len()
            })
            .sum();
        if work <= DIRECT_LIMIT {
            return needles.iter().map(|needle| self.direct_cross(needle)).collect();
        }
        self.spectra
            .get_or_init(|| Spectra::new(&self.planes))
            .cross_terms(&self.planes, needles)
    }

    fn direct_cross(&self, needle: &Needle) -> Vec<f64> {
        let hay = &self.planes;
        let (tw, th) = (needle.width, needle.height);
        let (cols, rows) = self.placements(needle);
        let mut out = vec![0.0; cols * rows];
        out.par_chunks_mut(cols).enumerate().for_each(|(y, row_out)| {
            for (x, slot) in row_out.iter_mut().enumerate() {
                let mut cross = 0.0;
                for (iplane, tplane) in hay.channels.iter().zip(&needle.channels) {
                    for ty in 0..th {
                        let row = &iplane[(y + ty) * hay.width + x..][..tw];
                        let trow = &tplane[ty * tw..][..tw];
                        cross += trow.iter().zip(row).map(|(a, b)| a * b).sum::<f64>();
                    }
                }
                *slot = cross;
            }
        });
        out
    }
}

/// Evaluate `template` at every scale and keep the best-scoring location.
///
/// Every scale is evaluated even after a perfect score; on equal scores the
/// scale listed first wins. Returns `None` when no scale fits in the capture.
pub fn best_match(
    haystack: &Haystack,
    template: &RgbaImage,
    method: MatchMethod,
    scales: &[f64],
) -> Option<Candidate> {
    let needles: Vec<(f64, Needle)> = scales
        .iter()
        .filter_map(|&scale| {
            let scaled = scale_template(template, scale)?;
            let needle = Needle::new(&scaled, haystack.grayscale(), method.centered());
            haystack.fits(&needle).then_some((scale, needle))
        })
        .collect();
    let refs: Vec<&Needle> = needles.iter().map(|(_, needle)| needle).collect();
    let crosses = haystack.cross_terms(&refs);

    let mut best: Option<Candidate> = None;
    for ((scale, needle), cross) in needles.iter().zip(&crosses) {
        let Some((x, y, score)) = scan(haystack, needle, cross, method) else {
            continue;
        };
        let candidate = Candidate {
            x,
            y,
            width: needle.width as u32,
            height: needle.height as u32,
            score,
            scale: *scale,
        };
        match best {
            Some(current) if !method.improves(candidate.score, current.score) => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// Resize a template by `scale`, or `None` when the result would be empty.
pub fn scale_template(template: &RgbaImage, scale: f64) -> Option<RgbaImage> {
    let width = (template.width() as f64 * scale).round();
    let height = (template.height() as f64 * scale).round();
    if width < 1.0 || height < 1.0 {
        return None;
    }
    let (width, height) = (width as u32, height as u32);
    if (width, height) == template.dimensions() {
        return Some(template.clone());
    }
    Some(imageops::resize(template, width, height, FilterType::Triangle))
}

/// Best placement of `needle` as (x, y, score); the first raster position
/// wins ties.
fn scan(haystack: &Haystack, needle: &Needle, cross: &[f64], method: MatchMethod) -> Option<(u32, u32, f64)> {
    let (cols, _) = haystack.placements(needle);
    let centered = method.centered();
    let row_best: Vec<Option<(usize, f64)>> = cross
        .par_chunks(cols)
        .enumerate()
        .map(|(y, row)| {
            let mut best: Option<(usize, f64)> = None;
            for (x, &c) in row.iter().enumerate() {
                let energy = haystack.window_energy(x, y, needle.width, needle.height, centered);
                let score = normalized_score(method, c, needle.energy, energy);
                match best {
                    Some((_, incumbent)) if !method.improves(score, incumbent) => {}
                    _ => best = Some((x, score)),
                }
            }
            best
        })
        .collect();

    let mut best: Option<(u32, u32, f64)> = None;
    for (y, (x, score)) in row_best.into_iter().enumerate().filter_map(|(y, b)| Some((y, b?))) {
        match best {
            Some((_, _, incumbent)) if !method.improves(score, incumbent) => {}
            _ => best = Some((x as u32, y as u32, score)),
        }
    }
    best
}

fn normalized_score(method: MatchMethod, cross: f64, template_energy: f64, window_energy: f64) -> f64 {
    let degenerate = template_energy <= 0.0 || window_energy <= 0.0;
    match method {
        MatchMethod::CcoeffNormed | MatchMethod::CcorrNormed => {
            if degenerate {
                0.0
            } else {
                (cross / (template_energy * window_energy).sqrt()).clamp(-1.0, 1.0)
            }
        }
        MatchMethod::SqdiffNormed => {
            if degenerate {
                // Two empty signals are identical; one empty signal is as far
                // as it gets.
                if template_energy <= 0.0 && window_energy <= 0.0 {
                    0.0
                } else {
                    1.0
                }
            } else {
                let diff = (template_energy - 2.0 * cross + window_energy).max(0.0);
                diff / (template_energy * window_energy).sqrt()
            }
        }
    }
}

/// Haystack channel spectra, computed once per capture.
struct Spectra {
    fft: Fft2d,
    channels: Vec<Vec<Complex<f64>>>,
}

impl Spectra {
    fn new(planes: &Planes) -> Self {
        let fft = Fft2d::new(planes.width, planes.height);
        let mut channels = Vec::with_capacity(planes.channels.len());
        for pair in planes.channels.chunks(2) {
            let second = pair.get(1).map(|plane| (plane.as_slice(), planes.width));
            let packed = fft.forward(fft.pack((pair[0].as_slice(), planes.width), second), planes.height);
            if second.is_some() {
                let (a, b) = fft.split(&packed);
                channels.push(a);
                channels.push(b);
            } else {
                channels.push(packed);
            }
        }
        Self { fft, channels }
    }

    /// Needles are correlated two at a time: the second rides in the
    /// imaginary part of both the forward and the inverse transform.
    fn cross_terms(&self, planes: &Planes, needles: &[&Needle]) -> Vec<Vec<f64>> {
        let norm = 1.0 / self.fft.len() as f64;
        let mut out = Vec::with_capacity(needles.len());
        for pair in needles.chunks(2) {
            let (first, second) = (pair[0], pair.get(1).copied());
            let shortest = second.map_or(first.height, |n| n.height.min(first.height));
            let grid = self.fft.inverse(self.correlate(first, second), planes.height - shortest + 1);
            out.push(extract(&grid, planes, first, |c| c.re * norm));
            if let Some(second) = second {
                out.push(extract(&grid, planes, second, |c| c.im * norm));
            }
        }
        out
    }

    /// Sum over channels of the capture spectrum times the conjugate needle
    /// spectrum.
    fn correlate(&self, first: &Needle, second: Option<&Needle>) -> Vec<Complex<f64>> {
        let mut product = vec![Complex::default(); self.fft.len()];
        let rows = second.map_or(first.height, |n| n.height.max(first.height));
        for (c, image) in self.channels.iter().enumerate() {
            let packed = self.fft.forward(
                self.fft.pack(
                    (first.channels[c].as_slice(), first.width),
                    second.map(|n| (n.channels[c].as_slice(), n.width)),
                ),
                rows,
            );
            if second.is_some() {
                let (a, b) = self.fft.split(&packed);
                accumulate(&mut product, image, &a, Complex::new(1.0, 0.0));
                accumulate(&mut product, image, &b, Complex::i());
            } else {
                accumulate(&mut product, image, &packed, Complex::new(1.0, 0.0));
            }
        }
        product
    }
}

fn accumulate(product: &mut [Complex<f64>], image: &[Complex<f64>], needle: &[Complex<f64>], weight: Complex<f64>) {
    product
        .par_iter_mut()
        .zip(image.par_iter())
        .zip(needle.par_iter())
        .for_each(|((p, i), t)| *p += weight * (i * t.conj()));
}

/// The valid placements of `needle` out of a full correlation grid.
fn extract(grid: &[Complex<f64>], planes: &Planes, needle: &Needle, part: impl Fn(&Complex<f64>) -> f64) -> Vec<f64> {
    let cols = planes.width - needle.width + 1;
    let rows = planes.height - needle.height + 1;
    let mut out = Vec::with_capacity(cols * rows);
    for y in 0..rows {
        out.extend(grid[y * planes.width..][..cols].iter().map(&part));
    }
    out
}

/// 2-D transforms over a fixed `width x height` grid. Spatial grids are
/// row-major; spectra are column-major so both passes run on contiguous rows.
struct Fft2d {
    width: usize,
    height: usize,
    rows_forward: Arc<dyn Fft<f64>>,
    columns_forward: Arc<dyn Fft<f64>>,
    rows_inverse: Arc<dyn Fft<f64>>,
    columns_inverse: Arc<dyn Fft<f64>>,
}

impl Fft2d {
    fn new(width: usize, height: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            width,
            height,
            rows_forward: planner.plan_fft_forward(width),
            columns_forward: planner.plan_fft_forward(height),
            rows_inverse: planner.plan_fft_inverse(width),
            columns_inverse: planner.plan_fft_inverse(height),
        }
    }

    fn len(&self) -> usize {
        self.width * self.height
    }

    /// Zero grid with `first` in the real part and `second` in the imaginary
    /// part, both anchored at the top-left corner.
    fn pack(&self, first: (&[f64], usize), second: Option<(&[f64], usize)>) -> Vec<Complex<f64>> {
        let mut grid = vec![Complex::default(); self.len()];
        for (y, row) in first.0.chunks(first.1).enumerate() {
            for (slot, v) in grid[y * self.width..].iter_mut().zip(row) {
                slot.re = *v;
            }
        }
        if let Some((plane, width)) = second {
            for (y, row) in plane.chunks(width).enumerate() {
                for (slot, v) in grid[y * self.width..].iter_mut().zip(row) {
                    slot.im = *v;
                }
            }
        }
        grid
    }

    /// Forward transform of a grid whose nonzero rows are `0..rows`.
    fn forward(&self, mut grid: Vec<Complex<f64>>, rows: usize) -> Vec<Complex<f64>> {
        process_rows(self.rows_forward.as_ref(), &mut grid[..rows * self.width], self.width);
        let mut spectrum = transpose(&grid, self.width, self.height);
        process_rows(self.columns_forward.as_ref(), &mut spectrum, self.height);
        spectrum
    }

    /// Unnormalized inverse of [`forward`](Self::forward); only rows `0..rows`
    /// of the result are transformed.
    fn inverse(&self, mut spectrum: Vec<Complex<f64>>, rows: usize) -> Vec<Complex<f64>> {
        process_rows(self.columns_inverse.as_ref(), &mut spectrum, self.height);
        let mut grid = transpose(&spectrum, self.height, self.width);
        process_rows(self.rows_inverse.as_ref(), &mut grid[..rows * self.width], self.width);
        grid
    }

    /// Separate the spectra of two real planes packed by [`pack`](Self::pack).
    fn split(&self, packed: &[Complex<f64>]) -> (Vec<Complex<f64>>, Vec<Complex<f64>>) {
        let (w, h) = (self.width, self.height);
        let mut a = vec![Complex::default(); packed.len()];
        let mut b = vec![Complex::default(); packed.len()];
        a.par_chunks_mut(h)
            .zip(b.par_chunks_mut(h))
            .enumerate()
            .for_each(|(kx, (column_a, column_b))| {
                let mirror = (w - kx) % w;
                for ky in 0..h {
                    let z = packed[kx * h + ky];
                    let conj = packed[mirror * h + (h - ky) % h].conj();
                    column_a[ky] = (z + conj) * 0.5;
                    column_b[ky] = (z - conj) * Complex::new(0.0, -0.5);
                }
            });
        (a, b)
    }
}

fn process_rows(fft: &dyn Fft<f64>, data: &mut [Complex<f64>], len: usize) {
    data.par_chunks_mut(len * ROWS_PER_TASK)
        .for_each(|chunk| fft.process(chunk));
}

/// `src` holds `height` rows of `width`; the result holds `width` rows of
/// `height`.
fn transpose(src: &[Complex<f64>], width: usize, height: usize) -> Vec<Complex<f64>> {
    let mut dst = vec![Complex::default(); src.len()];
    dst.par_chunks_mut(height * TRANSPOSE_TILE)
        .enumerate()
        .for_each(|(block, out)| {
            let x0 = block * TRANSPOSE_TILE;
            let cols = out.len() / height;
            for y in 0..height {
                for (i, v) in src[y * width + x0..][..cols].iter().enumerate() {
                    out[i * height + y] = *v;
                }
            }
        });
    dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    /// Deterministic noise so no two windows look alike.
    fn noise(width: u32, height: u32, seed: u32) -> RgbaImage {
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        RgbaImage::from_fn(width, height, |_, _| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let v = (state >> 24) as u8;
            Rgba([v, v.wrapping_mul(3), v.wrapping_add(90), 255])
        })
    }

    #[test]
    fn exact_template_scores_one_at_its_position() {
        let template = noise(12, 10, 7);
        let mut capture = noise(80, 60, 99);
        imageops::replace(&mut capture, &template, 31, 17);

        for grayscale in [true, false] {
            let haystack = Haystack::new(&capture, grayscale);
            let found = best_match(&haystack, &template, MatchMethod::CcoeffNormed, &[1.0]).unwrap();
            assert_eq!((found.x, found.y), (31, 17));
            assert!(found.score > 0.999, "score was {}", found.score);
            assert_eq!(found.center(), (37, 22));
        }
    }

    #[test]
    fn every_method_finds_the_exact_copy() {
        let template = noise(9, 9, 3);
        let mut capture = noise(50, 40, 11);
        imageops::replace(&mut capture, &template, 5, 22);
        let haystack = Haystack::new(&capture, true);

        let ccorr = best_match(&haystack, &template, MatchMethod::CcorrNormed, &[1.0]).unwrap();
        assert_eq!((ccorr.x, ccorr.y), (5, 22));
        assert!(MatchMethod::CcorrNormed.accepts(ccorr.score, 0.99));

        let sqdiff = best_match(&haystack, &template, MatchMethod::SqdiffNormed, &[1.0]).unwrap();
        assert_eq!((sqdiff.x, sqdiff.y), (5, 22));
        assert!(sqdiff.score < 1e-6);
        assert!(MatchMethod::SqdiffNormed.accepts(sqdiff.score, 0.99));
        assert!(!MatchMethod::SqdiffNormed.accepts(0.2, 0.9));
    }

    #[test]
    fn picks_the_scale_that_matches_best() {
        let template = noise(20, 20, 5);
        let enlarged = scale_template(&template, 1.1).unwrap();
        assert_eq!(enlarged.dimensions(), (22, 22));

        let mut capture = noise(90, 70, 21);
        imageops::replace(&mut capture, &enlarged, 40, 30);
        let haystack = Haystack::new(&capture, true);

        let found = best_match(&haystack, &template, MatchMethod::CcoeffNormed, &[0.9, 1.0, 1.1]).unwrap();
        assert_eq!(found.scale, 1.1);
        assert_eq!((found.x, found.y), (40, 30));
        assert_eq!((found.width, found.height), (22, 22));

        let found = best_match(&haystack, &template, MatchMethod::SqdiffNormed, &[0.9, 1.0, 1.1]).unwrap();
        assert_eq!(found.scale, 1.1);
    }

    #[test]
    fn ties_keep_the_first_listed_scale() {
        let template = noise(10, 10, 8);
        let mut capture = noise(40, 40, 2);
        imageops::replace(&mut capture, &template, 3, 4);
        let haystack = Haystack::new(&capture, true);

        let found = best_match(&haystack, &template, MatchMethod::CcoeffNormed, &[1.0, 1.0]).unwrap();
        assert_eq!(found.scale, 1.0);
        assert_eq!((found.x, found.y), (3, 4));
    }

    #[test]
    fn oversized_scales_are_skipped() {
        let template = noise(30, 30, 1);
        let capture = noise(32, 32, 4);
        let haystack = Haystack::new(&capture, true);
        assert!(best_match(&haystack, &template, MatchMethod::CcoeffNormed, &[1.5, 2.0]).is_none());
        assert!(best_match(&haystack, &template, MatchMethod::CcoeffNormed, &[1.0]).is_some());
        assert!(scale_template(&template, 0.01).is_none());
    }

    #[test]
    fn flat_window_does_not_match_textured_template() {
        let template = noise(8, 8, 12);
        let capture = RgbaImage::from_pixel(30, 30, Rgba([128, 128, 128, 255]));
        let haystack = Haystack::new(&capture, true);
        let found = best_match(&haystack, &template, MatchMethod::CcoeffNormed, &[1.0]).unwrap();
        assert_eq!(found.score, 0.0);
        assert!(!MatchMethod::CcoeffNormed.accepts(found.score, 0.5));
    }

    #[test]
    fn flat_window_in_rgb_scores_zero_for_every_correlation() {
        let template = noise(6, 5, 4);
        let capture = RgbaImage::from_pixel(24, 20, Rgba([200, 17, 91, 255]));
        let haystack = Haystack::new(&capture, false);
        for method in [MatchMethod::CcoeffNormed, MatchMethod::CcorrNormed] {
            let found = best_match(&haystack, &template, method, &[1.0]).unwrap();
            assert!(found.score.abs() < 1.0, "{method:?} scored {}", found.score);
        }
        let found = best_match(&haystack, &template, MatchMethod::CcoeffNormed, &[1.0]).unwrap();
        assert_eq!(found.score, 0.0);
        assert_eq!((found.x, found.y), (0, 0));
    }

    #[test]
    fn fft_cross_terms_agree_with_direct_sums() {
        let capture = noise(64, 48, 31);
        for grayscale in [true, false] {
            let haystack = Haystack::new(&capture, grayscale);
            let needles: Vec<Needle> = [(9, 7, 1), (12, 12, 2), (5, 10, 3)]
                .iter()
                .map(|&(w, h, seed)| Needle::new(&noise(w, h, seed), grayscale, true))
                .collect();
            let refs: Vec<&Needle> = needles.iter().collect();

            let spectral = Spectra::new(&haystack.planes).cross_terms(&haystack.planes, &refs);
            assert_eq!(spectral.len(), needles.len());
            for (needle, fast) in needles.iter().zip(&spectral) {
                let direct = haystack.direct_cross(needle);
                assert_eq!(direct.len(), fast.len());
                let peak = direct.iter().fold(1.0f64, |m, v| m.max(v.abs()));
                let worst = direct
                    .iter()
                    .zip(fast)
                    .fold(0.0f64, |m, (a, b)| m.max((a - b).abs()));
                assert!(worst <= peak * 1e-9, "deviation {worst} against peak {peak}");
            }
        }
    }

    #[test]
    fn large_capture_is_matched_through_the_fft_path() {
        let template = noise(40, 30, 17);
        let mut capture = noise(400, 300, 23);
        imageops::replace(&mut capture, &template, 123, 201);
        let haystack = Haystack::new(&capture, true);

        let placements = (400 - 40 + 1) * (300 - 30 + 1) * 40 * 30;
        assert!(placements > DIRECT_LIMIT);

        for method in [
            MatchMethod::CcoeffNormed,
            MatchMethod::CcorrNormed,
            MatchMethod::SqdiffNormed,
        ] {
            let found = best_match(&haystack, &template, method, &[1.0]).unwrap();
            assert_eq!((found.x, found.y), (123, 201), "{method:?}");
            assert!(method.accepts(found.score, 0.99), "{method:?} scored {}", found.score);
        }
        assert!(haystack.spectra.get().is_some());
    }

    #[test]
    fn scales_must_be_positive() {
        let mut config = MatchingConfig::default();
        assert!(config.validate().is_ok());
        config.scales = vec![1.0, -0.5];
        assert!(config.validate().is_err());
        config.scales.clear();
        assert!(config.validate().is_err());
    }
}
