//! Extraction of 2D cross-sections and their mapping to display images.

use crate::enums::{Colormap, Rotation};

use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use ndarray::{Array2, ArrayView2, ArrayView3, Axis};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SliceError {
    #[error("axis {0} does not exist in a 3D volume")]
    InvalidAxis(usize),

    #[error("index {index} is out of bounds for axis {axis} with length {len}")]
    OutOfBounds { axis: usize, index: usize, len: usize },

    #[error("frame {frame} is out of bounds for a volume with {frames} frames")]
    FrameOutOfBounds { frame: usize, frames: usize },
}

/// Intensity range mapped onto the full display ramp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub min: f32,
    pub max: f32,
}

impl Window {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    fn of(samples: &Array2<f32>) -> Self {
        let (min, max) = samples
            .iter()
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if min > max {
            Self::new(0.0, 0.0)
        } else {
            Self::new(min, max)
        }
    }

    /// Position of `value` inside the window, clamped to `0.0..=1.0`.
    /// A flat window maps everything to 0.
    #[inline]
    fn normalize(&self, value: f32) -> f32 {
        let range = self.max - self.min;
        if range <= 0.0 || !value.is_finite() {
            return 0.0;
        }
        ((value - self.min) / range).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SliceOptions {
    pub rotation: Rotation,
    pub window: Option<Window>,
}

impl SliceOptions {
    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_window(mut self, window: Window) -> Self {
        self.window = Some(window);
        self
    }
}

/// A 2D cross-section in display orientation: rows run top to bottom,
/// columns left to right.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    samples: Array2<f32>,
    window: Window,
}

impl Raster {
    pub fn samples(&self) -> &Array2<f32> {
        &self.samples
    }

    /// (height, width)
    pub fn dim(&self) -> (usize, usize) {
        self.samples.dim()
    }

    pub fn window(&self) -> Window {
        self.window
    }

    /// Grayscale ramp from black at `window.min` to white at `window.max`.
    pub fn to_luma8(&self) -> GrayImage {
        let (height, width) = self.dim();
        ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
            let value = self.window.normalize(self.samples[[y as usize, x as usize]]);
            Luma([to_u8(value)])
        })
    }

    pub fn to_rgb8(&self, colormap: Colormap) -> RgbImage {
        let (height, width) = self.dim();
        ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
            let value = self.window.normalize(self.samples[[y as usize, x as usize]]);
            Rgb(apply_colormap(colormap, value).map(to_u8))
        })
    }
}

#[inline]
fn to_u8(value: f32) -> u8 {
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}

// Piecewise linear segments (x, y) per channel.
const BONE: [&[(f32, f32)]; 3] = [
    &[(0.0, 0.0), (0.746032, 0.652778), (1.0, 1.0)],
    &[(0.0, 0.0), (0.365079, 0.319444), (0.746032, 0.777778), (1.0, 1.0)],
    &[(0.0, 0.0), (0.365079, 0.444444), (1.0, 1.0)],
];

const HOT: [&[(f32, f32)]; 3] = [
    &[(0.0, 0.0416), (0.365079, 1.0), (1.0, 1.0)],
    &[(0.0, 0.0), (0.365079, 0.0), (0.746032, 1.0), (1.0, 1.0)],
    &[(0.0, 0.0), (0.746032, 0.0), (1.0, 1.0)],
];

fn apply_colormap(colormap: Colormap, value: f32) -> [f32; 3] {
    match colormap {
        Colormap::Gray => [value; 3],
        Colormap::Bone => BONE.map(|segments| interpolate(segments, value)),
        Colormap::Hot => HOT.map(|segments| interpolate(segments, value)),
    }
}

fn interpolate(segments: &[(f32, f32)], x: f32) -> f32 {
    for pair in segments.windows(2) {
        let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
        if x <= x1 {
            let t = if x1 > x0 { (x - x0) / (x1 - x0) } else { 0.0 };
            return y0 + t.clamp(0.0, 1.0) * (y1 - y0);
        }
    }
    segments.last().map_or(0.0, |&(_, y)| y)
}

/// Counter-clockwise rotation by whole quarter turns, the same as numpy's
/// `rot90(slice, k)`. Only strides change; no data is copied.
pub fn rotate<'a>(slice: ArrayView2<'a, f32>, rotation: Rotation) -> ArrayView2<'a, f32> {
    let mut view = slice;
    match rotation {
        Rotation::None => {}
        Rotation::Quarter => {
            view = view.reversed_axes();
            view.invert_axis(Axis(0));
        }
        Rotation::Half => {
            view.invert_axis(Axis(0));
            view.invert_axis(Axis(1));
        }
        Rotation::ThreeQuarters => {
            view = view.reversed_axes();
            view.invert_axis(Axis(1));
        }
    }
    view
}

/// Take the cross-section at `index` along `axis` and prepare it for display.
///
/// The remaining two axes keep their relative order: the lower one becomes
/// the raster rows, the higher one its columns, before `options.rotation`
/// is applied.
pub fn extract_slice(
    volume: ArrayView3<'_, f32>,
    axis: usize,
    index: usize,
    options: &SliceOptions,
) -> Result<Raster, SliceError> {
    if axis > 2 {
        return Err(SliceError::InvalidAxis(axis));
    }
    let len = volume.len_of(Axis(axis));
    if index >= len {
        return Err(SliceError::OutOfBounds { axis, index, len });
    }

    let slice = volume.index_axis_move(Axis(axis), index);
    let samples = rotate(slice, options.rotation)
        .as_standard_layout()
        .into_owned();
    let window = options.window.unwrap_or_else(|| Window::of(&samples));

    Ok(Raster { samples, window })
}
