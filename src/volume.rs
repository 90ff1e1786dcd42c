use crate::enums::Plane;
use crate::orientation::{self, AxisCodes};
use crate::renderer::{self, Raster, SliceError, SliceOptions};

use nalgebra::Matrix4;
use ndarray::{ArrayD, ArrayView3, Axis, Ix3};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VolumeError {
    #[error("volume must have 3 or 4 dimensions, got {0}")]
    Rank(usize),

    #[error("volume has an empty axis: {0:?}")]
    EmptyAxis(Vec<usize>),
}

/// Voxel intensities indexed `[i, j, k]` or `[i, j, k, t]` together with
/// the affine mapping voxel indices to world (RAS+) millimetres.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: ArrayD<f32>,
    affine: Matrix4<f64>,
    frame_duration: Option<f32>,
    description: String,
}

impl Volume {
    pub fn new(data: ArrayD<f32>, affine: Matrix4<f64>) -> Result<Self, VolumeError> {
        if !(3..=4).contains(&data.ndim()) {
            return Err(VolumeError::Rank(data.ndim()));
        }
        if data.shape().contains(&0) {
            return Err(VolumeError::EmptyAxis(data.shape().to_vec()));
        }
        Ok(Self {
            data,
            affine: single_precision(&affine),
            frame_duration: None,
            description: String::new(),
        })
    }

    /// Seconds between frames of a time series.
    pub fn with_frame_duration(mut self, seconds: f32) -> Self {
        self.frame_duration = Some(seconds);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Get the spatial dimensions of the volume (i, j, k)
    pub fn dim(&self) -> (usize, usize, usize) {
        let shape = self.data.shape();
        (shape[0], shape[1], shape[2])
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Number of frames along the time axis, 1 for a 3D volume.
    pub fn frames(&self) -> usize {
        self.data.shape().get(3).copied().unwrap_or(1)
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn into_data(self) -> ArrayD<f32> {
        self.data
    }

    pub fn affine(&self) -> &Matrix4<f64> {
        &self.affine
    }

    pub fn frame_duration(&self) -> Option<f32> {
        self.frame_duration
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn axis_codes(&self) -> AxisCodes {
        AxisCodes::from_affine(&self.affine)
    }

    pub fn voxel_sizes(&self) -> [f64; 3] {
        orientation::voxel_sizes(&self.affine)
    }

    /// Spatial volume of frame `t`.
    pub fn frame(&self, t: usize) -> Option<ArrayView3<'_, f32>> {
        match self.data.ndim() {
            3 if t == 0 => self.data.view().into_dimensionality::<Ix3>().ok(),
            4 if t < self.frames() => self
                .data
                .index_axis(Axis(3), t)
                .into_dimensionality::<Ix3>()
                .ok(),
            _ => None,
        }
    }

    /// Permute and flip the voxel axes so the volume's axis codes equal
    /// `target`. World positions of all voxels are preserved.
    pub fn reoriented(self, target: AxisCodes) -> Self {
        let (data, affine) = orientation::reorient(self.data, &self.affine, target);
        Self {
            data,
            affine: single_precision(&affine),
            ..self
        }
    }

    /// Render the cross-section of frame `t` normal to `plane`.
    pub fn get_slice_from_plane(
        &self,
        t: usize,
        plane: Plane,
        index: usize,
        options: &SliceOptions,
    ) -> Result<Raster, SliceError> {
        let frame = self.frame(t).ok_or(SliceError::FrameOutOfBounds {
            frame: t,
            frames: self.frames(),
        })?;
        renderer::extract_slice(frame, plane.axis(&self.axis_codes()), index, options)
    }
}

/// NIfTI-1 stores the affine as `f32`. Keeping the in-memory affine at
/// that precision makes a written and reloaded volume compare equal.
fn single_precision(affine: &Matrix4<f64>) -> Matrix4<f64> {
    affine.map(|v| f64::from(v as f32))
}
