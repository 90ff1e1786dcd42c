//! Anatomical axis codes and reorientation of voxel volumes.
//!
//! Affines in this crate map voxel indices to NIfTI world space, where
//! +x points Right, +y Anterior and +z Superior (RAS+). A set of axis
//! codes such as `LAS` names, for voxel axes i, j and k, the direction in
//! which each index increases.

use std::fmt;
use std::str::FromStr;

use nalgebra::{Matrix4, Vector3};
use ndarray::{ArrayD, Axis};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AxisCodesError {
    #[error("axis codes must have exactly three letters, got {0:?}")]
    Length(String),

    #[error("unknown axis code {0:?}, expected one of L, R, P, A, I, S")]
    Unknown(char),

    #[error("axis codes {0:?} use the same anatomical axis twice")]
    Duplicate(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisCode {
    L,
    R,
    P,
    A,
    I,
    S,
}

impl AxisCode {
    /// World axis (0 = x, 1 = y, 2 = z) this code lies on.
    pub fn world_axis(self) -> usize {
        match self {
            AxisCode::L | AxisCode::R => 0,
            AxisCode::P | AxisCode::A => 1,
            AxisCode::I | AxisCode::S => 2,
        }
    }

    /// `true` when the code points along the positive RAS+ direction.
    pub fn is_positive(self) -> bool {
        matches!(self, AxisCode::R | AxisCode::A | AxisCode::S)
    }

    fn from_world(world_axis: usize, positive: bool) -> Self {
        match (world_axis, positive) {
            (0, true) => AxisCode::R,
            (0, false) => AxisCode::L,
            (1, true) => AxisCode::A,
            (1, false) => AxisCode::P,
            (_, true) => AxisCode::S,
            (_, false) => AxisCode::I,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            AxisCode::L => 'L',
            AxisCode::R => 'R',
            AxisCode::P => 'P',
            AxisCode::A => 'A',
            AxisCode::I => 'I',
            AxisCode::S => 'S',
        }
    }
}

impl TryFrom<char> for AxisCode {
    type Error = AxisCodesError;

    fn try_from(value: char) -> Result<Self, Self::Error> {
        match value.to_ascii_uppercase() {
            'L' => Ok(AxisCode::L),
            'R' => Ok(AxisCode::R),
            'P' => Ok(AxisCode::P),
            'A' => Ok(AxisCode::A),
            'I' => Ok(AxisCode::I),
            'S' => Ok(AxisCode::S),
            _ => Err(AxisCodesError::Unknown(value)),
        }
    }
}

/// Orientation label of a volume: one [`AxisCode`] per voxel axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AxisCodes([AxisCode; 3]);

impl AxisCodes {
    pub const RAS: AxisCodes = AxisCodes([AxisCode::R, AxisCode::A, AxisCode::S]);
    pub const LAS: AxisCodes = AxisCodes([AxisCode::L, AxisCode::A, AxisCode::S]);
    pub const LPS: AxisCodes = AxisCodes([AxisCode::L, AxisCode::P, AxisCode::S]);

    pub fn new(codes: [AxisCode; 3]) -> Result<Self, AxisCodesError> {
        let mut seen = [false; 3];
        for code in codes {
            if std::mem::replace(&mut seen[code.world_axis()], true) {
                let label: String = codes.iter().map(|c| c.as_char()).collect();
                return Err(AxisCodesError::Duplicate(label));
            }
        }
        Ok(Self(codes))
    }

    /// Axis codes of the closest orthogonal orientation of `affine`.
    pub fn from_affine(affine: &Matrix4<f64>) -> Self {
        let axes = world_axes(affine);
        Self(axes.map(|(world, positive)| AxisCode::from_world(world, positive)))
    }

    pub fn codes(&self) -> [AxisCode; 3] {
        self.0
    }

    /// Voxel axis lying on the given world axis.
    pub fn voxel_axis(&self, world_axis: usize) -> usize {
        self.0
            .iter()
            .position(|code| code.world_axis() == world_axis)
            .unwrap_or(world_axis)
    }
}

impl Default for AxisCodes {
    fn default() -> Self {
        AxisCodes::LAS
    }
}

impl fmt::Display for AxisCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for code in self.0 {
            write!(f, "{}", code.as_char())?;
        }
        Ok(())
    }
}

impl FromStr for AxisCodes {
    type Err = AxisCodesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let letters: Vec<char> = s.trim().chars().collect();
        let [a, b, c] = letters[..] else {
            return Err(AxisCodesError::Length(s.to_owned()));
        };
        Self::new([
            AxisCode::try_from(a)?,
            AxisCode::try_from(b)?,
            AxisCode::try_from(c)?,
        ])
    }
}

/// Length of each voxel axis in world units.
pub fn voxel_sizes(affine: &Matrix4<f64>) -> [f64; 3] {
    [0, 1, 2].map(|axis| affine.fixed_view::<3, 1>(0, axis).norm())
}

/// For each voxel axis, the world axis it is closest to and whether it
/// points along the positive direction of that world axis.
///
/// Axes are assigned greedily by largest absolute direction cosine so
/// the result is always a permutation, even for oblique acquisitions.
fn world_axes(affine: &Matrix4<f64>) -> [(usize, bool); 3] {
    let sizes = voxel_sizes(affine);
    let mut cosines = [[0.0f64; 3]; 3];
    for voxel in 0..3 {
        let size = if sizes[voxel] > 0.0 { sizes[voxel] } else { 1.0 };
        for world in 0..3 {
            cosines[world][voxel] = affine[(world, voxel)] / size;
        }
    }

    let mut result = [(0usize, true); 3];
    let mut free_world = [true; 3];
    let mut free_voxel = [true; 3];
    for _ in 0..3 {
        let mut best: Option<(usize, usize, f64)> = None;
        for world in (0..3).filter(|&w| free_world[w]) {
            for voxel in (0..3).filter(|&v| free_voxel[v]) {
                let magnitude = cosines[world][voxel].abs();
                if best.is_none_or(|(_, _, m)| magnitude > m) {
                    best = Some((world, voxel, magnitude));
                }
            }
        }
        if let Some((world, voxel, _)) = best {
            free_world[world] = false;
            free_voxel[voxel] = false;
            result[voxel] = (world, cosines[world][voxel] >= 0.0);
        }
    }
    result
}

/// Permutes and flips the spatial axes of `data` so its orientation
/// matches `target`, returning the new data and the matching affine.
///
/// Axes beyond the third (time) are carried along untouched.
pub fn reorient(
    data: ArrayD<f32>,
    affine: &Matrix4<f64>,
    target: AxisCodes,
) -> (ArrayD<f32>, Matrix4<f64>) {
    let current = world_axes(affine);
    let mut by_world = [0usize; 3];
    for (voxel, &(world, _)) in current.iter().enumerate() {
        by_world[world] = voxel;
    }

    let mut permutation: Vec<usize> = (0..data.ndim()).collect();
    let mut flips = [false; 3];
    let mut new_affine = *affine;
    let mut translation: Vector3<f64> = affine.fixed_view::<3, 1>(0, 3).clone_owned();

    for (out_axis, code) in target.codes().iter().enumerate() {
        let in_axis = by_world[code.world_axis()];
        let flip = current[in_axis].1 != code.is_positive();
        let column: Vector3<f64> = affine.fixed_view::<3, 1>(0, in_axis).clone_owned();

        permutation[out_axis] = in_axis;
        flips[out_axis] = flip;
        if flip {
            let extent = data.shape()[in_axis].saturating_sub(1) as f64;
            translation += column * extent;
            new_affine.fixed_view_mut::<3, 1>(0, out_axis).copy_from(&(-column));
        } else {
            new_affine.fixed_view_mut::<3, 1>(0, out_axis).copy_from(&column);
        }
    }
    new_affine.fixed_view_mut::<3, 1>(0, 3).copy_from(&translation);

    let identity = permutation.iter().enumerate().all(|(i, &p)| i == p);
    if identity && !flips.contains(&true) {
        return (data, *affine);
    }

    let mut data = data.permuted_axes(permutation.as_slice());
    for (axis, flip) in flips.iter().enumerate() {
        if *flip {
            data.invert_axis(Axis(axis));
        }
    }
    (data.as_standard_layout().into_owned(), new_affine)
}
