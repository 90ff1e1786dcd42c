use crate::orientation::AxisCodes;

use clap::ValueEnum;

/// Anatomical plane of a 2D cross-section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Sagittal,
    Coronal,
    Axial,
}

impl Plane {
    /// Voxel axis normal to this plane in a volume with the given orientation.
    pub fn axis(self, codes: &AxisCodes) -> usize {
        let world_axis = match self {
            Plane::Sagittal => 0,
            Plane::Coronal => 1,
            Plane::Axial => 2,
        };
        codes.voxel_axis(world_axis)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    #[default]
    Gzip,
    None,
}

impl Compression {
    /// File extension used for single-file NIfTI output.
    pub fn extension(self) -> &'static str {
        match self {
            Compression::Gzip => "nii.gz",
            Compression::None => "nii",
        }
    }
}

/// Counter-clockwise rotation applied to an extracted slice.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    None,
    Quarter,
    Half,
    ThreeQuarters,
}

impl Rotation {
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::None),
            90 => Some(Rotation::Quarter),
            180 => Some(Rotation::Half),
            270 => Some(Rotation::ThreeQuarters),
            _ => None,
        }
    }

    pub fn quarter_turns(self) -> u8 {
        match self {
            Rotation::None => 0,
            Rotation::Quarter => 1,
            Rotation::Half => 2,
            Rotation::ThreeQuarters => 3,
        }
    }
}

/// Intensity to color mapping for rendered slices.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Colormap {
    #[default]
    Gray,
    Bone,
    Hot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_from_degrees() {
        assert_eq!(Rotation::from_degrees(90), Some(Rotation::Quarter));
        assert_eq!(Rotation::from_degrees(-90), Some(Rotation::ThreeQuarters));
        assert_eq!(Rotation::from_degrees(540), Some(Rotation::Half));
        assert_eq!(Rotation::from_degrees(45), None);
    }

    #[test]
    fn plane_axis_follows_orientation() {
        assert_eq!(Plane::Axial.axis(&AxisCodes::LAS), 2);
        assert_eq!(Plane::Sagittal.axis(&AxisCodes::LAS), 0);
        let codes: AxisCodes = "SAL".parse().unwrap();
        assert_eq!(Plane::Axial.axis(&codes), 0);
        assert_eq!(Plane::Sagittal.axis(&codes), 2);
    }

    #[test]
    fn colormap_names() {
        assert_eq!(Colormap::from_str("bone", true), Ok(Colormap::Bone));
        assert_eq!(Colormap::from_str("HOT", true), Ok(Colormap::Hot));
        assert!(Colormap::from_str("jet", true).is_err());
        let names: Vec<_> = Colormap::value_variants()
            .iter()
            .filter_map(|c| c.to_possible_value())
            .map(|v| v.get_name().to_owned())
            .collect();
        assert_eq!(names, ["gray", "bone", "hot"]);
    }
}
