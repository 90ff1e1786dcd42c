use crate::nifti::{self, Header, NiftiError};
use crate::orientation::{self, AxisCodes};
use crate::volume::Volume;

use nalgebra::Matrix4;
use ndarray::ArrayD;
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct VolumeLoader;

impl VolumeLoader {
    /// Open a NIfTI-1 file, reading and validating only its header.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the header is
    /// malformed, or (for uncompressed files) the payload size disagrees
    /// with the header.
    pub fn open(path: impl AsRef<Path>) -> Result<VolumeHandle, NiftiError> {
        let path = path.as_ref();
        let (header, compressed) = nifti::read_header(path)?;
        debug!(
            path = %path.display(),
            shape = ?header.shape(),
            datatype = ?header.datatype(),
            compressed,
            "opened volume header"
        );
        Ok(VolumeHandle {
            path: path.to_path_buf(),
            header,
            compressed,
            data: OnceCell::new(),
        })
    }
}

/// An opened volume file. The voxel array is read on the first call to
/// [`VolumeHandle::data`] and cached afterwards.
#[derive(Debug)]
pub struct VolumeHandle {
    path: PathBuf,
    header: Header,
    compressed: bool,
    data: OnceCell<ArrayD<f32>>,
}

impl VolumeHandle {
    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn shape(&self) -> &[usize] {
        self.header.shape()
    }

    pub fn affine(&self) -> Matrix4<f64> {
        self.header.affine()
    }

    pub fn axis_codes(&self) -> AxisCodes {
        AxisCodes::from_affine(&self.affine())
    }

    pub fn voxel_sizes(&self) -> [f64; 3] {
        orientation::voxel_sizes(&self.affine())
    }

    pub fn is_loaded(&self) -> bool {
        self.data.get().is_some()
    }

    /// Voxel intensities indexed in header axis order, with the header's
    /// intensity scaling applied.
    pub fn data(&self) -> Result<&ArrayD<f32>, NiftiError> {
        self.data.get_or_try_init(|| {
            debug!(path = %self.path.display(), "reading voxel data");
            nifti::read_data(&self.path, &self.header)
        })
    }

    /// Materialize the file as a [`Volume`]. Fails for files that are not
    /// 3D or 4D.
    pub fn into_volume(self) -> Result<Volume, NiftiError> {
        let affine = self.affine();
        let frame_duration = self.header.frame_duration();
        let data = match self.data.into_inner() {
            Some(data) => data,
            None => nifti::read_data(&self.path, &self.header)?,
        };
        let mut volume = Volume::new(data, affine)?.with_description(self.header.description());
        if let Some(seconds) = frame_duration {
            volume = volume.with_frame_duration(seconds);
        }
        Ok(volume)
    }
}
