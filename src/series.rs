//! Discovery of DICOM series on disk and their reconstruction into volumes.

use crate::volume::Volume;

use dicom::core::Tag;
use dicom::object::{FileDicomObject, InMemDicomObject, OpenFileOptions, open_file};
use dicom::pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder, VoiLutOption};
use dicom_dictionary_std::tags;
use nalgebra::{Matrix4, Vector3, Vector4};
use ndarray::{Array2, Array4, Axis, s};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum difference between direction cosines of slices in one series.
const ORIENTATION_TOLERANCE: f64 = 1e-3;

/// Slices closer than this along the normal (mm) share a position.
const POSITION_TOLERANCE: f64 = 1e-4;

/// Longest description stored in a NIfTI-1 header.
const MAX_DESCRIPTION: usize = 79;

#[derive(Debug, Error)]
pub enum SeriesError {
    #[error("Grouping failed: {0}")]
    Grouping(String),

    #[error("Reconstruction failed: {0}")]
    Reconstruction(String),

    #[error("Unsupported image: {0}")]
    Unsupported(String),

    #[error("Could not decode pixel data of {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("Could not read {path}: {source}")]
    Dicom {
        path: PathBuf,
        #[source]
        source: dicom::object::ReadError,
    },

    #[error("Could not write volume: {0}")]
    Write(#[from] crate::nifti::NiftiError),
}

/// Metadata of one single-slice DICOM file.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceHeader {
    pub path: PathBuf,
    pub series_uid: String,
    pub series_number: Option<i32>,
    pub series_description: Option<String>,
    pub protocol_name: Option<String>,
    pub rows: u32,
    pub columns: u32,
    pub samples_per_pixel: u16,
    pub frames: u32,
    /// Row spacing then column spacing, as stored in PixelSpacing.
    pub pixel_spacing: Option<[f64; 2]>,
    pub slice_thickness: Option<f64>,
    /// Row direction cosine followed by column direction cosine.
    pub orientation: Option<[f64; 6]>,
    pub position: Option<[f64; 3]>,
    pub instance_number: Option<i32>,
    pub temporal_position: Option<i32>,
    pub acquisition_number: Option<i32>,
    /// Milliseconds.
    pub repetition_time: Option<f64>,
}

impl SliceHeader {
    /// Read the metadata of `path`, stopping before the pixel data.
    ///
    /// Returns `None` for files that are not DICOM images belonging to a
    /// series.
    pub fn read(path: &Path) -> Option<Self> {
        let object = match OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)
        {
            Ok(object) => object,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping file that is not DICOM");
                return None;
            }
        };
        let header = Self::from_object(path, &object);
        if header.is_none() {
            debug!(path = %path.display(), "skipping DICOM file without series or image attributes");
        }
        header
    }

    fn from_object(path: &Path, object: &FileDicomObject<InMemDicomObject>) -> Option<Self> {
        let series_uid = get_string(object, tags::SERIES_INSTANCE_UID)?;
        let rows = get_uint(object, tags::ROWS)?;
        let columns = get_uint(object, tags::COLUMNS)?;

        Some(Self {
            path: path.to_path_buf(),
            series_uid,
            series_number: get_int(object, tags::SERIES_NUMBER),
            series_description: get_string(object, tags::SERIES_DESCRIPTION),
            protocol_name: get_string(object, tags::PROTOCOL_NAME),
            rows,
            columns,
            samples_per_pixel: get_uint(object, tags::SAMPLES_PER_PIXEL)
                .and_then(|v| u16::try_from(v).ok())
                .unwrap_or(1),
            frames: get_uint(object, tags::NUMBER_OF_FRAMES).unwrap_or(1),
            pixel_spacing: get_floats(object, tags::PIXEL_SPACING)
                .and_then(|v| v.try_into().ok()),
            slice_thickness: get_float(object, tags::SLICE_THICKNESS),
            orientation: get_floats(object, tags::IMAGE_ORIENTATION_PATIENT)
                .and_then(|v| v.try_into().ok()),
            position: get_floats(object, tags::IMAGE_POSITION_PATIENT)
                .and_then(|v| v.try_into().ok()),
            instance_number: get_int(object, tags::INSTANCE_NUMBER),
            temporal_position: get_int(object, tags::TEMPORAL_POSITION_IDENTIFIER),
            acquisition_number: get_int(object, tags::ACQUISITION_NUMBER),
            repetition_time: get_float(object, tags::REPETITION_TIME),
        })
    }

    fn frame_key(&self) -> (Option<i32>, Option<i32>, Option<i32>, &Path) {
        (
            self.temporal_position,
            self.acquisition_number,
            self.instance_number,
            &self.path,
        )
    }
}

fn get_string(object: &FileDicomObject<InMemDicomObject>, tag: Tag) -> Option<String> {
    let value = object.element(tag).ok()?.to_str().ok()?;
    let value = value.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    (!value.is_empty()).then(|| value.to_owned())
}

fn get_int(object: &FileDicomObject<InMemDicomObject>, tag: Tag) -> Option<i32> {
    object.element(tag).ok()?.to_int::<i32>().ok()
}

fn get_uint(object: &FileDicomObject<InMemDicomObject>, tag: Tag) -> Option<u32> {
    object.element(tag).ok()?.to_int::<u32>().ok()
}

fn get_float(object: &FileDicomObject<InMemDicomObject>, tag: Tag) -> Option<f64> {
    object.element(tag).ok()?.to_float64().ok()
}

fn get_floats(object: &FileDicomObject<InMemDicomObject>, tag: Tag) -> Option<Vec<f64>> {
    object.element(tag).ok()?.to_multi_float64().ok()
}

/// All slices sharing one SeriesInstanceUID.
#[derive(Debug, Clone)]
pub struct Series {
    uid: String,
    slices: Vec<SliceHeader>,
}

/// Slice order and geometry of a series, computed from metadata alone.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    /// Indices into [`Series::slices`], one inner list per position
    /// (ascending along the slice normal), ordered by time.
    pub positions: Vec<Vec<usize>>,
    /// Voxel to RAS+ world affine.
    pub affine: Matrix4<f64>,
}

impl Layout {
    pub fn frames(&self) -> usize {
        self.positions.first().map_or(0, Vec::len)
    }
}

impl Series {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn slices(&self) -> &[SliceHeader] {
        &self.slices
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Human readable label from acquisition metadata:
    /// `<SeriesNumber>_<SeriesDescription>`, `<SeriesNumber>_<ProtocolName>`
    /// or the SeriesInstanceUID.
    pub fn label(&self) -> String {
        let Some(first) = self.slices.first() else {
            return self.uid.clone();
        };
        match (
            first.series_number,
            &first.series_description,
            &first.protocol_name,
        ) {
            (Some(number), Some(description), _) => format!("{number}_{description}"),
            (Some(number), None, Some(protocol)) => format!("{number}_{protocol}"),
            _ => self.uid.clone(),
        }
    }

    fn description(&self) -> String {
        let description = self
            .slices
            .first()
            .and_then(|s| s.series_description.clone())
            .unwrap_or_default();
        let mut end = description.len().min(MAX_DESCRIPTION);
        while !description.is_char_boundary(end) {
            end -= 1;
        }
        description[..end].to_owned()
    }

    /// Check that every slice can be stacked with the first one.
    pub fn validate_grouping(&self) -> Result<(), SeriesError> {
        let Some(first) = self.slices.first() else {
            return Err(SeriesError::Grouping("series has no slices".into()));
        };
        for slice in &self.slices {
            if (slice.rows, slice.columns) != (first.rows, first.columns) {
                return Err(SeriesError::Grouping(format!(
                    "{} is {}x{}, expected {}x{}",
                    slice.path.display(),
                    slice.rows,
                    slice.columns,
                    first.rows,
                    first.columns
                )));
            }
            if let (Some(a), Some(b)) = (first.orientation, slice.orientation) {
                if a.iter().zip(&b).any(|(x, y)| (x - y).abs() > ORIENTATION_TOLERANCE) {
                    return Err(SeriesError::Grouping(format!(
                        "{} has ImageOrientationPatient {:?}, expected {:?}",
                        slice.path.display(),
                        b,
                        a
                    )));
                }
            }
            if slice.samples_per_pixel != 1 {
                return Err(SeriesError::Unsupported(format!(
                    "{} has {} samples per pixel, only single-channel images are supported",
                    slice.path.display(),
                    slice.samples_per_pixel
                )));
            }
        }
        Ok(())
    }

    /// Order the slices by physical position and derive the affine.
    ///
    /// When `increment_tolerance` is set, consecutive positions must be
    /// evenly spaced within that fraction of the mean spacing.
    pub fn layout(&self, increment_tolerance: Option<f64>) -> Result<Layout, SeriesError> {
        self.validate_grouping()?;
        let first = &self.slices[0];

        let orientation = first.orientation.ok_or_else(|| {
            SeriesError::Reconstruction(format!(
                "{} has no ImageOrientationPatient",
                first.path.display()
            ))
        })?;
        let row = Vector3::new(orientation[0], orientation[1], orientation[2]).normalize();
        let column = Vector3::new(orientation[3], orientation[4], orientation[5]).normalize();
        let normal = row.cross(&column);
        if !normal.iter().all(|v| v.is_finite()) || normal.norm() < 1e-6 {
            return Err(SeriesError::Reconstruction(format!(
                "degenerate ImageOrientationPatient {orientation:?}"
            )));
        }

        let mut placed = Vec::with_capacity(self.slices.len());
        for (index, slice) in self.slices.iter().enumerate() {
            if slice.orientation.is_none() {
                return Err(SeriesError::Reconstruction(format!(
                    "{} has no ImageOrientationPatient",
                    slice.path.display()
                )));
            }
            let position = slice.position.ok_or_else(|| {
                SeriesError::Reconstruction(format!(
                    "{} has no ImagePositionPatient",
                    slice.path.display()
                ))
            })?;
            let position = Vector3::from(position);
            placed.push((position.dot(&normal), position, index));
        }
        placed.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| self.slices[a.2].frame_key().cmp(&self.slices[b.2].frame_key()))
        });

        let mut positions: Vec<(f64, Vector3<f64>, Vec<usize>)> = Vec::new();
        for (distance, position, index) in placed {
            match positions.last_mut() {
                Some((last, _, indices)) if (distance - *last).abs() < POSITION_TOLERANCE => {
                    indices.push(index)
                }
                _ => positions.push((distance, position, vec![index])),
            }
        }
        for (_, _, indices) in &mut positions {
            indices.sort_by(|&a, &b| self.slices[a].frame_key().cmp(&self.slices[b].frame_key()));
        }

        let frames = positions[0].2.len();
        if let Some((distance, _, indices)) = positions.iter().find(|p| p.2.len() != frames) {
            return Err(SeriesError::Reconstruction(format!(
                "slice positions are not monotonic: position {distance:.4} holds {} slices, \
                 the first position holds {frames}",
                indices.len()
            )));
        }

        if let Some(tolerance) = increment_tolerance {
            check_increments(positions.iter().map(|p| p.0).collect(), tolerance)?;
        }

        let spacing = first.pixel_spacing.ok_or_else(|| {
            SeriesError::Reconstruction(format!("{} has no PixelSpacing", first.path.display()))
        })?;
        let origin = positions[0].1;
        let step = match positions.len() {
            1 => normal * first.slice_thickness.filter(|t| *t > 0.0).unwrap_or(1.0),
            n => (positions[n - 1].1 - origin) / (n - 1) as f64,
        };

        // PixelSpacing is (row spacing, column spacing); i runs along a row.
        let mut affine = Matrix4::identity();
        affine.fixed_view_mut::<3, 1>(0, 0).copy_from(&(row * spacing[1]));
        affine.fixed_view_mut::<3, 1>(0, 1).copy_from(&(column * spacing[0]));
        affine.fixed_view_mut::<3, 1>(0, 2).copy_from(&step);
        affine.fixed_view_mut::<3, 1>(0, 3).copy_from(&origin);

        // DICOM patient space is LPS+, NIfTI world space is RAS+.
        let lps_to_ras = Matrix4::from_diagonal(&Vector4::new(-1.0, -1.0, 1.0, 1.0));

        Ok(Layout {
            positions: positions.into_iter().map(|p| p.2).collect(),
            affine: lps_to_ras * affine,
        })
    }

    /// Decode every slice and stack them into a volume indexed
    /// `[column, row, position]`, or `[column, row, position, time]` for
    /// time series.
    pub fn reconstruct(&self, increment_tolerance: Option<f64>) -> Result<Volume, SeriesError> {
        let layout = self.layout(increment_tolerance)?;
        let first = &self.slices[0];
        let (rows, columns) = (first.rows as usize, first.columns as usize);
        let frames = layout.frames();
        if let Some(multi) = self.slices.iter().find(|s| s.frames > 1) {
            warn!(
                path = %multi.path.display(),
                frames = multi.frames,
                "multi-frame image, only the first frame is used"
            );
        }

        let ordered: Vec<&SliceHeader> = layout
            .positions
            .iter()
            .flatten()
            .map(|&index| &self.slices[index])
            .collect();
        let images = ordered
            .par_iter()
            .map(|slice| decode_slice(slice))
            .collect::<Result<Vec<_>, _>>()?;

        let mut data = Array4::<f32>::zeros((columns, rows, layout.positions.len(), frames));
        for (index, (image, slice)) in images.iter().zip(&ordered).enumerate() {
            if image.dim() != (rows, columns) {
                return Err(SeriesError::Grouping(format!(
                    "pixel data of {} is {:?}, expected ({rows}, {columns})",
                    slice.path.display(),
                    image.dim()
                )));
            }
            data.slice_mut(s![.., .., index / frames, index % frames])
                .assign(&image.t());
        }

        let data = if frames == 1 {
            data.index_axis_move(Axis(3), 0).into_dyn()
        } else {
            data.into_dyn()
        };
        let mut volume = Volume::new(data, layout.affine)
            .map_err(|e| SeriesError::Reconstruction(e.to_string()))?
            .with_description(self.description());
        if frames > 1 {
            if let Some(tr) = first.repetition_time.filter(|tr| *tr > 0.0) {
                volume = volume.with_frame_duration((tr / 1000.0) as f32);
            }
        }
        Ok(volume)
    }
}

fn check_increments(distances: Vec<f64>, tolerance: f64) -> Result<(), SeriesError> {
    if distances.len() < 3 {
        return Ok(());
    }
    let steps: Vec<f64> = distances.windows(2).map(|w| w[1] - w[0]).collect();
    let mean = steps.iter().sum::<f64>() / steps.len() as f64;
    if let Some((index, step)) = steps
        .iter()
        .enumerate()
        .find(|(_, step)| (*step - mean).abs() > tolerance * mean)
    {
        return Err(SeriesError::Reconstruction(format!(
            "inconsistent slice increment: {step:.4} mm between positions {index} and {}, \
             mean is {mean:.4} mm",
            index + 1
        )));
    }
    Ok(())
}

fn decode_error(path: &Path, error: impl Display) -> SeriesError {
    SeriesError::Decode {
        path: path.to_path_buf(),
        message: error.to_string(),
    }
}

/// Decode the first frame of a slice with the modality LUT (rescale
/// slope and intercept) applied and no VOI windowing.
fn decode_slice(slice: &SliceHeader) -> Result<Array2<f32>, SeriesError> {
    let path = slice.path.as_path();
    let object = open_file(path).map_err(|source| SeriesError::Dicom {
        path: path.to_path_buf(),
        source,
    })?;
    let pixel_data = object
        .decode_pixel_data()
        .map_err(|e| decode_error(path, e))?;
    let options = ConvertOptions::new()
        .with_modality_lut(ModalityLutOption::Default)
        .with_voi_lut(VoiLutOption::Identity);
    let frames = pixel_data
        .to_ndarray_with_options::<f32>(&options)
        .map_err(|e| decode_error(path, e))?;
    Ok(frames.slice_move(s![0, .., .., 0]))
}

fn collect_files(root: &Path, recursive: bool) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            // Symlinked directories are not descended into, so links back
            // up the tree cannot loop. Symlinked files are read.
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if recursive {
                    pending.push(path);
                }
            } else if file_type.is_file() || (file_type.is_symlink() && path.is_file()) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Read the metadata of every DICOM file below `root`.
///
/// Files that are not DICOM images are skipped.
pub fn scan_directory(root: impl AsRef<Path>, recursive: bool) -> io::Result<Vec<SliceHeader>> {
    let files = collect_files(root.as_ref(), recursive)?;
    let headers: Vec<SliceHeader> = files
        .par_iter()
        .filter_map(|path| SliceHeader::read(path))
        .collect();
    debug!(
        files = files.len(),
        slices = headers.len(),
        "scanned directory"
    );
    Ok(headers)
}

/// Group slices by SeriesInstanceUID, ordered by UID.
pub fn group_slices(headers: Vec<SliceHeader>) -> Vec<Series> {
    let mut groups: BTreeMap<String, Vec<SliceHeader>> = BTreeMap::new();
    for header in headers {
        groups.entry(header.series_uid.clone()).or_default().push(header);
    }
    groups
        .into_iter()
        .map(|(uid, mut slices)| {
            slices.sort_by(|a, b| a.path.cmp(&b.path));
            Series { uid, slices }
        })
        .collect()
}
