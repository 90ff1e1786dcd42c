//! Single-file NIfTI-1 (`.nii` / `.nii.gz`) reading and writing on top of
//! the `nifti` crate.
//!
//! The crate does the header and voxel codec. This module adds what the
//! converter and loader rely on: a validated [`Header`] whose payload size
//! is computed without overflow, payload length checks that never trust
//! the header for an allocation size, and an affine stored as both sform
//! and qform.

use crate::volume::{Volume, VolumeError};

use ::nifti::writer::WriterOptions;
use ::nifti::{Endianness, InMemNiftiObject, IntoNdArray, NiftiHeader, NiftiObject, NiftiType};
use flate2::bufread::GzDecoder;
use nalgebra::{Matrix3, Matrix4, Quaternion, Rotation3, UnitQuaternion, Vector3};
use ndarray::ArrayD;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::path::Path;
use thiserror::Error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Single-file magic. Header/image pairs (`ni1`) are not supported.
const MAGIC_SINGLE_FILE: &[u8; 4] = b"n+1\0";

const HEADER_SIZE: u64 = 348;
const VOX_OFFSET: f32 = 352.0;

/// Length of the `descrip` field, including the terminating NUL.
const DESCRIP_LEN: usize = 80;

/// Millimetres for space, seconds for time.
const UNITS_MM: u8 = 2;
const UNITS_SEC: u8 = 8;

/// Coordinates aligned to the scanner (`NIFTI_XFORM_SCANNER_ANAT`).
pub const XFORM_SCANNER_ANAT: i16 = 1;

#[derive(Debug, Error)]
pub enum NiftiError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid NIfTI header: {0}")]
    InvalidHeader(String),

    #[error("Unsupported NIfTI data type code {0}")]
    UnsupportedDataType(i16),

    #[error("Voxel payload is {actual} bytes, header declares {expected}")]
    PayloadSize { expected: u64, actual: u64 },

    #[error("NIfTI codec error: {0}")]
    Format(#[from] ::nifti::NiftiError),

    #[error("Invalid volume: {0}")]
    InvalidVolume(#[from] VolumeError),
}

/// A parsed NIfTI-1 header that passed validation: single-file magic,
/// rank 1 to 7 with positive extents, a sample type this crate decodes,
/// matching `bitpix` and a payload size that fits in 64 bits.
#[derive(Debug, Clone)]
pub struct Header {
    raw: NiftiHeader,
    datatype: NiftiType,
    shape: Vec<usize>,
    payload_len: u64,
}

impl Header {
    pub fn from_raw(raw: NiftiHeader) -> Result<Self, NiftiError> {
        if &raw.magic != MAGIC_SINGLE_FILE {
            return Err(NiftiError::InvalidHeader(format!(
                "expected single-file magic \"n+1\", got {:?}",
                String::from_utf8_lossy(&raw.magic)
            )));
        }

        let ndim = raw.dim[0] as usize;
        if !(1..=7).contains(&ndim) {
            return Err(NiftiError::InvalidHeader(format!(
                "rank must be 1..=7, got {ndim}"
            )));
        }
        let shape: Vec<usize> = raw.dim[1..=ndim].iter().map(|&d| d as usize).collect();
        if shape.contains(&0) {
            return Err(NiftiError::InvalidHeader(format!(
                "dimensions must be positive, got {shape:?}"
            )));
        }

        let datatype = decodable_type(&raw)?;
        let expected_bitpix = datatype.size_of() * 8;
        if usize::try_from(raw.bitpix).ok() != Some(expected_bitpix) {
            return Err(NiftiError::InvalidHeader(format!(
                "bitpix {} does not match datatype {datatype:?} (expected {expected_bitpix})",
                raw.bitpix
            )));
        }

        if !raw.vox_offset.is_finite()
            || raw.vox_offset.fract() != 0.0
            || raw.vox_offset < HEADER_SIZE as f32
        {
            return Err(NiftiError::InvalidHeader(format!(
                "vox_offset must be an integer of at least {HEADER_SIZE}, got {}",
                raw.vox_offset
            )));
        }

        let payload_len = shape
            .iter()
            .try_fold(datatype.size_of() as u64, |acc, &d| acc.checked_mul(d as u64))
            .ok_or_else(|| {
                NiftiError::InvalidHeader(format!(
                    "{shape:?} samples of {datatype:?} overflow the payload size"
                ))
            })?;

        Ok(Self {
            raw,
            datatype,
            shape,
            payload_len,
        })
    }

    pub fn raw(&self) -> &NiftiHeader {
        &self.raw
    }

    pub fn datatype(&self) -> NiftiType {
        self.datatype
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Extents of the declared dimensions, in `[i, j, k, t, ...]` order.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Size of the voxel buffer in bytes.
    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    pub fn vox_offset(&self) -> u64 {
        self.raw.vox_offset as u64
    }

    pub fn frame_duration(&self) -> Option<f32> {
        (self.ndim() >= 4 && self.raw.pixdim[4] > 0.0).then_some(self.raw.pixdim[4])
    }

    pub fn description(&self) -> String {
        String::from_utf8_lossy(&self.raw.descrip)
            .trim_end_matches('\0')
            .to_string()
    }

    /// Voxel to world affine: sform when set, otherwise qform, otherwise
    /// plain voxel scaling.
    pub fn affine(&self) -> Matrix4<f64> {
        let raw = &self.raw;
        if raw.sform_code > 0 {
            let mut affine = Matrix4::identity();
            for (row, srow) in [raw.srow_x, raw.srow_y, raw.srow_z].iter().enumerate() {
                for (col, &value) in srow.iter().enumerate() {
                    affine[(row, col)] = f64::from(value);
                }
            }
            affine
        } else if raw.qform_code > 0 {
            qform_affine(raw)
        } else {
            Matrix4::new_nonuniform_scaling(&Vector3::new(
                f64::from(raw.pixdim[1]),
                f64::from(raw.pixdim[2]),
                f64::from(raw.pixdim[3]),
            ))
        }
    }
}

/// Sample types `into_ndarray::<f32>` can decode.
fn decodable_type(raw: &NiftiHeader) -> Result<NiftiType, NiftiError> {
    let datatype = raw
        .data_type()
        .map_err(|_| NiftiError::UnsupportedDataType(raw.datatype))?;
    match datatype {
        NiftiType::Uint8
        | NiftiType::Int8
        | NiftiType::Uint16
        | NiftiType::Int16
        | NiftiType::Uint32
        | NiftiType::Int32
        | NiftiType::Uint64
        | NiftiType::Int64
        | NiftiType::Float32
        | NiftiType::Float64 => Ok(datatype),
        _ => Err(NiftiError::UnsupportedDataType(raw.datatype)),
    }
}

fn qform_affine(raw: &NiftiHeader) -> Matrix4<f64> {
    let [b, c, d] = [raw.quatern_b, raw.quatern_c, raw.quatern_d].map(f64::from);
    let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
    let rotation = UnitQuaternion::from_quaternion(Quaternion::new(a, b, c, d));
    let qfac = if raw.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
    let scale = Vector3::new(
        f64::from(raw.pixdim[1]),
        f64::from(raw.pixdim[2]),
        qfac * f64::from(raw.pixdim[3]),
    );

    let mut affine = Matrix4::identity();
    let linear = rotation.to_rotation_matrix().into_inner() * Matrix3::from_diagonal(&scale);
    affine.fixed_view_mut::<3, 3>(0, 0).copy_from(&linear);
    for (row, offset) in [raw.quatern_x, raw.quatern_y, raw.quatern_z].into_iter().enumerate() {
        affine[(row, 3)] = f64::from(offset);
    }
    affine
}

/// Store `affine` as both sform and qform, updating voxel sizes.
fn set_affine(raw: &mut NiftiHeader, affine: &Matrix4<f64>) {
    for (row, srow) in [&mut raw.srow_x, &mut raw.srow_y, &mut raw.srow_z]
        .into_iter()
        .enumerate()
    {
        for (col, value) in srow.iter_mut().enumerate() {
            *value = affine[(row, col)] as f32;
        }
    }

    let mut linear: Matrix3<f64> = affine.fixed_view::<3, 3>(0, 0).clone_owned();
    for col in 0..3 {
        let norm = linear.column(col).norm();
        let norm = if norm > 0.0 { norm } else { 1.0 };
        raw.pixdim[col + 1] = norm as f32;
        linear.column_mut(col).unscale_mut(norm);
    }
    let qfac = if linear.determinant() < 0.0 {
        linear.column_mut(2).neg_mut();
        -1.0
    } else {
        1.0
    };
    // Nearest proper rotation (polar decomposition) for sheared input.
    let svd = linear.svd(true, true);
    let orthogonal = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => u * v_t,
        _ => linear,
    };
    let rotation =
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(orthogonal));
    let mut q = rotation.into_inner();
    if q.w < 0.0 {
        q = -q;
    }

    raw.pixdim[0] = qfac;
    raw.quatern_b = q.i as f32;
    raw.quatern_c = q.j as f32;
    raw.quatern_d = q.k as f32;
    raw.quatern_x = affine[(0, 3)] as f32;
    raw.quatern_y = affine[(1, 3)] as f32;
    raw.quatern_z = affine[(2, 3)] as f32;
    raw.qform_code = XFORM_SCANNER_ANAT;
    raw.sform_code = XFORM_SCANNER_ANAT;
}

/// Smallest type that stores every sample of `data` exactly, choosing
/// between `Int16` and `Float32`.
pub fn lossless_datatype(data: &ArrayD<f32>) -> NiftiType {
    let fits_i16 = data
        .iter()
        .all(|&v| v.fract() == 0.0 && v >= f32::from(i16::MIN) && v <= f32::from(i16::MAX));
    if fits_i16 {
        NiftiType::Int16
    } else {
        NiftiType::Float32
    }
}

/// Reference header carrying everything about `volume` except the sample
/// layout, which the writer fills in from the array.
fn reference_header(volume: &Volume) -> Result<NiftiHeader, NiftiError> {
    if let Some(&extent) = volume.shape().iter().find(|&&d| d > i16::MAX as usize) {
        return Err(NiftiError::InvalidHeader(format!(
            "extent {extent} exceeds NIfTI-1 limits"
        )));
    }

    let mut descrip = volume.description().as_bytes().to_vec();
    descrip.truncate(DESCRIP_LEN - 1);
    descrip.resize(DESCRIP_LEN, 0);

    let mut header = NiftiHeader {
        pixdim: [1.0; 8],
        vox_offset: VOX_OFFSET,
        scl_slope: 1.0,
        scl_inter: 0.0,
        xyzt_units: UNITS_MM,
        descrip,
        magic: *MAGIC_SINGLE_FILE,
        endianness: Endianness::Little,
        ..NiftiHeader::default()
    };
    set_affine(&mut header, volume.affine());
    if let Some(seconds) = volume.frame_duration() {
        header.pixdim[4] = seconds;
        header.xyzt_units = UNITS_MM | UNITS_SEC;
    }
    Ok(header)
}

/// Options for [`write_volume`]. Compression follows the file name: a
/// path ending in `.gz` is gzip-compressed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// On-disk sample type, `Int16` or `Float32`. `None` picks
    /// [`lossless_datatype`].
    pub datatype: Option<NiftiType>,
}

impl WriteOptions {
    pub fn with_datatype(mut self, datatype: NiftiType) -> Self {
        self.datatype = Some(datatype);
        self
    }
}

/// Write `volume` as a single NIfTI-1 file. A partially written file is
/// removed when writing fails.
pub fn write_volume(
    path: impl AsRef<Path>,
    volume: &Volume,
    options: &WriteOptions,
) -> Result<(), NiftiError> {
    let path = path.as_ref();
    let datatype = options
        .datatype
        .unwrap_or_else(|| lossless_datatype(volume.data()));
    let header = reference_header(volume)?;
    let writer = WriterOptions::new(path).reference_header(&header);

    let result = match datatype {
        NiftiType::Int16 => writer.write_nifti(&volume.data().mapv(|v| v.round() as i16)),
        NiftiType::Float32 => writer.write_nifti(volume.data()),
        other => return Err(NiftiError::UnsupportedDataType(other as i16)),
    };
    if result.is_err() {
        let _ = fs::remove_file(path);
    }
    Ok(result?)
}

/// Open `path`, transparently decompressing gzip content. Compression is
/// detected from the leading bytes, not the file extension.
fn open_reader(path: &Path) -> Result<(Box<dyn Read>, bool), NiftiError> {
    let mut reader = BufReader::new(File::open(path)?);
    let compressed = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    if compressed {
        Ok((Box::new(GzDecoder::new(reader)), true))
    } else {
        Ok((Box::new(reader), false))
    }
}

/// Read and validate only the header of `path`. Returns the header and
/// whether the file is gzip-compressed.
///
/// For uncompressed files the payload length is checked against the
/// header here, since the file size is known without reading the data.
pub fn read_header(path: impl AsRef<Path>) -> Result<(Header, bool), NiftiError> {
    let path = path.as_ref();
    let (reader, compressed) = open_reader(path)?;
    let raw = NiftiHeader::from_reader(reader)
        .map_err(|e| NiftiError::InvalidHeader(e.to_string()))?;
    let header = Header::from_raw(raw)?;

    if !compressed {
        let actual = fs::metadata(path)?.len().saturating_sub(header.vox_offset());
        if actual != header.payload_len() {
            return Err(NiftiError::PayloadSize {
                expected: header.payload_len(),
                actual,
            });
        }
    }
    Ok((header, compressed))
}

/// Read the voxel buffer of `path` as `f32`, applying `scl_slope` and
/// `scl_inter`. The array is indexed `[i, j, k, ...]` with the header's
/// extents.
///
/// At most one byte more than the header declares is read, so a header
/// claiming a huge payload fails with [`NiftiError::PayloadSize`] once the
/// stream runs out instead of reserving memory up front.
pub fn read_data(path: impl AsRef<Path>, header: &Header) -> Result<ArrayD<f32>, NiftiError> {
    let (reader, _) = open_reader(path.as_ref())?;
    let expected = header.payload_len();
    let total = header
        .vox_offset()
        .checked_add(expected)
        .ok_or_else(|| NiftiError::InvalidHeader("payload ends beyond 2^64 bytes".into()))?;

    let mut bytes = Vec::new();
    reader.take(total.saturating_add(1)).read_to_end(&mut bytes)?;
    let actual = (bytes.len() as u64).saturating_sub(header.vox_offset());
    if bytes.len() as u64 != total {
        return Err(NiftiError::PayloadSize { expected, actual });
    }

    let object = InMemNiftiObject::from_reader(Cursor::new(bytes))?;
    let data = object.into_volume().into_ndarray::<f32>()?;
    if data.shape() != header.shape() {
        return Err(NiftiError::InvalidHeader(format!(
            "decoded shape {:?} differs from header shape {:?}",
            data.shape(),
            header.shape()
        )));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn oblique_affine() -> Matrix4<f64> {
        Matrix4::new(
            -0.5, 0.0, 0.0, 90.0, //
            0.0, 0.75, 0.0, -126.0, //
            0.0, 0.0, 2.0, -72.0, //
            0.0, 0.0, 0.0, 1.0,
        )
    }

    fn sample_volume() -> Volume {
        let data = Array3::from_shape_fn((4, 3, 2), |(i, j, k)| (i + 10 * j + 100 * k) as f32);
        Volume::new(data.into_dyn(), oblique_affine())
            .unwrap()
            .with_description("test volume")
    }

    fn written_header(volume: &Volume, datatype: NiftiType) -> NiftiHeader {
        NiftiHeader {
            dim: [3, 4, 3, 2, 1, 1, 1, 1],
            datatype: datatype as i16,
            bitpix: (datatype.size_of() * 8) as i16,
            ..reference_header(volume).unwrap()
        }
    }

    #[test]
    fn header_affine_uses_sform() {
        let volume = sample_volume();
        let header = Header::from_raw(written_header(&volume, NiftiType::Float32)).unwrap();
        assert_eq!(header.affine(), oblique_affine());
        assert_eq!(header.raw().pixdim[1..4], [0.5, 0.75, 2.0]);
        assert_eq!(header.raw().pixdim[0], -1.0);
        assert_eq!(header.description(), "test volume");
        assert_eq!(header.shape(), &[4, 3, 2]);
        assert_eq!(header.payload_len(), 4 * 3 * 2 * 4);
    }

    #[test]
    fn qform_matches_sform() {
        let mut raw = written_header(&sample_volume(), NiftiType::Float32);
        raw.sform_code = 0;
        let qform = Header::from_raw(raw).unwrap().affine();
        let expected = oblique_affine();
        for (a, b) in qform.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5, "{qform} != {expected}");
        }
    }

    #[test]
    fn rejects_bad_headers() {
        let raw = written_header(&sample_volume(), NiftiType::Float32);

        let bad_magic = NiftiHeader {
            magic: *b"ni1\0",
            ..raw.clone()
        };
        assert!(matches!(
            Header::from_raw(bad_magic),
            Err(NiftiError::InvalidHeader(_))
        ));

        let rgb = NiftiHeader {
            datatype: NiftiType::Rgb24 as i16,
            bitpix: 24,
            ..raw.clone()
        };
        assert!(matches!(
            Header::from_raw(rgb),
            Err(NiftiError::UnsupportedDataType(128))
        ));

        let bad_bitpix = NiftiHeader {
            bitpix: 8,
            ..raw.clone()
        };
        assert!(matches!(
            Header::from_raw(bad_bitpix),
            Err(NiftiError::InvalidHeader(_))
        ));

        let mut empty_axis = raw.clone();
        empty_axis.dim[1] = 0;
        assert!(matches!(
            Header::from_raw(empty_axis),
            Err(NiftiError::InvalidHeader(_))
        ));

        let low_offset = NiftiHeader {
            vox_offset: 100.0,
            ..raw
        };
        assert!(matches!(
            Header::from_raw(low_offset),
            Err(NiftiError::InvalidHeader(_))
        ));
    }

    #[test]
    fn overflowing_dimensions_are_rejected() {
        let mut raw = written_header(&sample_volume(), NiftiType::Float32);
        raw.dim = [7, 32767, 32767, 32767, 32767, 32767, 32767, 32767];
        match Header::from_raw(raw) {
            Err(NiftiError::InvalidHeader(message)) => assert!(message.contains("overflow")),
            other => panic!("expected an overflow error, got {other:?}"),
        }
    }

    #[test]
    fn lossless_datatype_selection() {
        let ints = Array3::from_elem((2, 2, 2), -1024.0f32).into_dyn();
        assert_eq!(lossless_datatype(&ints), NiftiType::Int16);
        let large = Array3::from_elem((2, 2, 2), 40000.0f32).into_dyn();
        assert_eq!(lossless_datatype(&large), NiftiType::Float32);
        let fractional = Array3::from_elem((2, 2, 2), 0.5f32).into_dyn();
        assert_eq!(lossless_datatype(&fractional), NiftiType::Float32);
    }

    #[test]
    fn long_descriptions_are_truncated_to_the_field() {
        let volume = sample_volume().with_description("x".repeat(200));
        let header = reference_header(&volume).unwrap();
        assert_eq!(header.descrip.len(), DESCRIP_LEN);
        assert_eq!(header.descrip[DESCRIP_LEN - 1], 0);
    }
}
