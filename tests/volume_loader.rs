use dicom_nifti::nifti::{self, WriteOptions};
use dicom_nifti::{AxisCodes, NiftiError, Volume, VolumeLoader};
use flate2::Compression as GzLevel;
use flate2::write::GzEncoder;
use nalgebra::Matrix4;
use ndarray::{Array3, Array4};
use ::nifti::NiftiType;
use std::fs;
use std::io::Write;

fn las_affine() -> Matrix4<f64> {
    Matrix4::new(
        -0.75, 0.0, 0.0, 60.0, //
        0.0, 0.5, 0.0, -80.5, //
        0.0, 0.0, 2.0, -40.0, //
        0.0, 0.0, 0.0, 1.0,
    )
}

fn integer_volume() -> Volume {
    let data = Array3::from_shape_fn((6, 5, 4), |(i, j, k)| {
        (i as f32 - 3.0) * 1000.0 + (j * 10 + k) as f32
    });
    Volume::new(data.into_dyn(), las_affine()).unwrap()
}

#[test]
fn integer_volume_round_trips_losslessly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.nii.gz");
    let volume = integer_volume();
    nifti::write_volume(&path, &volume, &WriteOptions::default()).unwrap();

    let handle = VolumeLoader::open(&path).unwrap();
    assert!(handle.is_compressed());
    assert_eq!(handle.header().datatype(), NiftiType::Int16);
    assert_eq!(handle.shape(), &[6, 5, 4]);
    assert_eq!(handle.affine(), las_affine());
    assert_eq!(handle.axis_codes(), AxisCodes::LAS);
    assert_eq!(handle.data().unwrap(), volume.data());
}

#[test]
fn fractional_volume_is_written_as_float() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.nii");
    let data = Array4::from_shape_fn((3, 2, 2, 3), |(i, j, k, t)| {
        i as f32 * 0.25 - j as f32 + k as f32 * 1e-3 + t as f32 * 7.5
    });
    let volume = Volume::new(data.into_dyn(), las_affine())
        .unwrap()
        .with_frame_duration(1.5);
    nifti::write_volume(&path, &volume, &WriteOptions::default()).unwrap();

    let bytes = fs::read(&path).unwrap();
    assert_eq!(bytes.len(), 352 + 3 * 2 * 2 * 3 * 4);
    assert_eq!(&bytes[344..348], b"n+1\0");

    let loaded = VolumeLoader::open(&path).unwrap().into_volume().unwrap();
    assert_eq!(loaded.data(), volume.data());
    assert_eq!(loaded.frames(), 3);
    assert_eq!(loaded.frame_duration(), Some(1.5));
}

#[test]
fn data_is_read_once_and_cached() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.nii.gz");
    nifti::write_volume(&path, &integer_volume(), &WriteOptions::default()).unwrap();

    let handle = VolumeLoader::open(&path).unwrap();
    assert!(!handle.is_loaded());
    let first = handle.data().unwrap() as *const _;
    assert!(handle.is_loaded());

    // The file is no longer needed once the data is cached.
    fs::remove_file(&path).unwrap();
    let second = handle.data().unwrap() as *const _;
    assert_eq!(first, second);
}

#[test]
fn truncated_file_is_rejected_at_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.nii");
    nifti::write_volume(&path, &integer_volume(), &WriteOptions::default()).unwrap();

    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();
    match VolumeLoader::open(&path) {
        Err(NiftiError::PayloadSize { expected, actual }) => {
            assert_eq!(expected, 6 * 5 * 4 * 2);
            assert_eq!(actual, expected - 2);
        }
        other => panic!("expected a payload size error, got {other:?}"),
    }

    fs::write(&path, [bytes.as_slice(), &[0, 0]].concat()).unwrap();
    assert!(matches!(
        VolumeLoader::open(&path),
        Err(NiftiError::PayloadSize { .. })
    ));
}

#[test]
fn truncated_compressed_payload_is_rejected_on_read() {
    let dir = tempfile::tempdir().unwrap();
    let plain = dir.path().join("volume.nii");
    nifti::write_volume(&plain, &integer_volume(), &WriteOptions::default()).unwrap();
    let bytes = fs::read(&plain).unwrap();

    // Compressed files are recognised by content, whatever the extension.
    let path = dir.path().join("volume.img");
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    encoder.write_all(&bytes[..bytes.len() - 10]).unwrap();
    fs::write(&path, encoder.finish().unwrap()).unwrap();

    let handle = VolumeLoader::open(&path).unwrap();
    assert!(handle.is_compressed());
    assert!(matches!(
        handle.data(),
        Err(NiftiError::PayloadSize { .. })
    ));
    assert!(!handle.is_loaded());
}

#[test]
fn malformed_headers_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.nii");
    nifti::write_volume(&path, &integer_volume(), &WriteOptions::default()).unwrap();
    let bytes = fs::read(&path).unwrap();

    let mut bad_magic = bytes.clone();
    bad_magic[344..348].copy_from_slice(b"ni1\0");
    fs::write(&path, &bad_magic).unwrap();
    assert!(matches!(
        VolumeLoader::open(&path),
        Err(NiftiError::InvalidHeader(_))
    ));

    let mut bad_datatype = bytes.clone();
    bad_datatype[70..72].copy_from_slice(&1234_i16.to_le_bytes());
    fs::write(&path, &bad_datatype).unwrap();
    assert!(matches!(
        VolumeLoader::open(&path),
        Err(NiftiError::UnsupportedDataType(1234))
    ));

    fs::write(&path, &bytes[..100]).unwrap();
    assert!(matches!(
        VolumeLoader::open(&path),
        Err(NiftiError::InvalidHeader(_))
    ));
}

#[test]
fn intensity_scaling_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.nii");
    let options = WriteOptions::default().with_datatype(NiftiType::Int16);
    nifti::write_volume(&path, &integer_volume(), &options).unwrap();

    let mut bytes = fs::read(&path).unwrap();
    bytes[112..116].copy_from_slice(&2.0_f32.to_le_bytes());
    bytes[116..120].copy_from_slice(&(-1.0_f32).to_le_bytes());
    fs::write(&path, &bytes).unwrap();

    let handle = VolumeLoader::open(&path).unwrap();
    let expected = integer_volume().data().mapv(|v| v * 2.0 - 1.0);
    assert_eq!(handle.data().unwrap(), &expected);
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        VolumeLoader::open(dir.path().join("absent.nii.gz")),
        Err(NiftiError::Io(_))
    ));
}

fn with_dim(mut bytes: Vec<u8>, dim: [i16; 8]) -> Vec<u8> {
    for (i, value) in dim.iter().enumerate() {
        bytes[40 + i * 2..42 + i * 2].copy_from_slice(&value.to_le_bytes());
    }
    bytes
}

#[test]
fn overflowing_dimensions_are_rejected_at_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.nii");
    nifti::write_volume(&path, &integer_volume(), &WriteOptions::default()).unwrap();

    let bytes = with_dim(
        fs::read(&path).unwrap(),
        [7, 32767, 32767, 32767, 32767, 32767, 32767, 32767],
    );
    fs::write(&path, &bytes).unwrap();
    match VolumeLoader::open(&path) {
        Err(NiftiError::InvalidHeader(message)) => assert!(message.contains("overflow")),
        other => panic!("expected an overflow error, got {other:?}"),
    }
}

#[test]
fn huge_declared_payload_in_small_gzip_fails_on_read() {
    let dir = tempfile::tempdir().unwrap();
    let plain = dir.path().join("volume.nii");
    let data = Array3::from_elem((2, 2, 2), 0.5_f32);
    let volume = Volume::new(data.into_dyn(), las_affine()).unwrap();
    nifti::write_volume(&plain, &volume, &WriteOptions::default()).unwrap();

    let bytes = with_dim(fs::read(&plain).unwrap(), [3, 32767, 32767, 32767, 1, 1, 1, 1]);
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::best());
    encoder.write_all(&bytes).unwrap();
    let path = dir.path().join("huge.nii.gz");
    fs::write(&path, encoder.finish().unwrap()).unwrap();

    let handle = VolumeLoader::open(&path).unwrap();
    assert_eq!(handle.header().datatype(), NiftiType::Float32);
    let expected = 32767_u64.pow(3) * 4;
    assert_eq!(handle.header().payload_len(), expected);
    match handle.data() {
        Err(NiftiError::PayloadSize {
            expected: declared,
            actual,
        }) => {
            assert_eq!(declared, expected);
            assert_eq!(actual, 2 * 2 * 2 * 4);
        }
        other => panic!("expected a payload size error, got {other:?}"),
    }
}

#[test]
fn fractional_affine_round_trips_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.nii.gz");
    let angle = 0.3_f64;
    let affine = Matrix4::new(
        0.1 * angle.cos(), -0.1 * angle.sin(), 0.0, -12.345, //
        0.1 * angle.sin(), 0.1 * angle.cos(), 0.0, 7.1, //
        0.0, 0.0, 1.1, 0.3, //
        0.0, 0.0, 0.0, 1.0,
    );
    let data = Array3::from_shape_fn((3, 3, 2), |(i, j, k)| (i + j + k) as f32);
    let volume = Volume::new(data.into_dyn(), affine).unwrap();
    assert_eq!(volume.affine()[(0, 3)], f64::from(-12.345_f32));

    nifti::write_volume(&path, &volume, &WriteOptions::default()).unwrap();
    let loaded = VolumeLoader::open(&path).unwrap().into_volume().unwrap();
    assert_eq!(loaded.affine(), volume.affine());
    assert_eq!(loaded, volume);
}
