//! # DICOM-NIfTI library
//!
//! This crate converts directories of DICOM files into NIfTI-1 volumes and
//! gives access to the resulting files.
//!
//! This library is part of the dicom-rs ecosystem and leverages its
//! components to read the DICOM files. Every file below a directory is
//! read up to its pixel data, grouped by Series Instance UID and stacked
//! in the order of the physical slice positions (never the file names).
//! If the environment supports it the series are converted in parallel
//! using rayon. Each series is reoriented to a fixed orientation (LAS by
//! default) and written as one `.nii.gz` file named after the acquisition.
//!
//! DICOM files are assumed to have the following attributes:
//!  - One sample per pixel
//!  - No multiframe (always the first frame is used)
//!  - Slices of a time series share their positions and are ordered by
//!    Temporal Position Identifier, Acquisition Number and Instance Number
//!
//! Written volumes can be opened again with [`VolumeLoader`], which reads
//! the header eagerly and the voxel data on first use. Cross-sections of
//! a volume can be rendered in the three medical planes:
//!  - Axial
//!  - Coronal
//!  - Sagittal
//!
//! # Examples
//!
//! ## Converting a directory
//!
//! ```no_run
//! # use dicom_nifti::{convert, ConvertOptions};
//! let reports = convert("dicom", "nifti", &ConvertOptions::default())
//!     .expect("should have scanned the directory");
//! for report in &reports {
//!     match &report.result {
//!         Ok(converted) => println!("{} -> {}", report.series_uid, converted.path.display()),
//!         Err(e) => eprintln!("{} failed: {e}", report.series_uid),
//!     }
//! }
//! ```
//!
//! ## Rendering the center of a volume
//!
//! ```no_run
//! # use dicom_nifti::{enums::Plane, SliceOptions, VolumeLoader};
//! let volume = VolumeLoader::open("nifti/3_t1_mprage.nii.gz")
//!     .and_then(|handle| handle.into_volume())
//!     .expect("should have loaded the volume");
//! let axis = Plane::Sagittal.axis(&volume.axis_codes());
//! let index = volume.shape()[axis] / 2;
//! let image = volume
//!     .get_slice_from_plane(0, Plane::Sagittal, index, &SliceOptions::default())
//!     .expect("should have returned the slice at the center of the volume")
//!     .to_luma8();
//! image.save("result.png").expect("should have written the image");
//! ```

pub mod converter;
pub mod enums;
pub mod nifti;
pub mod orientation;
pub mod renderer;
pub mod series;
pub mod volume;
pub mod volume_loader;

pub use converter::{ConvertError, ConvertOptions, ConvertedSeries, SeriesReport, convert};
pub use crate::nifti::{Header, NiftiError};
pub use orientation::AxisCodes;
pub use renderer::{Raster, SliceError, SliceOptions, Window, extract_slice};
pub use series::SeriesError;
pub use volume::Volume;
pub use volume_loader::{VolumeHandle, VolumeLoader};
