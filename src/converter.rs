//! Batch conversion of a DICOM directory into one NIfTI-1 file per series.

use crate::enums::Compression;
use crate::nifti::{self, WriteOptions};
use crate::orientation::AxisCodes;
use crate::series::{self, Series, SeriesError};

use rayon::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Errors that abort a whole conversion run. Failures of individual
/// series are reported through [`SeriesReport::result`] instead.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("Could not scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Could not create output directory {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvertOptions {
    /// Axis codes every output volume is reoriented to. `None` keeps the
    /// acquisition order.
    pub orientation: Option<AxisCodes>,
    pub compression: Compression,
    pub recursive: bool,
    pub parallel: bool,
    /// Allowed relative deviation of each slice increment from the mean.
    /// `None` disables the check.
    pub increment_tolerance: Option<f64>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            orientation: Some(AxisCodes::LAS),
            compression: Compression::Gzip,
            recursive: true,
            parallel: true,
            increment_tolerance: Some(0.01),
        }
    }
}

impl ConvertOptions {
    pub fn with_orientation(mut self, orientation: Option<AxisCodes>) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_increment_tolerance(mut self, tolerance: Option<f64>) -> Self {
        self.increment_tolerance = tolerance;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedSeries {
    pub path: PathBuf,
    pub shape: Vec<usize>,
    pub axis_codes: AxisCodes,
}

/// Outcome of converting one series.
#[derive(Debug)]
pub struct SeriesReport {
    pub series_uid: String,
    /// Output file name without extension.
    pub name: String,
    pub slice_count: usize,
    pub result: Result<ConvertedSeries, SeriesError>,
}

impl SeriesReport {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Lower-case `name`, replace everything outside `[a-z0-9_-]` with `_`
/// and collapse runs of `_`.
pub fn sanitize_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            c
        } else {
            '_'
        };
        if c == '_' && sanitized.ends_with('_') {
            continue;
        }
        sanitized.push(c);
    }
    let trimmed = sanitized.trim_matches('_');
    if trimmed.is_empty() {
        "series".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// File names (without extension) for `series`, in the same order.
/// Repeated names become `name`, `name_2`, `name_3`, ...
pub fn output_names(series: &[Series]) -> Vec<String> {
    let mut taken = HashSet::new();
    series
        .iter()
        .map(|s| {
            let base = sanitize_name(&s.label());
            let mut name = base.clone();
            let mut counter = 1;
            while !taken.insert(name.clone()) {
                counter += 1;
                name = format!("{base}_{counter}");
            }
            name
        })
        .collect()
}

/// Reconstruct one series and write it to `path`.
pub fn convert_series(
    series: &Series,
    path: impl AsRef<Path>,
    options: &ConvertOptions,
) -> Result<ConvertedSeries, SeriesError> {
    let path = path.as_ref();
    let mut volume = series.reconstruct(options.increment_tolerance)?;
    if let Some(target) = options.orientation {
        volume = volume.reoriented(target);
    }
    nifti::write_volume(path, &volume, &WriteOptions::default())?;
    Ok(ConvertedSeries {
        path: path.to_path_buf(),
        shape: volume.shape().to_vec(),
        axis_codes: volume.axis_codes(),
    })
}

fn report(series: &Series, name: String, dest: &Path, options: &ConvertOptions) -> SeriesReport {
    let path = dest.join(format!("{name}.{}", options.compression.extension()));
    let result = convert_series(series, &path, options);
    match &result {
        Ok(converted) => info!(
            series = series.uid(),
            path = %converted.path.display(),
            shape = ?converted.shape,
            orientation = %converted.axis_codes,
            "converted series"
        ),
        Err(e) => warn!(series = series.uid(), name = %name, error = %e, "series failed"),
    }
    SeriesReport {
        series_uid: series.uid().to_owned(),
        name,
        slice_count: series.len(),
        result,
    }
}

/// Convert every DICOM series found below `source` into a NIfTI-1 file in
/// `dest`.
///
/// # Errors
///
/// Only failures that affect the whole run are returned as errors. Each
/// series gets a [`SeriesReport`], ordered by SeriesInstanceUID.
pub fn convert(
    source: impl AsRef<Path>,
    dest: impl AsRef<Path>,
    options: &ConvertOptions,
) -> Result<Vec<SeriesReport>, ConvertError> {
    let (source, dest) = (source.as_ref(), dest.as_ref());
    if !source.is_dir() {
        return Err(ConvertError::NotADirectory(source.to_path_buf()));
    }

    let headers =
        series::scan_directory(source, options.recursive).map_err(|e| ConvertError::Scan {
            path: source.to_path_buf(),
            source: e,
        })?;
    let series = series::group_slices(headers);
    info!(source = %source.display(), series = series.len(), "found series");

    fs::create_dir_all(dest).map_err(|e| ConvertError::Output {
        path: dest.to_path_buf(),
        source: e,
    })?;

    let jobs: Vec<(&Series, String)> = series.iter().zip(output_names(&series)).collect();
    let reports: Vec<SeriesReport> = if options.parallel {
        jobs.into_par_iter()
            .map(|(series, name)| report(series, name, dest, options))
            .collect()
    } else {
        jobs.into_iter()
            .map(|(series, name)| report(series, name, dest, options))
            .collect()
    };
    Ok(reports)
}
