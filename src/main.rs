use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dicom_nifti::{
    AxisCodes, ConvertOptions, SliceOptions, VolumeLoader, Window,
    enums::{Colormap, Compression, Rotation},
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert every DICOM series in a directory to NIfTI
    Convert {
        #[arg(value_name = "SOURCE")]
        source: PathBuf,
        #[arg(value_name = "DEST")]
        dest: PathBuf,
        /// Axis codes of the written volumes, e.g. LAS or RAS
        #[arg(long, default_value = "LAS", conflicts_with = "no_reorient")]
        orientation: AxisCodes,
        /// Keep the acquisition axis order
        #[arg(long)]
        no_reorient: bool,
        /// Write .nii instead of .nii.gz
        #[arg(long)]
        uncompressed: bool,
        /// Only scan the top level of SOURCE
        #[arg(long)]
        no_recursive: bool,
        /// Convert one series at a time
        #[arg(long)]
        serial: bool,
        /// Accept unevenly spaced slices
        #[arg(long)]
        no_slice_increment_check: bool,
    },
    /// Print the header of a NIfTI file
    Info {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Render one slice of a NIfTI file to PNG
    Render {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// Voxel axis normal to the slice
        #[arg(long)]
        axis: usize,
        #[arg(long)]
        index: usize,
        #[arg(long, default_value_t = 0)]
        frame: usize,
        /// Counter-clockwise rotation in degrees
        #[arg(long, default_value = "0", value_parser = parse_rotation)]
        rotate: Rotation,
        #[arg(long, value_enum, default_value_t)]
        colormap: Colormap,
        /// Intensity window as MIN:MAX
        #[arg(long, value_parser = parse_window)]
        window: Option<Window>,
        #[arg(short, long, value_name = "PNG")]
        output: PathBuf,
    },
}

fn parse_rotation(value: &str) -> Result<Rotation, String> {
    let degrees: i32 = value.parse().map_err(|e| format!("{e}"))?;
    Rotation::from_degrees(degrees).ok_or_else(|| format!("{degrees} is not a multiple of 90"))
}

fn parse_window(value: &str) -> Result<Window, String> {
    let (min, max) = value
        .split_once(':')
        .ok_or_else(|| "expected MIN:MAX".to_owned())?;
    let min: f32 = min.trim().parse().map_err(|e| format!("{e}"))?;
    let max: f32 = max.trim().parse().map_err(|e| format!("{e}"))?;
    if max < min {
        return Err(format!("window maximum {max} is below minimum {min}"));
    }
    Ok(Window::new(min, max))
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Convert {
            source,
            dest,
            orientation,
            no_reorient,
            uncompressed,
            no_recursive,
            serial,
            no_slice_increment_check,
        } => {
            let defaults = ConvertOptions::default();
            let options = ConvertOptions::default()
                .with_orientation((!no_reorient).then_some(orientation))
                .with_compression(if uncompressed {
                    Compression::None
                } else {
                    Compression::Gzip
                })
                .with_recursive(!no_recursive)
                .with_parallel(!serial)
                .with_increment_tolerance(if no_slice_increment_check {
                    None
                } else {
                    defaults.increment_tolerance
                });
            let reports = dicom_nifti::convert(&source, &dest, &options)
                .with_context(|| format!("converting {}", source.display()))?;

            let mut failed = 0;
            for report in &reports {
                match &report.result {
                    Ok(converted) => println!(
                        "{}  {} slices  {:?} {}  {}",
                        report.series_uid,
                        report.slice_count,
                        converted.shape,
                        converted.axis_codes,
                        converted.path.display()
                    ),
                    Err(e) => {
                        failed += 1;
                        println!("{}  {} slices  FAILED: {e}", report.series_uid, report.slice_count);
                    }
                }
            }
            println!("{} converted, {failed} failed", reports.len() - failed);
            Ok(if failed == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Info { file } => {
            let handle = VolumeLoader::open(&file)
                .with_context(|| format!("opening {}", file.display()))?;
            let header = handle.header();
            println!("file:        {}", file.display());
            println!("compressed:  {}", handle.is_compressed());
            println!("shape:       {:?}", handle.shape());
            println!("datatype:    {:?}", header.datatype());
            println!("voxel sizes: {:?}", handle.voxel_sizes());
            println!("orientation: {}", handle.axis_codes());
            if let Some(seconds) = header.frame_duration() {
                println!("frame time:  {seconds} s");
            }
            let description = header.description();
            if !description.is_empty() {
                println!("description: {description}");
            }
            let affine = handle.affine();
            println!("affine:");
            for row in affine.row_iter() {
                println!(
                    "  {:>10.4} {:>10.4} {:>10.4} {:>10.4}",
                    row[0], row[1], row[2], row[3]
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Render {
            file,
            axis,
            index,
            frame,
            rotate,
            colormap,
            window,
            output,
        } => {
            let volume = VolumeLoader::open(&file)
                .and_then(|handle| handle.into_volume())
                .with_context(|| format!("loading {}", file.display()))?;
            let frame_view = volume.frame(frame).ok_or_else(|| {
                anyhow!(
                    "frame {frame} is out of bounds for a volume with {} frames",
                    volume.frames()
                )
            })?;
            let mut options = SliceOptions::default().with_rotation(rotate);
            if let Some(window) = window {
                options = options.with_window(window);
            }
            let raster = dicom_nifti::extract_slice(frame_view, axis, index, &options)?;
            let result = match colormap {
                Colormap::Gray => raster.to_luma8().save(&output),
                _ => raster.to_rgb8(colormap).save(&output),
            };
            result.with_context(|| format!("writing {}", output.display()))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
