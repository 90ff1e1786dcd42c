#![allow(dead_code)]

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{StandardDataDictionary, tags, uids};
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use std::path::Path;

/// One synthetic MONOCHROME2 slice with signed 16-bit pixels.
#[derive(Debug, Clone)]
pub struct Slice {
    pub series_uid: String,
    pub series_number: i32,
    pub description: String,
    pub rows: u16,
    pub columns: u16,
    /// Row direction cosine followed by column direction cosine (LPS).
    pub orientation: [f64; 6],
    pub spacing: [f64; 2],
    pub thickness: f64,
    pub position: Option<[f64; 3]>,
    pub instance: i32,
    pub temporal_position: Option<i32>,
    pub repetition_time: Option<f64>,
    /// Row-major, `rows * columns` samples.
    pub pixels: Vec<i16>,
}

impl Slice {
    pub fn axial(series_uid: &str, rows: u16, columns: u16) -> Self {
        Self {
            series_uid: series_uid.to_owned(),
            series_number: 3,
            description: "T1 MPRAGE".to_owned(),
            rows,
            columns,
            orientation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            spacing: [0.5, 0.75],
            thickness: 2.0,
            position: Some([-10.0, 20.0, 0.0]),
            instance: 1,
            temporal_position: None,
            repetition_time: None,
            pixels: vec![0; rows as usize * columns as usize],
        }
    }

    /// Fill pixels with `value(column, row)`.
    pub fn with_pixels(mut self, value: impl Fn(usize, usize) -> i16) -> Self {
        let columns = self.columns as usize;
        self.pixels = (0..self.rows as usize * columns)
            .map(|n| value(n % columns, n / columns))
            .collect();
        self
    }
}

fn ds(values: &[f64]) -> PrimitiveValue {
    let joined: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    PrimitiveValue::from(joined.join("\\"))
}

pub fn write_slice(path: &Path, slice: &Slice) {
    let sop_instance_uid = format!("{}.{}", slice.series_uid, slice.instance);
    let mut object = InMemDicomObject::new_empty();
    let mut put = |tag, vr, value: PrimitiveValue| object.put(DataElement::new(tag, vr, value));

    put(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::MR_IMAGE_STORAGE));
    put(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop_instance_uid.as_str()));
    put(tags::MODALITY, VR::CS, PrimitiveValue::from("MR"));
    put(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("PAT001"));
    put(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from(slice.series_uid.as_str()));
    put(tags::SERIES_NUMBER, VR::IS, PrimitiveValue::from(slice.series_number.to_string()));
    put(tags::SERIES_DESCRIPTION, VR::LO, PrimitiveValue::from(slice.description.as_str()));
    put(tags::INSTANCE_NUMBER, VR::IS, PrimitiveValue::from(slice.instance.to_string()));
    put(tags::IMAGE_ORIENTATION_PATIENT, VR::DS, ds(&slice.orientation));
    if let Some(position) = slice.position {
        put(tags::IMAGE_POSITION_PATIENT, VR::DS, ds(&position));
    }
    if let Some(temporal) = slice.temporal_position {
        put(
            tags::TEMPORAL_POSITION_IDENTIFIER,
            VR::IS,
            PrimitiveValue::from(temporal.to_string()),
        );
    }
    if let Some(tr) = slice.repetition_time {
        put(tags::REPETITION_TIME, VR::DS, ds(&[tr]));
    }
    put(tags::PIXEL_SPACING, VR::DS, ds(&slice.spacing));
    put(tags::SLICE_THICKNESS, VR::DS, ds(&[slice.thickness]));
    put(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16));
    put(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, PrimitiveValue::from("MONOCHROME2"));
    put(tags::ROWS, VR::US, PrimitiveValue::from(slice.rows));
    put(tags::COLUMNS, VR::US, PrimitiveValue::from(slice.columns));
    put(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16));
    put(tags::BITS_STORED, VR::US, PrimitiveValue::from(16_u16));
    put(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15_u16));
    put(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(1_u16));
    let bytes: Vec<u8> = slice.pixels.iter().flat_map(|v| v.to_le_bytes()).collect();
    put(tags::PIXEL_DATA, VR::OW, PrimitiveValue::from(bytes));

    let meta = FileMetaTableBuilder::new()
        .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
        .media_storage_sop_class_uid(uids::MR_IMAGE_STORAGE)
        .media_storage_sop_instance_uid(sop_instance_uid.as_str())
        .build()
        .expect("valid file meta group");
    let mut file = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
    for element in object {
        file.put(element);
    }
    file.write_to_file(path).expect("should have written DICOM file");
}

/// Pixel value of column `i`, row `j` in slice `k` at time `t`.
pub fn ramp(i: usize, j: usize, k: usize, t: usize) -> i16 {
    (t * 1000 + k * 100 + j * 10 + i) as i16
}

/// Write `count` axial slices of one series spaced `step` mm apart. File
/// names run opposite to slice position.
pub fn write_axial_series(dir: &Path, uid: &str, count: usize, rows: u16, columns: u16, step: f64) {
    std::fs::create_dir_all(dir).unwrap();
    for k in 0..count {
        let mut slice = Slice::axial(uid, rows, columns).with_pixels(|i, j| ramp(i, j, k, 0));
        slice.position = Some([-10.0, 20.0, k as f64 * step]);
        slice.instance = (count - k) as i32;
        write_slice(&dir.join(format!("IM{:04}.dcm", count - 1 - k)), &slice);
    }
}
