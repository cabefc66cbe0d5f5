use glob::glob;
use log::debug;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::config::ConversionConfig;
use crate::error::{AnnotationError, RecordLocation, Result};
use crate::exchange::read_export_archive;
use crate::parser::{
    box_records_from_csv, box_records_from_json, keypoint_records_from_csv,
    keypoint_records_from_json, records_from_json, RawBoxRecord, RawKeypointRecord, RawShape,
    RecordIter,
};
use crate::types::get_image_extensions_set;
use crate::utils::parent_directory;

/// Input flavours, decided by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Delimited(u8),
    Json,
    Archive,
}

impl InputFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "csv" => Ok(InputFormat::Delimited(b',')),
            "tsv" => Ok(InputFormat::Delimited(b'\t')),
            "json" => Ok(InputFormat::Json),
            "zip" => Ok(InputFormat::Archive),
            _ => Err(AnnotationError::schema(
                RecordLocation::Document,
                "path",
                path.display().to_string(),
                "unsupported input format, expected .csv, .tsv, .json or .zip",
            )),
        }
    }
}

/// Write a file through a temporary file in the same directory, so readers
/// never observe a partial document.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let directory = parent_directory(path);
    fs::create_dir_all(directory)?;
    let mut file = NamedTempFile::new_in(directory)?;
    {
        let mut writer = BufWriter::new(file.as_file_mut());
        write(&mut writer)?;
        writer.flush()?;
    }
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    debug!("Wrote {}", path.display());
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, |writer| {
        serde_json::to_writer_pretty(&mut *writer, value)?;
        writer.write_all(b"\n")?;
        Ok(())
    })
}

/// Read a whole document, dropping a UTF-8 byte order mark.
pub fn read_document(path: &Path) -> Result<Vec<u8>> {
    let mut bytes = fs::read(path)?;
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        bytes.drain(..3);
    }
    Ok(bytes)
}

pub fn open_keypoint_records<'a>(
    path: &Path,
    config: &'a ConversionConfig,
) -> Result<RecordIter<'a, RawKeypointRecord>> {
    match InputFormat::from_path(path)? {
        InputFormat::Delimited(delimiter) => {
            let file = File::open(path)?;
            keypoint_records_from_csv(BufReader::new(file), delimiter, config)
        }
        InputFormat::Json => keypoint_records_from_json(&read_document(path)?[..], config),
        InputFormat::Archive => {
            keypoint_records_from_json(&read_export_archive(path)?[..], config)
        }
    }
}

pub fn open_box_records<'a>(
    path: &Path,
    config: &'a ConversionConfig,
) -> Result<RecordIter<'a, RawBoxRecord>> {
    match InputFormat::from_path(path)? {
        InputFormat::Delimited(delimiter) => {
            let file = File::open(path)?;
            box_records_from_csv(BufReader::new(file), delimiter, config)
        }
        InputFormat::Json => box_records_from_json(&read_document(path)?[..], config),
        InputFormat::Archive => box_records_from_json(&read_export_archive(path)?[..], config),
    }
}

/// Shapes of a corrected export, each decided by its own geometry.
pub fn read_export(path: &Path, config: &ConversionConfig) -> Result<Vec<RawShape>> {
    let bytes = match InputFormat::from_path(path)? {
        InputFormat::Archive => read_export_archive(path)?,
        InputFormat::Json => read_document(path)?,
        InputFormat::Delimited(_) => {
            return Err(AnnotationError::schema(
                RecordLocation::Document,
                "path",
                path.display().to_string(),
                "a corrected export must be a .json document or a .zip archive",
            ))
        }
    };
    records_from_json(&bytes[..], config, None)
}

/// Image files directly inside a folder, in file-name order.
pub fn discover_images(folder: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/*", glob::Pattern::escape(&folder.display().to_string()));
    let extensions = get_image_extensions_set();
    let mut images: Vec<PathBuf> = glob(&pattern)
        .map_err(|e| AnnotationError::Config(format!("invalid image folder pattern: {}", e)))?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.contains(&ext.to_lowercase()))
        })
        .collect();
    images.sort();
    Ok(images)
}
