//! The hand-off to and from the annotation tool.
//!
//! Converted documents go out through an [`AnnotationTool`]; corrected
//! exports come back as JSON documents or CVAT-style zip archives. The
//! [`StagingDirectory`] tool lays tasks out on the local filesystem, which is
//! also how tasks are prepared for a manual upload.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{AnnotationError, RecordLocation, Result};
use crate::io::{read_document, write_atomic, write_json_atomic};
use crate::tool_schema::ToolDocument;
use crate::types::Pass;
use crate::utils::create_output_directory;

const MANIFEST_FILE: &str = "task.json";
const ANNOTATIONS_DIR: &str = "annotations";
const IMAGES_DIR: &str = "images";

/// A task created in an annotation tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub name: String,
    pub location: PathBuf,
}

/// Operations the conversion needs from an annotation tool.
pub trait AnnotationTool {
    fn create_task(&mut self, name: &str, labels: &[&str]) -> Result<TaskHandle>;

    /// Returns the number of images accepted.
    fn upload_images(&mut self, task: &TaskHandle, images: &[PathBuf]) -> Result<usize>;

    /// Import a converted tool-schema document; returns its pass.
    fn import_annotations(&mut self, task: &TaskHandle, document: &Path) -> Result<Pass>;

    /// Export the annotations of one pass into `destination`.
    fn export_annotations(&self, task: &TaskHandle, pass: Pass, destination: &Path) -> Result<PathBuf>;
}

/// Contents of `task.json` in a staged task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskManifest {
    pub name: String,
    pub labels: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub annotations: Vec<Pass>,
}

/// Annotation tool backed by a local directory of tasks.
#[derive(Debug, Clone)]
pub struct StagingDirectory {
    root: PathBuf,
}

impl StagingDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn manifest_path(task: &TaskHandle) -> PathBuf {
        task.location.join(MANIFEST_FILE)
    }

    pub fn read_manifest(task: &TaskHandle) -> Result<TaskManifest> {
        let bytes = read_document(&Self::manifest_path(task))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn update_manifest<F>(task: &TaskHandle, update: F) -> Result<()>
    where
        F: FnOnce(&mut TaskManifest),
    {
        let mut manifest = Self::read_manifest(task)?;
        update(&mut manifest);
        write_json_atomic(&Self::manifest_path(task), &manifest)
    }

    fn document_path(task: &TaskHandle, pass: Pass) -> PathBuf {
        task.location
            .join(ANNOTATIONS_DIR)
            .join(format!("{}.json", pass))
    }
}

impl AnnotationTool for StagingDirectory {
    fn create_task(&mut self, name: &str, labels: &[&str]) -> Result<TaskHandle> {
        let directory_name = sanitize_filename::sanitize(name);
        if directory_name.is_empty() {
            return Err(AnnotationError::Config(format!(
                "task name {:?} has no usable characters",
                name
            )));
        }
        let location = create_output_directory(&self.root.join(directory_name))?;
        fs::create_dir_all(location.join(IMAGES_DIR))?;
        fs::create_dir_all(location.join(ANNOTATIONS_DIR))?;

        let task = TaskHandle {
            name: name.to_string(),
            location,
        };
        let manifest = TaskManifest {
            name: name.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            ..TaskManifest::default()
        };
        write_json_atomic(&Self::manifest_path(&task), &manifest)?;
        info!("Created task {:?} in {}", name, task.location.display());
        Ok(task)
    }

    fn upload_images(&mut self, task: &TaskHandle, images: &[PathBuf]) -> Result<usize> {
        let mut uploaded = Vec::with_capacity(images.len());
        for image in images {
            let Some(file_name) = image.file_name().and_then(|n| n.to_str()) else {
                warn!("Skipping image with unusable name: {}", image.display());
                continue;
            };
            let file_name = sanitize_filename::sanitize(file_name);
            fs::copy(image, task.location.join(IMAGES_DIR).join(&file_name))?;
            uploaded.push(file_name);
        }
        let count = uploaded.len();
        Self::update_manifest(task, |manifest| {
            manifest.images.extend(uploaded);
            manifest.images.sort();
            manifest.images.dedup();
        })?;
        info!("Uploaded {} images to task {:?}", count, task.name);
        Ok(count)
    }

    fn import_annotations(&mut self, task: &TaskHandle, document: &Path) -> Result<Pass> {
        let bytes = read_document(document)?;
        let parsed: ToolDocument = serde_json::from_slice(&bytes).map_err(|e| {
            AnnotationError::schema(
                RecordLocation::Document,
                "document",
                document.display().to_string(),
                format!("not a converted annotation document: {}", e),
            )
        })?;
        let pass = parsed.kind;
        write_atomic(&Self::document_path(task, pass), |writer| {
            writer.write_all(&bytes)?;
            Ok(())
        })?;
        Self::update_manifest(task, |manifest| {
            if !manifest.annotations.contains(&pass) {
                manifest.annotations.push(pass);
                manifest.annotations.sort();
            }
        })?;
        info!(
            "Imported {} {} shapes into task {:?}",
            parsed.shapes.len(),
            pass,
            task.name
        );
        Ok(pass)
    }

    fn export_annotations(&self, task: &TaskHandle, pass: Pass, destination: &Path) -> Result<PathBuf> {
        let source = Self::document_path(task, pass);
        if !source.exists() {
            return Err(AnnotationError::Config(format!(
                "task {:?} has no {} annotations",
                task.name, pass
            )));
        }
        let document = read_document(&source)?;
        let archive_path = destination.join(format!(
            "{}_{}.zip",
            sanitize_filename::sanitize(&task.name),
            pass
        ));
        write_export_archive(&archive_path, &format!("{}.json", pass), &document)?;
        info!("Exported {} annotations to {}", pass, archive_path.display());
        Ok(archive_path)
    }
}

/// Write a CVAT-style export archive holding one annotation document.
pub fn write_export_archive(path: &Path, document_name: &str, document: &[u8]) -> Result<()> {
    write_atomic(path, |writer| {
        let mut buffer = std::io::Cursor::new(Vec::new());
        {
            let mut archive = ZipWriter::new(&mut buffer);
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            archive.start_file(format!("{}/{}", ANNOTATIONS_DIR, document_name), options)?;
            archive.write_all(document)?;
            archive.finish()?;
        }
        writer.write_all(buffer.get_ref())?;
        Ok(())
    })
}

/// The annotation document inside a CVAT export archive: the first `.json`
/// entry under `annotations/`.
pub fn read_export_archive(path: &Path) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(path)?))?;
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|name| {
            name.starts_with(&format!("{}/", ANNOTATIONS_DIR)) && name.ends_with(".json")
        })
        .map(str::to_string)
        .collect();
    names.sort();
    let name = names.first().ok_or_else(|| {
        AnnotationError::schema(
            RecordLocation::Document,
            ANNOTATIONS_DIR,
            path.display().to_string(),
            "archive holds no annotation document",
        )
    })?;

    let mut bytes = Vec::new();
    archive.by_name(name)?.read_to_end(&mut bytes)?;
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        bytes.drain(..3);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const DOCUMENT: &str = r#"{"kind": "bbox", "shapes": [
        {"type": "rectangle", "frame": 0, "track_id": 1, "label": "mouse", "points": [0, 0, 5, 5]}
    ]}"#;

    #[test]
    fn test_staging_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let inputs = tempfile::tempdir().unwrap();
        let image = inputs.path().join("0000.jpg");
        fs::write(&image, b"jpeg").unwrap();
        let document = inputs.path().join("converted_bbox.json");
        fs::write(&document, DOCUMENT).unwrap();

        let mut tool = StagingDirectory::new(root.path());
        let task = tool.create_task("session/1", &["mouse"]).unwrap();
        assert!(task.location.starts_with(root.path()));
        assert_eq!(tool.upload_images(&task, &[image]).unwrap(), 1);
        assert_eq!(tool.import_annotations(&task, &document).unwrap(), Pass::Bbox);

        let manifest = StagingDirectory::read_manifest(&task).unwrap();
        assert_eq!(manifest.images, vec!["0000.jpg"]);
        assert_eq!(manifest.annotations, vec![Pass::Bbox]);
        assert_eq!(manifest.labels, vec!["mouse"]);

        let exports = tempfile::tempdir().unwrap();
        let archive = tool
            .export_annotations(&task, Pass::Bbox, exports.path())
            .unwrap();
        let bytes = read_export_archive(&archive).unwrap();
        assert_eq!(bytes, DOCUMENT.as_bytes());

        assert_matches!(
            tool.export_annotations(&task, Pass::Keypoints, exports.path()),
            Err(AnnotationError::Config(_))
        );
    }

    #[test]
    fn test_import_rejects_foreign_documents() {
        let root = tempfile::tempdir().unwrap();
        let document = root.path().join("other.json");
        fs::write(&document, r#"{"images": []}"#).unwrap();
        let mut tool = StagingDirectory::new(root.path().join("tasks"));
        let task = tool.create_task("t", &["mouse"]).unwrap();
        assert_matches!(
            tool.import_annotations(&task, &document),
            Err(AnnotationError::SchemaViolation { .. })
        );
    }

    #[test]
    fn test_archive_without_annotations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.zip");
        {
            let mut archive = ZipWriter::new(File::create(&path).unwrap());
            archive
                .start_file("images/0000.jpg", SimpleFileOptions::default())
                .unwrap();
            archive.write_all(b"jpeg").unwrap();
            archive.finish().unwrap();
        }
        assert_matches!(
            read_export_archive(&path),
            Err(AnnotationError::SchemaViolation { .. })
        );
    }
}
