use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{AnnotationError, Result};
use crate::types::Pass;

/// Convert keypoint and bounding-box annotations into CVAT's import schema.
#[derive(Parser, Debug, Clone)]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Map raw keypoints onto the configured skeleton
    Keypoints(ConvertArgs),
    /// Map raw bounding boxes onto CVAT rectangles
    Bbox(ConvertArgs),
    /// Build bounding boxes from the extent of each skeleton's visible points
    DeriveBbox(ConvertArgs),
    /// Stage converted annotations and images into a local task directory
    Stage(StageArgs),
}

/// Arguments shared by the conversion subcommands.
#[derive(Args, Debug, Clone)]
pub struct ConvertArgs {
    /// Raw annotation file (.csv or .json)
    pub input: PathBuf,

    /// Conversion configuration (skeleton topology, labels, units)
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,

    /// Output file; defaults to converted_keypoints / converted_bbox
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Output format: CVAT tool-schema JSON, CVAT 1.1 XML or COCO
    #[arg(
        long = "output_format",
        visible_alias = "format",
        value_enum,
        default_value = "json"
    )]
    pub output_format: Format,

    /// Task name embedded in XML output
    #[arg(long = "task_name", default_value = "converted")]
    pub task_name: String,

    /// Override the configured score threshold below which points are occluded
    #[arg(long = "visibility_threshold", value_parser = validate_threshold)]
    pub visibility_threshold: Option<f64>,
}

impl ConvertArgs {
    /// Output path for a document of the given pass.
    pub fn output_path(&self, pass: Pass) -> PathBuf {
        if let Some(output) = &self.output {
            return output.clone();
        }
        let stem = match pass {
            Pass::Keypoints => "converted_keypoints",
            Pass::Bbox => "converted_bbox",
        };
        PathBuf::from(stem).with_extension(self.output_format.extension())
    }
}

#[derive(Args, Debug, Clone)]
pub struct StageArgs {
    /// Directory holding staged tasks
    #[arg(long = "root")]
    pub root: PathBuf,

    /// Name of the task to create
    #[arg(long = "task_name")]
    pub task_name: String,

    /// Folder of frame images to upload
    #[arg(long = "images")]
    pub images: PathBuf,

    /// Converted annotation documents to import
    #[arg(long = "annotations", num_args = 1..)]
    pub annotations: Vec<PathBuf>,

    /// Conversion configuration (labels of the task)
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,
}

/// Merge a corrected keypoints export with a corrected bounding-box export.
#[derive(Parser, Debug, Clone)]
#[command(version, long_about = None)]
pub struct MergeArgs {
    /// Corrected keypoints export (.json or CVAT export .zip)
    pub keypoints: PathBuf,

    /// Corrected bounding-box export (.json or CVAT export .zip)
    pub bbox: PathBuf,

    /// Conversion configuration (skeleton topology, labels, units)
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,

    /// Combined output file
    #[arg(short = 'o', long = "output", default_value = "combined.json")]
    pub output: PathBuf,

    /// Output format of the combined records
    #[arg(
        long = "output_format",
        visible_alias = "format",
        value_enum,
        default_value = "json"
    )]
    pub output_format: MergeFormat,
}

// Output format of the conversion subcommands
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum Format {
    Json,
    Xml,
    Coco,
}

impl Format {
    pub fn extension(self) -> &'static str {
        match self {
            Format::Json | Format::Coco => "json",
            Format::Xml => "xml",
        }
    }
}

// Output format of the merge
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum MergeFormat {
    Json,
    Coco,
}

// Validate that the threshold is between 0.0 and 1.0
fn validate_threshold(s: &str) -> std::result::Result<f64, String> {
    match f64::from_str(s) {
        Ok(val) if (0.0..=1.0).contains(&val) => Ok(val),
        _ => Err("THRESHOLD must be between 0.0 and 1.0".to_string()),
    }
}

/// Ordered skeleton slots and the edges between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkeletonTopology {
    pub label: String,
    pub points: Vec<String>,
    #[serde(default)]
    pub links: Vec<(String, String)>,
}

impl SkeletonTopology {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.points.iter().position(|p| p == name)
    }

    /// Links as 1-based index pairs, the COCO `skeleton` convention.
    pub fn coco_links(&self) -> Vec<[usize; 2]> {
        self.links
            .iter()
            .filter_map(|(a, b)| Some([self.index_of(a)? + 1, self.index_of(b)? + 1]))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateUnits {
    #[default]
    Pixels,
    /// Coordinates in [0, 1], scaled by the image size.
    Normalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

fn default_visibility_threshold() -> f64 {
    0.5
}

/// Static description of the annotation task, shared read-only by every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversionConfig {
    pub skeleton: SkeletonTopology,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub units: CoordinateUnits,
    #[serde(default)]
    pub image_size: Option<ImageSize>,
    #[serde(default)]
    pub sequence_length: Option<u64>,
    #[serde(default = "default_visibility_threshold")]
    pub visibility_threshold: f64,
}

impl ConversionConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            AnnotationError::Config(format!("cannot open {}: {}", path.display(), e))
        })?;
        let config: ConversionConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| AnnotationError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ConversionConfig =
            serde_json::from_str(json).map_err(|e| AnnotationError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.skeleton.label.trim().is_empty() {
            return Err(AnnotationError::Config("skeleton label is empty".into()));
        }
        if self.skeleton.is_empty() {
            return Err(AnnotationError::Config("skeleton declares no points".into()));
        }
        let mut seen = HashSet::new();
        for name in &self.skeleton.points {
            if name.trim().is_empty() {
                return Err(AnnotationError::Config("skeleton point name is empty".into()));
            }
            if !seen.insert(name.as_str()) {
                return Err(AnnotationError::Config(format!(
                    "skeleton point {:?} declared twice",
                    name
                )));
            }
        }
        for (a, b) in &self.skeleton.links {
            for end in [a, b] {
                if self.skeleton.index_of(end).is_none() {
                    return Err(AnnotationError::Config(format!(
                        "skeleton link references undeclared point {:?}",
                        end
                    )));
                }
            }
        }
        let mut seen = HashSet::new();
        for label in &self.labels {
            if label.trim().is_empty() {
                return Err(AnnotationError::Config("label name is empty".into()));
            }
            if !seen.insert(label.as_str()) {
                return Err(AnnotationError::Config(format!("label {:?} declared twice", label)));
            }
        }
        if !(0.0..=1.0).contains(&self.visibility_threshold) {
            return Err(AnnotationError::Config(format!(
                "visibility_threshold {} is outside [0, 1]",
                self.visibility_threshold
            )));
        }
        if self.units == CoordinateUnits::Normalized && self.image_size.is_none() {
            return Err(AnnotationError::Config(
                "normalized units require image_size".into(),
            ));
        }
        Ok(())
    }

    /// Copy of this configuration with a different score threshold.
    pub fn with_visibility_threshold(&self, threshold: f64) -> Self {
        Self {
            visibility_threshold: threshold,
            ..self.clone()
        }
    }

    /// Labels in class-id order. The skeleton label is always a member.
    pub fn label_set(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.labels.iter().map(String::as_str).collect();
        if !labels.contains(&self.skeleton.label.as_str()) {
            labels.push(&self.skeleton.label);
        }
        labels
    }

    pub fn label_for_class(&self, class_id: usize) -> Option<&str> {
        self.label_set().get(class_id).copied()
    }

    pub fn accepts_label(&self, label: &str) -> bool {
        self.label_set().contains(&label)
    }

    /// Convert an input coordinate to pixels.
    pub fn to_pixels(&self, x: f64, y: f64) -> (f64, f64) {
        match (self.units, self.image_size) {
            (CoordinateUnits::Normalized, Some(size)) => {
                (x * size.width as f64, y * size.height as f64)
            }
            _ => (x, y),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> ConversionConfig {
    ConversionConfig::from_json_str(
        r#"{
            "skeleton": {
                "label": "mouse",
                "points": ["Snout", "Right Ear", "Left Ear", "Centroid", "Tailtag"],
                "links": [["Snout", "Right Ear"], ["Snout", "Left Ear"], ["Centroid", "Tailtag"]]
            },
            "labels": ["mouse", "rat"],
            "sequence_length": 100
        }"#,
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_validate_threshold() {
        assert!(validate_threshold("0.5").is_ok());
        assert!(validate_threshold("1.0").is_ok());
        assert!(validate_threshold("0.0").is_ok());
        assert!(validate_threshold("-0.1").is_err());
        assert!(validate_threshold("1.1").is_err());
        assert!(validate_threshold("abc").is_err());
    }

    #[test]
    fn test_label_set_includes_skeleton_label() {
        let config = ConversionConfig::from_json_str(
            r#"{"skeleton": {"label": "mouse", "points": ["a"]}, "labels": ["rat"]}"#,
        )
        .unwrap();
        assert_eq!(config.label_set(), vec!["rat", "mouse"]);
        assert_eq!(config.label_for_class(1), Some("mouse"));
        assert_eq!(config.label_for_class(2), None);
        assert!(config.accepts_label("mouse"));
        assert!(!config.accepts_label("cat"));
        assert_eq!(config.visibility_threshold, 0.5);
    }

    #[test]
    fn test_coco_links_are_one_based() {
        let config = test_config();
        assert_eq!(config.skeleton.coco_links(), vec![[1, 2], [1, 3], [4, 5]]);
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let duplicate_point =
            r#"{"skeleton": {"label": "mouse", "points": ["a", "a"]}}"#;
        assert_matches!(
            ConversionConfig::from_json_str(duplicate_point),
            Err(AnnotationError::Config(_))
        );

        let bad_link =
            r#"{"skeleton": {"label": "mouse", "points": ["a"], "links": [["a", "b"]]}}"#;
        assert_matches!(
            ConversionConfig::from_json_str(bad_link),
            Err(AnnotationError::Config(_))
        );

        let normalized_without_size =
            r#"{"skeleton": {"label": "mouse", "points": ["a"]}, "units": "normalized"}"#;
        assert_matches!(
            ConversionConfig::from_json_str(normalized_without_size),
            Err(AnnotationError::Config(_))
        );
    }

    #[test]
    fn test_normalized_units_scale_to_pixels() {
        let config = ConversionConfig::from_json_str(
            r#"{"skeleton": {"label": "mouse", "points": ["a"]},
                "units": "normalized",
                "image_size": {"width": 640, "height": 480}}"#,
        )
        .unwrap();
        assert_eq!(config.to_pixels(0.5, 0.25), (320.0, 120.0));
        assert_eq!(test_config().to_pixels(3.0, 4.0), (3.0, 4.0));
    }

    #[test]
    fn test_default_output_paths() {
        let cli = Cli::parse_from(["kpts2cvat", "keypoints", "kpts.csv", "-c", "cfg.json"]);
        let Command::Keypoints(args) = cli.command else {
            panic!("expected keypoints subcommand");
        };
        assert_eq!(args.output_path(Pass::Keypoints), PathBuf::from("converted_keypoints.json"));

        let cli = Cli::parse_from([
            "kpts2cvat", "bbox", "boxes.csv", "-c", "cfg.json", "--format", "xml",
        ]);
        let Command::Bbox(args) = cli.command else {
            panic!("expected bbox subcommand");
        };
        assert_eq!(args.output_path(Pass::Bbox), PathBuf::from("converted_bbox.xml"));
    }
}
