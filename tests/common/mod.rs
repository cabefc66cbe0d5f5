#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use kpts2cvat::{ConvertArgs, Format};

pub const CONFIG: &str = r#"{
    "skeleton": {
        "label": "mouse",
        "points": ["Snout", "Right Ear", "Left Ear", "Centroid", "Tailtag"],
        "links": [["Snout", "Right Ear"], ["Snout", "Left Ear"], ["Centroid", "Tailtag"]]
    },
    "labels": ["mouse"],
    "sequence_length": 100,
    "visibility_threshold": 0.5
}"#;

pub fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

pub fn config_file(dir: &Path) -> PathBuf {
    write(dir, "config.json", CONFIG)
}

pub fn convert_args(input: &Path, config: &Path, output: &Path, format: Format) -> ConvertArgs {
    ConvertArgs {
        input: input.to_path_buf(),
        config: config.to_path_buf(),
        output: Some(output.to_path_buf()),
        output_format: format,
        task_name: "test".to_string(),
        visibility_threshold: None,
    }
}

pub fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
}

/// A skeleton shape in the tool schema; `outside` lists point names not in frame.
pub fn skeleton_shape(frame: u64, track: &str, outside: &[&str]) -> String {
    let elements: Vec<String> = ["Snout", "Right Ear", "Left Ear", "Centroid", "Tailtag"]
        .iter()
        .enumerate()
        .map(|(index, name)| {
            format!(
                r#"{{"label": "{}", "points": [{}, {}], "outside": {}}}"#,
                name,
                10 + index,
                20 + index,
                outside.contains(name)
            )
        })
        .collect();
    format!(
        r#"{{"type": "skeleton", "frame": {}, "track_id": "{}", "label": "mouse", "elements": [{}]}}"#,
        frame,
        track,
        elements.join(", ")
    )
}

pub fn rectangle_shape(frame: u64, track: &str, corners: [f64; 4]) -> String {
    format!(
        r#"{{"type": "rectangle", "frame": {}, "track_id": "{}", "label": "mouse", "points": [{}, {}, {}, {}]}}"#,
        frame, track, corners[0], corners[1], corners[2], corners[3]
    )
}

pub fn document(kind: &str, shapes: &[String]) -> String {
    format!(r#"{{"kind": "{}", "shapes": [{}]}}"#, kind, shapes.join(", "))
}
