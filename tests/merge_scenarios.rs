mod common;

use assert_matches::assert_matches;
use clap::Parser;
use std::fs;
use std::path::Path;

use common::{config_file, document, read_json, rectangle_shape, skeleton_shape, write};
use kpts2cvat::exchange::write_export_archive;
use kpts2cvat::io::read_export;
use kpts2cvat::pipeline::map_export;
use kpts2cvat::types::ConversionStats;
use kpts2cvat::{merge_exports, AnnotationError, ConversionConfig, MergeArgs, Pass, TrackId};

fn merge_args(keypoints: &Path, bbox: &Path, config: &Path, output: &Path, format: &str) -> MergeArgs {
    MergeArgs::parse_from([
        "cvatmerge",
        keypoints.to_str().unwrap(),
        bbox.to_str().unwrap(),
        "-c",
        config.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
        "--format",
        format,
    ])
}

#[test]
fn test_keypoints_without_box_get_explicit_absence() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_file(dir.path());
    let keypoints = write(
        dir.path(),
        "keypoints.json",
        &document("keypoints", &[skeleton_shape(3, "7", &["Left Ear", "Tailtag"])]),
    );
    let bbox = write(dir.path(), "bbox.json", &document("bbox", &[]));
    let output = dir.path().join("combined.json");

    merge_exports(&merge_args(&keypoints, &bbox, &config, &output, "json")).unwrap();

    let combined = read_json(&output);
    let records = combined["records"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record["frame"], 3);
    assert_eq!(record["track_id"], 7);
    assert_eq!(record["label"], "mouse");
    assert!(record["bbox"].is_null());
    let points = record["keypoints"]["points"].as_array().unwrap();
    assert_eq!(points.len(), 5);
    assert_eq!(points.iter().filter(|p| p["outside"] == true).count(), 2);
    assert_eq!(points[2]["name"], "Left Ear");
    assert_eq!(points[2]["outside"], true);
}

#[test]
fn test_key_in_both_exports_yields_one_record() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_file(dir.path());
    let keypoints = write(
        dir.path(),
        "keypoints.json",
        &document("keypoints", &[skeleton_shape(10, "A", &[])]),
    );
    let bbox = write(
        dir.path(),
        "bbox.json",
        &document("bbox", &[rectangle_shape(10, "A", [5.0, 6.0, 40.0, 60.0])]),
    );
    let output = dir.path().join("combined.json");

    merge_exports(&merge_args(&keypoints, &bbox, &config, &output, "json")).unwrap();

    let combined = read_json(&output);
    let records = combined["records"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["frame"], 10);
    assert_eq!(records[0]["track_id"], "A");
    assert!(records[0]["keypoints"].is_object());
    assert_eq!(records[0]["bbox"]["top_left"]["x"], 5.0);
    assert_eq!(records[0]["bbox"]["bottom_right"]["y"], 60.0);
}

#[test]
fn test_inverted_box_is_corrected_in_merge() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = config_file(dir.path());
    let config = ConversionConfig::load(&config_path).unwrap();
    let bbox = write(
        dir.path(),
        "bbox.json",
        &document("bbox", &[rectangle_shape(2, "B", [50.0, 50.0, 10.0, 10.0])]),
    );

    let mut stats = ConversionStats::new();
    let records = map_export(read_export(&bbox, &config).unwrap(), &config, &mut stats).unwrap();
    assert_eq!(stats.corrections, 1);
    assert_eq!(records[0].track, TrackId::from("B"));

    let keypoints = write(dir.path(), "keypoints.json", &document("keypoints", &[]));
    let output = dir.path().join("combined.json");
    merge_exports(&merge_args(&keypoints, &bbox, &config_path, &output, "json")).unwrap();
    let combined = read_json(&output);
    let record = &combined["records"][0];
    assert!(record["keypoints"].is_null());
    assert_eq!(record["bbox"]["top_left"], serde_json::json!({"x": 10.0, "y": 10.0}));
    assert_eq!(record["bbox"]["bottom_right"], serde_json::json!({"x": 50.0, "y": 50.0}));
}

#[test]
fn test_duplicate_boxes_fail_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_file(dir.path());
    let keypoints = write(dir.path(), "keypoints.json", &document("keypoints", &[]));
    let bbox = write(
        dir.path(),
        "bbox.json",
        &document(
            "bbox",
            &[
                rectangle_shape(1, "X", [0.0, 0.0, 10.0, 10.0]),
                rectangle_shape(1, "X", [2.0, 2.0, 12.0, 12.0]),
            ],
        ),
    );
    let output = dir.path().join("combined.json");

    let result = merge_exports(&merge_args(&keypoints, &bbox, &config, &output, "json"));
    assert_matches!(
        result,
        Err(AnnotationError::DuplicateKey { pass: Pass::Bbox, track, .. })
            if track == TrackId::from("X")
    );
    assert!(!output.exists());
}

#[test]
fn test_argument_order_does_not_change_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_file(dir.path());
    let keypoints = write(
        dir.path(),
        "keypoints.json",
        &document(
            "keypoints",
            &[
                skeleton_shape(4, "B", &[]),
                skeleton_shape(4, "12", &["Snout"]),
                skeleton_shape(1, "B", &[]),
            ],
        ),
    );
    let bbox = write(
        dir.path(),
        "bbox.json",
        &document(
            "bbox",
            &[
                rectangle_shape(4, "B", [1.0, 1.0, 9.0, 9.0]),
                rectangle_shape(0, "3", [1.0, 1.0, 9.0, 9.0]),
            ],
        ),
    );

    let forward = dir.path().join("forward.json");
    let backward = dir.path().join("backward.json");
    merge_exports(&merge_args(&keypoints, &bbox, &config, &forward, "json")).unwrap();
    merge_exports(&merge_args(&bbox, &keypoints, &config, &backward, "json")).unwrap();
    let again = dir.path().join("again.json");
    merge_exports(&merge_args(&keypoints, &bbox, &config, &again, "json")).unwrap();

    let forward_bytes = fs::read(&forward).unwrap();
    assert_eq!(forward_bytes, fs::read(&backward).unwrap());
    assert_eq!(forward_bytes, fs::read(&again).unwrap());

    let combined = read_json(&forward);
    let keys: Vec<(u64, String)> = combined["records"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| (r["frame"].as_u64().unwrap(), r["track_id"].to_string()))
        .collect();
    assert_eq!(
        keys,
        vec![
            (0, "3".to_string()),
            (1, "\"B\"".to_string()),
            (4, "12".to_string()),
            (4, "\"B\"".to_string()),
        ]
    );
}

#[test]
fn test_label_conflict_across_exports() {
    let dir = tempfile::tempdir().unwrap();
    let config = write(
        dir.path(),
        "config.json",
        r#"{"skeleton": {"label": "mouse", "points": ["Snout", "Right Ear", "Left Ear", "Centroid", "Tailtag"]},
            "labels": ["mouse", "rat"]}"#,
    );
    let keypoints = write(
        dir.path(),
        "keypoints.json",
        &document("keypoints", &[skeleton_shape(1, "A", &[])]),
    );
    let bbox = write(
        dir.path(),
        "bbox.json",
        &document("bbox", &[rectangle_shape(2, "A", [0.0, 0.0, 5.0, 5.0]).replace("mouse", "rat")]),
    );
    let output = dir.path().join("combined.json");
    assert_matches!(
        merge_exports(&merge_args(&keypoints, &bbox, &config, &output, "json")),
        Err(AnnotationError::TrackLabelConflict { .. })
    );
    assert!(!output.exists());
}

#[test]
fn test_archives_and_coco_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_file(dir.path());
    let keypoints = dir.path().join("keypoints.zip");
    write_export_archive(
        &keypoints,
        "person_keypoints_default.json",
        document("keypoints", &[skeleton_shape(3, "7", &["Tailtag"])]).as_bytes(),
    )
    .unwrap();
    let bbox = dir.path().join("bbox.zip");
    write_export_archive(
        &bbox,
        "instances_default.json",
        document("bbox", &[rectangle_shape(3, "7", [1.0, 2.0, 11.0, 12.0])]).as_bytes(),
    )
    .unwrap();
    let output = dir.path().join("combined_coco.json");

    merge_exports(&merge_args(&keypoints, &bbox, &config, &output, "coco")).unwrap();

    let coco = read_json(&output);
    assert_eq!(coco["images"][0]["file_name"], "0003.jpg");
    assert_eq!(coco["categories"][0]["skeleton"], serde_json::json!([[1, 2], [1, 3], [4, 5]]));
    let annotation = &coco["annotations"][0];
    assert_eq!(annotation["track_id"], 7);
    assert_eq!(annotation["bbox"], serde_json::json!([1.0, 2.0, 10.0, 10.0]));
    assert_eq!(annotation["num_keypoints"], 4);
    assert_eq!(annotation["keypoints"].as_array().unwrap().len(), 15);
}

#[test]
fn test_cvat_coco_export_keeps_zero_based_frames() {
    let dir = tempfile::tempdir().unwrap();
    let config = write(
        dir.path(),
        "config.json",
        &common::CONFIG.replace("\"sequence_length\": 100", "\"sequence_length\": 3"),
    );
    let keypoints = write(dir.path(), "keypoints.json", &document("keypoints", &[]));
    // CVAT numbers images from 1 and names them after the 0-based frame.
    let bbox = write(
        dir.path(),
        "instances_default.json",
        r#"{
            "licenses": [{"name": "", "id": 0, "url": ""}],
            "info": {"contributor": "", "date_created": ""},
            "categories": [{"id": 1, "name": "mouse", "supercategory": ""}],
            "images": [
                {"id": 1, "width": 640, "height": 480, "file_name": "frame_000000.jpg"},
                {"id": 2, "width": 640, "height": 480, "file_name": "frame_000001.jpg"},
                {"id": 3, "width": 640, "height": 480, "file_name": "frame_000002.jpg"}
            ],
            "annotations": [
                {"id": 1, "image_id": 1, "category_id": 1, "bbox": [1.0, 2.0, 10.0, 10.0],
                 "area": 100.0, "iscrowd": 0, "attributes": {"occluded": false, "track_id": 0}},
                {"id": 2, "image_id": 3, "category_id": 1, "bbox": [3.0, 4.0, 10.0, 10.0],
                 "area": 100.0, "iscrowd": 0, "attributes": {"occluded": false, "track_id": 0}}
            ]
        }"#,
    );
    let output = dir.path().join("combined.json");

    merge_exports(&merge_args(&keypoints, &bbox, &config, &output, "json")).unwrap();

    let combined = read_json(&output);
    let frames: Vec<u64> = combined["records"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["frame"].as_u64().unwrap())
        .collect();
    assert_eq!(frames, vec![0, 2]);
    assert_eq!(combined["records"][1]["bbox"]["top_left"], serde_json::json!({"x": 3.0, "y": 4.0}));
}

#[test]
fn test_zero_padded_track_ids_stay_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_file(dir.path());
    let keypoints = write(dir.path(), "keypoints.json", &document("keypoints", &[]));
    let bbox = write(
        dir.path(),
        "bbox.json",
        &document(
            "bbox",
            &[
                rectangle_shape(1, "7", [0.0, 0.0, 10.0, 10.0]),
                rectangle_shape(1, "007", [2.0, 2.0, 12.0, 12.0]),
            ],
        ),
    );
    let output = dir.path().join("combined.json");

    merge_exports(&merge_args(&keypoints, &bbox, &config, &output, "json")).unwrap();

    let combined = read_json(&output);
    let records = combined["records"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["track_id"], 7);
    assert_eq!(records[1]["track_id"], "007");
}
