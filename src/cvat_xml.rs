//! CVAT for video 1.1 XML writer.

use quick_xml::events::{BytesDecl, BytesText, Event};
use quick_xml::Writer;
use std::collections::BTreeMap;
use std::io::Write;

use crate::config::ConversionConfig;
use crate::error::Result;
use crate::types::{AnnotationRecord, BoundingBox, KeypointSet, Shape, TrackId};

pub const CVAT_XML_VERSION: &str = "1.1";

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn coord(value: f64) -> String {
    format!("{:.2}", value)
}

fn write_meta<W: Write>(
    writer: &mut Writer<W>,
    config: &ConversionConfig,
    task_name: &str,
    size: u64,
) -> quick_xml::Result<()> {
    writer
        .create_element("meta")
        .write_inner_content(|writer| -> quick_xml::Result<()> {
            writer
                .create_element("task")
                .write_inner_content(|writer| -> quick_xml::Result<()> {
                    writer
                        .create_element("name")
                        .write_text_content(BytesText::new(task_name))?;
                    writer
                        .create_element("size")
                        .write_text_content(BytesText::new(&size.to_string()))?;
                    writer
                        .create_element("mode")
                        .write_text_content(BytesText::new("interpolation"))?;
                    writer
                        .create_element("labels")
                        .write_inner_content(|writer| write_labels(writer, config))?;
                    if let Some(image_size) = config.image_size {
                        writer
                            .create_element("original_size")
                            .write_inner_content(|writer| -> quick_xml::Result<()> {
                                writer.create_element("width").write_text_content(
                                    BytesText::new(&image_size.width.to_string()),
                                )?;
                                writer.create_element("height").write_text_content(
                                    BytesText::new(&image_size.height.to_string()),
                                )?;
                                Ok(())
                            })?;
                    }
                    Ok(())
                })?;
            Ok(())
        })?;
    Ok(())
}

fn write_labels<W: Write>(writer: &mut Writer<W>, config: &ConversionConfig) -> quick_xml::Result<()> {
    for label in config.label_set() {
        let is_skeleton = label == config.skeleton.label;
        writer
            .create_element("label")
            .write_inner_content(|writer| -> quick_xml::Result<()> {
                writer
                    .create_element("name")
                    .write_text_content(BytesText::new(label))?;
                writer
                    .create_element("type")
                    .write_text_content(BytesText::new(if is_skeleton {
                        "skeleton"
                    } else {
                        "rectangle"
                    }))?;
                Ok(())
            })?;
        if is_skeleton {
            // Skeleton sublabels are listed flat with a parent reference.
            for point in &config.skeleton.points {
                writer
                    .create_element("label")
                    .write_inner_content(|writer| -> quick_xml::Result<()> {
                        writer
                            .create_element("name")
                            .write_text_content(BytesText::new(point))?;
                        writer
                            .create_element("type")
                            .write_text_content(BytesText::new("points"))?;
                        writer
                            .create_element("parent")
                            .write_text_content(BytesText::new(label))?;
                        Ok(())
                    })?;
            }
        }
    }
    Ok(())
}

fn write_skeleton<W: Write>(
    writer: &mut Writer<W>,
    frame: &str,
    set: &KeypointSet,
) -> quick_xml::Result<()> {
    writer
        .create_element("skeleton")
        .with_attribute(("frame", frame))
        .with_attribute(("keyframe", "1"))
        .with_attribute(("outside", flag(set.all_outside())))
        .with_attribute(("occluded", "0"))
        .write_inner_content(|writer| -> quick_xml::Result<()> {
            for point in &set.points {
                let points = format!("{},{}", coord(point.x), coord(point.y));
                writer
                    .create_element("points")
                    .with_attribute(("label", point.name.as_str()))
                    .with_attribute(("keyframe", "1"))
                    .with_attribute(("outside", flag(point.outside)))
                    .with_attribute(("occluded", flag(point.occluded)))
                    .with_attribute(("points", points.as_str()))
                    .write_empty()?;
            }
            Ok(())
        })?;
    Ok(())
}

fn write_box<W: Write>(writer: &mut Writer<W>, frame: &str, bbox: &BoundingBox) -> quick_xml::Result<()> {
    writer
        .create_element("box")
        .with_attribute(("frame", frame))
        .with_attribute(("keyframe", "1"))
        .with_attribute(("outside", flag(bbox.outside)))
        .with_attribute(("occluded", flag(bbox.occluded)))
        .with_attribute(("xtl", coord(bbox.top_left.x).as_str()))
        .with_attribute(("ytl", coord(bbox.top_left.y).as_str()))
        .with_attribute(("xbr", coord(bbox.bottom_right.x).as_str()))
        .with_attribute(("ybr", coord(bbox.bottom_right.y).as_str()))
        .with_attribute(("z_order", "0"))
        .write_empty()?;
    Ok(())
}

/// Write mapped records as CVAT tracks, one `<track>` per track id.
///
/// CVAT numbers tracks itself, so tracks get consecutive ids in natural
/// track order.
pub fn write_tracks<W: Write>(
    out: W,
    records: &[AnnotationRecord],
    config: &ConversionConfig,
    task_name: &str,
) -> Result<W> {
    let mut tracks: BTreeMap<&TrackId, Vec<&AnnotationRecord>> = BTreeMap::new();
    for record in records {
        tracks.entry(&record.track).or_default().push(record);
    }
    let size = config.sequence_length.unwrap_or_else(|| {
        records
            .iter()
            .map(|r| r.frame.0 + 1)
            .max()
            .unwrap_or(0)
    });

    let mut writer = Writer::new_with_indent(out, b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    writer
        .create_element("annotations")
        .write_inner_content(|writer| -> quick_xml::Result<()> {
            writer
                .create_element("version")
                .write_text_content(BytesText::new(CVAT_XML_VERSION))?;
            write_meta(writer, config, task_name, size)?;

            for (id, (_, shapes)) in tracks.iter().enumerate() {
                let label = shapes.first().map(|r| r.label.as_str()).unwrap_or_default();
                writer
                    .create_element("track")
                    .with_attribute(("id", id.to_string().as_str()))
                    .with_attribute(("label", label))
                    .with_attribute(("source", "manual"))
                    .write_inner_content(|writer| -> quick_xml::Result<()> {
                        let mut shapes = shapes.clone();
                        shapes.sort_by_key(|r| r.frame);
                        for record in shapes {
                            let frame = record.frame.to_string();
                            match &record.shape {
                                Shape::Skeleton(set) => write_skeleton(writer, &frame, set)?,
                                Shape::Rectangle(bbox) => write_box(writer, &frame, bbox)?,
                            }
                        }
                        Ok(())
                    })?;
            }
            Ok(())
        })?;
    Ok(writer.into_inner())
}
