use crate::detection_obj::Detection;
use crate::yolo_preprocessing::LetterboxInfo;
use anyhow::Result;
use ndarray::{Array, ArrayView2, Axis, IxDyn};
use std::collections::HashMap;

/// Where a decoded tile sits inside the full image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TilePlacement {
    pub letterbox: LetterboxInfo,
    pub offset_x: f32,
    pub offset_y: f32,
    /// Full image bounds, used for clipping
    pub image_width: u32,
    pub image_height: u32,
}

/// Decoding knobs shared by every tile of an image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeParams {
    pub confidence_threshold: f32,
    pub num_classes: usize,
}

/// Number of class channels in a raw output with `channels` rows.
///
/// Oriented-box heads carry one extra trailing angle row. When the class table
/// accounts for `channels - 5` classes, the last row is taken as the angle.
pub fn class_channel_count(channels: usize, known_classes: usize) -> Result<(usize, bool)> {
    if channels < 5 {
        return Err(anyhow::anyhow!(
            "Expected at least 5 output channels, got {channels}"
        ));
    }
    if known_classes > 0 && channels == 4 + known_classes + 1 {
        Ok((known_classes, true))
    } else {
        Ok((channels - 4, false))
    }
}

/// Whether a `[1, a, b]` output is channels-first (`a` is the channel axis).
///
/// A side matching `4 + nc` or `4 + nc + 1` for the known class count decides;
/// only when neither side matches is the shorter side taken as the channels.
fn is_channels_first(dim_a: usize, dim_b: usize, known_classes: usize) -> bool {
    let is_channel_axis = |dim: usize| {
        known_classes > 0 && (dim == 4 + known_classes || dim == 5 + known_classes)
    };
    if is_channel_axis(dim_a) {
        true
    } else if is_channel_axis(dim_b) {
        false
    } else {
        dim_a <= dim_b
    }
}

/// Enclosing axis-aligned box of a rotated rectangle
fn rotated_extent(w: f32, h: f32, angle: f32) -> (f32, f32) {
    let (sin, cos) = angle.sin_cos();
    (
        w * cos.abs() + h * sin.abs(),
        w * sin.abs() + h * cos.abs(),
    )
}

/// Decode a raw `[1, 4 + nc (+1), N]` output into detections in full-image pixels.
///
/// The transposed `[1, N, 4 + nc (+1)]` layout is accepted as well.
pub fn decode_output(
    output: &Array<f32, IxDyn>,
    params: &DecodeParams,
    placement: &TilePlacement,
) -> Result<Vec<Detection>> {
    let shape = output.shape();
    if shape.len() != 3 {
        return Err(anyhow::anyhow!("Expected 3D output, got {}D", shape.len()));
    }

    let batch = output.index_axis(Axis(0), 0);
    let rows: ArrayView2<f32> = batch
        .into_dimensionality()
        .map_err(|e| anyhow::anyhow!("Unexpected output layout: {e}"))?;
    let rows = if is_channels_first(shape[1], shape[2], params.num_classes) {
        rows
    } else {
        rows.reversed_axes()
    };

    let channels = rows.nrows();
    let (num_classes, oriented) = class_channel_count(channels, params.num_classes)?;

    let mut detections = Vec::new();
    for i in 0..rows.ncols() {
        let mut best_class = 0usize;
        let mut best_score = f32::MIN;
        for class_idx in 0..num_classes {
            let score = rows[[4 + class_idx, i]];
            if score > best_score {
                best_score = score;
                best_class = class_idx;
            }
        }

        if best_score <= params.confidence_threshold {
            continue;
        }

        let x_center = rows[[0, i]];
        let y_center = rows[[1, i]];
        let (width, height) = if oriented {
            rotated_extent(rows[[2, i]], rows[[3, i]], rows[[channels - 1, i]])
        } else {
            (rows[[2, i]], rows[[3, i]])
        };

        let (x1, y1) = placement
            .letterbox
            .to_source(x_center - width / 2.0, y_center - height / 2.0);
        let (x2, y2) = placement
            .letterbox
            .to_source(x_center + width / 2.0, y_center + height / 2.0);

        let max_x = placement.image_width as f32;
        let max_y = placement.image_height as f32;
        let detection = Detection::new(
            (x1 + placement.offset_x).clamp(0.0, max_x),
            (y1 + placement.offset_y).clamp(0.0, max_y),
            (x2 + placement.offset_x).clamp(0.0, max_x),
            (y2 + placement.offset_y).clamp(0.0, max_y),
            best_score,
            best_class as u32,
        );

        if detection.area() > 0.0 {
            detections.push(detection);
        }
    }

    Ok(detections)
}

/// Per-class non-maximum suppression
pub fn nms(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }

    let mut class_groups: HashMap<u32, Vec<Detection>> = HashMap::new();
    for detection in detections {
        class_groups
            .entry(detection.class_id)
            .or_default()
            .push(detection);
    }

    let mut all_results = Vec::new();
    for (_, mut class_detections) in class_groups {
        class_detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut suppressed = vec![false; class_detections.len()];
        for i in 0..class_detections.len() {
            if suppressed[i] {
                continue;
            }
            for j in (i + 1)..class_detections.len() {
                if !suppressed[j] && class_detections[i].iou(&class_detections[j]) > iou_threshold {
                    suppressed[j] = true;
                }
            }
        }

        all_results.extend(
            class_detections
                .into_iter()
                .zip(suppressed)
                .filter_map(|(detection, gone)| (!gone).then_some(detection)),
        );
    }

    all_results
}

/// Sort by descending confidence and keep at most `max_det`
pub fn cap_detections(mut detections: Vec<Detection>, max_det: usize) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    detections.truncate(max_det);
    detections
}

/// Full post-processing for one model output
pub fn postprocess_output(
    output: &Array<f32, IxDyn>,
    params: &DecodeParams,
    placement: &TilePlacement,
    iou_threshold: f32,
    max_det: usize,
) -> Result<Vec<Detection>> {
    let decoded = decode_output(output, params, placement)?;
    Ok(cap_detections(nms(decoded, iou_threshold), max_det))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn identity_placement(width: u32, height: u32) -> TilePlacement {
        TilePlacement {
            letterbox: LetterboxInfo {
                scale: 1.0,
                pad_x: 0.0,
                pad_y: 0.0,
            },
            offset_x: 0.0,
            offset_y: 0.0,
            image_width: width,
            image_height: height,
        }
    }

    /// Build a `[1, 4 + nc, N]` output from (cx, cy, w, h, scores) rows
    fn raw_output(boxes: &[(f32, f32, f32, f32, Vec<f32>)]) -> Array<f32, IxDyn> {
        let channels = 4 + boxes[0].4.len();
        let mut out = Array3::<f32>::zeros((1, channels, boxes.len()));
        for (i, (cx, cy, w, h, scores)) in boxes.iter().enumerate() {
            out[[0, 0, i]] = *cx;
            out[[0, 1, i]] = *cy;
            out[[0, 2, i]] = *w;
            out[[0, 3, i]] = *h;
            for (c, s) in scores.iter().enumerate() {
                out[[0, 4 + c, i]] = *s;
            }
        }
        out.into_dyn()
    }

    #[test]
    fn test_decode_filters_by_confidence_and_picks_best_class() {
        let output = raw_output(&[
            (20.0, 20.0, 20.0, 20.0, vec![0.9, 0.1]),
            (60.0, 60.0, 10.0, 10.0, vec![0.1, 0.7]),
            (80.0, 80.0, 10.0, 10.0, vec![0.05, 0.1]),
        ]);
        let params = DecodeParams {
            confidence_threshold: 0.2,
            num_classes: 2,
        };
        let detections = decode_output(&output, &params, &identity_placement(100, 100)).unwrap();

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0], Detection::new(10.0, 10.0, 30.0, 30.0, 0.9, 0));
        assert_eq!(detections[1].class_id, 1);
    }

    #[test]
    fn test_decode_applies_letterbox_and_tile_offset() {
        let output = raw_output(&[(50.0, 50.0, 10.0, 10.0, vec![0.8, 0.0])]);
        let placement = TilePlacement {
            letterbox: LetterboxInfo {
                scale: 0.5,
                pad_x: 0.0,
                pad_y: 10.0,
            },
            offset_x: 1000.0,
            offset_y: 2000.0,
            image_width: 5000,
            image_height: 5000,
        };
        let params = DecodeParams {
            confidence_threshold: 0.2,
            num_classes: 2,
        };
        let detections = decode_output(&output, &params, &placement).unwrap();
        assert_eq!(
            detections[0],
            Detection::new(1090.0, 2070.0, 1110.0, 2090.0, 0.8, 0)
        );
    }

    #[test]
    fn test_decode_transposed_layout() {
        let output = raw_output(&[(20.0, 20.0, 20.0, 20.0, vec![0.9, 0.1])]);
        // Pad to 12 anchors so the anchor axis is the long one, then transpose
        let mut wide = Array3::<f32>::zeros((1, 6, 12));
        wide.slice_mut(ndarray::s![.., .., 0..1])
            .assign(&output.into_dimensionality::<ndarray::Ix3>().unwrap());
        let transposed = wide.permuted_axes([0, 2, 1]).as_standard_layout().to_owned();

        let params = DecodeParams {
            confidence_threshold: 0.2,
            num_classes: 2,
        };
        let detections =
            decode_output(&transposed.into_dyn(), &params, &identity_placement(100, 100)).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_id, 0);
    }

    #[test]
    fn test_oriented_box_uses_enclosing_extent() {
        // 2 classes + trailing angle channel
        let mut output = Array3::<f32>::zeros((1, 7, 1));
        output[[0, 0, 0]] = 50.0;
        output[[0, 1, 0]] = 50.0;
        output[[0, 2, 0]] = 20.0;
        output[[0, 3, 0]] = 10.0;
        output[[0, 4, 0]] = 0.1;
        output[[0, 5, 0]] = 0.9;
        output[[0, 6, 0]] = std::f32::consts::FRAC_PI_2;

        let params = DecodeParams {
            confidence_threshold: 0.2,
            num_classes: 2,
        };
        let detections =
            decode_output(&output.into_dyn(), &params, &identity_placement(100, 100)).unwrap();
        let d = &detections[0];
        assert_eq!(d.class_id, 1);
        assert!((d.x2 - d.x1 - 10.0).abs() < 1e-3);
        assert!((d.y2 - d.y1 - 20.0).abs() < 1e-3);
    }

    #[test]
    fn test_boxes_are_clipped_to_image() {
        let output = raw_output(&[(2.0, 2.0, 10.0, 10.0, vec![0.9])]);
        let params = DecodeParams {
            confidence_threshold: 0.2,
            num_classes: 1,
        };
        let detections = decode_output(&output, &params, &identity_placement(100, 100)).unwrap();
        assert_eq!(detections[0].x1, 0.0);
        assert_eq!(detections[0].y1, 0.0);
    }

    #[test]
    fn test_nms_is_per_class() {
        let detections = vec![
            Detection::new(0.0, 0.0, 10.0, 10.0, 0.9, 0),
            Detection::new(1.0, 1.0, 11.0, 11.0, 0.8, 0),
            Detection::new(1.0, 1.0, 11.0, 11.0, 0.7, 1),
        ];
        let kept = cap_detections(nms(detections, 0.5), 100);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].class_id, 1);
    }

    #[test]
    fn test_cap_detections_keeps_most_confident() {
        let detections = vec![
            Detection::new(0.0, 0.0, 1.0, 1.0, 0.3, 0),
            Detection::new(0.0, 0.0, 1.0, 1.0, 0.9, 1),
            Detection::new(0.0, 0.0, 1.0, 1.0, 0.6, 0),
        ];
        let capped = cap_detections(detections, 2);
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].confidence, 0.9);
        assert_eq!(capped[1].confidence, 0.6);
    }

    #[test]
    fn test_few_anchors_stay_channels_first() {
        // 6 channels over only 3 anchors
        let output = raw_output(&[
            (20.0, 20.0, 10.0, 10.0, vec![0.9, 0.0]),
            (40.0, 40.0, 10.0, 10.0, vec![0.0, 0.0]),
            (60.0, 60.0, 10.0, 10.0, vec![0.0, 0.1]),
        ]);
        assert_eq!(output.shape(), &[1, 6, 3]);
        let params = DecodeParams {
            confidence_threshold: 0.2,
            num_classes: 2,
        };
        let detections = decode_output(&output, &params, &identity_placement(100, 100)).unwrap();
        assert_eq!(detections, vec![Detection::new(15.0, 15.0, 25.0, 25.0, 0.9, 0)]);
    }

    #[test]
    fn test_layout_choice() {
        assert!(is_channels_first(6, 3, 2));
        assert!(is_channels_first(7, 2, 2));
        assert!(!is_channels_first(8400, 6, 2));
        assert!(!is_channels_first(3, 7, 2));
        // Unknown class count falls back to the shorter side
        assert!(is_channels_first(6, 8400, 0));
        assert!(!is_channels_first(8400, 6, 0));
    }

    #[test]
    fn test_class_channel_count() {
        assert_eq!(class_channel_count(6, 2).unwrap(), (2, false));
        assert_eq!(class_channel_count(7, 2).unwrap(), (2, true));
        assert_eq!(class_channel_count(7, 0).unwrap(), (3, false));
        assert!(class_channel_count(4, 2).is_err());
    }
}
