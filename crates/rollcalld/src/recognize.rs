//! Detection, matching and annotation steps shared by the ingestion loop
//! and on-demand marking.

use std::collections::HashSet;

use image::{Rgb, RgbImage};

use rollcall_core::{
    Annotation, BoundingBox, CacheSnapshot, DailyMarkedSet, EncoderError, EuclideanMatcher,
    FaceEncoder, MatchResult, Matcher, PersonId, Template,
};
use rollcall_hw::frame;

const MATCHED_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
const BOX_THICKNESS: u32 = 2;

/// One face located on the full-resolution frame, with its best match.
#[derive(Debug, Clone)]
pub struct RecognizedFace {
    pub bbox: BoundingBox,
    pub result: MatchResult,
}

/// Encode a downscaled copy of `image` and map the boxes back to full
/// resolution.
pub fn encode_scaled(
    encoder: &dyn FaceEncoder,
    image: &RgbImage,
    scale: f32,
) -> Result<Vec<(BoundingBox, Template)>, EncoderError> {
    let small = frame::downscale(image, scale);
    let fx = image.width() as f32 / small.width() as f32;
    let fy = image.height() as f32 / small.height() as f32;
    let faces = encoder.encode(&small)?;
    Ok(faces
        .into_iter()
        .map(|face| (face.bbox.scaled((fx + fy) / 2.0), face.template))
        .collect())
}

pub fn match_all(
    faces: &[(BoundingBox, Template)],
    snapshot: &CacheSnapshot,
    threshold: f32,
) -> Vec<RecognizedFace> {
    faces
        .iter()
        .map(|(bbox, template)| RecognizedFace {
            bbox: *bbox,
            result: EuclideanMatcher.compare(template, snapshot, threshold),
        })
        .collect()
}

pub fn annotations(faces: &[RecognizedFace]) -> Vec<Annotation> {
    faces
        .iter()
        .map(|face| {
            let r = &face.result;
            let label = match (&r.name, r.found) {
                (Some(name), true) => name.clone(),
                _ => "Unknown".to_string(),
            };
            Annotation {
                bbox: face.bbox,
                label,
                person_id: if r.found { r.person_id } else { None },
                matched: r.found,
                confidence: r.confidence(),
            }
        })
        .collect()
}

/// Draw every annotation's box: green when matched, red otherwise.
pub fn draw_annotations(image: &mut RgbImage, annotations: &[Annotation]) {
    for a in annotations {
        let color = if a.matched { MATCHED_COLOR } else { UNKNOWN_COLOR };
        frame::draw_box(image, &a.bbox, color, BOX_THICKNESS);
    }
}

/// Matched people, first occurrence only, in face order.
pub fn matched_people(faces: &[RecognizedFace]) -> Vec<(PersonId, String)> {
    let mut seen = HashSet::new();
    faces
        .iter()
        .filter(|f| f.result.found)
        .filter_map(|f| Some((f.result.person_id?, f.result.name.clone().unwrap_or_default())))
        .filter(|(id, _)| seen.insert(*id))
        .collect()
}

/// Matched people not yet marked today.
pub fn pending_people(faces: &[RecognizedFace], marked: &DailyMarkedSet) -> Vec<(PersonId, String)> {
    matched_people(faces)
        .into_iter()
        .filter(|(id, _)| !marked.contains(*id))
        .collect()
}
