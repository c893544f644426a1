use serde::{Deserialize, Serialize};

use crate::template::Template;

/// Store-assigned person identifier.
pub type PersonId = i64;
/// Store-assigned face template identifier.
pub type TemplateId = i64;
/// Store-assigned attendance event identifier.
pub type EventId = i64;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Multiply every coordinate by `factor`. Used to map boxes found on a
    /// downscaled copy back onto the full-resolution frame.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx * factor, ly * factor))),
        }
    }

    /// Clamp the box to an image of `width` x `height`, returning integer
    /// pixel bounds `(x0, y0, x1, y1)` with `x1`/`y1` exclusive.
    /// Returns `None` when the clamped box is empty.
    pub fn pixel_bounds(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(width);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(height);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0, y0, x1, y1))
    }
}

/// One face found in an image: where it is and its template.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub template: Template,
}

/// A stored template together with the person who owns it.
#[derive(Debug, Clone)]
pub struct KnownFace {
    pub template_id: TemplateId,
    pub person_id: PersonId,
    pub name: String,
    pub template: Template,
}
