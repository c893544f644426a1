//! Match a probe template against the known-face snapshot.

use crate::cache::CacheSnapshot;
use crate::template::Template;
use crate::types::PersonId;

/// Best candidate for a probe template.
///
/// `person_id`/`name` describe the closest known face even when it is not
/// close enough to count; they are `None` only when nothing was comparable.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub found: bool,
    pub person_id: Option<PersonId>,
    pub name: Option<String>,
    /// Euclidean distance to the closest template (`+inf` if none).
    pub distance: f32,
}

impl MatchResult {
    fn none() -> Self {
        Self {
            found: false,
            person_id: None,
            name: None,
            distance: f32::INFINITY,
        }
    }

    /// Display-only confidence: `1 - distance`, clamped to [0, 1].
    pub fn confidence(&self) -> f32 {
        (1.0 - self.distance).clamp(0.0, 1.0)
    }
}

/// Strategy for comparing a probe template against the cached gallery.
pub trait Matcher {
    fn compare(&self, probe: &Template, snapshot: &CacheSnapshot, threshold: f32) -> MatchResult;
}

/// Minimum Euclidean distance; a match requires `distance < threshold`.
///
/// Ties go to the earliest entry in snapshot order.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Template, snapshot: &CacheSnapshot, threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, known) in snapshot.faces().iter().enumerate() {
            let Some(d) = probe.distance(&known.template) else {
                continue;
            };
            if best.map_or(true, |(_, best_d)| d < best_d) {
                best = Some((i, d));
            }
        }

        match best {
            Some((idx, distance)) => {
                let known = &snapshot.faces()[idx];
                MatchResult {
                    found: distance < threshold,
                    person_id: Some(known.person_id),
                    name: Some(known.name.clone()),
                    distance,
                }
            }
            None => MatchResult::none(),
        }
    }
}

/// Convenience wrapper around [`EuclideanMatcher`].
pub fn match_face(probe: &Template, snapshot: &CacheSnapshot, threshold: f32) -> MatchResult {
    EuclideanMatcher.compare(probe, snapshot, threshold)
}
