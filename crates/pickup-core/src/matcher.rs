//! Nearest-neighbor matching of a query descriptor against enrolled guardians.

use crate::types::{Descriptor, Guardian};
use thiserror::Error;

/// Label reported when no gallery entry is close enough.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Default maximum Euclidean distance for a positive match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("malformed descriptor: expected {expected} components, got {actual}")]
    MalformedDescriptor { expected: usize, actual: usize },
}

/// One enrolled face: the guardian it belongs to and its display label.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub id: String,
    pub label: String,
    pub descriptor: Descriptor,
}

/// Labeled descriptors of a single fixed dimensionality.
///
/// Entries keep insertion order, which decides ties.
#[derive(Debug, Clone)]
pub struct Gallery {
    dimension: usize,
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: Vec::new(),
        }
    }

    /// Build a gallery from stored guardians, skipping any whose descriptor
    /// has the wrong dimensionality.
    pub fn from_guardians<'a>(
        dimension: usize,
        guardians: impl IntoIterator<Item = &'a Guardian>,
    ) -> Self {
        let mut gallery = Self::new(dimension);
        for guardian in guardians {
            if let Err(err) = gallery.insert(&guardian.id, &guardian.name, guardian.descriptor.clone()) {
                tracing::warn!(guardian_id = %guardian.id, error = %err, "skipping gallery entry");
            }
        }
        gallery
    }

    pub fn insert(&mut self, id: &str, label: &str, descriptor: Descriptor) -> Result<(), MatchError> {
        if descriptor.len() != self.dimension {
            return Err(MatchError::MalformedDescriptor {
                expected: self.dimension,
                actual: descriptor.len(),
            });
        }
        self.entries.push(GalleryEntry {
            id: id.to_string(),
            label: label.to_string(),
            descriptor,
        });
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }
}

/// Result of matching a query descriptor against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched guardian, `None` when the label is [`UNKNOWN_LABEL`].
    pub guardian_id: Option<String>,
    pub label: String,
    /// Distance to the closest entry (infinite for an empty gallery).
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            guardian_id: None,
            label: UNKNOWN_LABEL.to_string(),
            distance,
        }
    }

    pub fn is_known(&self) -> bool {
        self.guardian_id.is_some()
    }
}

/// Strategy for comparing a query descriptor against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(
        &self,
        query: &Descriptor,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Euclidean distance matcher.
///
/// Visits every gallery entry. Ties keep the first entry encountered.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        query: &Descriptor,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        if query.len() != gallery.dimension() {
            return Err(MatchError::MalformedDescriptor {
                expected: gallery.dimension(),
                actual: query.len(),
            });
        }

        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.entries().iter().enumerate() {
            let distance = query.euclidean_distance(&entry.descriptor);
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        let result = match best_idx {
            Some(idx) if best_distance <= threshold => {
                let entry = &gallery.entries()[idx];
                MatchResult {
                    guardian_id: Some(entry.id.clone()),
                    label: entry.label.clone(),
                    distance: best_distance,
                }
            }
            _ => MatchResult::unknown(best_distance),
        };

        tracing::debug!(
            label = %result.label,
            distance = result.distance,
            gallery = gallery.len(),
            "descriptor compared"
        );
        Ok(result)
    }
}
