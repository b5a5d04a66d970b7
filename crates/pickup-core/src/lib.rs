//! pickup-core: Face matching and detection stabilization for the pickup kiosk.
//!
//! Descriptors come from an external face detector; this crate compares them
//! against enrolled guardians, smooths per-frame detections into a held
//! detection, and enforces the child enrollment ceiling.

pub mod detector;
pub mod enrollment;
pub mod ids;
pub mod matcher;
pub mod photo;
pub mod stabilizer;
pub mod types;

pub use detector::{AdaptivePolicy, DetectOptions, DetectorError, FaceDetector, FrameSource};
pub use enrollment::{CapacityExceeded, EnrollmentPolicy, DEFAULT_CHILD_CEILING};
pub use ids::IdGenerator;
pub use matcher::{
    EuclideanMatcher, Gallery, GalleryEntry, MatchError, MatchResult, Matcher,
    DEFAULT_MATCH_THRESHOLD, UNKNOWN_LABEL,
};
pub use photo::{thumbnail_png, PhotoError, DEFAULT_PHOTO_MAX_SIDE};
pub use stabilizer::{DetectionStabilizer, HeldDetection, Transition, DEFAULT_HOLD_WINDOW};
pub use types::{
    AuditEntry, BoundingBox, Child, Descriptor, Detection, FrameHandle, Guardian, Link, Mode,
    RecordError, RecordKind, Role, DEFAULT_DESCRIPTOR_LEN,
};
