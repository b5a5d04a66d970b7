//! Seams to the external face detector and camera, plus the adaptive
//! input-size policy that tunes each detector call from the last result.

use crate::types::{Detection, FrameHandle};
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;

// --- Adaptive sizing constants ---
const SMALL_FACE_RATIO: f32 = 0.2;
const LARGE_FACE_RATIO: f32 = 0.5;
const SMALL_FACE_INPUT_SIZE: u32 = 512;
const SMALL_FACE_SCORE: f32 = 0.3;
const LARGE_FACE_INPUT_SIZE: u32 = 320;
const LARGE_FACE_SCORE: f32 = 0.5;
const BASE_INPUT_SIZE: u32 = 416;
const REGISTRATION_SCORE: f32 = 0.4;
const RECOGNITION_SCORE: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("vision service unavailable: {0}")]
    Unavailable(String),
    #[error("invalid detector response: {0}")]
    InvalidResponse(String),
}

/// Per-call detector tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectOptions {
    /// Square network input resolution in pixels.
    pub input_size: u32,
    /// Minimum face score for a detection to be reported.
    pub score_threshold: f32,
}

/// Closed-loop tuning of [`DetectOptions`] from the previous detection's size.
///
/// Small (far) faces get a larger input and a lower score threshold; large
/// (near) faces get a smaller input and a stricter threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptivePolicy {
    pub base: DetectOptions,
    pub small_face: DetectOptions,
    pub large_face: DetectOptions,
}

impl AdaptivePolicy {
    pub fn registration() -> Self {
        Self::with_base(DetectOptions {
            input_size: BASE_INPUT_SIZE,
            score_threshold: REGISTRATION_SCORE,
        })
    }

    pub fn recognition() -> Self {
        Self::with_base(DetectOptions {
            input_size: BASE_INPUT_SIZE,
            score_threshold: RECOGNITION_SCORE,
        })
    }

    fn with_base(base: DetectOptions) -> Self {
        Self {
            base,
            small_face: DetectOptions {
                input_size: SMALL_FACE_INPUT_SIZE,
                score_threshold: SMALL_FACE_SCORE,
            },
            large_face: DetectOptions {
                input_size: LARGE_FACE_INPUT_SIZE,
                score_threshold: LARGE_FACE_SCORE,
            },
        }
    }

    /// Options for the next call given the last held detection, if any.
    pub fn options_for(&self, previous: Option<&Detection>, frame_width: u32) -> DetectOptions {
        let Some(previous) = previous else {
            return self.base;
        };
        let ratio = previous.bounding_box.width_ratio(frame_width);
        if ratio < SMALL_FACE_RATIO {
            self.small_face
        } else if ratio > LARGE_FACE_RATIO {
            self.large_face
        } else {
            self.base
        }
    }
}

/// External face detector: finds the single most prominent face in a frame
/// and returns its descriptor, or `None` when no face clears the threshold.
pub trait FaceDetector: Send + Sync {
    fn detect(
        &self,
        frame: &FrameHandle,
        options: &DetectOptions,
    ) -> impl Future<Output = Result<Option<Detection>, DetectorError>> + Send;
}

/// External camera: exposes the frame currently being displayed.
pub trait FrameSource: Send + Sync {
    /// `None` while the camera is not delivering frames yet.
    fn current_frame(&self) -> impl Future<Output = Result<Option<FrameHandle>, DetectorError>> + Send;

    /// Encoded still image of `frame`, if the source still has it.
    fn snapshot(
        &self,
        frame: &FrameHandle,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, DetectorError>> + Send;
}
