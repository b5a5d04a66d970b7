//! Detection stabilizer.
//!
//! Turns the noisy, possibly-null per-frame detector output into a held
//! detection that survives short dropouts. A held detection stays valid for
//! the hold window; within it no new inference is requested, and a null
//! result only clears it once the window has elapsed.

use crate::detector::{AdaptivePolicy, DetectOptions};
use crate::types::{Detection, FrameHandle};
use std::time::{Duration, Instant};

/// Default time a detection is held despite detector dropouts.
pub const DEFAULT_HOLD_WINDOW: Duration = Duration::from_millis(3000);

/// The detection currently driving the UI.
#[derive(Debug, Clone)]
pub struct HeldDetection {
    pub detection: Detection,
    /// Frame the detection was found in.
    pub frame: FrameHandle,
    pub captured_at: Instant,
}

#[derive(Debug, Clone)]
enum State {
    Empty,
    Held(HeldDetection),
}

/// Outcome of feeding one detector result to the stabilizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `Empty -> Held`.
    Acquired,
    /// `Held -> Held` with a new detection.
    Refreshed,
    /// Held detection unchanged (dropout or early result inside the window).
    Kept,
    /// `Held -> Empty`.
    Cleared,
    /// Still `Empty`.
    Idle,
}

impl Transition {
    /// Whether the exposed detection changed to a new value.
    pub fn is_new_detection(&self) -> bool {
        matches!(self, Transition::Acquired | Transition::Refreshed)
    }
}

#[derive(Debug, Clone)]
pub struct DetectionStabilizer {
    hold_window: Duration,
    policy: AdaptivePolicy,
    state: State,
}

impl DetectionStabilizer {
    pub fn new(hold_window: Duration, policy: AdaptivePolicy) -> Self {
        Self {
            hold_window,
            policy,
            state: State::Empty,
        }
    }

    pub fn hold_window(&self) -> Duration {
        self.hold_window
    }

    pub fn current(&self) -> Option<&HeldDetection> {
        match &self.state {
            State::Held(held) => Some(held),
            State::Empty => None,
        }
    }

    pub fn is_held(&self) -> bool {
        matches!(self.state, State::Held(_))
    }

    fn window_elapsed(&self, held: &HeldDetection, now: Instant) -> bool {
        now.saturating_duration_since(held.captured_at) >= self.hold_window
    }

    /// False while a held detection is still inside its hold window.
    pub fn should_poll(&self, now: Instant) -> bool {
        match &self.state {
            State::Empty => true,
            State::Held(held) => self.window_elapsed(held, now),
        }
    }

    /// Detector options for the next call, tuned from the held detection.
    pub fn detect_options(&self, frame_width: u32) -> DetectOptions {
        self.policy
            .options_for(self.current().map(|h| &h.detection), frame_width)
    }

    pub fn observe(
        &mut self,
        detection: Option<Detection>,
        frame: FrameHandle,
        now: Instant,
    ) -> Transition {
        let elapsed = match &self.state {
            State::Empty => None,
            State::Held(held) => Some(self.window_elapsed(held, now)),
        };

        match (elapsed, detection) {
            (None, None) => Transition::Idle,
            (None, Some(detection)) => {
                self.hold(detection, frame, now);
                Transition::Acquired
            }
            (Some(true), Some(detection)) => {
                self.hold(detection, frame, now);
                Transition::Refreshed
            }
            (Some(true), None) => {
                self.state = State::Empty;
                tracing::debug!("held detection expired");
                Transition::Cleared
            }
            (Some(false), _) => Transition::Kept,
        }
    }

    fn hold(&mut self, detection: Detection, frame: FrameHandle, now: Instant) {
        tracing::debug!(
            sequence = frame.sequence,
            confidence = detection.bounding_box.confidence,
            "holding detection"
        );
        self.state = State::Held(HeldDetection {
            detection,
            frame,
            captured_at: now,
        });
    }

    /// Drop the held detection, e.g. after it was used for registration.
    pub fn clear(&mut self) {
        self.state = State::Empty;
    }
}
