//! Per-frame liveness heuristic gating the expensive matching stage.
//!
//! Two policies are supported. `PresenceOnly` treats any detected face as
//! live; `BlinkAndTurn` additionally requires a closed-eye aspect ratio and a
//! horizontal nose displacement in the same frame. Both operate on landmark
//! geometry the detector already produced — no extra inference, no temporal
//! state. Callers wanting debounce must layer it on top.
//!
//! This is a cheap photo deterrent, not anti-spoofing: a video replay or a
//! cooperative attacker defeats it.

use crate::types::Detection;

/// Eye aspect ratio below which the eyes count as closed.
pub const DEFAULT_EAR_THRESHOLD: f32 = 0.2;

/// Horizontal nose-extreme displacement (pixels at the detector's working
/// resolution) above which the head counts as turned.
pub const DEFAULT_TURN_THRESHOLD_PX: f32 = 10.0;

/// A 2-D landmark point in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Landmark geometry for one frame, consumed by the gate and discarded.
/// Never persisted.
#[derive(Debug, Clone)]
pub struct LivenessFrame {
    /// Eye contour points: left eye (6) followed by right eye (6).
    pub eye_points: Vec<Point>,
    /// Nose contour points, bridge-to-tip order.
    pub nose_points: Vec<Point>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessPolicy {
    /// A detected face is live.
    PresenceOnly,
    /// Requires `blinked && turned` in the same frame.
    BlinkAndTurn,
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    pub policy: LivenessPolicy,
    pub ear_threshold: f32,
    pub turn_threshold_px: f32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            policy: LivenessPolicy::PresenceOnly,
            ear_threshold: DEFAULT_EAR_THRESHOLD,
            turn_threshold_px: DEFAULT_TURN_THRESHOLD_PX,
        }
    }
}

/// Outcome of one gate evaluation. `blinked`/`turned` are reported under both
/// policies as auxiliary signals for the operator UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessStatus {
    pub ok: bool,
    pub blinked: bool,
    pub turned: bool,
}

impl LivenessStatus {
    const NOT_LIVE: LivenessStatus = LivenessStatus {
        ok: false,
        blinked: false,
        turned: false,
    };
}

pub struct LivenessGate {
    config: LivenessConfig,
}

impl LivenessGate {
    pub fn new(config: LivenessConfig) -> Self {
        Self { config }
    }

    /// Evaluate one frame. No detection always yields `ok = false` without
    /// error.
    pub fn evaluate(&self, frame: Detection<&LivenessFrame>) -> LivenessStatus {
        let Detection::Detected(frame) = frame else {
            return LivenessStatus::NOT_LIVE;
        };

        let ear = eye_aspect_ratio(&frame.eye_points);
        let blinked = ear < self.config.ear_threshold;
        let turned = nose_turn(&frame.nose_points).abs() > self.config.turn_threshold_px;

        let ok = match self.config.policy {
            LivenessPolicy::PresenceOnly => true,
            LivenessPolicy::BlinkAndTurn => blinked && turned,
        };

        LivenessStatus { ok, blinked, turned }
    }
}

/// Eye aspect ratio `(d(p1,p5) + d(p2,p4)) / (2·d(p0,p3))` over the first
/// eye contour of the concatenated left+right sequence. Both eyes blink
/// together in practice, so one contour is enough. Fewer than the full 12
/// points reads as wide open (ratio 1).
pub fn eye_aspect_ratio(eye_points: &[Point]) -> f32 {
    if eye_points.len() < 12 {
        return 1.0;
    }
    let p = eye_points;
    let span = 2.0 * p[0].distance(&p[3]);
    if span == 0.0 {
        return 1.0;
    }
    (p[1].distance(&p[5]) + p[2].distance(&p[4])) / span
}

/// Signed horizontal displacement between the two extreme nose points — a
/// coarse yaw proxy. Fewer than 2 points reads as no turn.
pub fn nose_turn(nose_points: &[Point]) -> f32 {
    match (nose_points.first(), nose_points.last()) {
        (Some(first), Some(last)) if nose_points.len() >= 2 => first.x - last.x,
        _ => 0.0,
    }
}
