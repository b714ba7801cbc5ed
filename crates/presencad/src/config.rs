use presenca_core::liveness::{
    LivenessConfig, LivenessPolicy, DEFAULT_EAR_THRESHOLD, DEFAULT_TURN_THRESHOLD_PX,
};
use presenca_core::matcher::DEFAULT_MATCH_THRESHOLD;
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
///
/// Every threshold the kiosk applies is tunable here. The shipped defaults
/// come from the reference deployment and have no stated calibration method;
/// validate them against your own camera and model before trusting them.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files and the integrity manifest.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance threshold for a positive match.
    pub match_threshold: f32,
    /// Liveness policy: "presence" or "blink-turn".
    pub liveness_policy: LivenessPolicy,
    /// Eye aspect ratio below which the eyes count as closed.
    pub ear_threshold: f32,
    /// Nose displacement (px) above which the head counts as turned.
    pub turn_threshold_px: f32,
    /// Minimum interval between embedding extractions (ms).
    pub throttle_ms: u64,
    /// Pause between kiosk cycles (ms).
    pub cycle_interval_ms: u64,
    /// Per-subject cooldown before the recorder is called again (s).
    pub cooldown_secs: u64,
    /// Lookback for the recent-duplicate query (s).
    pub recent_window_secs: i64,
    /// Interval between roster snapshot refreshes (s).
    pub roster_refresh_secs: u64,
    /// Number of warmup frames to discard at startup (camera AGC/AE
    /// stabilization).
    pub warmup_frames: usize,
    /// When set, check-ins are bound to this class schedule.
    pub class_id: Option<String>,
    /// Whether the daemon registers on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `PRESENCA_*` environment variables with
    /// defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("PRESENCA_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| presenca_models::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presenca");

        let db_path = std::env::var("PRESENCA_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("kiosk.db"));

        let liveness_policy = match std::env::var("PRESENCA_LIVENESS_POLICY").as_deref() {
            Ok("blink-turn") => LivenessPolicy::BlinkAndTurn,
            _ => LivenessPolicy::PresenceOnly,
        };

        Self {
            camera_device: std::env::var("PRESENCA_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            db_path,
            match_threshold: env_f32("PRESENCA_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD),
            liveness_policy,
            ear_threshold: env_f32("PRESENCA_EAR_THRESHOLD", DEFAULT_EAR_THRESHOLD),
            turn_threshold_px: env_f32("PRESENCA_TURN_THRESHOLD_PX", DEFAULT_TURN_THRESHOLD_PX),
            throttle_ms: env_u64("PRESENCA_THROTTLE_MS", 900),
            cycle_interval_ms: env_u64("PRESENCA_CYCLE_INTERVAL_MS", 100),
            cooldown_secs: env_u64("PRESENCA_COOLDOWN_SECS", 20),
            recent_window_secs: env_u64("PRESENCA_RECENT_WINDOW_SECS", 30) as i64,
            roster_refresh_secs: env_u64("PRESENCA_ROSTER_REFRESH_SECS", 30),
            warmup_frames: env_usize("PRESENCA_WARMUP_FRAMES", 4),
            class_id: std::env::var("PRESENCA_CLASS_ID").ok().filter(|v| !v.is_empty()),
            session_bus: std::env::var("PRESENCA_SESSION_BUS").is_ok(),
        }
    }

    pub fn detector_model_path(&self) -> String {
        self.model_path(presenca_models::DETECTOR_MODEL)
    }

    pub fn landmark_model_path(&self) -> String {
        self.model_path(presenca_models::LANDMARK_MODEL)
    }

    pub fn recognition_model_path(&self) -> String {
        self.model_path(presenca_models::RECOGNITION_MODEL)
    }

    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            policy: self.liveness_policy,
            ear_threshold: self.ear_threshold,
            turn_threshold_px: self.turn_threshold_px,
        }
    }

    fn model_path(&self, name: &str) -> String {
        self.model_dir.join(name).to_string_lossy().into_owned()
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
