use chrono::Utc;
use presenca_core::attendance::{AttendanceRecorder, CheckInSource};
use presenca_core::enroll::{BiometricUpdate, ProfileDraft, ProfileStore};
use presenca_core::Detection;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::interface;

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::kiosk::{KioskEvent, KioskHandle};
use crate::store::KioskStore;

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    /// `None` when models or camera were unavailable at startup — the kiosk
    /// then runs in manual-only mode.
    pub engine: Option<EngineHandle>,
    pub store: KioskStore,
    pub recorder: AttendanceRecorder<KioskStore>,
    pub kiosk: Option<KioskHandle>,
    /// In-progress enrollment drafts, keyed by profile id.
    pub drafts: HashMap<String, ProfileDraft>,
    /// Latest loop outcome, kept for `LastCheckIn`.
    pub last_event: Option<KioskEvent>,
}

/// D-Bus control surface for the attendance kiosk daemon.
///
/// Bus name: org.presenca.Kiosk1
/// Object path: /org/presenca/Kiosk1
pub struct KioskService {
    pub state: Arc<Mutex<AppState>>,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.presenca.Kiosk1")]
impl KioskService {
    /// Record a manual check-in for a subject, bypassing liveness, matching,
    /// and cooldown entirely. Returns the outcome as JSON.
    async fn manual_check_in(&self, subject_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(subject_id, "manual check-in requested");

        let state = self.state.lock().await;
        let at = Utc::now();
        let outcome = match state.config.class_id.as_deref() {
            Some(class_id) => {
                state
                    .recorder
                    .check_in_for_class(class_id, subject_id, CheckInSource::Manual, at)
                    .await
            }
            None => {
                state
                    .recorder
                    .check_in(subject_id, CheckInSource::Manual, at)
                    .await
            }
        }
        .map_err(|e| {
            tracing::error!(error = %e, "manual check-in failed");
            failed(e)
        })?;

        serde_json::to_string(&outcome).map_err(failed)
    }

    /// Create a new profile. Returns the generated profile id.
    async fn create_profile(&self, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, "create_profile requested");
        let state = self.state.lock().await;
        state.store.create_profile(name).await.map_err(failed)
    }

    /// Capture one frame and add its embedding to the profile's enrollment
    /// draft. Returns the draft's sample count.
    async fn enroll_sample(&self, profile_id: &str) -> zbus::fdo::Result<u32> {
        tracing::info!(profile_id, "enroll_sample requested");

        // Copy the engine handle while holding the lock, then capture with
        // the lock released.
        let engine = {
            let state = self.state.lock().await;
            state.engine.clone()
        };
        let Some(engine) = engine else {
            return Err(failed("model unavailable; kiosk is in manual-only mode"));
        };

        let detection = engine.extract().await.map_err(|e| {
            tracing::error!(error = %e, "enroll capture failed");
            failed(e)
        })?;
        let Detection::Detected(embedding) = detection else {
            return Err(failed("face not detected; adjust lighting and retry"));
        };

        let mut state = self.state.lock().await;
        let draft = state
            .drafts
            .entry(profile_id.to_string())
            .or_insert_with(|| ProfileDraft::new(profile_id));
        draft.add_sample(embedding).map_err(failed)?;
        Ok(draft.sample_count() as u32)
    }

    /// Commit the profile's enrollment draft: computes the centroid and
    /// replaces any previously stored biometrics atomically. Returns the
    /// number of committed samples.
    async fn enroll_commit(&self, profile_id: &str) -> zbus::fdo::Result<u32> {
        tracing::info!(profile_id, "enroll_commit requested");

        let mut state = self.state.lock().await;
        let Some(draft) = state.drafts.remove(profile_id) else {
            return Err(failed("no enrollment in progress for this profile"));
        };
        let count = draft.sample_count();

        match draft.clone().commit() {
            Ok(update) => {
                state
                    .store
                    .apply_biometrics(profile_id, update)
                    .await
                    .map_err(|e| {
                        tracing::error!(error = %e, "enroll commit store write failed");
                        failed(e)
                    })?;
                tracing::info!(profile_id, samples = count, "enrollment committed");
                Ok(count as u32)
            }
            Err(e) => {
                // Keep the draft so the caller can gather more samples.
                state.drafts.insert(profile_id.to_string(), draft);
                Err(failed(e))
            }
        }
    }

    /// Remove the profile's biometrics (stored samples and centroid) and any
    /// in-progress draft.
    async fn enroll_clear(&self, profile_id: &str) -> zbus::fdo::Result<()> {
        tracing::info!(profile_id, "enroll_clear requested");
        let mut state = self.state.lock().await;
        state.drafts.remove(profile_id);
        state
            .store
            .apply_biometrics(profile_id, BiometricUpdate::Clear)
            .await
            .map_err(failed)
    }

    /// List enrolled profiles (metadata only) as JSON.
    async fn list_profiles(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let profiles = state.store.list_profiles().await.map_err(failed)?;
        serde_json::to_string(&profiles).map_err(failed)
    }

    /// Flip a profile's active flag. Inactive profiles drop out of matching
    /// on the next roster refresh.
    async fn set_profile_active(&self, profile_id: &str, active: bool) -> zbus::fdo::Result<bool> {
        tracing::info!(profile_id, active, "set_profile_active requested");
        let state = self.state.lock().await;
        state
            .store
            .set_profile_active(profile_id, active)
            .await
            .map_err(failed)
    }

    /// Insert or update a class schedule row (schedule-bound deployments).
    async fn set_class_window(
        &self,
        class_id: &str,
        starts_at: &str,
        ends_at: &str,
    ) -> zbus::fdo::Result<()> {
        let starts_at = chrono::DateTime::parse_from_rfc3339(starts_at)
            .map_err(failed)?
            .with_timezone(&Utc);
        let ends_at = chrono::DateTime::parse_from_rfc3339(ends_at)
            .map_err(failed)?
            .with_timezone(&Utc);

        let state = self.state.lock().await;
        state
            .store
            .set_class_window(&presenca_core::attendance::ClassWindow {
                id: class_id.to_string(),
                starts_at,
                ends_at,
            })
            .await
            .map_err(failed)
    }

    /// Daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let profiles = state.store.count_profiles().await.unwrap_or(0);

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": state.config.camera_device,
            "mode": if state.engine.is_some() { "automatic" } else { "manual-only" },
            "loop_active": state.kiosk.as_ref().map(|k| k.is_active()).unwrap_or(false),
            "class_id": state.config.class_id,
            "profiles": profiles,
            "match_threshold": state.config.match_threshold,
        })
        .to_string())
    }

    /// Latest kiosk loop outcome as JSON, or "null" if none yet.
    async fn last_check_in(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        match &state.last_event {
            Some(event) => serde_json::to_string(event).map_err(failed),
            None => Ok("null".to_string()),
        }
    }
}
