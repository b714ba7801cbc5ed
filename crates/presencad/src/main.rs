use anyhow::Result;
use presenca_core::attendance::{AttendanceRecorder, WindowPolicy};
use presenca_core::liveness::LivenessGate;
use presenca_core::matcher::TwoStageMatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod kiosk;
mod roster;
mod store;

use dbus_interface::{AppState, KioskService};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presencad starting");

    let config = config::Config::from_env();
    let store = store::KioskStore::open(&config.db_path).await?;
    tracing::info!(db = %config.db_path.display(), "store opened");

    // Model verification and engine startup decide between automatic and
    // manual-only mode. A failure here degrades the kiosk, never crashes it.
    let engine = match presenca_models::verify_models_dir(&config.model_dir) {
        Ok(()) => match engine::spawn_engine(
            &config.camera_device,
            &config.detector_model_path(),
            &config.landmark_model_path(),
            &config.recognition_model_path(),
            config.warmup_frames,
        ) {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "engine unavailable; automatic matching disabled");
                None
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "model verification failed; automatic matching disabled");
            None
        }
    };

    let recent_window = chrono::Duration::seconds(config.recent_window_secs);
    let kiosk_handle = match engine.clone() {
        Some(engine_handle) => {
            let roster = roster::spawn_roster_refresh(
                store.clone(),
                Duration::from_secs(config.roster_refresh_secs),
            );
            let kiosk_config = kiosk::KioskConfig {
                cycle_interval: Duration::from_millis(config.cycle_interval_ms),
                throttle: Duration::from_millis(config.throttle_ms),
                cooldown: Duration::from_secs(config.cooldown_secs),
                class_id: config.class_id.clone(),
            };
            let (kiosk_loop, handle) = kiosk::KioskLoop::new(
                kiosk_config,
                engine_handle,
                LivenessGate::new(config.liveness()),
                TwoStageMatcher::new(config.match_threshold),
                AttendanceRecorder::with_policies(
                    store.clone(),
                    recent_window,
                    WindowPolicy::default(),
                ),
                roster,
            );
            tokio::spawn(kiosk_loop.run());
            Some(handle)
        }
        None => None,
    };

    let state = Arc::new(Mutex::new(AppState {
        recorder: AttendanceRecorder::with_policies(
            store.clone(),
            recent_window,
            WindowPolicy::default(),
        ),
        engine,
        store,
        kiosk: kiosk_handle.clone(),
        drafts: Default::default(),
        last_event: None,
        config,
    }));

    // Mirror loop outcomes into shared state for the LastCheckIn method.
    if let Some(handle) = &kiosk_handle {
        let mut events = handle.subscribe();
        let event_state = state.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => event_state.lock().await.last_event = Some(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let session_bus = state.lock().await.config.session_bus;
    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name("org.presenca.Kiosk1")?
        .serve_at("/org/presenca/Kiosk1", KioskService { state })?
        .build()
        .await?;

    tracing::info!("presencad ready");

    tokio::signal::ctrl_c().await?;
    if let Some(handle) = &kiosk_handle {
        handle.stop();
    }
    tracing::info!("presencad shutting down");

    Ok(())
}
