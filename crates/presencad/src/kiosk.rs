//! The kiosk processing loop.
//!
//! One `KioskLoop` owns one camera session's worth of state: the liveness
//! gate, the matcher, the per-subject cooldown map, and the extraction
//! throttle stamp. The loop is an explicit schedulable task: `run` awaits
//! every cycle to completion before pausing and starting the next one, so
//! cycles can never overlap no matter how slow the extractor or the store
//! gets. Stopping the loop flips an `active` flag that is re-checked before
//! any store write, so a result that was in flight when the kiosk stopped is
//! discarded rather than recorded.
//!
//! Per cycle: sense landmarks → liveness gate (every cycle, cheap) →
//! extraction throttle → embedding extraction → match against the current
//! roster snapshot → cooldown → attendance recorder → publish the outcome.
//! A fault anywhere is logged and ends that cycle only.

use chrono::{DateTime, Utc};
use presenca_core::attendance::{
    AttendanceRecorder, AttendanceStore, CheckInSource, SkipReason,
};
use presenca_core::liveness::{LivenessFrame, LivenessGate};
use presenca_core::matcher::{MatchOutcome, Matcher, TwoStageMatcher};
use presenca_core::types::{Detection, Embedding, FaceProfile};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
// tokio's Instant rather than std's: the throttle and cooldown clocks must
// follow the runtime clock so paused-time tests drive them deterministically.
use tokio::time::Instant;

/// Seam between the loop and the camera/extractor engine. Both calls capture
/// a fresh frame; `sense` is the cheap per-cycle one.
#[allow(async_fn_in_trait)]
pub trait ObserveSource {
    type Error: std::fmt::Display;

    async fn sense(&mut self) -> Result<Detection<LivenessFrame>, Self::Error>;
    async fn extract(&mut self) -> Result<Detection<Embedding>, Self::Error>;
}

#[derive(Debug, Clone)]
pub struct KioskConfig {
    /// Pause between cycles, after the previous cycle has fully completed.
    pub cycle_interval: Duration,
    /// Minimum interval between embedding extractions.
    pub throttle: Duration,
    /// Per-subject cooldown before the recorder is called again.
    pub cooldown: Duration,
    /// When set, check-ins are bound to this class schedule.
    pub class_id: Option<String>,
}

impl Default for KioskConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_millis(100),
            throttle: Duration::from_millis(900),
            cooldown: Duration::from_secs(20),
            class_id: None,
        }
    }
}

/// Outcome of one recognized-and-recorded (or suppressed) check-in, published
/// to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct KioskEvent {
    pub subject_id: String,
    pub name: String,
    pub distance: f32,
    pub at: DateTime<Utc>,
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_ok: Option<bool>,
}

/// Per-subject cooldown map, owned by one loop instance.
///
/// Purely a cost optimization: it short-circuits recorder calls (and their
/// store round-trips) on every throttled tick while the same face stays in
/// frame. It is not persisted and resets on restart — the persisted
/// duplicate check in the recorder remains the correctness guarantee.
pub struct Cooldown {
    window: Duration,
    last_trigger: HashMap<String, Instant>,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_trigger: HashMap::new(),
        }
    }

    /// Whether the subject is outside its cooldown window; arms the window
    /// when so.
    pub fn check_and_arm(&mut self, subject_id: &str, now: Instant) -> bool {
        match self.last_trigger.get(subject_id) {
            Some(&last) if now.duration_since(last) < self.window => false,
            _ => {
                self.last_trigger.insert(subject_id.to_string(), now);
                true
            }
        }
    }
}

/// Handle for stopping a running loop and subscribing to its events.
#[derive(Clone)]
pub struct KioskHandle {
    active: Arc<AtomicBool>,
    events: broadcast::Sender<KioskEvent>,
}

impl KioskHandle {
    /// Stop the loop. The current cycle finishes on its own; its result is
    /// discarded before any store write.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KioskEvent> {
        self.events.subscribe()
    }
}

pub struct KioskLoop<O, S> {
    config: KioskConfig,
    source: O,
    gate: LivenessGate,
    matcher: TwoStageMatcher,
    recorder: AttendanceRecorder<S>,
    roster: watch::Receiver<Arc<Vec<FaceProfile>>>,
    cooldown: Cooldown,
    last_extraction: Option<Instant>,
    active: Arc<AtomicBool>,
    events: broadcast::Sender<KioskEvent>,
}

impl<O, S> KioskLoop<O, S>
where
    O: ObserveSource,
    S: AttendanceStore,
{
    pub fn new(
        config: KioskConfig,
        source: O,
        gate: LivenessGate,
        matcher: TwoStageMatcher,
        recorder: AttendanceRecorder<S>,
        roster: watch::Receiver<Arc<Vec<FaceProfile>>>,
    ) -> (Self, KioskHandle) {
        let active = Arc::new(AtomicBool::new(true));
        let (events, _) = broadcast::channel(16);
        let handle = KioskHandle {
            active: active.clone(),
            events: events.clone(),
        };
        let cooldown = Cooldown::new(config.cooldown);
        (
            Self {
                config,
                source,
                gate,
                matcher,
                recorder,
                roster,
                cooldown,
                last_extraction: None,
                active,
                events,
            },
            handle,
        )
    }

    /// Run until stopped. Reschedule-after-completion: the next cycle is
    /// only considered once the previous one has fully finished.
    pub async fn run(mut self) {
        tracing::info!("kiosk loop started");
        while self.active.load(Ordering::SeqCst) {
            self.cycle().await;
            tokio::time::sleep(self.config.cycle_interval).await;
        }
        tracing::info!("kiosk loop stopped");
    }

    /// One processing cycle. Faults are logged and confined to this cycle.
    async fn cycle(&mut self) {
        // Liveness runs every cycle; it is cheap relative to extraction.
        let status = match self.source.sense().await {
            Ok(detection) => self.gate.evaluate(detection.as_ref()),
            Err(e) => {
                tracing::warn!(error = %e, "sense failed; skipping cycle");
                return;
            }
        };

        // Throttle the expensive stage independent of frame rate. The stamp
        // is armed as soon as the check passes, whether or not extraction
        // produces anything this cycle.
        let now = Instant::now();
        match self.last_extraction {
            Some(last) if now.duration_since(last) < self.config.throttle => return,
            _ => self.last_extraction = Some(now),
        }

        if !status.ok {
            return;
        }

        let embedding = match self.source.extract().await {
            Ok(Detection::Detected(embedding)) => embedding,
            Ok(Detection::NotDetected) => return,
            Err(e) => {
                tracing::warn!(error = %e, "extraction failed; skipping cycle");
                return;
            }
        };

        // Read-only snapshot, swapped wholesale by the roster refresh task.
        let roster = self.roster.borrow().clone();
        let MatchOutcome::Matched {
            profile_id,
            name,
            distance,
        } = self.matcher.identify(&embedding, &roster)
        else {
            return;
        };
        tracing::debug!(subject = %profile_id, distance, "face matched");

        if !self.cooldown.check_and_arm(&profile_id, Instant::now()) {
            tracing::debug!(subject = %profile_id, "within cooldown; not recording");
            return;
        }

        // The loop may have been stopped while extraction was in flight; a
        // stopped loop must not write.
        if !self.active.load(Ordering::SeqCst) {
            return;
        }

        let at = Utc::now();
        let result = match self.config.class_id.as_deref() {
            Some(class_id) => {
                self.recorder
                    .check_in_for_class(class_id, &profile_id, CheckInSource::Face, at)
                    .await
            }
            None => {
                self.recorder
                    .check_in(&profile_id, CheckInSource::Face, at)
                    .await
            }
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, subject = %profile_id, "attendance store unavailable; cycle dropped");
                return;
            }
        };

        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(KioskEvent {
            subject_id: profile_id,
            name,
            distance,
            at,
            created: outcome.created,
            reason: outcome.reason,
            window_ok: outcome.window_ok,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presenca_core::attendance::{CheckInRecord, ClassWindow};
    use presenca_core::centroid;
    use presenca_core::liveness::LivenessConfig;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Observe source that always sees a face and counts extraction calls,
    /// optionally stalling each extraction.
    struct ScriptedSource {
        extract_calls: Arc<AtomicUsize>,
        extract_delay: Duration,
        embedding: Vec<f32>,
    }

    impl ScriptedSource {
        fn new(extract_delay: Duration, embedding: Vec<f32>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    extract_calls: calls.clone(),
                    extract_delay,
                    embedding,
                },
                calls,
            )
        }
    }

    impl ObserveSource for ScriptedSource {
        type Error = Infallible;

        async fn sense(&mut self) -> Result<Detection<LivenessFrame>, Infallible> {
            Ok(Detection::Detected(LivenessFrame {
                eye_points: Vec::new(),
                nose_points: Vec::new(),
            }))
        }

        async fn extract(&mut self) -> Result<Detection<Embedding>, Infallible> {
            self.extract_calls.fetch_add(1, Ordering::SeqCst);
            if !self.extract_delay.is_zero() {
                tokio::time::sleep(self.extract_delay).await;
            }
            Ok(Detection::Detected(Embedding::new(self.embedding.clone())))
        }
    }

    #[derive(Default)]
    struct CountingStore {
        records: Mutex<Vec<CheckInRecord>>,
    }

    impl AttendanceStore for Arc<CountingStore> {
        type Error = Infallible;

        async fn find_recent(
            &self,
            subject_id: &str,
            since: DateTime<Utc>,
        ) -> Result<Option<CheckInRecord>, Infallible> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.subject_id == subject_id && r.created_at >= since)
                .max_by_key(|r| r.created_at)
                .cloned())
        }

        async fn create_if_absent(&self, record: &CheckInRecord) -> Result<bool, Infallible> {
            let mut records = self.records.lock().unwrap();
            if records.iter().any(|r| r.id == record.id) {
                return Ok(false);
            }
            records.push(record.clone());
            Ok(true)
        }

        async fn class_window(&self, _class_id: &str) -> Result<Option<ClassWindow>, Infallible> {
            Ok(None)
        }
    }

    fn roster_with(profiles: Vec<FaceProfile>) -> watch::Receiver<Arc<Vec<FaceProfile>>> {
        // The loop only ever borrows the latest snapshot, which outlives the
        // dropped sender.
        let (_tx, rx) = watch::channel(Arc::new(profiles));
        rx
    }

    fn enrolled(id: &str, name: &str, fill: f32) -> FaceProfile {
        let samples = vec![
            Embedding::new(vec![fill, fill]),
            Embedding::new(vec![fill, fill]),
            Embedding::new(vec![fill, fill]),
        ];
        let center = centroid(&samples);
        FaceProfile {
            id: id.into(),
            name: name.into(),
            active: true,
            samples,
            centroid: center,
        }
    }

    fn start_loop(
        config: KioskConfig,
        source: ScriptedSource,
        store: Arc<CountingStore>,
        roster: watch::Receiver<Arc<Vec<FaceProfile>>>,
    ) -> KioskHandle {
        let (kiosk, handle) = KioskLoop::new(
            config,
            source,
            LivenessGate::new(LivenessConfig::default()),
            TwoStageMatcher::default(),
            AttendanceRecorder::new(store),
            roster,
        );
        tokio::spawn(kiosk.run());
        handle
    }

    #[test]
    fn test_cooldown_blocks_then_releases() {
        let mut cooldown = Cooldown::new(Duration::from_secs(20));
        let t0 = Instant::now();

        assert!(cooldown.check_and_arm("s1", t0));
        assert!(!cooldown.check_and_arm("s1", t0 + Duration::from_secs(10)));
        // Other subjects are unaffected.
        assert!(cooldown.check_and_arm("s2", t0 + Duration::from_secs(10)));
        assert!(cooldown.check_and_arm("s1", t0 + Duration::from_secs(21)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extraction_bounded_by_throttle() {
        let (source, calls) = ScriptedSource::new(Duration::ZERO, vec![9.0, 9.0]);
        let store = Arc::new(CountingStore::default());
        let handle = start_loop(
            KioskConfig::default(),
            source,
            store.clone(),
            roster_with(Vec::new()),
        );

        let elapsed = Duration::from_millis(4500);
        tokio::time::sleep(elapsed).await;
        handle.stop();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let bound = (elapsed.as_millis() / 900) as usize + 1;
        let count = calls.load(Ordering::SeqCst);
        assert!(count >= 2, "extraction never ran: {count}");
        assert!(count <= bound, "{count} extractions exceed bound {bound}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_extractor_never_overlaps() {
        // Extraction takes longer than the throttle interval. Single-flight
        // rescheduling means call count is bounded by the extraction latency,
        // not just the throttle.
        let (source, calls) = ScriptedSource::new(Duration::from_secs(2), vec![9.0, 9.0]);
        let store = Arc::new(CountingStore::default());
        let handle = start_loop(
            KioskConfig::default(),
            source,
            store.clone(),
            roster_with(Vec::new()),
        );

        tokio::time::sleep(Duration::from_millis(4500)).await;
        handle.stop();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let count = calls.load(Ordering::SeqCst);
        assert!(count <= 3, "{count} extractions imply overlapping cycles");
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_records_once_within_cooldown() {
        let (source, _calls) = ScriptedSource::new(Duration::ZERO, vec![1.0, 1.0]);
        let store = Arc::new(CountingStore::default());
        let roster = roster_with(vec![enrolled("s1", "Ana", 1.0)]);
        let handle = start_loop(KioskConfig::default(), source, store.clone(), roster);
        let mut events = handle.subscribe();

        // Several throttle windows pass while the same face stays in frame.
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.stop();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(store.records.lock().unwrap().len(), 1);
        let event = events.try_recv().expect("one event published");
        assert_eq!(event.subject_id, "s1");
        assert_eq!(event.name, "Ana");
        assert!(event.created);
        assert!(events.try_recv().is_err(), "no second event within cooldown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_loop_discards_inflight_result() {
        // Extraction is still in flight when the loop is stopped; the match
        // result must be discarded before any store write.
        let (source, _calls) = ScriptedSource::new(Duration::from_millis(500), vec![1.0, 1.0]);
        let store = Arc::new(CountingStore::default());
        let roster = roster_with(vec![enrolled("s1", "Ana", 1.0)]);
        let handle = start_loop(KioskConfig::default(), source, store.clone(), roster);

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(store.records.lock().unwrap().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_match_means_no_record() {
        let (source, _calls) = ScriptedSource::new(Duration::ZERO, vec![9.0, 9.0]);
        let store = Arc::new(CountingStore::default());
        // Roster present but far from the probe.
        let roster = roster_with(vec![enrolled("s1", "Ana", 1.0)]);
        let handle = start_loop(KioskConfig::default(), source, store.clone(), roster);

        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.stop();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(store.records.lock().unwrap().len(), 0);
    }
}
