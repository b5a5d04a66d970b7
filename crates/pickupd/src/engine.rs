//! Mode controller: runs the detection polling loop for the active mode.
//!
//! At most one loop exists at a time. Switching modes cancels the running
//! loop and waits for it to finish before the next one starts. Each loop
//! awaits its detector call inline, so a slow detector makes the loop skip
//! ticks instead of stacking calls.

use pickup_core::{
    thumbnail_png, AdaptivePolicy, BoundingBox, Descriptor, DetectionStabilizer, DetectorError,
    FaceDetector, FrameHandle, FrameSource, Guardian, HeldDetection, Mode, Role, Transition,
};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::kiosk::{GuardianUpdate, Kiosk, KioskError, Recognition};

#[derive(Debug, Clone, Copy)]
pub struct LoopTiming {
    pub hold_window: Duration,
    pub registration_poll: Duration,
    pub recognition_poll: Duration,
}

/// The held detection as shown to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionView {
    pub mode: Mode,
    pub bounding_box: BoundingBox,
    pub frame: FrameHandle,
    pub age_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub mode: Mode,
    pub polls: u64,
    pub holding: bool,
    /// Most recent vision failure, cleared by the next successful poll.
    pub last_error: Option<String>,
}

/// State shared between one polling loop and the controller.
struct Session {
    stabilizer: DetectionStabilizer,
    recognition: Option<Recognition>,
    last_error: Option<String>,
    polls: u64,
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActiveLoop {
    mode: Mode,
    session: Arc<Mutex<Session>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ModeController<V> {
    vision: Arc<V>,
    kiosk: Arc<Kiosk>,
    timing: LoopTiming,
    active: tokio::sync::Mutex<Option<ActiveLoop>>,
}

impl<V> ModeController<V>
where
    V: FaceDetector + FrameSource + 'static,
{
    pub fn new(vision: Arc<V>, kiosk: Arc<Kiosk>, timing: LoopTiming) -> Self {
        Self {
            vision,
            kiosk,
            timing,
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn mode(&self) -> Mode {
        self.active
            .lock()
            .await
            .as_ref()
            .map_or(Mode::Idle, |active| active.mode)
    }

    /// Stop the running loop, if any, then start the loop for `mode`.
    pub async fn switch_mode(&self, mode: Mode) {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.cancel.cancel();
            if let Err(err) = previous.task.await {
                tracing::error!(mode = %previous.mode, error = %err, "detection loop panicked");
            }
        }
        if mode == Mode::Idle {
            tracing::info!("kiosk idle");
            return;
        }

        let (policy, period) = match mode {
            Mode::Registration => (AdaptivePolicy::registration(), self.timing.registration_poll),
            _ => (AdaptivePolicy::recognition(), self.timing.recognition_poll),
        };
        let session = Arc::new(Mutex::new(Session {
            stabilizer: DetectionStabilizer::new(self.timing.hold_window, policy),
            recognition: None,
            last_error: None,
            polls: 0,
        }));
        let cancel = CancellationToken::new();
        let poll = PollLoop {
            mode,
            period,
            vision: Arc::clone(&self.vision),
            kiosk: Arc::clone(&self.kiosk),
            session: Arc::clone(&session),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(poll.run());
        *active = Some(ActiveLoop {
            mode,
            session,
            cancel,
            task,
        });
    }

    /// Stop the running loop. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.switch_mode(Mode::Idle).await;
    }

    pub async fn status(&self) -> LoopStatus {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(active) => {
                let session = lock(&active.session);
                LoopStatus {
                    mode: active.mode,
                    polls: session.polls,
                    holding: session.stabilizer.is_held(),
                    last_error: session.last_error.clone(),
                }
            }
            None => LoopStatus {
                mode: Mode::Idle,
                polls: 0,
                holding: false,
                last_error: None,
            },
        }
    }

    pub async fn current_detection(&self) -> Option<DetectionView> {
        let active = self.active.lock().await;
        let active = active.as_ref()?;
        let session = lock(&active.session);
        let held = session.stabilizer.current()?;
        Some(DetectionView {
            mode: active.mode,
            bounding_box: held.detection.bounding_box.clone(),
            frame: held.frame,
            age_ms: held.captured_at.elapsed().as_millis() as u64,
        })
    }

    /// Recognition for the held detection, recognition mode only.
    pub async fn current_recognition(&self) -> Option<Recognition> {
        let active = self.active.lock().await;
        let active = active.as_ref().filter(|a| a.mode == Mode::Recognition)?;
        let recognition = lock(&active.session).recognition.clone();
        recognition
    }

    /// Enroll a guardian from the detection held in registration mode.
    pub async fn register_held(&self, name: &str, role: Role) -> Result<Guardian, KioskError> {
        let (session, held) = self.held_for_registration().await?;
        let photo = self.capture_photo(&held.frame).await;
        let guardian = self
            .kiosk
            .enroll(name, role, held.detection.descriptor, photo)
            .await?;
        lock(&session).stabilizer.clear();
        Ok(guardian)
    }

    /// Replace an enrolled guardian's descriptor with the held detection.
    pub async fn recapture_held(&self, guardian_id: &str) -> Result<Guardian, KioskError> {
        let (session, held) = self.held_for_registration().await?;
        let update = GuardianUpdate {
            descriptor: Some(held.detection.descriptor),
            ..Default::default()
        };
        let guardian = self.kiosk.update_guardian(guardian_id, update).await?;
        lock(&session).stabilizer.clear();
        Ok(guardian)
    }

    async fn held_for_registration(&self) -> Result<(Arc<Mutex<Session>>, HeldDetection), KioskError> {
        let guard = self.active.lock().await;
        let Some(active) = guard.as_ref().filter(|a| a.mode == Mode::Registration) else {
            return Err(KioskError::NoFaceDetected);
        };
        let session = lock(&active.session);
        match session.stabilizer.current() {
            Some(held) => Ok((Arc::clone(&active.session), held.clone())),
            None => match &session.last_error {
                Some(message) => Err(DetectorError::Unavailable(message.clone()).into()),
                None => Err(KioskError::NoFaceDetected),
            },
        }
    }

    /// Thumbnail of the frame a detection came from. Registration proceeds
    /// without a photo when the frame is gone or cannot be decoded.
    async fn capture_photo(&self, frame: &FrameHandle) -> Option<Vec<u8>> {
        let encoded = match self.vision.snapshot(frame).await {
            Ok(Some(encoded)) => encoded,
            Ok(None) => {
                tracing::debug!(sequence = frame.sequence, "frame gone before photo capture");
                return None;
            }
            Err(err) => {
                tracing::warn!(error = %err, "photo capture failed");
                return None;
            }
        };
        match thumbnail_png(&encoded, self.kiosk.settings().photo_max_side) {
            Ok(png) => Some(png),
            Err(err) => {
                tracing::warn!(error = %err, "photo thumbnail failed");
                None
            }
        }
    }
}

struct PollLoop<V> {
    mode: Mode,
    period: Duration,
    vision: Arc<V>,
    kiosk: Arc<Kiosk>,
    session: Arc<Mutex<Session>>,
    cancel: CancellationToken,
}

impl<V> PollLoop<V>
where
    V: FaceDetector + FrameSource + 'static,
{
    async fn run(self) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(mode = %self.mode, period_ms = self.period.as_millis() as u64, "detection loop started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !lock(&self.session).stabilizer.should_poll(Instant::now()) {
                continue;
            }
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = self.poll_once() => outcome,
            };
            let Some(descriptor) = outcome else {
                continue;
            };

            let recognition = tokio::select! {
                _ = self.cancel.cancelled() => break,
                recognition = self.kiosk.recognize(&descriptor) => recognition,
            };
            match recognition {
                Ok(recognition) => {
                    tracing::info!(
                        label = %recognition.label,
                        known = recognition.is_known(),
                        distance = recognition.distance,
                        children = recognition.linked_children.len(),
                        "recognition updated"
                    );
                    lock(&self.session).recognition = Some(recognition);
                }
                Err(err) => tracing::warn!(error = %err, "recognition failed"),
            }
        }

        tracing::info!(mode = %self.mode, "detection loop stopped");
    }

    /// One frame through the detector and the stabilizer. Returns the
    /// descriptor to match when recognition mode holds a new detection.
    async fn poll_once(&self) -> Option<Descriptor> {
        let frame = match self.vision.current_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return None,
            Err(err) => {
                self.record_error(err);
                return None;
            }
        };
        let options = lock(&self.session).stabilizer.detect_options(frame.width);
        let detection = match self.vision.detect(&frame, &options).await {
            Ok(detection) => detection,
            Err(err) => {
                self.record_error(err);
                return None;
            }
        };

        let mut session = lock(&self.session);
        session.polls += 1;
        session.last_error = None;
        match session.stabilizer.observe(detection, frame, Instant::now()) {
            Transition::Cleared => {
                session.recognition = None;
                None
            }
            transition if transition.is_new_detection() && self.mode == Mode::Recognition => session
                .stabilizer
                .current()
                .map(|held| held.detection.descriptor.clone()),
            _ => None,
        }
    }

    fn record_error(&self, err: DetectorError) {
        tracing::warn!(mode = %self.mode, error = %err, "vision poll failed");
        lock(&self.session).last_error = Some(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kiosk::tests::{descriptor, kiosk, DIM};
    use image::{DynamicImage, ImageFormat, RgbImage};
    use pickup_core::{DetectOptions, Detection, RecordKind};
    use pickup_store::LinkMode;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Vision service stand-in whose camera always shows `scene`.
    #[derive(Default)]
    struct FakeVision {
        scene: Mutex<Option<Detection>>,
        latency: Duration,
        failing: AtomicBool,
        photo: Option<Vec<u8>>,
        calls: AtomicUsize,
        in_flight: AtomicBool,
        overlapped: AtomicBool,
    }

    impl FakeVision {
        fn showing(detection: Option<Detection>) -> Self {
            Self {
                scene: Mutex::new(detection),
                ..Default::default()
            }
        }
    }

    impl FrameSource for FakeVision {
        async fn current_frame(&self) -> Result<Option<FrameHandle>, DetectorError> {
            let sequence = self.calls.load(Ordering::SeqCst) as u64;
            Ok(Some(FrameHandle { sequence, width: 640, height: 480 }))
        }

        async fn snapshot(&self, _frame: &FrameHandle) -> Result<Option<Vec<u8>>, DetectorError> {
            Ok(self.photo.clone())
        }
    }

    impl FaceDetector for FakeVision {
        async fn detect(
            &self,
            _frame: &FrameHandle,
            _options: &DetectOptions,
        ) -> Result<Option<Detection>, DetectorError> {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.in_flight.store(false, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(DetectorError::Unavailable("camera unplugged".into()));
            }
            Ok(self.scene.lock().unwrap().clone())
        }
    }

    fn face(values: [f32; DIM]) -> Detection {
        Detection {
            bounding_box: BoundingBox { x: 200.0, y: 100.0, width: 200.0, height: 240.0, confidence: 0.9 },
            descriptor: descriptor(values),
        }
    }

    fn timing(hold_window: Duration, poll: Duration) -> LoopTiming {
        LoopTiming {
            hold_window,
            registration_poll: poll,
            recognition_poll: poll,
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30])));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    async fn controller(vision: FakeVision, timing: LoopTiming) -> (ModeController<FakeVision>, Arc<Kiosk>, Arc<FakeVision>) {
        let kiosk = Arc::new(kiosk().await);
        let vision = Arc::new(vision);
        let controller = ModeController::new(Arc::clone(&vision), Arc::clone(&kiosk), timing);
        (controller, kiosk, vision)
    }

    async fn wait_for_detection(controller: &ModeController<FakeVision>) -> DetectionView {
        for _ in 0..200 {
            if let Some(view) = controller.current_detection().await {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no detection held");
    }

    async fn wait_for_recognition(controller: &ModeController<FakeVision>) -> Recognition {
        for _ in 0..200 {
            if let Some(recognition) = controller.current_recognition().await {
                return recognition;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no recognition produced");
    }

    #[tokio::test]
    async fn test_register_held_detection() {
        let vision = FakeVision {
            photo: Some(png(320, 240)),
            ..FakeVision::showing(Some(face([0.1, 0.2, 0.3, 0.4])))
        };
        let (controller, kiosk, _) =
            controller(vision, timing(Duration::from_secs(10), Duration::from_millis(10))).await;

        controller.switch_mode(Mode::Registration).await;
        let view = wait_for_detection(&controller).await;
        assert_eq!(view.mode, Mode::Registration);
        assert_eq!(view.bounding_box.width, 200.0);

        let guardian = controller.register_held("Ann", Role::Mother).await.unwrap();
        assert_eq!(guardian.descriptor, descriptor([0.1, 0.2, 0.3, 0.4]));
        let photo = image::load_from_memory(guardian.photo.as_deref().unwrap()).unwrap();
        assert_eq!((photo.width(), photo.height()), (64, 48));
        assert_eq!(kiosk.list(RecordKind::Guardian).await.unwrap().len(), 1);

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_register_without_face() {
        let (controller, kiosk, _) =
            controller(FakeVision::showing(None), timing(Duration::from_secs(10), Duration::from_millis(10))).await;

        let err = controller.register_held("Ann", Role::Mother).await.unwrap_err();
        assert!(matches!(err, KioskError::NoFaceDetected));

        controller.switch_mode(Mode::Registration).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = controller.register_held("Ann", Role::Mother).await.unwrap_err();
        assert!(matches!(err, KioskError::NoFaceDetected));
        assert!(kiosk.list(RecordKind::Guardian).await.unwrap().is_empty());

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_recapture_replaces_descriptor() {
        let (controller, kiosk, _) = controller(
            FakeVision::showing(Some(face([0.9, 0.9, 0.9, 0.9]))),
            timing(Duration::from_secs(10), Duration::from_millis(10)),
        )
        .await;
        let ann = kiosk.enroll("Ann", Role::Mother, descriptor([0.0; DIM]), None).await.unwrap();

        controller.switch_mode(Mode::Registration).await;
        wait_for_detection(&controller).await;
        let updated = controller.recapture_held(&ann.id).await.unwrap();
        assert_eq!(updated.descriptor, descriptor([0.9, 0.9, 0.9, 0.9]));
        assert_eq!(kiosk.recognize(&descriptor([0.9, 0.9, 0.9, 0.9])).await.unwrap().label, "Ann");

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_recognition_loop_resolves_children() {
        let (controller, kiosk, _) = controller(
            FakeVision::showing(Some(face([0.1, 0.2, 0.3, 0.4]))),
            timing(Duration::from_secs(10), Duration::from_millis(10)),
        )
        .await;
        let ann = kiosk.enroll("Ann", Role::Mother, descriptor([0.1, 0.2, 0.3, 0.4]), None).await.unwrap();
        let bo = kiosk.enroll_child("Bo", "2", "B").await.unwrap();
        kiosk.link(&ann.id, vec![bo.id.clone()], LinkMode::Merge).await.unwrap();

        controller.switch_mode(Mode::Recognition).await;
        let recognition = wait_for_recognition(&controller).await;
        assert_eq!(recognition.label, "Ann");
        assert_eq!(recognition.linked_children, vec![bo]);

        // Registration needs registration mode.
        let err = controller.register_held("Cy", Role::Father).await.unwrap_err();
        assert!(matches!(err, KioskError::NoFaceDetected));

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_switch_mode_cancels_previous_loop() {
        let (controller, _, vision) = controller(
            FakeVision::showing(Some(face([0.0; DIM]))),
            timing(Duration::ZERO, Duration::from_millis(5)),
        )
        .await;

        controller.switch_mode(Mode::Registration).await;
        wait_for_detection(&controller).await;
        controller.switch_mode(Mode::Recognition).await;
        assert_eq!(controller.mode().await, Mode::Recognition);

        controller.stop().await;
        assert_eq!(controller.mode().await, Mode::Idle);
        assert!(controller.current_detection().await.is_none());

        let calls = vision.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(vision.calls.load(Ordering::SeqCst), calls);

        controller.stop().await;
        assert_eq!(controller.status().await.mode, Mode::Idle);
    }

    #[tokio::test]
    async fn test_slow_detector_never_overlaps() {
        let vision = FakeVision {
            latency: Duration::from_millis(40),
            ..FakeVision::showing(None)
        };
        let (controller, _, vision) = controller(vision, timing(Duration::ZERO, Duration::from_millis(5))).await;

        controller.switch_mode(Mode::Recognition).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        controller.stop().await;

        assert!(!vision.overlapped.load(Ordering::SeqCst));
        let calls = vision.calls.load(Ordering::SeqCst);
        assert!(calls >= 2, "only {calls} detector calls");
        assert!(calls <= 300 / 40 + 2, "{calls} detector calls in 300ms");
    }

    #[tokio::test]
    async fn test_held_detection_suppresses_polling() {
        let (controller, _, vision) = controller(
            FakeVision::showing(Some(face([0.0; DIM]))),
            timing(Duration::from_secs(10), Duration::from_millis(5)),
        )
        .await;

        controller.switch_mode(Mode::Registration).await;
        wait_for_detection(&controller).await;
        let calls = vision.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(vision.calls.load(Ordering::SeqCst), calls);
        assert!(controller.status().await.holding);

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_detector_failure_surfaces() {
        let vision = FakeVision::showing(None);
        vision.failing.store(true, Ordering::SeqCst);
        let (controller, _, vision) =
            controller(vision, timing(Duration::from_secs(10), Duration::from_millis(5))).await;

        controller.switch_mode(Mode::Registration).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(controller.status().await.last_error.is_some());
        let err = controller.register_held("Ann", Role::Mother).await.unwrap_err();
        assert!(matches!(err, KioskError::Detector(_)));

        vision.failing.store(false, Ordering::SeqCst);
        *vision.scene.lock().unwrap() = Some(face([0.0; DIM]));
        wait_for_detection(&controller).await;
        assert!(controller.status().await.last_error.is_none());

        controller.stop().await;
    }
}
