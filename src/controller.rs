// src/controller.rs
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use anyhow::Context as _;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};

use crate::{
    convert::ImageConverter,
    data_url::DataUrl,
    error::{Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppPhase {
    Capturing,
    Processing,
    Result,
}

impl AppPhase {
    /// Retake is allowed out of Processing too; the in-flight result is then discarded.
    fn can_move_to(self, next: AppPhase) -> bool {
        matches!(
            (self, next),
            (AppPhase::Capturing, AppPhase::Processing)
                | (AppPhase::Processing, AppPhase::Result)
                | (AppPhase::Processing, AppPhase::Capturing)
                | (AppPhase::Result, AppPhase::Capturing)
        )
    }
}

/// A finished conversion, tagged with the capture attempt that started it.
#[derive(Debug)]
pub struct ConversionOutcome {
    pub attempt: u64,
    pub result: Result<DataUrl>,
}

/// Owns the capture → processing → result flow and the images that go with it.
pub struct Controller {
    phase: AppPhase,
    captured: Option<DataUrl>,
    processed: Option<DataUrl>,
    error: Option<String>,
    attempt: u64,
    export_name: String,

    converter: Arc<dyn ImageConverter>,
    outcome_tx: Sender<ConversionOutcome>,
    outcome_rx: Receiver<ConversionOutcome>,
    repaint: Option<egui::Context>,
}

impl Controller {
    pub fn new(converter: Arc<dyn ImageConverter>, export_name: impl Into<String>) -> Self {
        let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded();
        Self {
            phase: AppPhase::Capturing,
            captured: None,
            processed: None,
            error: None,
            attempt: 0,
            export_name: export_name.into(),
            converter,
            outcome_tx,
            outcome_rx,
            repaint: None,
        }
    }

    /// Wakes the UI when a conversion finishes in the background.
    pub fn with_repaint(mut self, ctx: egui::Context) -> Self {
        self.repaint = Some(ctx);
        self
    }

    pub fn phase(&self) -> AppPhase {
        self.phase
    }

    pub fn captured(&self) -> Option<&DataUrl> {
        self.captured.as_ref()
    }

    pub fn processed(&self) -> Option<&DataUrl> {
        self.processed.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn can_download(&self) -> bool {
        self.processed.is_some()
    }

    pub fn export_name(&self) -> &str {
        &self.export_name
    }

    fn transition(&mut self, next: AppPhase) -> bool {
        if !self.phase.can_move_to(next) {
            warn!("Ignoring transition {:?} -> {:?}", self.phase, next);
            return false;
        }
        debug!("Phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
        true
    }

    /// Takes a frame from the camera and starts converting it.
    pub fn on_capture(&mut self, data_url: &str) {
        if !self.transition(AppPhase::Processing) {
            return;
        }
        self.attempt += 1;
        self.error = None;
        self.processed = None;
        self.captured = None;

        match DataUrl::parse_capture(data_url) {
            Ok(image) => {
                info!("Capture #{} accepted ({})", self.attempt, image.mime());
                self.captured = Some(image.clone());
                self.spawn_conversion(image);
            }
            Err(err) => {
                error!("Capture #{} rejected: {}", self.attempt, err);
                self.fail(&err);
            }
        }
    }

    /// Camera trouble. Shown inline; the phase does not change.
    pub fn report_error(&mut self, err: &Error) {
        error!("{}", err);
        self.error = Some(err.to_string());
    }

    /// Dismisses the inline alert once the camera has recovered. Only
    /// meaningful while capturing; later phases own their error text.
    pub fn clear_error(&mut self) {
        if self.phase == AppPhase::Capturing {
            self.error = None;
        }
    }

    /// Drops both images and any error, back to the camera.
    pub fn retake(&mut self) {
        if !self.transition(AppPhase::Capturing) {
            return;
        }
        // Any conversion still in flight now belongs to a dead attempt.
        self.attempt += 1;
        self.captured = None;
        self.processed = None;
        self.error = None;
    }

    /// Applies every finished conversion. Call once per UI frame.
    pub fn poll(&mut self) {
        loop {
            match self.outcome_rx.try_recv() {
                Ok(outcome) => self.apply(outcome),
                Err(TryRecvError::Empty) => break,
                // We hold a sender ourselves, so this cannot happen.
                Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Writes the processed image into `dir` under the export name.
    /// Returns `None` when there is nothing to export.
    pub fn download_into(&self, dir: &Path) -> anyhow::Result<Option<PathBuf>> {
        let path = dir.join(&self.export_name);
        Ok(self.export_to(&path)?.then_some(path))
    }

    /// Writes the processed image's bytes to `path`. Returns `false` when
    /// there is nothing to export.
    pub fn export_to(&self, path: &Path) -> anyhow::Result<bool> {
        let Some(processed) = &self.processed else {
            return Ok(false);
        };
        let bytes = processed
            .decode()
            .context("Processed image is not valid base64")?;
        std::fs::write(path, &bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Saved {} bytes to {}", bytes.len(), path.display());
        Ok(true)
    }

    fn apply(&mut self, outcome: ConversionOutcome) {
        if self.phase != AppPhase::Processing || outcome.attempt != self.attempt {
            info!(
                "Discarding stale conversion #{} (current #{}, {:?})",
                outcome.attempt, self.attempt, self.phase
            );
            return;
        }
        match outcome.result {
            Ok(image) => {
                info!("Conversion #{} finished", outcome.attempt);
                self.processed = Some(image);
                self.transition(AppPhase::Result);
            }
            Err(err) => self.fail(&err),
        }
    }

    fn fail(&mut self, err: &Error) {
        self.error = Some(format!("Conversion failed: {}", err));
        self.processed = None;
        self.transition(AppPhase::Result);
    }

    fn spawn_conversion(&self, image: DataUrl) {
        let attempt = self.attempt;
        let converter = Arc::clone(&self.converter);
        let tx = self.outcome_tx.clone();
        let repaint = self.repaint.clone();
        thread::spawn(move || {
            let result = converter.convert(&image);
            if tx.send(ConversionOutcome { attempt, result }).is_err() {
                debug!("Controller gone before conversion #{} finished", attempt);
            }
            if let Some(ctx) = repaint {
                ctx.request_repaint();
            }
        });
    }

    /// Blocks until one conversion outcome arrives and applies it.
    #[cfg(test)]
    fn settle(&mut self) {
        let outcome = self
            .outcome_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("conversion did not finish");
        self.apply(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{extract_image, GenerateContentResponse};
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };
    use tempfile::TempDir;

    const JPEG_URL: &str = "data:image/jpeg;base64,/9j/AAA=";
    const EXPORT: &str = "anime-karakterim.png";

    /// Answers every request with the same model response body.
    struct CannedResponse {
        body: &'static str,
        calls: AtomicUsize,
    }

    impl CannedResponse {
        fn new(body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                body,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ImageConverter for CannedResponse {
        fn convert(&self, _image: &DataUrl) -> Result<DataUrl> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let response: GenerateContentResponse =
                serde_json::from_str(self.body).map_err(|e| Error::Conversion(e.to_string()))?;
            extract_image(response)
        }
    }

    /// Each call blocks until the test releases the gate keyed by its payload.
    struct Gated {
        gates: Mutex<HashMap<String, Receiver<Result<DataUrl>>>>,
    }

    impl Gated {
        fn new(gates: Vec<(&str, Receiver<Result<DataUrl>>)>) -> Arc<Self> {
            let gates = gates
                .into_iter()
                .map(|(payload, gate)| (payload.to_string(), gate))
                .collect();
            Arc::new(Self {
                gates: Mutex::new(gates),
            })
        }
    }

    impl ImageConverter for Gated {
        fn convert(&self, image: &DataUrl) -> Result<DataUrl> {
            let gate = self.gates.lock().unwrap().remove(image.payload()).unwrap();
            gate.recv().unwrap()
        }
    }

    const IMAGE_RESPONSE: &str =
        r#"{"candidates":[{"content":{"parts":[{"inlineData":{"mimeType":"image/png","data":"AAA="}}]}}]}"#;
    const TEXT_RESPONSE: &str =
        r#"{"candidates":[{"content":{"parts":[{"text":"blocked by policy"}]}}]}"#;

    #[test]
    fn starts_capturing_and_empty() {
        let ctl = Controller::new(CannedResponse::new(IMAGE_RESPONSE), EXPORT);
        assert_eq!(ctl.phase(), AppPhase::Capturing);
        assert!(ctl.captured().is_none());
        assert!(ctl.processed().is_none());
        assert!(ctl.error().is_none());
        assert!(!ctl.can_download());
    }

    #[test]
    fn successful_conversion_shows_image() {
        let mut ctl = Controller::new(CannedResponse::new(IMAGE_RESPONSE), EXPORT);
        ctl.on_capture(JPEG_URL);
        assert_eq!(ctl.phase(), AppPhase::Processing);
        assert_eq!(ctl.captured().unwrap().to_string(), JPEG_URL);
        assert!(ctl.processed().is_none());

        ctl.settle();
        assert_eq!(ctl.phase(), AppPhase::Result);
        assert_eq!(
            ctl.processed().unwrap().to_string(),
            "data:image/png;base64,AAA="
        );
        assert!(ctl.error().is_none());
        assert!(ctl.can_download());
    }

    #[test]
    fn text_only_response_shows_explanation() {
        let mut ctl = Controller::new(CannedResponse::new(TEXT_RESPONSE), EXPORT);
        ctl.on_capture(JPEG_URL);
        ctl.settle();

        assert_eq!(ctl.phase(), AppPhase::Result);
        assert!(ctl.processed().is_none());
        assert!(ctl.captured().is_some());
        let message = ctl.error().unwrap();
        assert!(message.contains("blocked by policy"), "{message}");
        assert!(message.starts_with("Conversion failed:"));
    }

    #[test]
    fn bad_data_url_skips_converter() {
        let canned = CannedResponse::new(IMAGE_RESPONSE);
        let mut ctl = Controller::new(canned.clone(), EXPORT);
        ctl.on_capture("data:image/gif;base64,R0lGOD==");

        assert_eq!(ctl.phase(), AppPhase::Result);
        assert!(ctl.processed().is_none());
        assert!(ctl.captured().is_none());
        assert!(ctl.error().unwrap().contains("Invalid image format"));
        ctl.poll();
        assert_eq!(canned.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn retake_clears_everything_at_once() {
        let mut ctl = Controller::new(CannedResponse::new(IMAGE_RESPONSE), EXPORT);
        ctl.on_capture(JPEG_URL);
        ctl.settle();
        assert!(ctl.captured().is_some() && ctl.processed().is_some());

        ctl.retake();
        assert_eq!(ctl.phase(), AppPhase::Capturing);
        assert!(ctl.captured().is_none());
        assert!(ctl.processed().is_none());
        assert!(ctl.error().is_none());

        let mut ctl = Controller::new(CannedResponse::new(TEXT_RESPONSE), EXPORT);
        ctl.on_capture(JPEG_URL);
        ctl.settle();
        assert!(ctl.error().is_some());
        ctl.retake();
        assert!(ctl.captured().is_none() && ctl.processed().is_none() && ctl.error().is_none());
    }

    #[test]
    fn illegal_transitions_are_ignored() {
        let mut ctl = Controller::new(CannedResponse::new(IMAGE_RESPONSE), EXPORT);
        // Retake from Capturing is not an edge.
        ctl.retake();
        assert_eq!(ctl.phase(), AppPhase::Capturing);

        ctl.on_capture(JPEG_URL);
        // A second capture while processing is refused.
        ctl.on_capture("data:image/png;base64,BBB=");
        assert_eq!(ctl.phase(), AppPhase::Processing);
        assert_eq!(ctl.captured().unwrap().to_string(), JPEG_URL);

        ctl.settle();
        ctl.on_capture(JPEG_URL);
        assert_eq!(ctl.phase(), AppPhase::Result);
    }

    #[test]
    fn late_result_of_abandoned_capture_is_ignored() {
        let (release_a, gate_a) = crossbeam_channel::bounded(1);
        let (release_b, gate_b) = crossbeam_channel::bounded(1);
        let converter = Gated::new(vec![("QQ==", gate_a), ("Qg==", gate_b)]);
        let mut ctl = Controller::new(converter, EXPORT);

        ctl.on_capture("data:image/jpeg;base64,QQ==");
        ctl.retake();
        ctl.on_capture("data:image/jpeg;base64,Qg==");
        assert_eq!(ctl.phase(), AppPhase::Processing);

        release_b
            .send(Ok(DataUrl::new("image/png", "Qg==")))
            .unwrap();
        ctl.settle();
        assert_eq!(ctl.phase(), AppPhase::Result);

        release_a
            .send(Ok(DataUrl::new("image/png", "QQ==")))
            .unwrap();
        ctl.settle();

        assert_eq!(ctl.captured().unwrap().payload(), "Qg==");
        assert_eq!(ctl.processed().unwrap().payload(), "Qg==");
        assert!(ctl.error().is_none());
    }

    #[test]
    fn abandoned_result_arriving_mid_processing_is_ignored() {
        let (release_a, gate_a) = crossbeam_channel::bounded(1);
        let (release_b, gate_b) = crossbeam_channel::bounded(1);
        let converter = Gated::new(vec![("QQ==", gate_a), ("Qg==", gate_b)]);
        let mut ctl = Controller::new(converter, EXPORT);

        ctl.on_capture("data:image/jpeg;base64,QQ==");
        ctl.retake();
        ctl.on_capture("data:image/jpeg;base64,Qg==");

        // A lands while B is still in flight.
        release_a
            .send(Ok(DataUrl::new("image/png", "QQ==")))
            .unwrap();
        ctl.settle();
        assert_eq!(ctl.phase(), AppPhase::Processing);
        assert!(ctl.processed().is_none());
        assert!(ctl.error().is_none());
        assert_eq!(ctl.captured().unwrap().payload(), "Qg==");

        release_b
            .send(Ok(DataUrl::new("image/png", "Qg==")))
            .unwrap();
        ctl.settle();
        assert_eq!(ctl.phase(), AppPhase::Result);
        assert_eq!(ctl.processed().unwrap().payload(), "Qg==");
    }

    #[test]
    fn abandoned_failure_mid_processing_sets_no_error() {
        let (release_a, gate_a) = crossbeam_channel::bounded(1);
        let (release_b, gate_b) = crossbeam_channel::bounded(1);
        let converter = Gated::new(vec![("QQ==", gate_a), ("Qg==", gate_b)]);
        let mut ctl = Controller::new(converter, EXPORT);

        ctl.on_capture("data:image/jpeg;base64,QQ==");
        ctl.retake();
        ctl.on_capture("data:image/jpeg;base64,Qg==");

        release_a
            .send(Err(Error::ModelOutput("blocked by policy".to_string())))
            .unwrap();
        ctl.settle();
        assert_eq!(ctl.phase(), AppPhase::Processing);
        assert!(ctl.error().is_none());

        release_b
            .send(Ok(DataUrl::new("image/png", "Qg==")))
            .unwrap();
        ctl.settle();
        assert!(ctl.error().is_none());
        assert_eq!(ctl.processed().unwrap().payload(), "Qg==");
    }

    #[test]
    fn clear_error_only_dismisses_camera_alerts() {
        let mut ctl = Controller::new(CannedResponse::new(TEXT_RESPONSE), EXPORT);
        ctl.report_error(&Error::Device("No other camera to switch to.".to_string()));
        ctl.clear_error();
        assert!(ctl.error().is_none());

        ctl.on_capture(JPEG_URL);
        ctl.settle();
        ctl.clear_error();
        assert!(ctl.error().unwrap().contains("blocked by policy"));
    }

    #[test]
    fn late_result_after_retake_does_not_leave_capturing() {
        let (release, gate) = crossbeam_channel::bounded(1);
        let converter = Gated::new(vec![("/9j/AAA=", gate)]);
        let mut ctl = Controller::new(converter, EXPORT);

        ctl.on_capture(JPEG_URL);
        ctl.retake();
        release.send(Err(Error::Conversion("timeout".to_string()))).unwrap();
        ctl.settle();

        assert_eq!(ctl.phase(), AppPhase::Capturing);
        assert!(ctl.error().is_none());
    }

    #[test]
    fn download_is_noop_without_result() {
        let dir = TempDir::new().unwrap();
        let mut ctl = Controller::new(CannedResponse::new(TEXT_RESPONSE), EXPORT);
        assert_eq!(ctl.download_into(dir.path()).unwrap(), None);

        ctl.on_capture(JPEG_URL);
        ctl.settle();
        assert!(!ctl.can_download());
        assert_eq!(ctl.download_into(dir.path()).unwrap(), None);
        assert!(!dir.path().join(EXPORT).exists());
    }

    #[test]
    fn download_writes_exact_bytes_under_fixed_name() {
        let dir = TempDir::new().unwrap();
        let mut ctl = Controller::new(CannedResponse::new(IMAGE_RESPONSE), EXPORT);
        ctl.on_capture(JPEG_URL);
        ctl.settle();

        let path = ctl.download_into(dir.path()).unwrap().unwrap();
        assert_eq!(path, dir.path().join("anime-karakterim.png"));
        assert_eq!(std::fs::read(&path).unwrap(), ctl.processed().unwrap().decode().unwrap());
        assert_eq!(ctl.phase(), AppPhase::Result);
    }

    #[test]
    fn device_error_does_not_change_phase_and_capture_clears_it() {
        let mut ctl = Controller::new(CannedResponse::new(IMAGE_RESPONSE), EXPORT);
        ctl.report_error(&Error::Device("denied".to_string()));
        assert_eq!(ctl.phase(), AppPhase::Capturing);
        assert!(ctl.error().unwrap().contains("denied"));

        ctl.on_capture(JPEG_URL);
        assert!(ctl.error().is_none());
    }
}
