// Generation session - serialized mode transitions plus single-flight generation

use super::encoding::{self, EncoderTopology, TextConditioner};
use super::mode::{decode_mask, decode_upload, CompletedGeneration, HistoryEntry, ModeState, Transition};
use super::notify::{Notification, Notifier};
use super::request::{self, RequestSnapshot};
use super::runtime::{InferenceFailure, InferenceOutput, InferenceRuntime};
use super::scheduler::{SchedulerCatalog, SchedulerConfig};
use super::store::{ImageStore, SavedImage};
use super::types::{GenerationMode, GenerationParams, ModelArchitecture};
use crate::{Error, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Held while a request is resolving, running or persisting
struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl InFlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// One user's interactive generation session
pub struct GenerationSession {
    state: Mutex<ModeState>,
    model: Arc<dyn TextConditioner>,
    runtime: Arc<dyn InferenceRuntime>,
    store: Option<Arc<dyn ImageStore>>,
    notifier: Arc<dyn Notifier>,
    catalog: SchedulerCatalog,
    base_scheduler_config: Option<SchedulerConfig>,
    in_flight: Arc<AtomicBool>,
}

impl GenerationSession {
    pub fn new(
        state: ModeState,
        model: Arc<dyn TextConditioner>,
        runtime: Arc<dyn InferenceRuntime>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            state: Mutex::new(state),
            model,
            runtime,
            store: None,
            notifier,
            catalog: SchedulerCatalog::new(),
            base_scheduler_config: None,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ImageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Scheduler config of the loaded model, used as the base for overrides
    pub fn with_base_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.base_scheduler_config = Some(config);
        self
    }

    pub fn catalog(&self) -> &SchedulerCatalog {
        &self.catalog
    }

    pub fn architecture(&self) -> ModelArchitecture {
        EncoderTopology::detect(self.model.as_ref()).architecture()
    }

    pub fn is_generating(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Swap the loaded model and reset params to its family defaults
    pub fn replace_backend(
        &mut self,
        model: Arc<dyn TextConditioner>,
        runtime: Arc<dyn InferenceRuntime>,
    ) -> Result<()> {
        if self.is_generating() {
            return Err(Error::Busy);
        }
        self.model = model;
        self.runtime = runtime;
        let architecture = self.architecture();
        self.lock_state().reset_params_for(architecture);
        tracing::info!("Loaded model {} ({:?})", self.runtime.model_name(), architecture);
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, ModeState> {
        // State stays consistent even if a holder panicked; every mutation is a single call
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read the current state
    pub fn with_state<R>(&self, f: impl FnOnce(&ModeState) -> R) -> R {
        f(&self.lock_state())
    }

    pub fn current_mode(&self) -> GenerationMode {
        self.lock_state().current_mode()
    }

    pub fn params(&self) -> GenerationParams {
        self.lock_state().params().clone()
    }

    pub fn update_params(&self, f: impl FnOnce(&mut GenerationParams)) {
        f(self.lock_state().params_mut());
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lock_state().history().to_vec()
    }

    pub fn restore_from_history(&self, id: u64) -> Result<()> {
        self.lock_state().restore_from_history(id)
    }

    /// Write the session history as JSON
    pub fn export_history(&self, path: &Path) -> Result<()> {
        let json = self.lock_state().history_json()?;
        std::fs::write(path, json)?;
        tracing::info!("History written to {}", path.display());
        Ok(())
    }

    /// Switch modes; hand-off and strength defaulting finish before this returns
    pub fn transition(&self, mode: GenerationMode) -> Transition {
        let (transition, strength) = {
            let mut state = self.lock_state();
            let transition = state.transition(mode);
            (transition, state.params().effective_strength())
        };

        if transition.handed_off {
            self.notifier.notify(Notification::ImageHandedOff { to: mode });
        }
        if transition.strength_defaulted {
            self.notifier
                .notify(Notification::StrengthDefaulted { mode, strength });
        }
        transition
    }

    pub fn upload_init_image(&self, bytes: &[u8]) -> Result<()> {
        let image = decode_upload(bytes)?;
        tracing::debug!("Init image uploaded ({}x{})", image.width(), image.height());
        self.lock_state().set_init_image(image);
        Ok(())
    }

    pub fn clear_init_image(&self) {
        self.lock_state().clear_init_image();
    }

    pub fn upload_mask(&self, bytes: &[u8]) -> Result<()> {
        let mask = decode_mask(bytes)?;
        self.lock_state().set_mask(mask);
        Ok(())
    }

    pub fn clear_mask(&self) {
        self.lock_state().clear_mask();
    }

    /// Run one generation request for the current mode.
    ///
    /// Overlapping calls fail with [`Error::Busy`]. Failures are also sent to
    /// the notifier with a user-facing message and leave the state untouched.
    pub async fn generate(&self) -> Result<Option<HistoryEntry>> {
        match self.run_generation().await {
            Ok(entry) => Ok(entry),
            Err(err) => {
                tracing::error!("Generation failed: {}", err);
                self.notifier.notify(Notification::GenerationFailed {
                    message: err.user_message(),
                });
                Err(err)
            }
        }
    }

    async fn run_generation(&self) -> Result<Option<HistoryEntry>> {
        let guard = InFlightGuard::acquire(&self.in_flight).ok_or(Error::Busy)?;

        let snapshot = RequestSnapshot::capture(&self.lock_state())?;
        snapshot.params.validate()?;
        if snapshot.params.prompt.trim().is_empty() {
            return Err(InferenceFailure::empty_prompt().into());
        }

        let mode = snapshot.mode;
        let params = snapshot.params.clone();
        let model_name = self.runtime.model_name();
        self.notifier
            .notify(Notification::GenerationStarted { mode });
        tracing::info!("Starting {} with {}", mode, model_name);

        let model = self.model.clone();
        let runtime = self.runtime.clone();
        let catalog = self.catalog.clone();
        let base_config = self.base_scheduler_config.clone();

        // The guard travels with the blocking task so a dropped future cannot
        // release it while the runtime is still busy
        let (guard, output) = tokio::task::spawn_blocking(move || {
            let output = execute(snapshot, model.as_ref(), runtime.as_ref(), &catalog, base_config.as_ref());
            (guard, output)
        })
        .await
        .map_err(|e| Error::Other(anyhow::anyhow!("generation task failed: {}", e)))?;
        let output = output?;

        let artifacts = self.persist(&output, &params, &model_name).await;

        let image_count = output.images.len();
        let entry = self
            .lock_state()
            .on_generation_complete(CompletedGeneration {
                images: output.images,
                params,
                seed: output.seed,
                model: model_name,
                artifacts,
            })
            .cloned();
        drop(guard);

        self.notifier.notify(Notification::GenerationCompleted {
            images: image_count,
            seed: output.seed,
        });
        Ok(entry)
    }

    async fn persist(
        &self,
        output: &InferenceOutput,
        params: &GenerationParams,
        model_name: &str,
    ) -> Vec<SavedImage> {
        let Some(store) = &self.store else {
            return Vec::new();
        };

        let mut artifacts = Vec::with_capacity(output.images.len());
        for image in &output.images {
            match store.save(image, params, output.seed, model_name).await {
                Ok(saved) => artifacts.push(saved),
                Err(err) => {
                    tracing::warn!("Failed to save image: {}", err);
                    self.notifier.notify(Notification::PersistenceFailed {
                        message: err.to_string(),
                    });
                }
            }
        }
        artifacts
    }
}

// Encoding, scheduler resolution, assembly and the runtime call, off the async thread
fn execute(
    snapshot: RequestSnapshot,
    model: &dyn TextConditioner,
    runtime: &dyn InferenceRuntime,
    catalog: &SchedulerCatalog,
    base_config: Option<&SchedulerConfig>,
) -> Result<InferenceOutput> {
    let params = &snapshot.params;
    let encoding = encoding::encode(&params.prompt, &params.negative_prompt, model, params.clip_skip)?;
    let scheduler = catalog.resolve(&params.sampler, &params.scheduler, base_config);
    let request = request::assemble(encoding, scheduler, snapshot)?;
    Ok(runtime.run(request)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::encoding::{PooledTextEncoder, TextEncoder};
    use crate::generation::request::InferenceRequest;
    use crate::generation::runtime::FailureKind;
    use async_trait::async_trait;
    use candle_core::{DType, Device, Tensor};
    use image::{Rgb, RgbImage};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct OnesEncoder;

    impl TextEncoder for OnesEncoder {
        fn encode(&self, _text: &str, _clip_skip: u32) -> Result<Tensor> {
            Ok(Tensor::ones((1, 77, 8), DType::F32, &Device::Cpu)?)
        }
    }

    struct FakeModel;

    impl TextConditioner for FakeModel {
        fn name(&self) -> &str {
            "fake"
        }

        fn text_encoder(&self) -> &dyn TextEncoder {
            &OnesEncoder
        }
    }

    /// Returns a solid image per batch slot, optionally waiting for a release signal
    struct FakeRuntime {
        calls: AtomicUsize,
        gate: Option<Mutex<std::sync::mpsc::Receiver<()>>>,
        fail_with: Option<String>,
        last_request: Mutex<Option<InferenceRequest>>,
    }

    impl FakeRuntime {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: None,
                fail_with: None,
                last_request: Mutex::new(None),
            }
        }
    }

    impl InferenceRuntime for FakeRuntime {
        fn model_name(&self) -> String {
            "fake-sd".to_string()
        }

        fn run(&self, request: InferenceRequest) -> std::result::Result<InferenceOutput, InferenceFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _ = gate.lock().unwrap().recv();
            }
            if let Some(message) = &self.fail_with {
                return Err(InferenceFailure::from_message(message.clone()));
            }
            let images = (0..request.batch_size)
                .map(|i| RgbImage::from_pixel(request.width, request.height, Rgb([i as u8, 0, 0])))
                .collect();
            *self.last_request.lock().unwrap() = Some(request);
            Ok(InferenceOutput { images, seed: 31337 })
        }
    }

    #[derive(Default)]
    struct CountingStore {
        saves: AtomicUsize,
    }

    #[async_trait]
    impl ImageStore for CountingStore {
        async fn save(
            &self,
            _image: &RgbImage,
            params: &GenerationParams,
            seed: u64,
            model_name: &str,
        ) -> Result<SavedImage> {
            let n = self.saves.fetch_add(1, Ordering::SeqCst);
            if n > 0 {
                return Err(Error::Persistence("disk full".to_string()));
            }
            Ok(SavedImage {
                image_path: format!("out/{}.png", n).into(),
                thumbnail_path: format!("out/thumb_{}.png", n).into(),
                metadata: crate::generation::metadata::GenerationMetadata::build(params, seed, model_name)
                    .to_string(),
            })
        }
    }

    fn session_with(runtime: Arc<FakeRuntime>) -> (GenerationSession, UnboundedReceiver<Notification>) {
        let (tx, rx) = unbounded_channel();
        let state = ModeState::new(
            GenerationMode::Txt2Img,
            GenerationParams::new("a tidal pool").with_size(64, 64),
        );
        let session = GenerationSession::new(state, Arc::new(FakeModel), runtime, Arc::new(tx));
        (session, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn test_generate_records_history() {
        let runtime = Arc::new(FakeRuntime::new());
        let (session, mut rx) = session_with(runtime.clone());

        let entry = session.generate().await.unwrap().unwrap();
        assert_eq!(entry.seed, 31337);
        assert_eq!(entry.model, "fake-sd");
        assert_eq!(entry.params.prompt, "a tidal pool");
        assert!(session.with_state(|s| s.last_generated_image().is_some()));
        assert!(!session.is_generating());

        let notifications = drain(&mut rx);
        assert!(matches!(notifications.first(), Some(Notification::GenerationStarted { .. })));
        assert!(matches!(
            notifications.last(),
            Some(Notification::GenerationCompleted { images: 1, seed: 31337 })
        ));
    }

    #[tokio::test]
    async fn test_hand_off_notified_once() {
        let runtime = Arc::new(FakeRuntime::new());
        let (session, mut rx) = session_with(runtime);
        session.generate().await.unwrap();
        drain(&mut rx);

        let transition = session.transition(GenerationMode::Img2Img);
        assert!(transition.handed_off);
        let notifications = drain(&mut rx);
        let hand_offs = notifications
            .iter()
            .filter(|n| matches!(n, Notification::ImageHandedOff { .. }))
            .count();
        assert_eq!(hand_offs, 1);

        session.transition(GenerationMode::Inpaint);
        assert!(drain(&mut rx)
            .iter()
            .all(|n| !matches!(n, Notification::ImageHandedOff { .. })));
    }

    #[tokio::test]
    async fn test_img2img_after_hand_off_uses_init_image() {
        let runtime = Arc::new(FakeRuntime::new());
        let (session, _rx) = session_with(runtime.clone());
        session.generate().await.unwrap();
        session.transition(GenerationMode::Img2Img);
        session.generate().await.unwrap();

        let request = runtime.last_request.lock().unwrap().take().unwrap();
        let conditioning = request.conditioning.unwrap();
        assert_eq!(conditioning.init_image.dimensions(), (64, 64));
        assert_eq!(conditioning.strength, 0.8);
        assert_eq!(session.history().len(), 2);
    }

    #[tokio::test]
    async fn test_strength_defaulted_and_kept() {
        let runtime = Arc::new(FakeRuntime::new());
        let (session, mut rx) = session_with(runtime);

        session.update_params(|p| p.strength = Some(0.3));
        let transition = session.transition(GenerationMode::Upscale);
        assert!(!transition.strength_defaulted);
        assert_eq!(session.params().strength, Some(0.3));
        assert!(drain(&mut rx).is_empty());

        session.update_params(|p| p.strength = None);
        session.transition(GenerationMode::Txt2Img);
        assert!(session.transition(GenerationMode::Img2Img).strength_defaulted);
        assert!(!session.transition(GenerationMode::Inpaint).strength_defaulted);
        let defaulted = drain(&mut rx)
            .iter()
            .filter(|n| matches!(n, Notification::StrengthDefaulted { .. }))
            .count();
        assert_eq!(defaulted, 1);
    }

    #[tokio::test]
    async fn test_inpaint_without_init_image_leaves_state_unchanged() {
        let runtime = Arc::new(FakeRuntime::new());
        let (session, mut rx) = session_with(runtime.clone());
        session.transition(GenerationMode::Inpaint);
        drain(&mut rx);

        let before = session.with_state(|s| {
            (s.current_mode(), s.previous_mode(), s.params().clone(), s.history().len())
        });
        let result = session.generate().await;
        assert!(matches!(result, Err(Error::Configuration(_))));
        let after = session.with_state(|s| {
            (s.current_mode(), s.previous_mode(), s.params().clone(), s.history().len())
        });
        assert_eq!(before, after);
        assert!(session.with_state(|s| s.init_image().is_none()));
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 0);
        assert!(!session.is_generating());
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [Notification::GenerationFailed { .. }]
        ));
    }

    #[tokio::test]
    async fn test_overlapping_request_is_busy() {
        let (release, gate) = std::sync::mpsc::channel();
        let runtime = Arc::new(FakeRuntime {
            gate: Some(Mutex::new(gate)),
            ..FakeRuntime::new()
        });
        let (session, _rx) = session_with(runtime.clone());
        let session = Arc::new(session);

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.generate().await }
        });
        while runtime.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(matches!(session.generate().await, Err(Error::Busy)));
        assert!(session.history().is_empty());

        release.send(()).unwrap();
        assert!(first.await.unwrap().is_ok());
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 1);
        assert!(!session.is_generating());
        assert_eq!(session.history().len(), 1);
    }

    #[tokio::test]
    async fn test_runtime_failure_is_mapped() {
        let runtime = Arc::new(FakeRuntime {
            fail_with: Some("CUDA out of memory".to_string()),
            ..FakeRuntime::new()
        });
        let (session, mut rx) = session_with(runtime);

        match session.generate().await {
            Err(Error::Inference(failure)) => assert_eq!(failure.kind, FailureKind::ResourceExhausted),
            other => panic!("expected inference failure, got {:?}", other),
        }
        assert!(session.history().is_empty());
        let notifications = drain(&mut rx);
        assert_eq!(
            notifications.last(),
            Some(&Notification::GenerationFailed {
                message: "GPU memory is insufficient. Reduce the image size.".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected_before_runtime() {
        let runtime = Arc::new(FakeRuntime::new());
        let (session, _rx) = session_with(runtime.clone());
        session.update_params(|p| p.prompt = "   ".to_string());

        let err = session.generate().await.unwrap_err();
        assert_eq!(err.user_message(), "Enter a prompt.");
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_still_completes() {
        let runtime = Arc::new(FakeRuntime::new());
        let (session, mut rx) = session_with(runtime);
        let session = session.with_store(Arc::new(CountingStore::default()));
        session.update_params(|p| p.batch_size = 2);

        let entry = session.generate().await.unwrap().unwrap();
        assert_eq!(entry.images.len(), 2);
        assert_eq!(entry.artifacts.len(), 1);
        assert!(entry.artifacts[0].metadata.starts_with("Model: fake-sd, Seed: 31337"));
        assert!(drain(&mut rx)
            .iter()
            .any(|n| matches!(n, Notification::PersistenceFailed { .. })));
        assert_eq!(session.with_state(|s| s.last_batch().len()), 2);
    }

    #[tokio::test]
    async fn test_upload_init_image() {
        let runtime = Arc::new(FakeRuntime::new());
        let (session, _rx) = session_with(runtime);

        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(RgbImage::new(16, 8))
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        session.upload_init_image(&bytes).unwrap();
        assert_eq!(
            session.with_state(|s| s.init_image().map(|i| i.dimensions())),
            Some((16, 8))
        );
        assert!(session.upload_init_image(b"nope").is_err());

        session.clear_init_image();
        assert!(session.with_state(|s| s.init_image().is_none()));
    }

    struct PooledOnes;

    impl PooledTextEncoder for PooledOnes {
        fn encode_with_pooled(&self, _text: &str, _clip_skip: u32) -> Result<(Tensor, Tensor)> {
            Ok((
                Tensor::ones((1, 77, 16), DType::F32, &Device::Cpu)?,
                Tensor::ones((1, 16), DType::F32, &Device::Cpu)?,
            ))
        }
    }

    struct FakeDualModel;

    impl TextConditioner for FakeDualModel {
        fn name(&self) -> &str {
            "fake-xl"
        }

        fn text_encoder(&self) -> &dyn TextEncoder {
            &OnesEncoder
        }

        fn text_encoder_2(&self) -> Option<&dyn PooledTextEncoder> {
            Some(&PooledOnes)
        }
    }

    #[tokio::test]
    async fn test_export_history() {
        let runtime = Arc::new(FakeRuntime::new());
        let (session, _rx) = session_with(runtime);
        session.generate().await.unwrap();

        let path = std::env::temp_dir().join(format!("atelier-history-{}.json", std::process::id()));
        session.export_history(&path).unwrap();

        let exported: Vec<HistoryEntry> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].params.prompt, "a tidal pool");
        assert_eq!(exported[0].seed, 31337);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_replace_backend_resets_params() {
        let runtime = Arc::new(FakeRuntime::new());
        let (mut session, _rx) = session_with(runtime.clone());
        assert_eq!(session.architecture(), ModelArchitecture::SingleEncoder);

        session
            .replace_backend(Arc::new(FakeDualModel), runtime.clone())
            .unwrap();
        assert_eq!(session.architecture(), ModelArchitecture::DualEncoder);
        let params = session.params();
        assert_eq!((params.width, params.height, params.steps), (1024, 1024, 28));
        assert_eq!(params.prompt, "a tidal pool");

        session.update_params(|p| p.negative_prompt = String::new());
        session.generate().await.unwrap();
        let request = runtime.last_request.lock().unwrap().take().unwrap();
        assert_eq!(request.prompt_embeds.dims(), &[1, 77, 24]);
        assert!(request.pooled.is_some());
    }
}
