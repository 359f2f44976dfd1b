use std::{
    path::Path,
    sync::{Arc, Mutex, OnceLock},
};

use image::DynamicImage;
use log::{debug, info, warn};
use p2pnet_utils::{GpuContext, config::AppSettings, load_image, timing_guard};

use crate::anchors::AnchorConfig;
use crate::error::{CountError, Result};
use crate::frame::PixelBuffer;
use crate::model::{InferenceBackend, ModelSource, P2PNetModel};
use crate::postprocess::{CrowdPoint, PostprocessConfig, decode_predictions, prediction_rows};
use crate::preprocess::{
    CpuPreprocessor, PreprocessConfig, Preprocessor, ResizePlan, WgpuPreprocessor,
};

/// Everything the pipeline needs besides the network itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineConfig {
    pub preprocess: PreprocessConfig,
    pub anchors: AnchorConfig,
    pub postprocess: PostprocessConfig,
}

impl From<&AppSettings> for PipelineConfig {
    fn from(settings: &AppSettings) -> Self {
        Self {
            preprocess: (&settings.input).into(),
            anchors: (&settings.anchors).into(),
            postprocess: (&settings.detection).into(),
        }
    }
}

/// Result of counting one image.
#[derive(Debug, Clone)]
pub struct CrowdOutput {
    /// Detected heads in source-image pixels, in anchor order.
    pub points: Vec<CrowdPoint>,
    /// Geometry used to map network output back to the source image.
    pub plan: ResizePlan,
    /// Number of anchors evaluated.
    pub anchor_count: usize,
}

impl CrowdOutput {
    /// Estimated head count.
    pub fn count(&self) -> usize {
        self.points.len()
    }
}

/// Run preprocessing, anchor generation, inference and decoding for one image.
///
/// Fails without partial output; an image with no confident predictions yields an empty
/// point list, not an error.
pub fn detect_crowd(
    backend: &dyn InferenceBackend,
    preprocessor: &dyn Preprocessor,
    image: &DynamicImage,
    config: &PipelineConfig,
) -> Result<CrowdOutput> {
    let _guard = timing_guard("p2pnet_core::detect_crowd", log::Level::Debug);

    let prep = {
        let _guard = timing_guard("p2pnet_core::preprocess", log::Level::Debug);
        preprocessor
            .preprocess(image, &config.preprocess)
            .map_err(|err| match err.downcast::<CountError>() {
                Ok(count_err) => count_err,
                Err(other) => CountError::Preprocessing(other),
            })?
    };
    let plan = prep.plan;
    let (padded_w, padded_h) = plan.padded_size();

    let anchors = {
        let _guard = timing_guard("p2pnet_core::anchors", log::Level::Trace);
        config.anchors.generate(padded_w, padded_h)?
    };

    let raw = {
        let _guard = timing_guard("p2pnet_core::inference", log::Level::Debug);
        backend
            .infer(prep.tensor, &anchors)
            .map_err(CountError::InferenceFailure)?
    };

    let rows = prediction_rows(&raw.scores).map_err(CountError::InferenceFailure)?;
    if rows != anchors.len() {
        return Err(CountError::InferenceFailure(anyhow::anyhow!(
            "network returned {rows} predictions for {} anchors ({padded_w}x{padded_h} input)",
            anchors.len()
        )));
    }

    let points = {
        let _guard = timing_guard("p2pnet_core::postprocess", log::Level::Debug);
        decode_predictions(&raw, &plan, &config.postprocess)
            .map_err(CountError::InferenceFailure)?
    };
    debug!(
        "counted {} heads in {}x{} image ({} anchors)",
        points.len(),
        plan.original.0,
        plan.original.1,
        anchors.len()
    );

    Ok(CrowdOutput {
        points,
        plan,
        anchor_count: anchors.len(),
    })
}

/// Owned counting context: the loaded network, pipeline settings and an optional accelerator.
///
/// The network is loaded at most once. Detection calls borrow the context immutably, so one
/// counter can be shared across threads.
pub struct CrowdCounter {
    backend: OnceLock<Arc<dyn InferenceBackend>>,
    init_lock: Mutex<()>,
    config: PipelineConfig,
    cpu: CpuPreprocessor,
    accelerator: Option<Arc<dyn Preprocessor>>,
}

impl std::fmt::Debug for CrowdCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrowdCounter")
            .field("ready", &self.is_ready())
            .field("config", &self.config)
            .field("accelerator", &self.accelerator)
            .finish()
    }
}

impl CrowdCounter {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            backend: OnceLock::new(),
            init_lock: Mutex::new(()),
            config,
            cpu: CpuPreprocessor,
            accelerator: None,
        }
    }

    /// Attach a preprocessor used when callers request acceleration.
    pub fn with_accelerator(mut self, accelerator: Arc<dyn Preprocessor>) -> Self {
        self.accelerator = Some(accelerator);
        self
    }

    /// Build a counter from settings, attaching the GPU preprocessor when it is enabled and
    /// a device is available. GPU problems only disable acceleration.
    pub fn from_settings(settings: &AppSettings) -> Self {
        let counter = Self::new(PipelineConfig::from(settings));
        if !(settings.gpu.enabled && settings.gpu.preprocessing) {
            return counter;
        }

        let availability = GpuContext::init_with_fallback(&(&settings.gpu).into());
        let Some(context) = availability.context() else {
            info!("GPU preprocessing unavailable; using CPU only");
            return counter;
        };
        match WgpuPreprocessor::new(Arc::clone(context)) {
            Ok(preprocessor) => {
                info!("GPU preprocessing enabled on {}", context.adapter_info().name);
                counter.with_accelerator(Arc::new(preprocessor))
            }
            Err(err) => {
                warn!("failed to build GPU preprocessor: {err:#}");
                counter
            }
        }
    }

    /// Load the P2PNet graph. A no-op once the counter is ready.
    pub fn initialize(&self, source: &ModelSource) -> Result<()> {
        self.initialize_with(|| {
            let model = P2PNetModel::load(source)?;
            Ok(Arc::new(model) as Arc<dyn InferenceBackend>)
        })
    }

    /// Install a backend produced by `loader`.
    ///
    /// Concurrent callers are serialized; only the first runs its loader. A failed load leaves
    /// the counter uninitialized so a later call may retry.
    pub fn initialize_with<F>(&self, loader: F) -> Result<()>
    where
        F: FnOnce() -> anyhow::Result<Arc<dyn InferenceBackend>>,
    {
        if self.backend.get().is_some() {
            return Ok(());
        }
        let _lock = self.init_lock.lock().map_err(|_| {
            CountError::Initialization(anyhow::anyhow!("initialization lock poisoned"))
        })?;
        if self.backend.get().is_some() {
            return Ok(());
        }

        let _guard = timing_guard("p2pnet_core::initialize", log::Level::Info);
        let backend = loader().map_err(CountError::Initialization)?;
        debug!("counting backend ready: {backend:?}");
        let _ = self.backend.set(backend);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.backend.get().is_some()
    }

    pub fn has_accelerator(&self) -> bool {
        self.accelerator.is_some()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Count heads in a host pixel buffer.
    pub fn detect(&self, frame: &PixelBuffer<'_>, use_accelerator: bool) -> Result<CrowdOutput> {
        let preprocessor = self.select_preprocessor(use_accelerator)?;
        frame.validate()?;
        let backend = self.backend()?;
        let image = frame.to_dynamic_image()?;
        detect_crowd(backend, preprocessor, &image, &self.config)
    }

    /// Host-facing variant of [`CrowdCounter::detect`]: failures are logged and reported as `None`.
    pub fn detect_or_none(
        &self,
        frame: &PixelBuffer<'_>,
        use_accelerator: bool,
    ) -> Option<Vec<CrowdPoint>> {
        match self.detect(frame, use_accelerator) {
            Ok(output) => Some(output.points),
            Err(err) => {
                warn!("crowd detection failed: {err}");
                None
            }
        }
    }

    /// Count heads in a decoded image on the CPU path.
    pub fn detect_image(&self, image: &DynamicImage) -> Result<CrowdOutput> {
        let backend = self.backend()?;
        detect_crowd(backend, &self.cpu, image, &self.config)
    }

    /// Count heads in a decoded image, preferring the accelerator when one is attached.
    pub fn detect_image_accelerated(&self, image: &DynamicImage) -> Result<CrowdOutput> {
        let backend = self.backend()?;
        let preprocessor = self.select_preprocessor(self.has_accelerator())?;
        detect_crowd(backend, preprocessor, image, &self.config)
    }

    /// Load an image file and count heads in it on the CPU path.
    pub fn detect_path<P: AsRef<Path>>(&self, path: P) -> Result<CrowdOutput> {
        let _guard = timing_guard("p2pnet_core::detect_path", log::Level::Debug);
        let image = load_image(path.as_ref()).map_err(CountError::ImageLoad)?;
        self.detect_image(&image)
    }

    fn backend(&self) -> Result<&dyn InferenceBackend> {
        self.backend
            .get()
            .map(|backend| backend.as_ref())
            .ok_or(CountError::NotInitialized)
    }

    fn select_preprocessor(&self, use_accelerator: bool) -> Result<&dyn Preprocessor> {
        if !use_accelerator {
            return Ok(&self.cpu);
        }
        self.accelerator
            .as_deref()
            .ok_or(CountError::AcceleratorUnavailable)
    }
}
