//! GPU context bootstrap built on top of `wgpu`.
//!
//! The counting pipeline treats the GPU as an optional accelerator: when no adapter can be
//! created, callers keep working on the CPU path and report the accelerator as unavailable.

/// Combined bilinear resize + zero padding + mean/norm WGSL compute shader.
pub const PREPROCESS_WGSL: &str = include_str!("preprocess.wgsl");

use std::sync::Arc;

use log::{debug, info, warn};
use pollster::block_on;
use thiserror::Error;
use wgpu::{
    AdapterInfo, Backends, Device, DeviceDescriptor, ExperimentalFeatures, Features, Instance,
    InstanceDescriptor, InstanceFlags, Limits, PowerPreference, Queue, RequestAdapterError,
    RequestAdapterOptions, RequestDeviceError, Trace,
};

/// Configuration for creating a [`GpuContext`].
#[derive(Clone, Debug)]
pub struct GpuContextOptions {
    /// Whether GPU support is enabled.
    pub enabled: bool,
    /// Allow environment variables (e.g. `WGPU_BACKEND`) to override defaults.
    pub respect_env: bool,
    /// Which backends should be considered.
    pub backends: Backends,
    /// Adapter preference (high-performance vs low-power).
    pub power_preference: PowerPreference,
    /// Force wgpu to pick its fallback adapter implementation.
    pub force_fallback_adapter: bool,
    /// Optional debug label for the logical device.
    pub label: Option<String>,
}

impl Default for GpuContextOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            respect_env: true,
            backends: Backends::PRIMARY,
            power_preference: PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            label: Some("P2PNet GPU context".to_string()),
        }
    }
}

impl GpuContextOptions {
    /// Options that never touch the GPU.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Outcome of trying to bring up a GPU context.
#[derive(Debug)]
pub enum GpuAvailability {
    /// GPU resources are ready to use.
    Available(Arc<GpuContext>),
    /// GPU use was turned off by configuration.
    Disabled { reason: String },
    /// Initialization failed; callers stay on the CPU.
    Unavailable { error: GpuInitError },
}

impl GpuAvailability {
    /// Returns `true` when a GPU context was created successfully.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    /// Returns the GPU context when it exists.
    pub fn context(&self) -> Option<&Arc<GpuContext>> {
        match self {
            Self::Available(ctx) => Some(ctx),
            _ => None,
        }
    }
}

/// Device/queue pair plus adapter metadata.
#[derive(Debug)]
pub struct GpuContext {
    device: Device,
    queue: Queue,
    info: AdapterInfo,
}

impl GpuContext {
    /// Initialize a new GPU context with the provided options.
    pub fn initialize(options: &GpuContextOptions) -> Result<Self, GpuInitError> {
        if !options.enabled {
            return Err(GpuInitError::Disabled);
        }

        let mut instance_desc = if options.respect_env {
            InstanceDescriptor::from_env_or_default()
        } else {
            InstanceDescriptor::default()
        };
        let backends = if options.respect_env {
            options.backends.with_env()
        } else {
            options.backends
        };
        instance_desc.backends = backends;
        instance_desc.flags = if options.respect_env {
            InstanceFlags::from_build_config().with_env()
        } else {
            InstanceFlags::from_build_config()
        };

        let instance = Instance::new(&instance_desc);
        let adapter = block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: options.power_preference,
            force_fallback_adapter: options.force_fallback_adapter,
            compatible_surface: None,
        }))
        .map_err(|source| GpuInitError::Adapter { backends, source })?;

        let info = adapter.get_info();
        let limits: Limits = adapter.limits();
        let device_desc = DeviceDescriptor {
            label: options.label.as_deref(),
            required_features: Features::empty(),
            required_limits: limits,
            experimental_features: ExperimentalFeatures::default(),
            memory_hints: Default::default(),
            trace: Trace::default(),
        };
        let (device, queue) =
            block_on(adapter.request_device(&device_desc)).map_err(GpuInitError::from)?;

        info!(
            target: "p2pnet::gpu",
            "Using GPU adapter '{}' ({:?}/{:?})",
            info.name, info.backend, info.device_type
        );

        Ok(Self {
            device,
            queue,
            info,
        })
    }

    /// Attempt to create a GPU context, reporting why the CPU path is used otherwise.
    pub fn init_with_fallback(options: &GpuContextOptions) -> GpuAvailability {
        if !options.enabled {
            return GpuAvailability::Disabled {
                reason: "GPU acceleration disabled via configuration".to_string(),
            };
        }

        match Self::initialize(options) {
            Ok(ctx) => GpuAvailability::Available(Arc::new(ctx)),
            Err(GpuInitError::Disabled) => GpuAvailability::Disabled {
                reason: "GPU acceleration disabled via configuration".to_string(),
            },
            Err(err) => {
                warn!(
                    target: "p2pnet::gpu",
                    "GPU initialization failed ({err}); staying on CPU."
                );
                debug!(target: "p2pnet::gpu", "GPU init error detail: {err:?}");
                GpuAvailability::Unavailable { error: err }
            }
        }
    }

    /// Returns the shared `wgpu::Device`.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Returns the shared `wgpu::Queue`.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Adapter metadata for logging.
    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.info
    }
}

/// Reasons a GPU context could not be created.
#[derive(Debug, Error)]
pub enum GpuInitError {
    #[error("GPU adapter request failed for {backends:?}: {source}")]
    Adapter {
        backends: Backends,
        #[source]
        source: RequestAdapterError,
    },
    #[error("GPU device creation failed: {0}")]
    Device(#[from] RequestDeviceError),
    #[error("GPU acceleration disabled")]
    Disabled,
}
