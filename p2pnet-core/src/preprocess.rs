//! Preprocessing: aspect-preserving resize, stride-aligned padding and normalization.
//!
//! The longer image side is resized to `target_size`, then both sides are padded up to a
//! multiple of `alignment` with the image centered on the canvas. The returned [`ResizePlan`]
//! carries the scale and padding needed to map network output back onto the source image.

use std::{
    borrow::Cow,
    path::Path,
    sync::{Arc, Mutex, mpsc},
};

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable, bytes_of};
use image::{DynamicImage, GenericImageView, RgbImage, imageops::FilterType};
use p2pnet_utils::gpu::{GpuContext, PREPROCESS_WGSL};
use p2pnet_utils::telemetry::timing_guard;
use p2pnet_utils::{
    config::{InputSettings, ResizeQuality},
    load_image, pad_rgb, resize_image, rgb_to_normalized_chw,
};
use tract_onnx::prelude::Tensor;

use crate::error::CountError;

/// Geometry and normalization applied before inference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreprocessConfig {
    /// The longer side of the image is resized to this length.
    pub target_size: u32,
    /// Padded width and height are multiples of this value.
    pub alignment: u32,
    /// Per-channel mean (R, G, B).
    pub mean: [f32; 3],
    /// Per-channel multiplier (R, G, B).
    pub norm: [f32; 3],
    /// Resize filter preference.
    pub resize_quality: ResizeQuality,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        InputSettings::default().into()
    }
}

impl PreprocessConfig {
    fn resize_filter(&self) -> FilterType {
        match self.resize_quality {
            ResizeQuality::Quality => FilterType::Triangle,
            ResizeQuality::Speed => FilterType::Nearest,
        }
    }
}

impl From<InputSettings> for PreprocessConfig {
    fn from(settings: InputSettings) -> Self {
        let InputSettings {
            target_size,
            alignment,
            mean,
            norm,
            resize_quality,
        } = settings;
        Self {
            target_size,
            alignment,
            mean,
            norm,
            resize_quality,
        }
    }
}

impl From<&InputSettings> for PreprocessConfig {
    fn from(settings: &InputSettings) -> Self {
        (*settings).into()
    }
}

/// How a source image maps onto the padded network input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResizePlan {
    /// Source image size.
    pub original: (u32, u32),
    /// Size after the aspect-preserving resize.
    pub resized: (u32, u32),
    /// Uniform scale from source to resized pixels.
    pub scale: f32,
    /// Total horizontal padding.
    pub wpad: u32,
    /// Total vertical padding.
    pub hpad: u32,
}

impl ResizePlan {
    /// Size of the padded network input.
    pub fn padded_size(&self) -> (u32, u32) {
        (self.resized.0 + self.wpad, self.resized.1 + self.hpad)
    }

    /// Columns added on the left.
    pub fn left(&self) -> u32 {
        self.wpad / 2
    }

    /// Rows added on top.
    pub fn top(&self) -> u32 {
        self.hpad / 2
    }

    /// Map a padded-input coordinate back to source pixels (no rounding, no clamping).
    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.left() as f32) / self.scale,
            (y - self.top() as f32) / self.scale,
        )
    }

    /// Map a source coordinate onto the padded input.
    pub fn to_padded(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.left() as f32 + self.scale * x,
            self.top() as f32 + self.scale * y,
        )
    }
}

/// Compute the resize and padding for a `width x height` source image.
pub fn plan_resize(
    width: u32,
    height: u32,
    config: &PreprocessConfig,
) -> Result<ResizePlan, CountError> {
    if width == 0 || height == 0 {
        return Err(CountError::InvalidDimension(format!(
            "source image must be non-empty, got {width}x{height}"
        )));
    }
    if config.target_size == 0 || config.alignment == 0 {
        return Err(CountError::InvalidDimension(format!(
            "target size and alignment must be non-zero, got {} and {}",
            config.target_size, config.alignment
        )));
    }

    let target = config.target_size;
    let (scale, resized) = if width > height {
        let scale = target as f32 / width as f32;
        (scale, (target, scaled_side(height, scale)))
    } else {
        let scale = target as f32 / height as f32;
        (scale, (scaled_side(width, scale), target))
    };

    let wpad = resized.0.div_ceil(config.alignment) * config.alignment - resized.0;
    let hpad = resized.1.div_ceil(config.alignment) * config.alignment - resized.1;

    Ok(ResizePlan {
        original: (width, height),
        resized,
        scale,
        wpad,
        hpad,
    })
}

fn scaled_side(side: u32, scale: f32) -> u32 {
    ((side as f32 * scale).round() as u32).max(1)
}

/// Output of preprocessing: the `[1, 3, H, W]` RGB tensor plus the geometry used to build it.
#[derive(Debug)]
pub struct PreprocessOutput {
    /// Normalized, padded input tensor.
    pub tensor: Tensor,
    /// Resize and padding applied to the source image.
    pub plan: ResizePlan,
}

/// Abstraction over preprocessing backends (CPU, GPU).
pub trait Preprocessor: Send + Sync + std::fmt::Debug {
    /// Convert the image into a padded, normalized network input.
    fn preprocess(&self, image: &DynamicImage, config: &PreprocessConfig)
    -> Result<PreprocessOutput>;
}

/// Load an image from disk and preprocess it on the CPU.
pub fn preprocess_image<P: AsRef<Path>>(
    path: P,
    config: &PreprocessConfig,
) -> Result<PreprocessOutput> {
    let path_ref = path.as_ref();
    let image = load_image(path_ref)
        .with_context(|| format!("failed to load image from {}", path_ref.display()))?;
    CpuPreprocessor.preprocess(&image, config)
}

/// CPU implementation backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuPreprocessor;

impl Preprocessor for CpuPreprocessor {
    fn preprocess(
        &self,
        image: &DynamicImage,
        config: &PreprocessConfig,
    ) -> Result<PreprocessOutput> {
        cpu_preprocess(image, config)
    }
}

fn cpu_preprocess(image: &DynamicImage, config: &PreprocessConfig) -> Result<PreprocessOutput> {
    let _guard = timing_guard("p2pnet_core::cpu_preprocess", log::Level::Trace);
    let (orig_w, orig_h) = image.dimensions();
    let plan = plan_resize(orig_w, orig_h, config)?;
    let (resized_w, resized_h) = plan.resized;

    let resized: Cow<'_, RgbImage> = if (orig_w, orig_h) == plan.resized {
        match image.as_rgb8() {
            Some(rgb) => Cow::Borrowed(rgb),
            None => Cow::Owned(image.to_rgb8()),
        }
    } else {
        Cow::Owned(resize_image(
            image,
            resized_w,
            resized_h,
            config.resize_filter(),
        ))
    };

    let (padded_w, padded_h) = plan.padded_size();
    let padded: Cow<'_, RgbImage> = if plan.wpad == 0 && plan.hpad == 0 {
        resized
    } else {
        Cow::Owned(pad_rgb(
            &resized,
            padded_w,
            padded_h,
            plan.left(),
            plan.top(),
        ))
    };

    let chw = rgb_to_normalized_chw(&padded, config.mean, config.norm);
    let shape = [1usize, 3, padded_h as usize, padded_w as usize];
    let (data, offset) = chw.into_raw_vec_and_offset();
    debug_assert_eq!(offset, Some(0), "expected contiguous array");
    let tensor = Tensor::from_shape(&shape, &data)
        .map_err(|e| anyhow::anyhow!("failed to build input tensor: {e}"))?;

    Ok(PreprocessOutput { tensor, plan })
}

/// GPU preprocessor: one compute pass does the bilinear resize, padding and normalization.
#[derive(Clone)]
pub struct WgpuPreprocessor {
    context: Arc<GpuContext>,
    pipeline: Arc<WgpuPreprocessPipeline>,
    pool: Arc<Mutex<GpuResourcePool>>,
}

impl std::fmt::Debug for WgpuPreprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuPreprocessor")
            .field("adapter", self.context.adapter_info())
            .finish()
    }
}

impl WgpuPreprocessor {
    /// Create a GPU preprocessor from an existing `GpuContext`.
    pub fn new(context: Arc<GpuContext>) -> Result<Self> {
        let pipeline = WgpuPreprocessPipeline::new(context.device())?;
        Ok(Self {
            context,
            pipeline: Arc::new(pipeline),
            pool: Arc::new(Mutex::new(GpuResourcePool::default())),
        })
    }
}

impl Preprocessor for WgpuPreprocessor {
    fn preprocess(
        &self,
        image: &DynamicImage,
        config: &PreprocessConfig,
    ) -> Result<PreprocessOutput> {
        gpu_preprocess(
            image,
            config,
            self.context.as_ref(),
            &self.pipeline,
            self.pool.as_ref(),
        )
    }
}

struct WgpuPreprocessPipeline {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
    sampler: wgpu::Sampler,
}

impl WgpuPreprocessPipeline {
    fn new(device: &wgpu::Device) -> Result<Self> {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("p2pnet_preprocess_shader"),
            source: wgpu::ShaderSource::Wgsl(PREPROCESS_WGSL.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("p2pnet_preprocess_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("p2pnet_preprocess_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("p2pnet_preprocess_pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("p2pnet_preprocess_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Ok(Self {
            bind_group_layout,
            pipeline,
            sampler,
        })
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PreprocessUniforms {
    src_size: [u32; 2],
    resized_size: [u32; 2],
    padded_size: [u32; 2],
    offset: [u32; 2],
    mean: [f32; 4],
    norm: [f32; 4],
}

const UNIFORM_BUFFER_SIZE: u64 = std::mem::size_of::<PreprocessUniforms>() as u64;

#[derive(Default)]
struct GpuResourcePool {
    idle: Vec<GpuWorkBuffers>,
}

impl GpuResourcePool {
    fn acquire(
        &mut self,
        device: &wgpu::Device,
        extent: wgpu::Extent3d,
        output_bytes: u64,
    ) -> GpuWorkBuffers {
        if let Some(mut buffers) = self.idle.pop() {
            buffers.ensure_texture(device, extent);
            buffers.ensure_output_buffers(device, output_bytes);
            buffers
        } else {
            GpuWorkBuffers::new(device, extent, output_bytes)
        }
    }

    fn recycle(&mut self, buffers: GpuWorkBuffers) {
        self.idle.push(buffers);
    }
}

struct GpuWorkBuffers {
    texture: wgpu::Texture,
    extent: wgpu::Extent3d,
    storage: wgpu::Buffer,
    storage_size: u64,
    readback: wgpu::Buffer,
    readback_size: u64,
    uniform: wgpu::Buffer,
    staging: Vec<u8>,
}

impl GpuWorkBuffers {
    fn new(device: &wgpu::Device, extent: wgpu::Extent3d, output_bytes: u64) -> Self {
        Self {
            texture: create_input_texture(device, extent),
            extent,
            storage: create_storage_buffer(device, output_bytes),
            storage_size: output_bytes,
            readback: create_readback_buffer(device, output_bytes),
            readback_size: output_bytes,
            uniform: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("p2pnet_preprocess_uniforms"),
                size: UNIFORM_BUFFER_SIZE,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            staging: Vec::new(),
        }
    }

    fn ensure_texture(&mut self, device: &wgpu::Device, extent: wgpu::Extent3d) {
        if self.extent != extent {
            self.texture = create_input_texture(device, extent);
            self.extent = extent;
        }
    }

    fn ensure_output_buffers(&mut self, device: &wgpu::Device, size: u64) {
        if self.storage_size < size {
            self.storage = create_storage_buffer(device, size);
            self.storage_size = size;
        }
        if self.readback_size < size {
            self.readback = create_readback_buffer(device, size);
            self.readback_size = size;
        }
    }

    /// Rows uploaded to a texture must be padded to `COPY_BYTES_PER_ROW_ALIGNMENT`.
    fn prepare_upload<'a>(&'a mut self, data: &'a [u8], width: u32) -> (&'a [u8], u32) {
        let bytes_per_row = 4 * width as usize;
        let aligned = bytes_per_row.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize);
        if aligned == bytes_per_row {
            return (data, bytes_per_row as u32);
        }

        let rows = data.len() / bytes_per_row;
        self.staging.resize(aligned * rows, 0);
        for row in 0..rows {
            let src_start = row * bytes_per_row;
            let dst_start = row * aligned;
            self.staging[dst_start..dst_start + bytes_per_row]
                .copy_from_slice(&data[src_start..src_start + bytes_per_row]);
        }
        (self.staging.as_slice(), aligned as u32)
    }
}

fn create_input_texture(device: &wgpu::Device, extent: wgpu::Extent3d) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some("p2pnet_preprocess_input_texture"),
        size: extent,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    })
}

fn create_storage_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("p2pnet_preprocess_output_storage"),
        size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    })
}

fn create_readback_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("p2pnet_preprocess_readback"),
        size,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    })
}

/// Describes why a job cannot run on a device with `limits`, if it cannot.
fn device_limit_violation(
    (width, height): (u32, u32),
    output_bytes: u64,
    limits: &wgpu::Limits,
) -> Option<String> {
    let max_dim = limits.max_texture_dimension_2d;
    if width > max_dim || height > max_dim {
        return Some(format!("{width}x{height} source exceeds the {max_dim}px texture limit"));
    }
    let max_output = limits
        .max_buffer_size
        .min(u64::from(limits.max_storage_buffer_binding_size));
    if output_bytes > max_output {
        return Some(format!(
            "{output_bytes}-byte input tensor exceeds the {max_output}-byte storage limit"
        ));
    }
    None
}

fn gpu_preprocess(
    image: &DynamicImage,
    config: &PreprocessConfig,
    context: &GpuContext,
    pipeline: &WgpuPreprocessPipeline,
    pool: &Mutex<GpuResourcePool>,
) -> Result<PreprocessOutput> {
    let _guard = timing_guard("p2pnet_core::gpu_preprocess", log::Level::Trace);
    let (orig_w, orig_h) = image.dimensions();
    let plan = plan_resize(orig_w, orig_h, config)?;
    let (padded_w, padded_h) = plan.padded_size();

    let rgba = image.to_rgba8();
    let device = context.device();
    let queue = context.queue();

    let src_size = wgpu::Extent3d {
        width: orig_w,
        height: orig_h,
        depth_or_array_layers: 1,
    };
    let output_f32_len = padded_w as usize * padded_h as usize * 3;
    let output_size_bytes = (output_f32_len * std::mem::size_of::<f32>()) as u64;

    if let Some(reason) =
        device_limit_violation((orig_w, orig_h), output_size_bytes, &device.limits())
    {
        log::debug!("{reason}; preprocessing on the CPU");
        return cpu_preprocess(image, config);
    }

    let mut buffers = pool
        .lock()
        .map_err(|_| anyhow::anyhow!("GPU resource pool poisoned"))?
        .acquire(device, src_size, output_size_bytes);

    let texture_view = buffers
        .texture
        .create_view(&wgpu::TextureViewDescriptor::default());
    let texture_handle = buffers.texture.clone();
    let storage_buffer = buffers.storage.clone();
    let readback_buffer = buffers.readback.clone();
    let uniform_buffer = buffers.uniform.clone();

    let (input_bytes, bytes_per_row) = buffers.prepare_upload(rgba.as_raw(), orig_w);
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &texture_handle,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        input_bytes,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(bytes_per_row),
            rows_per_image: Some(orig_h),
        },
        src_size,
    );

    let [mean_r, mean_g, mean_b] = config.mean;
    let [norm_r, norm_g, norm_b] = config.norm;
    let uniforms = PreprocessUniforms {
        src_size: [orig_w, orig_h],
        resized_size: [plan.resized.0, plan.resized.1],
        padded_size: [padded_w, padded_h],
        offset: [plan.left(), plan.top()],
        mean: [mean_r, mean_g, mean_b, 0.0],
        norm: [norm_r, norm_g, norm_b, 0.0],
    };
    queue.write_buffer(&uniform_buffer, 0, bytes_of(&uniforms));

    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("p2pnet_preprocess_bind_group"),
        layout: &pipeline.bind_group_layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&texture_view),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::Sampler(&pipeline.sampler),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: storage_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: uniform_buffer.as_entire_binding(),
            },
        ],
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("p2pnet_preprocess_encoder"),
    });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("p2pnet_preprocess_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(padded_w.div_ceil(8), padded_h.div_ceil(8), 1);
    }
    encoder.copy_buffer_to_buffer(&storage_buffer, 0, &readback_buffer, 0, output_size_bytes);
    queue.submit(std::iter::once(encoder.finish()));

    let buffer_slice = readback_buffer.slice(..output_size_bytes);
    let (sender, receiver) = mpsc::channel();
    buffer_slice.map_async(wgpu::MapMode::Read, move |res| {
        let _ = sender.send(res);
    });
    device
        .poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        })
        .map_err(|e| anyhow::anyhow!("device poll failed during preprocessing: {e}"))?;
    receiver
        .recv()
        .map_err(|_| anyhow::anyhow!("GPU map callback was dropped"))?
        .map_err(|e| anyhow::anyhow!("failed to map GPU preprocessing buffer: {e}"))?;
    let mapped = buffer_slice.get_mapped_range();
    let floats: Vec<f32> = bytemuck::cast_slice(&mapped).to_vec();
    drop(mapped);
    readback_buffer.unmap();

    pool.lock()
        .map_err(|_| anyhow::anyhow!("GPU resource pool poisoned"))?
        .recycle(buffers);

    anyhow::ensure!(
        floats.len() == output_f32_len,
        "unexpected GPU output size (expected {}, got {})",
        output_f32_len,
        floats.len()
    );

    let shape = [1usize, 3, padded_h as usize, padded_w as usize];
    let tensor = Tensor::from_shape(&shape, &floats)
        .map_err(|e| anyhow::anyhow!("failed to build input tensor: {e}"))?;

    Ok(PreprocessOutput { tensor, plan })
}
