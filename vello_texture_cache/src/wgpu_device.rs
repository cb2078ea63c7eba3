// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A [`Device`] backed by [`wgpu`].

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use wgpu::{
    CommandEncoder, CommandEncoderDescriptor, PipelineCompilationOptions, TextureFormat,
    TextureUsages, TextureView,
};

use crate::bitmap::Pixmap;
use crate::device::{Device, DeviceError};
use crate::format::{FormatSupport, PixelFormat};
use crate::invalidation::ContextId;
use crate::key::Filter;
use crate::proxy::{BackingFit, Mipmapped, TextureDescriptor, TextureProxy};

impl PixelFormat {
    /// The wgpu format textures of this format are created in, if any.
    pub fn to_wgpu(self) -> Option<TextureFormat> {
        match self {
            Self::Rgba8 => Some(TextureFormat::Rgba8Unorm),
            Self::Bgra8 => Some(TextureFormat::Bgra8Unorm),
            // Single channel formats would sample into red, and the packed formats have no
            // portable wgpu equivalent.
            Self::Alpha8 | Self::Gray8 | Self::Rgb565 | Self::Rgba4444 | Self::RgbaF32 => None,
        }
    }
}

/// A texture created by a [`WgpuDevice`].
#[derive(Debug)]
pub struct WgpuTexture {
    pub texture: wgpu::Texture,
    /// A view of every mip level.
    pub view: TextureView,
}

/// Creates textures on a wgpu device, and fills mip chains by repeatedly blitting each level
/// into the next with a linear filter.
pub struct WgpuDevice {
    context: ContextId,
    device: wgpu::Device,
    queue: wgpu::Queue,
    module: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    linear_sampler: wgpu::Sampler,
    nearest_sampler: wgpu::Sampler,
    /// Blit pipelines, keyed by the format they render to.
    pipelines: Mutex<HashMap<TextureFormat, wgpu::RenderPipeline>>,
}

impl WgpuDevice {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        const SHADERS: &str = r#"
            struct VertexOutput {
                @builtin(position) position: vec4<f32>,
                @location(0) uv: vec2<f32>,
            }

            @vertex
            fn vs_main(@builtin(vertex_index) ix: u32) -> VertexOutput {
                // A single triangle covering the whole target
                let uv = vec2(f32((ix << 1u) & 2u), f32(ix & 2u));
                var out: VertexOutput;
                out.position = vec4(uv * vec2(2.0, -2.0) + vec2(-1.0, 1.0), 0.0, 1.0);
                out.uv = uv;
                return out;
            }

            @group(0) @binding(0)
            var source: texture_2d<f32>;
            @group(0) @binding(1)
            var source_sampler: sampler;

            @fragment
            fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
                return textureSample(source, source_sampler, in.uv);
            }
        "#;
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("texture cache blit shaders"),
            source: wgpu::ShaderSource::Wgsl(SHADERS.into()),
        });
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: None,
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: None,
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let sampler = |filter| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: None,
                mag_filter: filter,
                min_filter: filter,
                mipmap_filter: wgpu::FilterMode::Nearest,
                ..Default::default()
            })
        };
        let linear_sampler = sampler(wgpu::FilterMode::Linear);
        let nearest_sampler = sampler(wgpu::FilterMode::Nearest);
        Self {
            context: ContextId::next(),
            device,
            queue,
            module,
            bind_group_layout,
            pipeline_layout,
            linear_sampler,
            nearest_sampler,
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn create_pipeline(&self, format: TextureFormat) -> wgpu::RenderPipeline {
        self.device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("vello_texture_cache.blit"),
                layout: Some(&self.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &self.module,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &self.module,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
    }

    /// Run `f`, turning any validation or out of memory error it causes into a [`DeviceError`].
    fn scoped<R>(&self, f: impl FnOnce() -> R) -> Result<R, DeviceError> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let result = f();
        // We know that the only async here (`pop_error_scope`) is actually sync, so blocking is fine
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        match validation.or(out_of_memory) {
            Some(err) => Err(err.into()),
            None => Ok(result),
        }
    }

    fn validate(&self, desc: &TextureDescriptor) -> Result<TextureFormat, DeviceError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(DeviceError::Empty);
        }
        let max = self.device.limits().max_texture_dimension_2d;
        let width = desc.fit.backing_dimension(desc.width);
        let height = desc.fit.backing_dimension(desc.height);
        if width > max || height > max {
            return Err(DeviceError::TooLarge {
                width: desc.width,
                height: desc.height,
                max,
            });
        }
        desc.format
            .to_wgpu()
            .ok_or(DeviceError::UnsupportedFormat(desc.format))
    }

    fn allocate(&self, desc: &TextureDescriptor, format: TextureFormat) -> WgpuTexture {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("vello_texture_cache.texture"),
            size: backing_extent(desc),
            mip_level_count: desc.mip_level_count(),
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            usage: TextureUsages::TEXTURE_BINDING
                | TextureUsages::COPY_DST
                | TextureUsages::COPY_SRC
                | TextureUsages::RENDER_ATTACHMENT,
            format,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        WgpuTexture { texture, view }
    }

    fn level_view(texture: &wgpu::Texture, level: u32) -> TextureView {
        texture.create_view(&wgpu::TextureViewDescriptor {
            label: None,
            base_mip_level: level,
            mip_level_count: Some(1),
            ..Default::default()
        })
    }

    /// Draw `src` stretched over all of `dst`.
    fn blit(
        &self,
        encoder: &mut CommandEncoder,
        pipeline: &wgpu::RenderPipeline,
        src: &TextureView,
        dst: &TextureView,
        sampler: &wgpu::Sampler,
    ) {
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(src),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ],
        });
        let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: None,
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: dst,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        rpass.set_pipeline(pipeline);
        rpass.set_bind_group(0, &bind_group, &[]);
        rpass.draw(0..3, 0..1);
    }

    /// Fill levels `1..` of `texture` from its base level.
    fn generate_mips(&self, encoder: &mut CommandEncoder, texture: &wgpu::Texture) {
        let levels = texture.mip_level_count();
        if levels < 2 {
            return;
        }
        let mut pipelines = self.pipelines.lock().unwrap_or_else(PoisonError::into_inner);
        let format = texture.format();
        let pipeline = pipelines
            .entry(format)
            .or_insert_with(|| self.create_pipeline(format));
        let mut src = Self::level_view(texture, 0);
        for level in 1..levels {
            let dst = Self::level_view(texture, level);
            self.blit(encoder, pipeline, &src, &dst, &self.linear_sampler);
            src = dst;
        }
    }

    fn encoder(&self, label: &'static str) -> CommandEncoder {
        self.device
            .create_command_encoder(&CommandEncoderDescriptor { label: Some(label) })
    }
}

impl FormatSupport for WgpuDevice {
    fn supports_sampling(&self, format: PixelFormat) -> bool {
        format.to_wgpu().is_some()
    }
}

impl Device for WgpuDevice {
    type Texture = WgpuTexture;

    fn context_id(&self) -> ContextId {
        self.context
    }

    fn create_texture(
        &self,
        desc: &TextureDescriptor,
        pixels: &Pixmap,
    ) -> Result<(WgpuTexture, Mipmapped), DeviceError> {
        let format = self.validate(desc)?;
        if pixels.info().format != desc.format {
            return Err(DeviceError::UnsupportedFormat(pixels.info().format));
        }
        self.scoped(|| {
            let texture = self.allocate(desc, format);
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &texture.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                pixels.bytes(),
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(pixels.row_bytes() as u32),
                    rows_per_image: None,
                },
                wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: 1,
                },
            );
            let mut encoder = self.encoder("vello_texture_cache.upload");
            self.generate_mips(&mut encoder, &texture.texture);
            self.queue.submit(Some(encoder.finish()));
            (texture, desc.mipmapped)
        })
    }

    fn copy_base_and_generate_mips(
        &self,
        src: &TextureProxy<WgpuTexture>,
        desc: &TextureDescriptor,
    ) -> Result<WgpuTexture, DeviceError> {
        let format = self.validate(desc)?;
        self.scoped(|| {
            let texture = self.allocate(desc, format);
            let mut encoder = self.encoder("vello_texture_cache.promote");
            encoder.copy_texture_to_texture(
                src.texture().texture.as_image_copy(),
                texture.texture.as_image_copy(),
                logical_extent(desc),
            );
            self.generate_mips(&mut encoder, &texture.texture);
            self.queue.submit(Some(encoder.finish()));
            texture
        })
    }

    fn copy_for_params(
        &self,
        src: &TextureProxy<WgpuTexture>,
        desc: &TextureDescriptor,
        filter: Filter,
    ) -> Result<WgpuTexture, DeviceError> {
        let format = self.validate(desc)?;
        let sampler = match filter {
            Filter::Nearest => &self.nearest_sampler,
            Filter::Bilinear | Filter::MipMap => &self.linear_sampler,
        };
        self.scoped(|| {
            let texture = self.allocate(desc, format);
            let mut encoder = self.encoder("vello_texture_cache.copy");
            let src_desc = src.descriptor();
            let src_texture = &src.texture().texture;
            // The blit samples the whole view, so padding has to be cut off first.
            let unpadded = is_padded(src_desc).then(|| {
                let exact = TextureDescriptor {
                    mipmapped: Mipmapped::No,
                    fit: BackingFit::Exact,
                    ..*src_desc
                };
                let unpadded = self.allocate(&exact, src_texture.format());
                encoder.copy_texture_to_texture(
                    src_texture.as_image_copy(),
                    unpadded.texture.as_image_copy(),
                    logical_extent(src_desc),
                );
                unpadded
            });
            {
                let mut pipelines = self.pipelines.lock().unwrap_or_else(PoisonError::into_inner);
                let pipeline = pipelines
                    .entry(format)
                    .or_insert_with(|| self.create_pipeline(format));
                let src_view = match &unpadded {
                    Some(unpadded) => Self::level_view(&unpadded.texture, 0),
                    None => Self::level_view(src_texture, 0),
                };
                let dst_view = Self::level_view(&texture.texture, 0);
                self.blit(&mut encoder, pipeline, &src_view, &dst_view, sampler);
            }
            self.generate_mips(&mut encoder, &texture.texture);
            self.queue.submit(Some(encoder.finish()));
            texture
        })
    }
}

/// The size of the texture allocated for `desc`.
fn backing_extent(desc: &TextureDescriptor) -> wgpu::Extent3d {
    // Mips are blitted from the whole of the previous level, so those are never padded.
    let fit = match desc.mipmapped {
        Mipmapped::Yes => BackingFit::Exact,
        Mipmapped::No => desc.fit,
    };
    wgpu::Extent3d {
        width: fit.backing_dimension(desc.width),
        height: fit.backing_dimension(desc.height),
        depth_or_array_layers: 1,
    }
}

/// The size of the pixels a texture for `desc` holds.
fn logical_extent(desc: &TextureDescriptor) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: desc.width,
        height: desc.height,
        depth_or_array_layers: 1,
    }
}

fn is_padded(desc: &TextureDescriptor) -> bool {
    backing_extent(desc) != logical_extent(desc)
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
