//! `wgpu` implementation of [`RenderBackend`].
//!
//! Draws are recorded between `begin_frame` and `end_frame`, then encoded
//! as one render pass per depth segment: `clear_depth` starts a new pass
//! that keeps the color attachment and clears depth.

mod context;
mod pipeline;
mod target;
mod texture;

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use image::{Rgba, RgbaImage};
use wgpu::util::DeviceExt;
use winit::window::Window;

use crate::settings::RenderSettings;

use super::backend::{
    BufferId, DrawCall, Readback, RenderBackend, RenderTarget, TextureId, TextureSampling,
};
use super::error::RenderError;
use super::lights::LightsUniform;
use super::uniforms::DrawUniforms;

use context::GpuContext;
use pipeline::{PipelineCache, PipelineKey};
use target::{Depth, Offscreen, OFFSCREEN_FORMAT};
use texture::GpuTexture;

const INITIAL_DRAW_CAPACITY: u32 = 256;

struct FrameRecording {
    target: RenderTarget,
    clear_color: [f32; 4],
    lights: LightsUniform,
    /// Draws between depth clears.
    segments: Vec<Vec<DrawCall>>,
}

pub struct WgpuBackend {
    context: GpuContext,
    pipelines: PipelineCache,
    buffers: HashMap<BufferId, wgpu::Buffer>,
    textures: HashMap<TextureId, GpuTexture>,
    white: GpuTexture,
    next_id: u32,

    lights_buffer: wgpu::Buffer,
    lights_bind_group: wgpu::BindGroup,

    draw_buffer: wgpu::Buffer,
    draw_capacity: u32,
    draw_stride: u64,
    draw_bind_group: wgpu::BindGroup,

    /// Stands in for absent normal and texture coordinate streams.
    zeros: wgpu::Buffer,
    zeros_size: u64,

    depth: Depth,
    offscreen: Option<Offscreen>,
    picking: Option<Offscreen>,
    frame: Option<FrameRecording>,
}

impl WgpuBackend {
    /// Backend presenting to `window`.
    pub fn new_windowed(window: Arc<Window>, settings: &RenderSettings) -> Result<Self, RenderError> {
        let context = pollster::block_on(GpuContext::windowed(window, settings))?;
        Self::with_context(context)
    }

    /// Backend drawing every frame offscreen.
    pub fn new_headless(width: u32, height: u32) -> Result<Self, RenderError> {
        let context = pollster::block_on(GpuContext::headless(width, height))?;
        Self::with_context(context)
    }

    fn with_context(context: GpuContext) -> Result<Self, RenderError> {
        let device = &context.device;
        let pipelines = PipelineCache::new(device)?;

        let white = GpuTexture::new(
            device,
            &context.queue,
            &pipelines.layouts.texture,
            &RgbaImage::from_pixel(1, 1, Rgba([255, 255, 255, 255])),
            TextureSampling::Mipmapped,
        );

        let lights_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("LightsBuffer"),
            contents: bytemuck::bytes_of(&LightsUniform::default()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let lights_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("LightsBindGroup"),
            layout: &pipelines.layouts.lights,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: lights_buffer.as_entire_binding(),
            }],
        });

        let alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        let draw_stride = (mem::size_of::<DrawUniforms>() as u64).div_ceil(alignment) * alignment;
        let (draw_buffer, draw_bind_group) =
            Self::create_draw_buffer(device, &pipelines, INITIAL_DRAW_CAPACITY, draw_stride);

        let zeros_size = 1024 * 12;
        let zeros = Self::create_zeros(device, zeros_size);
        let depth = Depth::new(device, context.width, context.height);

        log::info!(
            "wgpu backend ready ({}x{}, {})",
            context.width,
            context.height,
            if context.surface.is_some() { "windowed" } else { "headless" }
        );

        Ok(Self {
            context,
            pipelines,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            white,
            next_id: 1,
            lights_buffer,
            lights_bind_group,
            draw_buffer,
            draw_capacity: INITIAL_DRAW_CAPACITY,
            draw_stride,
            draw_bind_group,
            zeros,
            zeros_size,
            depth,
            offscreen: None,
            picking: None,
            frame: None,
        })
    }

    fn create_draw_buffer(
        device: &wgpu::Device,
        pipelines: &PipelineCache,
        capacity: u32,
        stride: u64,
    ) -> (wgpu::Buffer, wgpu::BindGroup) {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("DrawUniformsBuffer"),
            size: capacity as u64 * stride,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("DrawBindGroup"),
            layout: &pipelines.layouts.draw,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: wgpu::BufferSize::new(mem::size_of::<DrawUniforms>() as u64),
                }),
            }],
        });
        (buffer, bind_group)
    }

    /// Buffers start zero-initialized.
    fn create_zeros(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ZeroStream"),
            size,
            usage: wgpu::BufferUsages::VERTEX,
            mapped_at_creation: false,
        })
    }

    fn grow_draw_buffer(&mut self, required: u32) {
        if required <= self.draw_capacity {
            return;
        }
        let new_capacity = required.max(self.draw_capacity * 2);
        log::info!(
            "Growing draw uniforms buffer: {} -> {}",
            self.draw_capacity,
            new_capacity
        );
        let (buffer, bind_group) = Self::create_draw_buffer(
            &self.context.device,
            &self.pipelines,
            new_capacity,
            self.draw_stride,
        );
        self.draw_buffer = buffer;
        self.draw_bind_group = bind_group;
        self.draw_capacity = new_capacity;
    }

    fn grow_zeros(&mut self, vertex_count: u32) {
        let required = vertex_count as u64 * 12;
        if required <= self.zeros_size {
            return;
        }
        self.zeros_size = required.max(self.zeros_size * 2);
        self.zeros = Self::create_zeros(&self.context.device, self.zeros_size);
    }

    fn prepare_targets(&mut self, target: RenderTarget, width: u32, height: u32) {
        let device = &self.context.device;
        if !self.depth.matches(width, height) {
            self.depth = Depth::new(device, width, height);
        }
        match target {
            RenderTarget::Picking { .. } => {
                if !self.picking.as_ref().is_some_and(|p| p.matches(width, height)) {
                    log::debug!("Creating {}x{} picking target", width, height);
                    self.picking = Some(Offscreen::new(device, width, height, "Picking Target"));
                }
            }
            RenderTarget::Image | RenderTarget::Canvas => {
                let needed = target == RenderTarget::Image || self.context.surface.is_none();
                if needed && !self.offscreen.as_ref().is_some_and(|o| o.matches(width, height)) {
                    self.offscreen = Some(Offscreen::new(device, width, height, "Offscreen Target"));
                }
            }
        }
    }

    fn target_format(&self, target: RenderTarget) -> wgpu::TextureFormat {
        match target {
            RenderTarget::Canvas => self.context.canvas_format(),
            RenderTarget::Image | RenderTarget::Picking { .. } => OFFSCREEN_FORMAT,
        }
    }

    fn acquire_surface(&self) -> Result<Option<wgpu::SurfaceTexture>, RenderError> {
        let Some(state) = &self.context.surface else {
            return Ok(None);
        };
        match state.surface.get_current_texture() {
            Ok(frame) => Ok(Some(frame)),
            Err(err @ (wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated)) => {
                log::warn!("Surface {:?}, reconfiguring", err);
                state.surface.configure(&self.context.device, &state.config);
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl RenderBackend for WgpuBackend {
    fn size(&self) -> (u32, u32) {
        (self.context.width, self.context.height)
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.context.resize(width, height);
    }

    fn create_buffer(&mut self, data: &[f32], components: u32) -> Result<BufferId, RenderError> {
        if components == 0 || data.len() % components as usize != 0 {
            return Err(RenderError::Buffer(format!(
                "buffer of {} floats is not a multiple of {} components",
                data.len(),
                components
            )));
        }
        let contents: &[f32] = if data.is_empty() { &[0.0; 4] } else { data };
        let buffer = self
            .context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("GeometryStream"),
                contents: bytemuck::cast_slice(contents),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        if let Some(buffer) = self.buffers.remove(&buffer) {
            buffer.destroy();
        }
    }

    fn create_texture(
        &mut self,
        image: &RgbaImage,
        sampling: TextureSampling,
    ) -> Result<TextureId, RenderError> {
        let limit = self.context.device.limits().max_texture_dimension_2d;
        if image.width() == 0 || image.height() == 0 || image.width() > limit || image.height() > limit {
            return Err(RenderError::Texture(format!(
                "unsupported texture size {}x{}",
                image.width(),
                image.height()
            )));
        }
        let texture = GpuTexture::new(
            &self.context.device,
            &self.context.queue,
            &self.pipelines.layouts.texture,
            image,
            sampling,
        );
        let id = TextureId(self.next_id);
        self.next_id += 1;
        self.textures.insert(id, texture);
        Ok(id)
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn begin_frame(&mut self, target: RenderTarget, clear_color: [f32; 4]) -> Result<(), RenderError> {
        self.frame = Some(FrameRecording {
            target,
            clear_color,
            lights: LightsUniform::default(),
            segments: vec![Vec::new()],
        });
        Ok(())
    }

    fn set_lights(&mut self, lights: &LightsUniform) {
        if let Some(frame) = &mut self.frame {
            frame.lights = *lights;
        }
    }

    fn clear_depth(&mut self) {
        if let Some(frame) = &mut self.frame {
            frame.segments.push(Vec::new());
        }
    }

    fn draw(&mut self, call: &DrawCall) {
        match self.frame.as_mut().and_then(|frame| frame.segments.last_mut()) {
            Some(segment) => segment.push(*call),
            None => log::warn!("Draw issued outside a frame"),
        }
    }

    fn end_frame(&mut self) -> Result<Option<Readback>, RenderError> {
        let frame = self.frame.take().ok_or(RenderError::NoFrame)?;
        let (width, height) = match frame.target {
            RenderTarget::Canvas | RenderTarget::Image => (self.context.width, self.context.height),
            RenderTarget::Picking { width, height } => (width.max(1), height.max(1)),
        };
        let format = self.target_format(frame.target);
        self.prepare_targets(frame.target, width, height);

        let calls: Vec<&DrawCall> = frame.segments.iter().flatten().collect();
        self.grow_draw_buffer(calls.len() as u32);
        self.grow_zeros(calls.iter().map(|c| c.buffers.vertex_count).max().unwrap_or(0));
        for call in &calls {
            let key = PipelineKey::new(
                call.mode,
                call.state.cull_face,
                call.state.blend,
                call.state.depth_test,
                format,
            );
            self.pipelines.prepare(&self.context.device, key);
        }

        let queue = &self.context.queue;
        queue.write_buffer(&self.lights_buffer, 0, bytemuck::bytes_of(&frame.lights));
        if !calls.is_empty() {
            let stride = self.draw_stride as usize;
            let mut staging = vec![0u8; stride * calls.len()];
            for (index, call) in calls.iter().enumerate() {
                let bytes = bytemuck::bytes_of(&call.uniforms);
                staging[index * stride..index * stride + bytes.len()].copy_from_slice(bytes);
            }
            queue.write_buffer(&self.draw_buffer, 0, &staging);
        }

        let surface_frame = match frame.target {
            RenderTarget::Canvas => self.acquire_surface()?,
            _ => None,
        };
        let surface_view = surface_frame
            .as_ref()
            .map(|f| f.texture.create_view(&wgpu::TextureViewDescriptor::default()));
        let offscreen = match frame.target {
            RenderTarget::Picking { .. } => self.picking.as_ref(),
            _ => self.offscreen.as_ref(),
        };
        let color_view = match (&surface_view, offscreen) {
            (Some(view), _) => view,
            (None, Some(target)) => &target.view,
            (None, None) => return Err(RenderError::Context("no color target for frame".into())),
        };

        let device = &self.context.device;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Canvas3D Encoder"),
        });
        let [r, g, b, a] = frame.clear_color;
        let mut slot = 0u64;
        for (index, segment) in frame.segments.iter().enumerate() {
            let load = if index == 0 {
                wgpu::LoadOp::Clear(wgpu::Color {
                    r: r as f64,
                    g: g as f64,
                    b: b as f64,
                    a: a as f64,
                })
            } else {
                wgpu::LoadOp::Load
            };
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Canvas3D Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: color_view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.depth.view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_bind_group(0, &self.lights_bind_group, &[]);

            for call in segment {
                let offset = (slot * self.draw_stride) as u32;
                slot += 1;
                let key = PipelineKey::new(
                    call.mode,
                    call.state.cull_face,
                    call.state.blend,
                    call.state.depth_test,
                    format,
                );
                let (Some(pipeline), Some(positions)) =
                    (self.pipelines.get(&key), self.buffers.get(&call.buffers.positions))
                else {
                    log::warn!("Skipping draw with missing pipeline or buffer");
                    continue;
                };
                let stream = |use_stream: bool, id: Option<BufferId>| {
                    use_stream
                        .then(|| id.and_then(|id| self.buffers.get(&id)))
                        .flatten()
                        .unwrap_or(&self.zeros)
                };
                let texture = call
                    .texture
                    .and_then(|id| self.textures.get(&id))
                    .unwrap_or(&self.white);

                pass.set_pipeline(pipeline);
                pass.set_bind_group(1, &self.draw_bind_group, &[offset]);
                pass.set_bind_group(2, &texture.bind_group, &[]);
                pass.set_vertex_buffer(0, positions.slice(..));
                pass.set_vertex_buffer(1, stream(call.use_normals, call.buffers.normals).slice(..));
                pass.set_vertex_buffer(2, stream(call.use_tex_coords, call.buffers.tex_coords).slice(..));
                pass.draw(0..call.buffers.vertex_count, 0..1);
            }
        }
        queue.submit(std::iter::once(encoder.finish()));

        let readback = match (frame.target.is_readable(), offscreen) {
            (true, Some(target)) => Some(target::read_pixels(device, queue, target)?),
            _ => None,
        };
        drop(surface_view);
        if let Some(surface_frame) = surface_frame {
            surface_frame.present();
        }
        log::trace!(
            "Frame {:?}: {} draws, {} pipelines cached",
            frame.target,
            calls.len(),
            self.pipelines.len()
        );
        Ok(readback)
    }

    fn release_picking_target(&mut self) {
        self.picking = None;
    }
}
