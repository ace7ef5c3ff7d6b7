use std::collections::HashMap;
use std::mem;

use crate::renderer::backend::RenderMode;
use crate::renderer::error::RenderError;
use crate::renderer::lights::LightsUniform;
use crate::renderer::uniforms::DrawUniforms;
use crate::scene::CullFace;

use super::target::DEPTH_FORMAT;

/// Distinct pipeline states the canvas asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PipelineKey {
    pub(crate) mode: RenderMode,
    pub(crate) cull_face: CullFace,
    pub(crate) blend: bool,
    pub(crate) depth_test: bool,
    pub(crate) format: wgpu::TextureFormat,
}

impl PipelineKey {
    pub(crate) fn new(
        mode: RenderMode,
        cull_face: CullFace,
        blend: bool,
        depth_test: bool,
        format: wgpu::TextureFormat,
    ) -> Self {
        // Lines have no facing.
        let cull_face = match mode {
            RenderMode::Lines => CullFace::None,
            RenderMode::Triangles => cull_face,
        };
        Self {
            mode,
            cull_face,
            blend,
            depth_test,
            format,
        }
    }

    fn topology(&self) -> wgpu::PrimitiveTopology {
        match self.mode {
            RenderMode::Triangles => wgpu::PrimitiveTopology::TriangleList,
            RenderMode::Lines => wgpu::PrimitiveTopology::LineList,
        }
    }

    fn cull_mode(&self) -> Option<wgpu::Face> {
        match self.cull_face {
            CullFace::None => None,
            CullFace::Back => Some(wgpu::Face::Back),
            CullFace::Front => Some(wgpu::Face::Front),
        }
    }
}

/// Builder for creating render pipelines with the canvas defaults.
pub(crate) struct PipelineBuilder<'a> {
    device: &'a wgpu::Device,
    label: Option<&'a str>,
    layout: &'a wgpu::PipelineLayout,
    shader: &'a wgpu::ShaderModule,
    vertex_buffers: Vec<wgpu::VertexBufferLayout<'a>>,
    color_targets: Vec<Option<wgpu::ColorTargetState>>,
    depth_stencil: Option<wgpu::DepthStencilState>,
    primitive: wgpu::PrimitiveState,
}

impl<'a> PipelineBuilder<'a> {
    pub(crate) fn new(
        device: &'a wgpu::Device,
        layout: &'a wgpu::PipelineLayout,
        shader: &'a wgpu::ShaderModule,
    ) -> Self {
        Self {
            device,
            label: None,
            layout,
            shader,
            vertex_buffers: Vec::new(),
            color_targets: Vec::new(),
            depth_stencil: None,
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: Some(wgpu::Face::Back),
                front_face: wgpu::FrontFace::Ccw,
                polygon_mode: wgpu::PolygonMode::Fill,
                ..Default::default()
            },
        }
    }

    pub(crate) fn with_label(mut self, label: &'a str) -> Self {
        self.label = Some(label);
        self
    }

    pub(crate) fn with_vertex_buffer(mut self, layout: wgpu::VertexBufferLayout<'a>) -> Self {
        self.vertex_buffers.push(layout);
        self
    }

    pub(crate) fn with_color_target(
        mut self,
        format: wgpu::TextureFormat,
        blend: Option<wgpu::BlendState>,
    ) -> Self {
        self.color_targets.push(Some(wgpu::ColorTargetState {
            format,
            blend,
            write_mask: wgpu::ColorWrites::ALL,
        }));
        self
    }

    pub(crate) fn with_depth_stencil(
        mut self,
        format: wgpu::TextureFormat,
        depth_write: bool,
        depth_compare: wgpu::CompareFunction,
    ) -> Self {
        self.depth_stencil = Some(wgpu::DepthStencilState {
            format,
            depth_write_enabled: depth_write,
            depth_compare,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });
        self
    }

    pub(crate) fn with_cull_mode(mut self, cull_mode: Option<wgpu::Face>) -> Self {
        self.primitive.cull_mode = cull_mode;
        self
    }

    pub(crate) fn with_topology(mut self, topology: wgpu::PrimitiveTopology) -> Self {
        self.primitive.topology = topology;
        self
    }

    pub(crate) fn build(self) -> wgpu::RenderPipeline {
        self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: self.label,
            layout: Some(self.layout),
            vertex: wgpu::VertexState {
                module: self.shader,
                entry_point: Some("vs_main"),
                buffers: &self.vertex_buffers,
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: self.shader,
                entry_point: Some("fs_main"),
                targets: &self.color_targets,
                compilation_options: Default::default(),
            }),
            primitive: self.primitive,
            depth_stencil: self.depth_stencil,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        })
    }
}

const POSITION_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x3];
const NORMAL_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![1 => Float32x3];
const TEX_COORD_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![2 => Float32x2];

fn stream_layout(
    components: u64,
    attributes: &'static [wgpu::VertexAttribute],
) -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: components * mem::size_of::<f32>() as u64,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes,
    }
}

/// Bind group layouts shared by every pipeline: lights, per-draw uniforms
/// (dynamic offset), texture and sampler.
pub(crate) struct BindLayouts {
    pub(crate) lights: wgpu::BindGroupLayout,
    pub(crate) draw: wgpu::BindGroupLayout,
    pub(crate) texture: wgpu::BindGroupLayout,
}

impl BindLayouts {
    fn new(device: &wgpu::Device) -> Self {
        let uniform_entry = |size: usize, dynamic: bool| wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: dynamic,
                min_binding_size: wgpu::BufferSize::new(size as u64),
            },
            count: None,
        };
        let lights = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("LightsBindLayout"),
            entries: &[uniform_entry(mem::size_of::<LightsUniform>(), false)],
        });
        let draw = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("DrawBindLayout"),
            entries: &[uniform_entry(mem::size_of::<DrawUniforms>(), true)],
        });
        let texture = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("TextureBindLayout"),
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
        Self {
            lights,
            draw,
            texture,
        }
    }
}

/// The canvas program and every pipeline built from it so far.
pub(crate) struct PipelineCache {
    pub(crate) layouts: BindLayouts,
    layout: wgpu::PipelineLayout,
    shader: wgpu::ShaderModule,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
}

impl PipelineCache {
    /// Compiles the program; a compile or validation error fails construction.
    pub(crate) fn new(device: &wgpu::Device) -> Result<Self, RenderError> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Canvas3D Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../shader/canvas3d.wgsl").into()),
        });
        let layouts = BindLayouts::new(device);
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Canvas3D Pipeline Layout"),
            bind_group_layouts: &[&layouts.lights, &layouts.draw, &layouts.texture],
            push_constant_ranges: &[],
        });
        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(RenderError::Shader(error.to_string()));
        }
        log::info!("Canvas3D shader program compiled");

        Ok(Self {
            layouts,
            layout,
            shader,
            pipelines: HashMap::new(),
        })
    }

    pub(crate) fn prepare(&mut self, device: &wgpu::Device, key: PipelineKey) {
        if self.pipelines.contains_key(&key) {
            return;
        }
        log::debug!("Building pipeline {:?}", key);
        let blend = key.blend.then_some(wgpu::BlendState::ALPHA_BLENDING);
        let pipeline = PipelineBuilder::new(device, &self.layout, &self.shader)
            .with_label("Canvas3D Pipeline")
            .with_vertex_buffer(stream_layout(3, &POSITION_ATTRIBUTES))
            .with_vertex_buffer(stream_layout(3, &NORMAL_ATTRIBUTES))
            .with_vertex_buffer(stream_layout(2, &TEX_COORD_ATTRIBUTES))
            .with_color_target(key.format, blend)
            .with_depth_stencil(
                DEPTH_FORMAT,
                key.depth_test,
                if key.depth_test {
                    wgpu::CompareFunction::Less
                } else {
                    wgpu::CompareFunction::Always
                },
            )
            .with_cull_mode(key.cull_mode())
            .with_topology(key.topology())
            .build();
        self.pipelines.insert(key, pipeline);
    }

    pub(crate) fn get(&self, key: &PipelineKey) -> Option<&wgpu::RenderPipeline> {
        self.pipelines.get(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.pipelines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_ignore_cull_face() {
        let format = wgpu::TextureFormat::Rgba8Unorm;
        let lines = PipelineKey::new(RenderMode::Lines, CullFace::Front, false, true, format);
        assert_eq!(lines.cull_face, CullFace::None);
        assert_eq!(lines.cull_mode(), None);
        assert_eq!(lines.topology(), wgpu::PrimitiveTopology::LineList);

        let triangles = PipelineKey::new(RenderMode::Triangles, CullFace::Front, false, true, format);
        assert_eq!(triangles.cull_mode(), Some(wgpu::Face::Front));
    }

    #[test]
    fn shader_declares_the_uniform_layouts() {
        let source = include_str!("../../shader/canvas3d.wgsl");
        assert_eq!(mem::size_of::<DrawUniforms>(), 352);
        assert_eq!(mem::size_of::<LightsUniform>(), 16 + 2 * 16 * 16);
        for needle in ["fn vs_main", "fn fs_main", "@group(1) @binding(0) var<uniform> draw", "array<vec4<f32>, 16>"] {
            assert!(source.contains(needle), "missing {needle}");
        }
    }
}
