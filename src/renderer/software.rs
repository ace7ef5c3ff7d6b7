//! Deterministic CPU backend. It rasterizes with the same stage functions
//! the WGSL program implements, so headless and test renders match the GPU
//! up to filtering.

use std::collections::HashMap;

use glam::{Vec2, Vec3, Vec4, Vec4Swizzles};
use image::RgbaImage;

use crate::scene::CullFace;

use super::backend::{
    BufferId, DrawCall, Readback, RenderBackend, RenderMode, RenderTarget, TextureId,
    TextureSampling,
};
use super::error::RenderError;
use super::lights::LightsUniform;
use super::shading::{fragment_stage, vertex_stage, VertexInput, VertexOutput};
use super::uniforms::DrawFlags;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    pub buffers_created: usize,
    pub live_buffers: usize,
    pub textures_created: usize,
    pub live_textures: usize,
    /// Uploaded texture sizes in creation order.
    pub texture_sizes: Vec<(u32, u32)>,
    pub frames: usize,
    pub draws: usize,
}

struct StoredBuffer {
    data: Vec<f32>,
    components: usize,
}

struct StoredTexture {
    image: RgbaImage,
    sampling: TextureSampling,
}

struct Framebuffer {
    target: RenderTarget,
    width: u32,
    height: u32,
    /// Rows bottom-up.
    color: Vec<Vec4>,
    depth: Vec<f32>,
}

impl Framebuffer {
    fn new(target: RenderTarget, width: u32, height: u32, clear: [f32; 4]) -> Self {
        let len = (width * height) as usize;
        Self {
            target,
            width,
            height,
            color: vec![Vec4::from_array(clear); len],
            depth: vec![1.0; len],
        }
    }

    fn readback(&self) -> Readback {
        let pixels = self
            .color
            .iter()
            .flat_map(|c| {
                let c = c.clamp(Vec4::ZERO, Vec4::ONE) * 255.0;
                [c.x.round() as u8, c.y.round() as u8, c.z.round() as u8, c.w.round() as u8]
            })
            .collect();
        Readback {
            width: self.width,
            height: self.height,
            pixels,
        }
    }
}

/// Fragment inputs interpolated across a primitive.
#[derive(Clone, Copy)]
struct Varyings {
    view_position: Vec3,
    normal: Vec3,
    tex_coord: Vec2,
}

impl Varyings {
    fn of(vertex: &VertexOutput) -> Self {
        Self {
            view_position: vertex.view_position,
            normal: vertex.normal,
            tex_coord: vertex.tex_coord,
        }
    }

    fn blend(items: &[(Varyings, f32)]) -> Self {
        let mut out = Varyings {
            view_position: Vec3::ZERO,
            normal: Vec3::ZERO,
            tex_coord: Vec2::ZERO,
        };
        for (v, weight) in items {
            out.view_position += v.view_position * *weight;
            out.normal += v.normal * *weight;
            out.tex_coord += v.tex_coord * *weight;
        }
        out
    }
}

struct ScreenVertex {
    position: Vec2,
    depth: f32,
    inverse_w: f32,
    varyings: Varyings,
}

pub struct SoftwareBackend {
    width: u32,
    height: u32,
    buffers: HashMap<BufferId, StoredBuffer>,
    textures: HashMap<TextureId, StoredTexture>,
    next_id: u32,
    lights: LightsUniform,
    frame: Option<Framebuffer>,
    canvas: Option<Readback>,
    stats: SoftwareStats,
}

impl SoftwareBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            next_id: 1,
            lights: LightsUniform::default(),
            frame: None,
            canvas: None,
            stats: SoftwareStats::default(),
        }
    }

    pub fn stats(&self) -> &SoftwareStats {
        &self.stats
    }

    /// Last frame presented to the canvas target.
    pub fn canvas_frame(&self) -> Option<&Readback> {
        self.canvas.as_ref()
    }

    /// Canvas pixel with a top-left origin.
    pub fn canvas_pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let canvas = self.canvas.as_ref()?;
        let row = canvas.height.checked_sub(y + 1)?;
        canvas.pixel(x, row)
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn fetch(&self, buffer: Option<BufferId>, index: usize) -> Option<&[f32]> {
        let stored = self.buffers.get(&buffer?)?;
        let start = index * stored.components;
        stored.data.get(start..start + stored.components)
    }

    fn sample(&self, texture: Option<TextureId>, uv: Vec2) -> Vec4 {
        let Some(stored) = texture.and_then(|id| self.textures.get(&id)) else {
            return Vec4::ONE;
        };
        let (width, height) = stored.image.dimensions();
        let (u, v) = (uv.x, 1.0 - uv.y);
        let (u, v) = match stored.sampling {
            TextureSampling::Mipmapped => (u.rem_euclid(1.0), v.rem_euclid(1.0)),
            TextureSampling::Clamped => (u.clamp(0.0, 1.0), v.clamp(0.0, 1.0)),
        };
        let x = ((u * width as f32) as u32).min(width - 1);
        let y = ((v * height as f32) as u32).min(height - 1);
        let [r, g, b, a] = stored.image.get_pixel(x, y).0;
        Vec4::new(r as f32, g as f32, b as f32, a as f32) / 255.0
    }

    fn to_screen(frame: &Framebuffer, vertex: &VertexOutput) -> Option<ScreenVertex> {
        let clip = vertex.clip_position;
        if clip.w <= 1e-6 {
            return None;
        }
        let ndc = clip.xyz() / clip.w;
        Some(ScreenVertex {
            position: Vec2::new(
                (ndc.x * 0.5 + 0.5) * frame.width as f32,
                (ndc.y * 0.5 + 0.5) * frame.height as f32,
            ),
            depth: ndc.z,
            inverse_w: 1.0 / clip.w,
            varyings: Varyings::of(vertex),
        })
    }

    fn shade(
        &self,
        call: &DrawCall,
        frame: &mut Framebuffer,
        x: u32,
        y: u32,
        depth: f32,
        varyings: Varyings,
    ) {
        if !(0.0..=1.0).contains(&depth) {
            return;
        }
        let index = (y * frame.width + x) as usize;
        if call.state.depth_test {
            if depth >= frame.depth[index] {
                return;
            }
            frame.depth[index] = depth;
        }
        let texel = if call.uniforms.flags().contains(DrawFlags::TEXTURE) {
            self.sample(call.texture, varyings.tex_coord)
        } else {
            Vec4::ONE
        };
        let normal = varyings.normal.normalize_or_zero();
        let color = fragment_stage(
            &call.uniforms,
            &self.lights,
            varyings.view_position,
            normal,
            texel,
        )
        .clamp(Vec4::ZERO, Vec4::ONE);
        let destination = &mut frame.color[index];
        *destination = if call.state.blend {
            let a = color.w;
            (color.xyz() * a + destination.xyz() * (1.0 - a)).extend(a + destination.w * (1.0 - a))
        } else {
            color
        };
    }

    fn rasterize_triangle(&self, call: &DrawCall, frame: &mut Framebuffer, v: [&ScreenVertex; 3]) {
        let area = edge(v[0].position, v[1].position, v[2].position);
        if area.abs() < f32::EPSILON {
            return;
        }
        let front = area > 0.0;
        let culled = match call.state.cull_face {
            CullFace::None => false,
            CullFace::Back => !front,
            CullFace::Front => front,
        };
        if culled {
            return;
        }
        // Counter-clockwise from here on, so inside means positive weights.
        let (v, area) = if front {
            (v, area)
        } else {
            ([v[0], v[2], v[1]], -area)
        };
        let owned = [
            is_top_left(v[1].position, v[2].position),
            is_top_left(v[2].position, v[0].position),
            is_top_left(v[0].position, v[1].position),
        ];

        let min = v[0].position.min(v[1].position).min(v[2].position);
        let max = v[0].position.max(v[1].position).max(v[2].position);
        let x0 = min.x.floor().max(0.0) as u32;
        let y0 = min.y.floor().max(0.0) as u32;
        let x1 = (max.x.ceil().max(0.0) as u32).min(frame.width);
        let y1 = (max.y.ceil().max(0.0) as u32).min(frame.height);

        for y in y0..y1 {
            for x in x0..x1 {
                let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                let b0 = edge(v[1].position, v[2].position, p) / area;
                let b1 = edge(v[2].position, v[0].position, p) / area;
                let b2 = edge(v[0].position, v[1].position, p) / area;
                let covered = [b0, b1, b2]
                    .iter()
                    .zip(owned)
                    .all(|(&b, owned)| b > 0.0 || (b == 0.0 && owned));
                if !covered {
                    continue;
                }
                let depth = b0 * v[0].depth + b1 * v[1].depth + b2 * v[2].depth;
                let w0 = b0 * v[0].inverse_w;
                let w1 = b1 * v[1].inverse_w;
                let w2 = b2 * v[2].inverse_w;
                let sum = w0 + w1 + w2;
                let varyings = Varyings::blend(&[
                    (v[0].varyings, w0 / sum),
                    (v[1].varyings, w1 / sum),
                    (v[2].varyings, w2 / sum),
                ]);
                self.shade(call, frame, x, y, depth, varyings);
            }
        }
    }

    fn rasterize_line(&self, call: &DrawCall, frame: &mut Framebuffer, a: &ScreenVertex, b: &ScreenVertex) {
        let delta = b.position - a.position;
        let steps = delta.x.abs().max(delta.y.abs()).ceil().max(1.0) as u32;
        for step in 0..=steps {
            let t = step as f32 / steps as f32;
            let p = a.position + delta * t;
            if p.x < 0.0 || p.y < 0.0 {
                continue;
            }
            let (x, y) = (p.x as u32, p.y as u32);
            if x >= frame.width || y >= frame.height {
                continue;
            }
            let depth = a.depth + (b.depth - a.depth) * t;
            let varyings = Varyings::blend(&[(a.varyings, 1.0 - t), (b.varyings, t)]);
            self.shade(call, frame, x, y, depth, varyings);
        }
    }
}

fn edge(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

/// Top-left fill rule for a counter-clockwise edge with y up: pixels centred
/// exactly on a shared edge belong to one triangle only.
fn is_top_left(a: Vec2, b: Vec2) -> bool {
    let top = a.y == b.y && b.x < a.x;
    let left = b.y < a.y;
    top || left
}

impl RenderBackend for SoftwareBackend {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.width = width.max(1);
        self.height = height.max(1);
    }

    fn create_buffer(&mut self, data: &[f32], components: u32) -> Result<BufferId, RenderError> {
        if components == 0 || data.len() % components as usize != 0 {
            return Err(RenderError::Buffer(format!(
                "buffer of {} floats is not a multiple of {} components",
                data.len(),
                components
            )));
        }
        let id = BufferId(self.allocate_id());
        self.buffers.insert(
            id,
            StoredBuffer {
                data: data.to_vec(),
                components: components as usize,
            },
        );
        self.stats.buffers_created += 1;
        self.stats.live_buffers = self.buffers.len();
        Ok(id)
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
        self.stats.live_buffers = self.buffers.len();
    }

    fn create_texture(
        &mut self,
        image: &RgbaImage,
        sampling: TextureSampling,
    ) -> Result<TextureId, RenderError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(RenderError::Texture("empty image".into()));
        }
        let id = TextureId(self.allocate_id());
        self.textures.insert(
            id,
            StoredTexture {
                image: image.clone(),
                sampling,
            },
        );
        self.stats.textures_created += 1;
        self.stats.live_textures = self.textures.len();
        self.stats.texture_sizes.push(image.dimensions());
        Ok(id)
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
        self.stats.live_textures = self.textures.len();
    }

    fn begin_frame(&mut self, target: RenderTarget, clear_color: [f32; 4]) -> Result<(), RenderError> {
        let (width, height) = match target {
            RenderTarget::Canvas | RenderTarget::Image => (self.width, self.height),
            RenderTarget::Picking { width, height } => (width.max(1), height.max(1)),
        };
        self.frame = Some(Framebuffer::new(target, width, height, clear_color));
        Ok(())
    }

    fn set_lights(&mut self, lights: &LightsUniform) {
        self.lights = *lights;
    }

    fn clear_depth(&mut self) {
        if let Some(frame) = &mut self.frame {
            frame.depth.fill(1.0);
        }
    }

    fn draw(&mut self, call: &DrawCall) {
        let Some(mut frame) = self.frame.take() else {
            log::warn!("Draw issued outside a frame");
            return;
        };
        self.stats.draws += 1;

        let mut screen = Vec::with_capacity(call.buffers.vertex_count as usize);
        for index in 0..call.buffers.vertex_count as usize {
            let Some(position) = self.fetch(Some(call.buffers.positions), index) else {
                break;
            };
            let normal = call
                .use_normals
                .then(|| self.fetch(call.buffers.normals, index))
                .flatten()
                .map_or(Vec3::ZERO, Vec3::from_slice);
            let tex_coord = call
                .use_tex_coords
                .then(|| self.fetch(call.buffers.tex_coords, index))
                .flatten()
                .map_or(Vec2::ZERO, Vec2::from_slice);
            let input = VertexInput {
                position: Vec3::from_slice(position),
                normal,
                tex_coord,
            };
            screen.push(Self::to_screen(&frame, &vertex_stage(&call.uniforms, &input)));
        }

        match call.mode {
            RenderMode::Triangles => {
                for triangle in screen.chunks_exact(3) {
                    if let [Some(a), Some(b), Some(c)] = triangle {
                        self.rasterize_triangle(call, &mut frame, [a, b, c]);
                    }
                }
            }
            RenderMode::Lines => {
                for line in screen.chunks_exact(2) {
                    if let [Some(a), Some(b)] = line {
                        self.rasterize_line(call, &mut frame, a, b);
                    }
                }
            }
        }
        self.frame = Some(frame);
    }

    fn end_frame(&mut self) -> Result<Option<Readback>, RenderError> {
        let frame = self.frame.take().ok_or(RenderError::NoFrame)?;
        self.stats.frames += 1;
        let readback = frame.readback();
        if frame.target.is_readable() {
            Ok(Some(readback))
        } else {
            self.canvas = Some(readback);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::{DrawState, GeometryBuffers};
    use crate::renderer::uniforms::DrawUniforms;

    fn quad_call(backend: &mut SoftwareBackend, color: Vec3, alpha: f32, depth_test: bool) -> DrawCall {
        let positions = [
            -1.0, -1.0, 0.0, 1.0, -1.0, 0.0, 1.0, 1.0, 0.0, //
            -1.0, -1.0, 0.0, 1.0, 1.0, 0.0, -1.0, 1.0, 0.0,
        ];
        let buffer = backend.create_buffer(&positions, 3).unwrap();
        let mut uniforms = DrawUniforms::default();
        uniforms.set_diffuse(color, alpha);
        DrawCall {
            mode: RenderMode::Triangles,
            buffers: GeometryBuffers {
                positions: buffer,
                normals: None,
                tex_coords: None,
                vertex_count: 6,
            },
            use_normals: false,
            use_tex_coords: false,
            texture: None,
            uniforms,
            state: DrawState {
                cull_face: CullFace::Back,
                blend: alpha < 1.0,
                depth_test,
            },
        }
    }

    #[test]
    fn fills_a_full_screen_quad() {
        let mut backend = SoftwareBackend::new(4, 4);
        let call = quad_call(&mut backend, Vec3::new(1.0, 0.0, 0.0), 1.0, true);
        backend.begin_frame(RenderTarget::Canvas, [0.0, 0.0, 0.0, 1.0]).unwrap();
        backend.draw(&call);
        assert!(backend.end_frame().unwrap().is_none());
        assert_eq!(backend.canvas_pixel(0, 0), Some([255, 0, 0, 255]));
        assert_eq!(backend.canvas_pixel(3, 3), Some([255, 0, 0, 255]));
    }

    #[test]
    fn back_faces_are_culled() {
        let mut backend = SoftwareBackend::new(2, 2);
        let mut call = quad_call(&mut backend, Vec3::ONE, 1.0, true);
        let mut flipped = DrawUniforms::default();
        flipped.set_diffuse(Vec3::ONE, 1.0);
        flipped.set_model_view(glam::Mat4::from_scale(Vec3::new(-1.0, 1.0, 1.0)));
        call.uniforms = flipped;
        backend.begin_frame(RenderTarget::Image, [0.0, 0.0, 0.0, 1.0]).unwrap();
        backend.draw(&call);
        let readback = backend.end_frame().unwrap().unwrap();
        assert_eq!(readback.pixel(0, 0), Some([0, 0, 0, 255]));
    }

    #[test]
    fn blending_mixes_with_the_destination() {
        let mut backend = SoftwareBackend::new(2, 2);
        let call = quad_call(&mut backend, Vec3::ONE, 0.5, false);
        backend.begin_frame(RenderTarget::Image, [0.0, 0.0, 0.0, 1.0]).unwrap();
        backend.draw(&call);
        let readback = backend.end_frame().unwrap().unwrap();
        // Premultiplied 0.5 output blended again by its alpha.
        assert_eq!(readback.pixel(1, 1), Some([64, 64, 64, 255]));
    }

    #[test]
    fn shared_diagonal_is_filled_once() {
        // The 2x2 quad's diagonal passes through both (0, 0) and (1, 1) centres.
        let mut backend = SoftwareBackend::new(2, 2);
        let call = quad_call(&mut backend, Vec3::ONE, 0.5, false);
        backend.begin_frame(RenderTarget::Image, [0.0, 0.0, 0.0, 1.0]).unwrap();
        backend.draw(&call);
        let readback = backend.end_frame().unwrap().unwrap();
        for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            assert_eq!(readback.pixel(x, y), Some([64, 64, 64, 255]), "pixel {x},{y}");
        }
    }

    #[test]
    fn clockwise_triangles_follow_the_same_fill_rule() {
        let mut backend = SoftwareBackend::new(2, 2);
        let mut call = quad_call(&mut backend, Vec3::ONE, 0.5, false);
        call.state.cull_face = CullFace::None;
        call.uniforms.set_model_view(glam::Mat4::from_scale(Vec3::new(-1.0, 1.0, 1.0)));
        backend.begin_frame(RenderTarget::Image, [0.0, 0.0, 0.0, 1.0]).unwrap();
        backend.draw(&call);
        let readback = backend.end_frame().unwrap().unwrap();
        assert_eq!(readback.pixel(1, 0), Some([64, 64, 64, 255]));
        assert_eq!(readback.pixel(0, 1), Some([64, 64, 64, 255]));
    }

    #[test]
    fn picking_target_uses_its_own_size() {
        let mut backend = SoftwareBackend::new(100, 60);
        backend
            .begin_frame(RenderTarget::Picking { width: 64, height: 32 }, [1.0; 4])
            .unwrap();
        let readback = backend.end_frame().unwrap().unwrap();
        assert_eq!((readback.width, readback.height), (64, 32));
        assert_eq!(readback.pixel(0, 0), Some([255, 255, 255, 255]));
    }

    #[test]
    fn end_without_begin_is_an_error() {
        let mut backend = SoftwareBackend::new(1, 1);
        assert!(matches!(backend.end_frame(), Err(RenderError::NoFrame)));
    }

    #[test]
    fn deleting_resources_updates_live_counts() {
        let mut backend = SoftwareBackend::new(1, 1);
        let buffer = backend.create_buffer(&[0.0; 6], 3).unwrap();
        let texture = backend
            .create_texture(&RgbaImage::new(2, 2), TextureSampling::Mipmapped)
            .unwrap();
        backend.delete_buffer(buffer);
        backend.delete_texture(texture);
        assert_eq!(backend.stats().live_buffers, 0);
        assert_eq!(backend.stats().live_textures, 0);
        assert_eq!(backend.stats().buffers_created, 1);
    }
}
