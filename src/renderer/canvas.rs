use std::cell::RefCell;
use std::rc::Rc;

use glam::{Mat3, Mat4, Vec3, Vec4};
use image::RgbaImage;

use crate::scene::{CullFace, NodeId, SceneGraph};
use crate::settings::{ProjectionPolicy, RenderSettings};
use crate::time::{Clock, FrameRateCounter, SystemClock};

use super::backend::{
    DrawCall, DrawState, GeometryBuffers, Readback, RenderBackend, RenderMode, RenderTarget,
};
use super::error::RenderError;
use super::lights::FrameLights;
use super::picking::{index_color, pick_buffer_size, pick_index, PickMap, NO_HIT};
use super::render_list::{BuildProgress, DrawRecord, LoadStage, ProgressCallback, RenderList};
use super::schedule::{FrameScheduler, RepaintRequest};
use super::texture_cache::TextureCache;
use super::uniforms::{DrawFlags, DrawUniforms};

const BACKGROUND_FRONT_CLIP: f32 = 0.001;
const BACKGROUND_BACK_CLIP: f32 = 1.0;
const PICKING_CLEAR: [f32; 4] = [1.0; 4];

const DEFAULT_PLANE_S: Vec4 = Vec4::new(1.0, 0.0, 0.0, 0.0);
const DEFAULT_PLANE_T: Vec4 = Vec4::new(0.0, 1.0, 0.0, 0.0);

/// Default eye position, looking down -Z at the origin.
pub fn default_view_platform() -> Mat4 {
    Mat4::from_translation(Vec3::new(0.0, 0.0, 2.4))
}

/// Projection for the given viewing parameters. `field_of_view` is the
/// horizontal angle in radians.
pub fn projection_matrix(
    policy: ProjectionPolicy,
    field_of_view: f32,
    aspect: f32,
    front: f32,
    back: f32,
) -> Mat4 {
    let aspect = if aspect.is_finite() && aspect > 0.0 { aspect } else { 1.0 };
    match policy {
        ProjectionPolicy::Perspective => {
            let vertical = 2.0 * ((field_of_view / 2.0).tan() / aspect).atan();
            Mat4::perspective_rh(vertical, aspect, front, back)
        }
        ProjectionPolicy::Parallel => {
            Mat4::orthographic_rh(-1.0, 1.0, -1.0 / aspect, 1.0 / aspect, front, back)
        }
    }
}

/// Inverse-transpose of the upper 3x3, falling back to the matrix itself
/// when it cannot be inverted.
fn normal_matrix(model_view: Mat4) -> Mat3 {
    let linear = Mat3::from_mat4(model_view);
    if linear.determinant().abs() <= f32::EPSILON {
        linear
    } else {
        linear.inverse().transpose()
    }
}

/// Visible, uploaded records of `list` accepted by `keep`, in list order.
fn pass_records<'l>(
    list: &'l RenderList,
    keep: impl Fn(&DrawRecord) -> bool,
) -> Vec<(&'l DrawRecord, GeometryBuffers)> {
    list.records()
        .filter(|record| record.material.visible && record.material.alpha > 0.0 && keep(record))
        .filter_map(|record| list.buffers(record.slot).map(|buffers| (record, buffers)))
        .collect()
}

#[derive(Clone, Copy)]
enum Pass {
    Background,
    Scene,
    Picking,
}

/// Matrices and light sums shared by every draw of one frame.
struct FrameView {
    projection: Mat4,
    background_projection: Mat4,
    view_inverse: Mat4,
    background_view_inverse: Mat4,
    ambient: Vec3,
}

/// Borrowed pieces a frame needs while the render list is borrowed.
struct Painter<'a, B: RenderBackend> {
    backend: &'a mut B,
    textures: &'a mut TextureCache,
    settings: &'a RenderSettings,
    view: &'a FrameView,
}

impl<B: RenderBackend> Painter<'_, B> {
    fn draw(&mut self, record: &DrawRecord, buffers: GeometryBuffers, pass: Pass, index: u32) {
        let material = &record.material;
        let cull_face = material.cull_face.unwrap_or(CullFace::Back);
        let (projection, view_inverse) = match pass {
            Pass::Background => (self.view.background_projection, self.view.background_view_inverse),
            Pass::Scene | Pass::Picking => (self.view.projection, self.view.view_inverse),
        };
        let model_view = view_inverse * record.transform;

        let mut uniforms = DrawUniforms::default();
        uniforms.set_projection(projection);
        uniforms.set_model_view(model_view);
        let mut flags = DrawFlags::empty();

        if let Pass::Picking = pass {
            uniforms.set_diffuse(index_color(index), 1.0);
            uniforms.set_flags(flags);
            self.backend.draw(&DrawCall {
                mode: record.mode,
                buffers,
                use_normals: false,
                use_tex_coords: false,
                texture: None,
                uniforms,
                state: DrawState {
                    cull_face,
                    blend: false,
                    depth_test: true,
                },
            });
            return;
        }

        let texture = material.texture.as_ref().and_then(|image| {
            self.textures
                .resolve(self.backend, image, self.settings.resize_transparent_textures)
        });

        if record.lighting_enabled {
            flags |= DrawFlags::LIGHTING;
            // A texture still loading counts as present.
            let ambient = match (material.ambient, &material.texture) {
                (Some(ambient), None) => ambient * self.view.ambient,
                _ => Vec3::ZERO,
            };
            uniforms.set_ambient(ambient);
            match (material.specular, material.shininess) {
                (Some(specular), Some(shininess)) if !self.settings.ignore_shininess => {
                    uniforms.set_specular(specular, shininess.max(1.0));
                }
                _ => uniforms.set_specular(Vec3::ZERO, 1.0),
            }
            uniforms.set_normal_matrix(normal_matrix(model_view));
            if record.mode == RenderMode::Lines {
                flags |= DrawFlags::IGNORE_NORMAL;
            } else if material.back_face_normal_flip {
                flags |= DrawFlags::FLIP_NORMAL;
            }
        }

        let mut use_tex_coords = false;
        if texture.is_some() {
            flags |= DrawFlags::TEXTURE;
            match material.tex_coord_generation {
                Some(generation) => {
                    flags |= DrawFlags::GENERATED_TEX_COORDS;
                    uniforms.set_planes(generation.plane_s, generation.plane_t);
                }
                None if buffers.tex_coords.is_none() => {
                    flags |= DrawFlags::GENERATED_TEX_COORDS;
                    uniforms.set_planes(DEFAULT_PLANE_S, DEFAULT_PLANE_T);
                }
                None => use_tex_coords = true,
            }
            uniforms.set_texture_transform(material.texture_transform.unwrap_or(Mat3::IDENTITY));
            uniforms.set_diffuse(Vec3::ONE, material.alpha);
        } else {
            uniforms.set_diffuse(material.diffuse.unwrap_or(Vec3::ONE), material.alpha);
        }
        uniforms.set_flags(flags);

        let (blend, depth_test) = match pass {
            Pass::Background => (false, false),
            _ => (record.is_color_transparent() || record.is_texture_transparent(), true),
        };
        self.backend.draw(&DrawCall {
            mode: record.mode,
            buffers,
            use_normals: record.lighting_enabled && buffers.normals.is_some(),
            use_tex_coords,
            texture,
            uniforms,
            state: DrawState {
                cull_face,
                blend,
                depth_test,
            },
        });
    }
}

/// 3D view of a [`SceneGraph`] drawn through a [`RenderBackend`].
///
/// The canvas never redraws on its own: repaint requests mark it dirty and
/// ask the scheduler for a frame, and the host answers by calling
/// [`Canvas3D::on_animation_frame`].
pub struct Canvas3D<B: RenderBackend> {
    backend: B,
    settings: RenderSettings,
    view_platform: Mat4,
    repaint: Rc<RepaintRequest>,
    scene: Option<Rc<RefCell<RenderList>>>,
    pending_scene: Option<(NodeId, Option<ProgressCallback>)>,
    textures: TextureCache,
    pick_map: Option<PickMap>,
    frame_rate: FrameRateCounter,
    clock: Box<dyn Clock>,
}

impl<B: RenderBackend> Canvas3D<B> {
    /// Canvas drawn on demand; nothing is notified when it needs a frame.
    pub fn new(backend: B, settings: RenderSettings) -> Self {
        Self::with_repaint(backend, settings, RepaintRequest::detached())
    }

    pub fn with_scheduler(
        backend: B,
        settings: RenderSettings,
        scheduler: Box<dyn FrameScheduler>,
    ) -> Self {
        Self::with_repaint(backend, settings, RepaintRequest::new(scheduler))
    }

    fn with_repaint(backend: B, settings: RenderSettings, repaint: RepaintRequest) -> Self {
        let settings = settings.validate();
        log::info!(
            "Canvas3D created at {:?} ({:?}, fov {}°)",
            backend.size(),
            settings.projection,
            settings.field_of_view_degrees
        );
        Self {
            backend,
            settings,
            view_platform: default_view_platform(),
            repaint: Rc::new(repaint),
            scene: None,
            pending_scene: None,
            textures: TextureCache::new(),
            pick_map: None,
            frame_rate: FrameRateCounter::new(),
            clock: Box::new(SystemClock::new()),
        }
    }

    /// Replaces the wall clock used for frame-rate telemetry.
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// The list currently drawn, if a scene has been swapped in.
    pub fn render_list(&self) -> Option<Rc<RefCell<RenderList>>> {
        self.scene.clone()
    }

    /// Horizontal field of view, in radians.
    pub fn field_of_view(&self) -> f32 {
        self.settings.field_of_view()
    }

    pub fn set_field_of_view(&mut self, radians: f32) {
        self.settings.field_of_view_degrees = radians.to_degrees();
        self.repaint();
    }

    pub fn set_front_clip_distance(&mut self, distance: f32) {
        self.settings.front_clip_distance = distance;
        self.repaint();
    }

    pub fn set_back_clip_distance(&mut self, distance: f32) {
        self.settings.back_clip_distance = distance;
        self.repaint();
    }

    pub fn view_platform_transform(&self) -> Mat4 {
        self.view_platform
    }

    pub fn set_view_platform_transform(&mut self, transform: Mat4) {
        self.view_platform = transform;
        self.repaint();
    }

    pub fn set_projection_policy(&mut self, policy: ProjectionPolicy) {
        self.settings.projection = policy;
        self.repaint();
    }

    /// Turns specular highlights off for every shape.
    pub fn set_ignore_shininess(&mut self, ignore: bool) {
        self.settings.ignore_shininess = ignore;
        self.repaint();
    }

    /// Asks for a frame. Calls before that frame runs fold into it.
    pub fn repaint(&self) {
        self.repaint.request();
    }

    pub fn needs_repaint(&self) -> bool {
        self.repaint.is_needed()
    }

    /// Drops a pending repaint; the next animation frame draws nothing.
    pub fn cancel_repaint(&self) {
        self.repaint.cancel();
    }

    /// Schedules `root` to replace the drawn scene on the next frame.
    /// A later call before that frame supersedes this one.
    pub fn set_scene(&mut self, root: NodeId, progress: Option<ProgressCallback>) {
        if self.pending_scene.is_some() {
            log::debug!("Pending scene superseded by {:?}", root);
        }
        self.pending_scene = Some((root, progress));
        self.repaint();
    }

    /// Animation-frame callback. Swaps in a pending scene, then draws if a
    /// repaint was requested. Returns whether a frame was drawn.
    pub fn on_animation_frame(&mut self, graph: &SceneGraph) -> Result<bool, RenderError> {
        if let Some((root, progress)) = self.pending_scene.take() {
            self.swap_scene(graph, root, progress);
        }
        if !self.repaint.take() {
            return Ok(false);
        }
        self.sync_buffers()?;
        self.draw_scene(RenderTarget::Canvas)?;
        self.frame_rate.frame_drawn(self.clock.now_millis());
        self.pick_map = None;
        if !self.textures.is_loading_completed() {
            self.repaint.request();
        }
        Ok(true)
    }

    fn swap_scene(&mut self, graph: &SceneGraph, root: NodeId, progress: Option<ProgressCallback>) {
        if !graph.contains(root) {
            log::warn!("Scene root {:?} is not in the graph", root);
            return;
        }
        let list = RenderList::build(graph, root, Rc::clone(&self.repaint), progress);
        if let Some(old) = self.scene.replace(Rc::clone(&list)) {
            let buffers = old.borrow_mut().detach(graph);
            self.delete_buffers(buffers);
        }
        self.pick_map = None;
        self.repaint.request();
        let callback = list.borrow_mut().take_progress();
        if let Some(mut callback) = callback {
            callback(BuildProgress {
                stage: LoadStage::BindingModel,
                fraction: 1.0,
            });
        }
    }

    fn delete_buffers(&mut self, buffers: Vec<GeometryBuffers>) {
        for geometry in buffers {
            for buffer in geometry.ids() {
                self.backend.delete_buffer(buffer);
            }
        }
    }

    /// Deletes buffers released by patches and uploads new geometry.
    fn sync_buffers(&mut self) -> Result<(), RenderError> {
        let Some(list) = self.scene.clone() else {
            return Ok(());
        };
        let released = list.borrow_mut().take_released_buffers();
        self.delete_buffers(released);

        let pending = list.borrow().pending_uploads();
        for (slot, geometry) in pending {
            let positions = self.backend.create_buffer(&geometry.expanded_positions(), 3)?;
            let normals = match geometry.expanded_normals() {
                Some(normals) => Some(self.backend.create_buffer(&normals, 3)?),
                None => None,
            };
            let tex_coords = match geometry.expanded_texture_coordinates() {
                Some(tex_coords) => Some(self.backend.create_buffer(&tex_coords, 2)?),
                None => None,
            };
            list.borrow_mut().set_buffers(
                slot,
                GeometryBuffers {
                    positions,
                    normals,
                    tex_coords,
                    vertex_count: geometry.vertex_count() as u32,
                },
            );
        }
        Ok(())
    }

    fn aspect(&self) -> f32 {
        let (width, height) = self.backend.size();
        width.max(1) as f32 / height.max(1) as f32
    }

    fn frame_view(&self, lights_ambient: Vec3) -> FrameView {
        let aspect = self.aspect();
        let fov = self.settings.field_of_view();
        let projection = projection_matrix(
            self.settings.projection,
            fov,
            aspect,
            self.settings.front_clip_distance,
            self.settings.back_clip_distance,
        );
        let background_projection = projection_matrix(
            self.settings.projection,
            fov,
            aspect,
            BACKGROUND_FRONT_CLIP,
            BACKGROUND_BACK_CLIP,
        );
        let mut centered = self.view_platform;
        centered.w_axis = Vec4::W;
        FrameView {
            projection,
            background_projection,
            view_inverse: self.view_platform.inverse(),
            background_view_inverse: centered.inverse(),
            ambient: lights_ambient,
        }
    }

    /// Background pass, depth clear, opaque pass, then the transparent pass.
    fn draw_scene(&mut self, target: RenderTarget) -> Result<Option<Readback>, RenderError> {
        self.backend.begin_frame(target, self.settings.clear_color)?;
        let Some(list) = self.scene.clone() else {
            return self.backend.end_frame();
        };
        let list = list.borrow();

        let frame_lights = FrameLights::collect(list.lights(), self.view_platform.inverse());
        self.backend.set_lights(&frame_lights.uniform);
        let view = self.frame_view(frame_lights.ambient);
        let mut painter = Painter {
            backend: &mut self.backend,
            textures: &mut self.textures,
            settings: &self.settings,
            view: &view,
        };

        for (record, buffers) in pass_records(&list, |r| r.background) {
            painter.draw(record, buffers, Pass::Background, 0);
        }
        painter.backend.clear_depth();

        let opaque = pass_records(&list, |r| {
            !r.background && !r.is_texture_transparent() && !r.is_color_transparent()
        });
        for (record, buffers) in opaque {
            painter.draw(record, buffers, Pass::Scene, 0);
        }

        // Transparent textures first, then translucent colors. No depth sort.
        let textured = pass_records(&list, |r| !r.background && r.is_texture_transparent());
        let translucent = pass_records(&list, |r| {
            !r.background && !r.is_texture_transparent() && r.is_color_transparent()
        });
        for (record, buffers) in textured.into_iter().chain(translucent) {
            painter.draw(record, buffers, Pass::Scene, 0);
        }

        self.backend.end_frame()
    }

    fn draw_picking(&mut self) -> Result<Option<PickMap>, RenderError> {
        let (width, height) = self.backend.size();
        let target = RenderTarget::Picking {
            width: pick_buffer_size(width),
            height: pick_buffer_size(height),
        };
        self.backend.begin_frame(target, PICKING_CLEAR)?;
        if let Some(list) = self.scene.clone() {
            let list = list.borrow();
            let view = self.frame_view(Vec3::ZERO);
            let mut painter = Painter {
                backend: &mut self.backend,
                textures: &mut self.textures,
                settings: &self.settings,
                view: &view,
            };
            for (index, record) in list.records().enumerate() {
                let Some(index) = pick_index(index) else {
                    log::debug!("Records from {} on cannot be picked", NO_HIT);
                    break;
                };
                if record.background
                    || !record.pickable
                    || !record.material.visible
                    || record.is_color_transparent()
                {
                    continue;
                }
                if let Some(buffers) = list.buffers(record.slot) {
                    painter.draw(record, buffers, Pass::Picking, index);
                }
            }
        }
        let readback = self.backend.end_frame()?;
        Ok(readback.map(|readback| PickMap::new(readback, (width, height))))
    }

    /// Node owning the closest shape drawn at canvas pixel `(x, y)`,
    /// measured from the top-left corner.
    pub fn get_closest_shape_at(&mut self, x: f32, y: f32) -> Result<Option<NodeId>, RenderError> {
        let Some(list) = self.scene.clone() else {
            return Ok(None);
        };
        let (width, height) = self.backend.size();
        if !(x >= 0.0 && x < width as f32 && y >= 0.0 && y < height as f32) {
            return Ok(None);
        }
        if self.pick_map.is_none() || self.repaint.is_needed() {
            self.sync_buffers()?;
            self.pick_map = self.draw_picking()?;
        }
        let Some(index) = self.pick_map.as_ref().and_then(|map| map.index_at(x, y)) else {
            return Ok(None);
        };
        let list = list.borrow();
        Ok(list.record_at(index as usize).map(|record| record.node))
    }

    /// Draws the current scene offscreen and returns it top-down.
    pub fn get_image(&mut self) -> Result<RgbaImage, RenderError> {
        self.sync_buffers()?;
        self.draw_scene(RenderTarget::Image)?
            .and_then(Readback::into_image)
            .ok_or_else(|| RenderError::Readback("offscreen frame returned no pixels".into()))
    }

    pub fn frames_per_second(&self) -> f32 {
        self.frame_rate.frames_per_second()
    }

    /// True once the pending scene is swapped in and every texture it
    /// references has finished loading.
    pub fn is_loading_completed(&self) -> bool {
        self.pending_scene.is_none() && self.textures.is_loading_completed()
    }

    /// Releases the scene, its buffers and textures, and the picking
    /// target. The canvas stays usable and draws empty frames.
    pub fn clear(&mut self, graph: &SceneGraph) {
        self.pending_scene = None;
        if let Some(list) = self.scene.take() {
            let buffers = list.borrow_mut().detach(graph);
            self.delete_buffers(buffers);
        }
        self.textures.clear(&mut self.backend);
        self.backend.release_picking_target();
        self.pick_map = None;
        log::info!("Canvas3D resources released");
        self.repaint();
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if (width, height) == self.backend.size() {
            return;
        }
        self.backend.resize(width, height);
        self.pick_map = None;
        self.repaint();
    }
}
