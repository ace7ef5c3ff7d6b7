// app.rs
use std::sync::Arc;

use glam::{Mat4, Vec3};
use winit::{
    application::ApplicationHandler,
    dpi::{PhysicalPosition, PhysicalSize},
    event::*,
    event_loop::ActiveEventLoop,
    keyboard::{Key, NamedKey},
    window::{Window, WindowId},
};

use crate::demo_scenes::{build_demo_scene, DemoScene};
use crate::renderer::{BuildProgress, Canvas3D, FrameScheduler, WgpuBackend};
use crate::scene::transform::orbit_view_platform;
use crate::scene::SceneGraph;
use crate::settings::RenderSettings;

const ORBIT_STEP: f32 = 0.08;
const ORBIT_DISTANCE: f32 = 5.0;
const CAROUSEL_SPEED: f32 = 0.4;

/// Answers repaint requests with a redraw of the window.
struct WindowScheduler {
    window: Arc<Window>,
}

impl FrameScheduler for WindowScheduler {
    fn request_frame(&self) {
        self.window.request_redraw();
    }
}

#[derive(Clone, Copy, Debug)]
struct Orbit {
    yaw: f32,
    pitch: f32,
}

impl Orbit {
    fn view_platform(&self) -> Mat4 {
        orbit_view_platform(Vec3::ZERO, ORBIT_DISTANCE, self.yaw, self.pitch)
    }
}

pub struct App {
    settings: RenderSettings,
    window: Option<Arc<Window>>,
    canvas: Option<Canvas3D<WgpuBackend>>,
    graph: SceneGraph,
    demo: Option<DemoScene>,
    orbit: Orbit,
    cursor: PhysicalPosition<f64>,
    started: instant::Instant,
}

impl App {
    pub fn new(settings: RenderSettings) -> Self {
        Self {
            settings,
            window: None,
            canvas: None,
            graph: SceneGraph::new(),
            demo: None,
            orbit: Orbit {
                yaw: 0.6,
                pitch: 0.35,
            },
            cursor: PhysicalPosition::new(0.0, 0.0),
            started: instant::Instant::now(),
        }
    }

    fn orbit_by(&mut self, yaw: f32, pitch: f32) {
        self.orbit.yaw += yaw;
        self.orbit.pitch = (self.orbit.pitch + pitch).clamp(-1.4, 1.4);
        let view_platform = self.orbit.view_platform();
        if let Some(canvas) = self.canvas.as_mut() {
            canvas.set_view_platform_transform(view_platform);
        }
    }

    fn pick(&mut self) {
        let Some(canvas) = self.canvas.as_mut() else {
            return;
        };
        match canvas.get_closest_shape_at(self.cursor.x as f32, self.cursor.y as f32) {
            Ok(Some(node)) => {
                let name = self
                    .graph
                    .node(node)
                    .and_then(|node| node.name())
                    .unwrap_or("unnamed shape");
                println!("Picked {name}");
            }
            Ok(None) => println!("Picked nothing"),
            Err(err) => log::error!("Picking failed: {}", err),
        }
    }

    fn spin_carousel(&mut self) {
        let Some(demo) = &self.demo else {
            return;
        };
        let angle = self.started.elapsed().as_secs_f32() * CAROUSEL_SPEED;
        if let Err(err) = self
            .graph
            .set_transform(demo.carousel, Mat4::from_rotation_y(angle))
        {
            log::warn!("Carousel update rejected: {}", err);
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let resolution = &self.settings.resolution;
        let attributes = Window::default_attributes()
            .with_title("canvas3d")
            .with_inner_size(PhysicalSize::new(resolution.width, resolution.height));
        let window = match event_loop.create_window(attributes) {
            Ok(window) => Arc::new(window),
            Err(err) => {
                log::error!("Failed to create window: {}", err);
                event_loop.exit();
                return;
            }
        };

        let backend = match WgpuBackend::new_windowed(Arc::clone(&window), &self.settings) {
            Ok(backend) => backend,
            Err(err) => {
                log::error!("Failed to initialize renderer: {}", err);
                event_loop.exit();
                return;
            }
        };
        let scheduler = Box::new(WindowScheduler {
            window: Arc::clone(&window),
        });
        let mut canvas = Canvas3D::with_scheduler(backend, self.settings.clone(), scheduler);
        canvas.set_view_platform_transform(self.orbit.view_platform());

        match build_demo_scene(&mut self.graph) {
            Ok(demo) => {
                canvas.set_scene(
                    demo.root,
                    Some(Box::new(|progress: BuildProgress| {
                        log::info!("Loading scene: {:.0}%", progress.fraction * 100.0);
                    })),
                );
                self.demo = Some(demo);
            }
            Err(err) => log::error!("Failed to build demo scene: {}", err),
        }

        self.window = Some(window);
        self.canvas = Some(canvas);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        if self.window.as_ref().map(|w| w.id()) != Some(id) {
            return;
        }

        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                if let Some(canvas) = self.canvas.as_mut() {
                    canvas.clear(&self.graph);
                }
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(canvas) = self.canvas.as_mut() {
                    canvas.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                self.spin_carousel();
                let Some(canvas) = self.canvas.as_mut() else {
                    return;
                };
                match canvas.on_animation_frame(&self.graph) {
                    Ok(true) => log::trace!("Frame drawn, {} fps", canvas.frames_per_second()),
                    Ok(false) => {}
                    Err(err) => log::error!("Frame failed: {}", err),
                }
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.cursor = position;
            }
            WindowEvent::MouseInput {
                state: ElementState::Pressed,
                button: MouseButton::Left,
                ..
            } => self.pick(),
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key: Key::Named(key),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => match key {
                NamedKey::Escape => event_loop.exit(),
                NamedKey::ArrowLeft => self.orbit_by(-ORBIT_STEP, 0.0),
                NamedKey::ArrowRight => self.orbit_by(ORBIT_STEP, 0.0),
                NamedKey::ArrowUp => self.orbit_by(0.0, ORBIT_STEP),
                NamedKey::ArrowDown => self.orbit_by(0.0, -ORBIT_STEP),
                _ => {}
            },
            _ => {}
        }
    }
}
