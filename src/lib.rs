pub mod app;
pub mod demo_scenes;
pub mod renderer;
pub mod scene;
pub mod settings;
pub mod time;

use app::App;
use winit::event_loop::EventLoop;

pub use renderer::{Canvas3D, RenderBackend, RenderError, SoftwareBackend, WgpuBackend};
pub use scene::{SceneError, SceneGraph};
pub use settings::RenderSettings;

pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

/// Opens the demo window and runs until it closes.
pub fn run() -> Result<(), winit::error::EventLoopError> {
    init_logging();

    log::info!("Starting canvas3d viewer");

    let event_loop = EventLoop::new()?;
    let mut app = App::new(RenderSettings::load());

    let result = event_loop.run_app(&mut app);

    if let Err(ref err) = result {
        log::error!("Application error: {}", err);
    }

    log::info!("Application shutdown complete");

    result
}
