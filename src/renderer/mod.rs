pub mod backend;
pub mod canvas;
pub mod error;
pub mod gpu;
pub mod lights;
pub mod picking;
pub mod render_list;
pub mod schedule;
pub mod shading;
pub mod software;
pub mod texture_cache;
pub mod uniforms;

pub use backend::{
    BufferId, DrawCall, DrawState, GeometryBuffers, Readback, RenderBackend, RenderMode,
    RenderTarget, TextureId, TextureSampling,
};
pub use canvas::{default_view_platform, projection_matrix, Canvas3D};
pub use error::RenderError;
pub use gpu::WgpuBackend;
pub use lights::{FrameLights, LightsUniform, MAX_DIRECTIONAL_LIGHTS};
pub use picking::{PickMap, NO_HIT};
pub use render_list::{
    BuildProgress, DrawRecord, LightRecord, LoadStage, ProgressCallback, RenderList,
    ResolvedAppearance,
};
pub use schedule::{FrameScheduler, RepaintRequest};
pub use software::{SoftwareBackend, SoftwareStats};
pub use texture_cache::TextureCache;
pub use uniforms::{DrawFlags, DrawUniforms};
