use thiserror::Error;

use crate::scene::SceneError;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to acquire a GPU context: {0}")]
    Context(String),
    #[error("shader program failed to build: {0}")]
    Shader(String),
    #[error("surface error: {0}")]
    Surface(#[from] wgpu::SurfaceError),
    #[error("failed to read back frame: {0}")]
    Readback(String),
    #[error("buffer upload failed: {0}")]
    Buffer(String),
    #[error("texture upload failed: {0}")]
    Texture(String),
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u32 },
    #[error("frame not started")]
    NoFrame,
    #[error(transparent)]
    Scene(#[from] SceneError),
}
