// scene/mod.rs

pub mod appearance;
pub mod bounds;
pub mod error;
pub mod events;
pub mod geometry;
pub mod graph;
pub mod image;
pub mod node;
pub mod shapes;
pub mod transform;

pub use appearance::{Appearance, AppearanceChange, CullFace, TexCoordGeneration};
pub use bounds::BoundingBox;
pub use error::SceneError;
pub use events::{Property, SceneEvent, SceneListener, Subject, SubscriptionId};
pub use geometry::{GeometryArray, GeometryId, GeometryKind};
pub use graph::SceneGraph;
pub use image::{ImageStatus, TextureImage, TextureImageId};
pub use node::{AppearanceId, Capabilities, Light, LightKind, Node, NodeId, NodeKind, Shape};
pub use transform::Transform;
