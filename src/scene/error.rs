use thiserror::Error;

use super::node::{AppearanceId, Capabilities, NodeId};

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("node {0:?} does not exist")]
    UnknownNode(NodeId),
    #[error("appearance {0:?} does not exist")]
    UnknownAppearance(AppearanceId),
    #[error("node {node:?} is not a {expected}")]
    WrongKind {
        node: NodeId,
        expected: &'static str,
    },
    #[error("capability {capability:?} was not granted on node {node:?}")]
    CapabilityNotSet {
        node: NodeId,
        capability: Capabilities,
    },
    #[error("node {0:?} is displayed by a renderer and can't be reconfigured")]
    NodeLive(NodeId),
    #[error("node {0:?} already has a parent")]
    AlreadyParented(NodeId),
    #[error("shared group {0:?} can only be reached through links")]
    SharedGroupAsChild(NodeId),
    #[error("attaching {child:?} under {parent:?} would create a cycle through a shared group")]
    Cycle { parent: NodeId, child: NodeId },
    #[error("child index {index} out of bounds for {len} children of {node:?}")]
    ChildIndexOutOfBounds {
        node: NodeId,
        index: usize,
        len: usize,
    },
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}
