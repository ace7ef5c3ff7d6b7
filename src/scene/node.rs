use std::any::Any;
use std::cell::Cell;
use std::sync::Arc;

use glam::{Mat4, Vec3};

use super::bounds::BoundingBox;
use super::geometry::GeometryArray;

slotmap::new_key_type! {
    /// Stable handle of a node in a [`SceneGraph`](super::SceneGraph).
    pub struct NodeId;
    pub struct AppearanceId;
}

bitflags::bitflags! {
    /// Mutations a node permits once it is displayed. Granting only adds bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        const ALLOW_CHILDREN_EXTEND = 1;
        const ALLOW_TRANSFORM_WRITE = 2;
        const ALLOW_GEOMETRY_WRITE = 4;
    }
}

pub type UserData = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Default)]
pub struct Group {
    pub(crate) children: Vec<NodeId>,
}

#[derive(Debug)]
pub struct TransformGroup {
    pub(crate) children: Vec<NodeId>,
    pub(crate) transform: Mat4,
}

#[derive(Debug)]
pub struct Link {
    pub(crate) shared_group: NodeId,
}

#[derive(Debug)]
pub struct Shape {
    pub(crate) appearance: Option<AppearanceId>,
    pub(crate) geometries: Vec<Arc<GeometryArray>>,
    pub(crate) pickable: bool,
    pub(crate) bounds: Cell<Option<BoundingBox>>,
}

impl Shape {
    pub fn appearance(&self) -> Option<AppearanceId> {
        self.appearance
    }

    pub fn geometries(&self) -> &[Arc<GeometryArray>] {
        &self.geometries
    }

    pub fn is_pickable(&self) -> bool {
        self.pickable
    }

    /// Union of the geometry bounds, recomputed after geometry changes.
    pub fn bounds(&self) -> BoundingBox {
        if let Some(bounds) = self.bounds.get() {
            return bounds;
        }
        let mut bounds = BoundingBox::empty();
        for geometry in &self.geometries {
            bounds.combine(&geometry.bounds());
        }
        self.bounds.set(Some(bounds));
        bounds
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LightKind {
    Ambient,
    Directional { direction: Vec3 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Light {
    pub color: Vec3,
    pub kind: LightKind,
}

#[derive(Debug)]
pub struct Background {
    pub(crate) geometry: NodeId,
}

#[derive(Debug)]
pub enum NodeKind {
    Group(Group),
    TransformGroup(TransformGroup),
    /// Only reachable through [`Link`]s.
    SharedGroup(Group),
    Link(Link),
    Shape(Shape),
    Light(Light),
    Background(Background),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Group(_) => "group",
            NodeKind::TransformGroup(_) => "transform group",
            NodeKind::SharedGroup(_) => "shared group",
            NodeKind::Link(_) => "link",
            NodeKind::Shape(_) => "shape",
            NodeKind::Light(_) => "light",
            NodeKind::Background(_) => "background",
        }
    }

    pub fn children(&self) -> Option<&[NodeId]> {
        match self {
            NodeKind::Group(group) | NodeKind::SharedGroup(group) => Some(&group.children),
            NodeKind::TransformGroup(group) => Some(&group.children),
            NodeKind::Link(_) | NodeKind::Shape(_) | NodeKind::Light(_) | NodeKind::Background(_) => {
                None
            }
        }
    }

    pub(crate) fn children_mut(&mut self) -> Option<&mut Vec<NodeId>> {
        match self {
            NodeKind::Group(group) | NodeKind::SharedGroup(group) => Some(&mut group.children),
            NodeKind::TransformGroup(group) => Some(&mut group.children),
            NodeKind::Link(_) | NodeKind::Shape(_) | NodeKind::Light(_) | NodeKind::Background(_) => {
                None
            }
        }
    }
}

pub struct Node {
    pub(crate) name: Option<String>,
    pub(crate) user_data: Option<UserData>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) capabilities: Capabilities,
    pub(crate) kind: NodeKind,
    /// Number of render-list instances currently displaying this node.
    pub(crate) live: Cell<u32>,
}

impl Node {
    pub(crate) fn new(kind: NodeKind, capabilities: Capabilities) -> Self {
        Self {
            name: None,
            user_data: None,
            parent: None,
            capabilities,
            kind,
            live: Cell::new(0),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn user_data(&self) -> Option<&UserData> {
        self.user_data.as_ref()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_live(&self) -> bool {
        self.live.get() > 0
    }

    pub(crate) fn acquire(&self) {
        self.live.set(self.live.get() + 1);
    }

    pub(crate) fn release(&self) {
        self.live.set(self.live.get().saturating_sub(1));
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("capabilities", &self.capabilities)
            .field("kind", &self.kind)
            .field("live", &self.live.get())
            .finish()
    }
}
