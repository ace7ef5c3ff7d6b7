use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use glam::{Mat4, Vec3};
use slotmap::SlotMap;

use super::appearance::{Appearance, AppearanceChange};
use super::bounds::BoundingBox;
use super::error::SceneError;
use super::events::{Property, SceneEvent, SceneListener, Subject, SubscriptionId, Subscriptions};
use super::geometry::GeometryArray;
use super::node::{
    AppearanceId, Background, Capabilities, Group, Light, LightKind, Link, Node, NodeId, NodeKind,
    Shape, TransformGroup, UserData,
};

/// Arena owning every node and appearance of a scene.
///
/// Nodes refer to each other by [`NodeId`]; a [`Link`] stores the id of its
/// shared group, which lets one subtree appear under several parents while
/// the arena keeps the only owning copy.
#[derive(Default)]
pub struct SceneGraph {
    nodes: SlotMap<NodeId, Node>,
    appearances: SlotMap<AppearanceId, Appearance>,
    subscriptions: RefCell<Subscriptions>,
}

impl SceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_group(&mut self, capabilities: Capabilities) -> NodeId {
        self.nodes
            .insert(Node::new(NodeKind::Group(Group::default()), capabilities))
    }

    pub fn create_transform_group(&mut self, transform: Mat4, capabilities: Capabilities) -> NodeId {
        self.nodes.insert(Node::new(
            NodeKind::TransformGroup(TransformGroup {
                children: Vec::new(),
                transform,
            }),
            capabilities,
        ))
    }

    pub fn create_shared_group(&mut self, capabilities: Capabilities) -> NodeId {
        self.nodes
            .insert(Node::new(NodeKind::SharedGroup(Group::default()), capabilities))
    }

    pub fn create_link(&mut self, shared_group: NodeId) -> Result<NodeId, SceneError> {
        self.expect_shared_group(shared_group)?;
        Ok(self.nodes.insert(Node::new(
            NodeKind::Link(Link { shared_group }),
            Capabilities::empty(),
        )))
    }

    pub fn create_shape(
        &mut self,
        appearance: Option<AppearanceId>,
        capabilities: Capabilities,
    ) -> Result<NodeId, SceneError> {
        if let Some(appearance) = appearance {
            self.appearance(appearance)
                .ok_or(SceneError::UnknownAppearance(appearance))?;
        }
        Ok(self.nodes.insert(Node::new(
            NodeKind::Shape(Shape {
                appearance,
                geometries: Vec::new(),
                pickable: true,
                bounds: Cell::new(None),
            }),
            capabilities,
        )))
    }

    pub fn create_ambient_light(&mut self, color: Vec3) -> NodeId {
        self.nodes.insert(Node::new(
            NodeKind::Light(Light {
                color,
                kind: LightKind::Ambient,
            }),
            Capabilities::empty(),
        ))
    }

    pub fn create_directional_light(&mut self, color: Vec3, direction: Vec3) -> NodeId {
        self.nodes.insert(Node::new(
            NodeKind::Light(Light {
                color,
                kind: LightKind::Directional { direction },
            }),
            Capabilities::empty(),
        ))
    }

    /// Wraps `geometry`, an unparented group, as camera-centered background.
    pub fn create_background(&mut self, geometry: NodeId) -> Result<NodeId, SceneError> {
        let node = self.get(geometry)?;
        if !matches!(node.kind, NodeKind::Group(_) | NodeKind::TransformGroup(_)) {
            return Err(SceneError::WrongKind {
                node: geometry,
                expected: "group",
            });
        }
        if node.parent.is_some() {
            return Err(SceneError::AlreadyParented(geometry));
        }
        let background = self.nodes.insert(Node::new(
            NodeKind::Background(Background { geometry }),
            Capabilities::empty(),
        ));
        self.get_mut(geometry)?.parent = Some(background);
        Ok(background)
    }

    pub fn create_appearance(&mut self, appearance: Appearance) -> AppearanceId {
        self.appearances.insert(appearance)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn appearance(&self, id: AppearanceId) -> Option<&Appearance> {
        self.appearances.get(id)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|node| node.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(id)
            .and_then(|node| node.kind.children())
            .unwrap_or(&[])
    }

    pub fn transform(&self, id: NodeId) -> Option<Mat4> {
        match &self.nodes.get(id)?.kind {
            NodeKind::TransformGroup(group) => Some(group.transform),
            _ => None,
        }
    }

    pub fn shape(&self, id: NodeId) -> Option<&Shape> {
        match &self.nodes.get(id)?.kind {
            NodeKind::Shape(shape) => Some(shape),
            _ => None,
        }
    }

    pub fn shape_bounds(&self, id: NodeId) -> Option<BoundingBox> {
        self.shape(id).map(Shape::bounds)
    }

    pub fn set_name(&mut self, id: NodeId, name: impl Into<String>) -> Result<(), SceneError> {
        self.get_mut(id)?.name = Some(name.into());
        Ok(())
    }

    pub fn set_user_data(&mut self, id: NodeId, data: UserData) -> Result<(), SceneError> {
        self.get_mut(id)?.user_data = Some(data);
        Ok(())
    }

    /// Adds capabilities to a node that no renderer displays yet.
    pub fn grant_capabilities(
        &mut self,
        id: NodeId,
        capabilities: Capabilities,
    ) -> Result<(), SceneError> {
        let node = self.get_mut(id)?;
        if node.is_live() && !node.capabilities.contains(capabilities) {
            return Err(SceneError::NodeLive(id));
        }
        node.capabilities |= capabilities;
        Ok(())
    }

    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), SceneError> {
        let index = self.children(parent).len();
        self.insert_child(parent, index, child)
    }

    pub fn insert_child(
        &mut self,
        parent: NodeId,
        index: usize,
        child: NodeId,
    ) -> Result<(), SceneError> {
        let len = self.editable_children(parent)?.len();
        if index > len {
            return Err(SceneError::ChildIndexOutOfBounds {
                node: parent,
                index,
                len,
            });
        }
        let child_node = self.get(child)?;
        if matches!(child_node.kind, NodeKind::SharedGroup(_)) {
            return Err(SceneError::SharedGroupAsChild(child));
        }
        if child_node.parent.is_some() {
            return Err(SceneError::AlreadyParented(child));
        }
        self.check_acyclic(parent, child)?;

        if let Some(children) = self.get_mut(parent)?.kind.children_mut() {
            children.insert(index, child);
        }
        self.get_mut(child)?.parent = Some(parent);
        log::trace!("Inserted {:?} under {:?} at {}", child, parent, index);

        if self.notifies_children(parent) {
            self.notify(SceneEvent::ChildAdded {
                parent,
                child,
                index,
            });
        }
        Ok(())
    }

    pub fn remove_child_at(&mut self, parent: NodeId, index: usize) -> Result<NodeId, SceneError> {
        let children = self.editable_children(parent)?;
        let len = children.len();
        let child = *children.get(index).ok_or(SceneError::ChildIndexOutOfBounds {
            node: parent,
            index,
            len,
        })?;
        if let Some(children) = self.get_mut(parent)?.kind.children_mut() {
            children.remove(index);
        }
        self.get_mut(child)?.parent = None;
        log::trace!("Removed {:?} from {:?} at {}", child, parent, index);

        if self.notifies_children(parent) {
            self.notify(SceneEvent::ChildRemoved {
                parent,
                child,
                index,
            });
        }
        Ok(child)
    }

    /// Returns false when `child` is not a child of `parent`.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<bool, SceneError> {
        match self.editable_children(parent)?.iter().position(|&c| c == child) {
            Some(index) => self.remove_child_at(parent, index).map(|_| true),
            None => Ok(false),
        }
    }

    pub fn remove_all_children(&mut self, parent: NodeId) -> Result<(), SceneError> {
        for index in (0..self.editable_children(parent)?.len()).rev() {
            self.remove_child_at(parent, index)?;
        }
        Ok(())
    }

    /// Removes `node` from its parent group, if any.
    pub fn detach(&mut self, node: NodeId) -> Result<bool, SceneError> {
        match self.get(node)?.parent {
            Some(parent) if self.get(parent)?.kind.children().is_some() => {
                self.remove_child(parent, node)
            }
            _ => Ok(false),
        }
    }

    /// Frees a detached subtree. Shared groups reached through links are not
    /// owned by the links and stay in the arena.
    pub fn delete_subtree(&mut self, root: NodeId) -> Result<(), SceneError> {
        if self.get(root)?.parent.is_some() {
            return Err(SceneError::AlreadyParented(root));
        }
        let mut doomed = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = self.get(id)?;
            if node.is_live() {
                return Err(SceneError::NodeLive(id));
            }
            doomed.push(id);
            match &node.kind {
                NodeKind::Group(group) | NodeKind::SharedGroup(group) => {
                    stack.extend(group.children.iter().copied())
                }
                NodeKind::TransformGroup(group) => stack.extend(group.children.iter().copied()),
                NodeKind::Background(background) => stack.push(background.geometry),
                NodeKind::Link(_) | NodeKind::Shape(_) | NodeKind::Light(_) => {}
            }
        }
        let mut subscriptions = self.subscriptions.borrow_mut();
        for id in doomed {
            subscriptions.remove_subject(Subject::Node(id));
            self.nodes.remove(id);
        }
        Ok(())
    }

    pub fn set_transform(&mut self, id: NodeId, transform: Mat4) -> Result<(), SceneError> {
        let node = self.get_mut(id)?;
        if !node.capabilities.contains(Capabilities::ALLOW_TRANSFORM_WRITE) {
            return Err(SceneError::CapabilityNotSet {
                node: id,
                capability: Capabilities::ALLOW_TRANSFORM_WRITE,
            });
        }
        let NodeKind::TransformGroup(group) = &mut node.kind else {
            return Err(SceneError::WrongKind {
                node: id,
                expected: "transform group",
            });
        };
        if group.transform == transform {
            return Ok(());
        }
        let old = std::mem::replace(&mut group.transform, transform);
        self.notify(SceneEvent::TransformChanged {
            node: id,
            old,
            new: transform,
        });
        Ok(())
    }

    /// Retargets a link. Fails if the shared group contains the link.
    pub fn set_link_target(&mut self, link: NodeId, shared_group: NodeId) -> Result<(), SceneError> {
        self.expect_shared_group(shared_group)?;
        let node = self.get(link)?;
        if node.is_live() {
            return Err(SceneError::NodeLive(link));
        }
        if !matches!(node.kind, NodeKind::Link(_)) {
            return Err(SceneError::WrongKind {
                node: link,
                expected: "link",
            });
        }
        self.check_acyclic(link, shared_group)?;
        if let NodeKind::Link(target) = &mut self.get_mut(link)?.kind {
            target.shared_group = shared_group;
        }
        Ok(())
    }

    pub fn add_geometry(
        &mut self,
        shape: NodeId,
        geometry: Arc<GeometryArray>,
    ) -> Result<(), SceneError> {
        let notify = self.check_geometry_write(shape)?;
        if let NodeKind::Shape(data) = &mut self.get_mut(shape)?.kind {
            data.geometries.push(Arc::clone(&geometry));
            data.bounds.set(None);
        }
        if notify {
            self.notify(SceneEvent::GeometryAdded { shape, geometry });
        }
        Ok(())
    }

    /// Removes `geometry` by identity; false when the shape doesn't hold it.
    pub fn remove_geometry(
        &mut self,
        shape: NodeId,
        geometry: &Arc<GeometryArray>,
    ) -> Result<bool, SceneError> {
        let notify = self.check_geometry_write(shape)?;
        let mut removed = None;
        if let NodeKind::Shape(data) = &mut self.get_mut(shape)?.kind {
            if let Some(index) = data.geometries.iter().position(|g| Arc::ptr_eq(g, geometry)) {
                removed = Some(data.geometries.remove(index));
                data.bounds.set(None);
            }
        }
        match removed {
            Some(geometry) => {
                if notify {
                    self.notify(SceneEvent::GeometryRemoved { shape, geometry });
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn set_appearance(
        &mut self,
        shape: NodeId,
        appearance: Option<AppearanceId>,
    ) -> Result<(), SceneError> {
        if let Some(appearance) = appearance {
            self.appearance(appearance)
                .ok_or(SceneError::UnknownAppearance(appearance))?;
        }
        let node = self.get_mut(shape)?;
        if node.is_live() {
            return Err(SceneError::NodeLive(shape));
        }
        match &mut node.kind {
            NodeKind::Shape(data) => {
                data.appearance = appearance;
                Ok(())
            }
            _ => Err(SceneError::WrongKind {
                node: shape,
                expected: "shape",
            }),
        }
    }

    pub fn set_pickable(&mut self, shape: NodeId, pickable: bool) -> Result<(), SceneError> {
        match &mut self.get_mut(shape)?.kind {
            NodeKind::Shape(data) => data.pickable = pickable,
            _ => {
                return Err(SceneError::WrongKind {
                    node: shape,
                    expected: "shape",
                })
            }
        }
        self.notify(SceneEvent::PickableChanged { shape, pickable });
        Ok(())
    }

    pub fn light(&self, id: NodeId) -> Option<&Light> {
        match &self.nodes.get(id)?.kind {
            NodeKind::Light(light) => Some(light),
            _ => None,
        }
    }

    pub fn set_light_color(&mut self, light: NodeId, color: Vec3) -> Result<(), SceneError> {
        self.light_mut(light)?.color = color;
        self.notify(SceneEvent::LightColorChanged { light, color });
        Ok(())
    }

    pub fn set_light_direction(&mut self, light: NodeId, direction: Vec3) -> Result<(), SceneError> {
        match &mut self.light_mut(light)?.kind {
            LightKind::Directional { direction: current } => *current = direction,
            LightKind::Ambient => {
                return Err(SceneError::WrongKind {
                    node: light,
                    expected: "directional light",
                })
            }
        }
        self.notify(SceneEvent::LightDirectionChanged { light, direction });
        Ok(())
    }

    pub fn update_appearance(
        &mut self,
        id: AppearanceId,
        change: AppearanceChange,
    ) -> Result<(), SceneError> {
        let appearance = self
            .appearances
            .get_mut(id)
            .ok_or(SceneError::UnknownAppearance(id))?;
        if appearance.apply(&change) {
            self.notify(SceneEvent::AppearanceChanged {
                appearance: id,
                change,
            });
        }
        Ok(())
    }

    pub fn subscribe(
        &self,
        subject: Subject,
        property: Option<Property>,
        listener: Rc<dyn SceneListener>,
    ) -> SubscriptionId {
        self.subscriptions
            .borrow_mut()
            .insert(subject, property, listener)
    }

    /// Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.borrow_mut().remove(id)
    }

    pub fn subscriber_count(&self, subject: Subject) -> usize {
        self.subscriptions.borrow().count(subject)
    }

    /// Product of every transform group from the root down to `node`,
    /// including `node` itself. `links` lists, outermost first, the links
    /// crossed to reach `node`; each shared group boundary continues above
    /// the matching link.
    pub fn transform_from_root(&self, node: NodeId, links: &[NodeId]) -> Mat4 {
        let mut transform = Mat4::IDENTITY;
        let mut links = links.iter().rev();
        let mut current = Some(node);
        while let Some(id) = current {
            let Some(node) = self.nodes.get(id) else {
                break;
            };
            if let NodeKind::TransformGroup(group) = &node.kind {
                transform = group.transform * transform;
            }
            current = match (node.parent, &node.kind) {
                (Some(parent), _) => Some(parent),
                (None, NodeKind::SharedGroup(_)) => links.next().copied(),
                (None, _) => None,
            };
        }
        transform
    }

    /// Number of geometry arrays drawn below `root`, background excluded.
    pub fn count_displayed_geometries(&self, root: NodeId) -> usize {
        let mut count = 0;
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            match &node.kind {
                NodeKind::Group(group) | NodeKind::SharedGroup(group) => {
                    stack.extend(group.children.iter().copied())
                }
                NodeKind::TransformGroup(group) => stack.extend(group.children.iter().copied()),
                NodeKind::Link(link) => stack.push(link.shared_group),
                NodeKind::Shape(shape) => count += shape.geometries.len(),
                NodeKind::Light(_) | NodeKind::Background(_) => {}
            }
        }
        count
    }

    fn notify(&self, event: SceneEvent) {
        let listeners = self.subscriptions.borrow().matching(&event);
        if listeners.is_empty() {
            return;
        }
        log::trace!("Dispatching {:?} to {} listeners", event.property(), listeners.len());
        for listener in listeners {
            listener.scene_changed(self, &event);
        }
    }

    fn notifies_children(&self, parent: NodeId) -> bool {
        self.nodes
            .get(parent)
            .is_some_and(|node| node.capabilities.contains(Capabilities::ALLOW_CHILDREN_EXTEND))
    }

    fn editable_children(&self, parent: NodeId) -> Result<&[NodeId], SceneError> {
        let node = self.get(parent)?;
        let children = node.kind.children().ok_or(SceneError::WrongKind {
            node: parent,
            expected: "group",
        })?;
        if node.is_live() && !node.capabilities.contains(Capabilities::ALLOW_CHILDREN_EXTEND) {
            return Err(SceneError::CapabilityNotSet {
                node: parent,
                capability: Capabilities::ALLOW_CHILDREN_EXTEND,
            });
        }
        Ok(children)
    }

    /// Returns whether geometry edits on `shape` should be broadcast.
    fn check_geometry_write(&self, shape: NodeId) -> Result<bool, SceneError> {
        let node = self.get(shape)?;
        if !matches!(node.kind, NodeKind::Shape(_)) {
            return Err(SceneError::WrongKind {
                node: shape,
                expected: "shape",
            });
        }
        let writable = node.capabilities.contains(Capabilities::ALLOW_GEOMETRY_WRITE);
        if node.is_live() && !writable {
            return Err(SceneError::CapabilityNotSet {
                node: shape,
                capability: Capabilities::ALLOW_GEOMETRY_WRITE,
            });
        }
        Ok(writable)
    }

    fn light_mut(&mut self, id: NodeId) -> Result<&mut Light, SceneError> {
        match &mut self.get_mut(id)?.kind {
            NodeKind::Light(light) => Ok(light),
            _ => Err(SceneError::WrongKind {
                node: id,
                expected: "light",
            }),
        }
    }

    fn expect_shared_group(&self, id: NodeId) -> Result<(), SceneError> {
        match self.get(id)?.kind {
            NodeKind::SharedGroup(_) => Ok(()),
            _ => Err(SceneError::WrongKind {
                node: id,
                expected: "shared group",
            }),
        }
    }

    /// Rejects attaching `subtree` below `attach_point` when the subtree
    /// contains an ancestor of the attach point, or reaches the shared
    /// group above it through links.
    fn check_acyclic(&self, attach_point: NodeId, subtree: NodeId) -> Result<(), SceneError> {
        let cycle = SceneError::Cycle {
            parent: attach_point,
            child: subtree,
        };
        let mut top = attach_point;
        loop {
            if top == subtree {
                return Err(cycle);
            }
            match self.nodes.get(top).and_then(|node| node.parent) {
                Some(parent) => top = parent,
                None => break,
            }
        }
        if !matches!(self.get(top)?.kind, NodeKind::SharedGroup(_)) {
            return Ok(());
        }

        let mut visited = HashSet::new();
        let mut stack = vec![subtree];
        while let Some(id) = stack.pop() {
            if id == top {
                return Err(cycle);
            }
            if !visited.insert(id) {
                continue;
            }
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            match &node.kind {
                NodeKind::Group(group) | NodeKind::SharedGroup(group) => {
                    stack.extend(group.children.iter().copied())
                }
                NodeKind::TransformGroup(group) => stack.extend(group.children.iter().copied()),
                NodeKind::Link(link) => stack.push(link.shared_group),
                NodeKind::Background(background) => stack.push(background.geometry),
                NodeKind::Shape(_) | NodeKind::Light(_) => {}
            }
        }
        Ok(())
    }

    fn get(&self, id: NodeId) -> Result<&Node, SceneError> {
        self.nodes.get(id).ok_or(SceneError::UnknownNode(id))
    }

    fn get_mut(&mut self, id: NodeId) -> Result<&mut Node, SceneError> {
        self.nodes.get_mut(id).ok_or(SceneError::UnknownNode(id))
    }
}
