use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use glam::{Mat4, Vec3};
use slotmap::SlotMap;

use super::appearance::AppearanceChange;
use super::geometry::GeometryArray;
use super::node::{AppearanceId, NodeId};
use super::SceneGraph;

slotmap::new_key_type! {
    pub struct SubscriptionId;
}

/// What a subscriber listens to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Subject {
    Node(NodeId),
    Appearance(AppearanceId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Property {
    Transform,
    Children,
    Geometry,
    Pickable,
    LightColor,
    LightDirection,
    AmbientColor,
    DiffuseColor,
    SpecularColor,
    Shininess,
    Transparency,
    Illumination,
    TextureImage,
    TextureCoordinatesGeneration,
    TextureTransform,
    Visible,
    CullFace,
    BackFaceNormalFlip,
}

#[derive(Clone, Debug)]
pub enum SceneEvent {
    TransformChanged {
        node: NodeId,
        old: Mat4,
        new: Mat4,
    },
    ChildAdded {
        parent: NodeId,
        child: NodeId,
        index: usize,
    },
    ChildRemoved {
        parent: NodeId,
        child: NodeId,
        index: usize,
    },
    GeometryAdded {
        shape: NodeId,
        geometry: Arc<GeometryArray>,
    },
    GeometryRemoved {
        shape: NodeId,
        geometry: Arc<GeometryArray>,
    },
    PickableChanged {
        shape: NodeId,
        pickable: bool,
    },
    LightColorChanged {
        light: NodeId,
        color: Vec3,
    },
    LightDirectionChanged {
        light: NodeId,
        direction: Vec3,
    },
    AppearanceChanged {
        appearance: AppearanceId,
        change: AppearanceChange,
    },
}

impl SceneEvent {
    pub fn subject(&self) -> Subject {
        match self {
            SceneEvent::TransformChanged { node, .. } => Subject::Node(*node),
            SceneEvent::ChildAdded { parent, .. } | SceneEvent::ChildRemoved { parent, .. } => {
                Subject::Node(*parent)
            }
            SceneEvent::GeometryAdded { shape, .. }
            | SceneEvent::GeometryRemoved { shape, .. }
            | SceneEvent::PickableChanged { shape, .. } => Subject::Node(*shape),
            SceneEvent::LightColorChanged { light, .. }
            | SceneEvent::LightDirectionChanged { light, .. } => Subject::Node(*light),
            SceneEvent::AppearanceChanged { appearance, .. } => Subject::Appearance(*appearance),
        }
    }

    pub fn property(&self) -> Property {
        match self {
            SceneEvent::TransformChanged { .. } => Property::Transform,
            SceneEvent::ChildAdded { .. } | SceneEvent::ChildRemoved { .. } => Property::Children,
            SceneEvent::GeometryAdded { .. } | SceneEvent::GeometryRemoved { .. } => {
                Property::Geometry
            }
            SceneEvent::PickableChanged { .. } => Property::Pickable,
            SceneEvent::LightColorChanged { .. } => Property::LightColor,
            SceneEvent::LightDirectionChanged { .. } => Property::LightDirection,
            SceneEvent::AppearanceChanged { change, .. } => match change {
                AppearanceChange::AmbientColor(_) => Property::AmbientColor,
                AppearanceChange::DiffuseColor(_) => Property::DiffuseColor,
                AppearanceChange::SpecularColor(_) => Property::SpecularColor,
                AppearanceChange::Shininess(_) => Property::Shininess,
                AppearanceChange::Transparency(_) => Property::Transparency,
                AppearanceChange::Illumination(_) => Property::Illumination,
                AppearanceChange::TextureImage(_) => Property::TextureImage,
                AppearanceChange::TextureCoordinatesGeneration(_) => {
                    Property::TextureCoordinatesGeneration
                }
                AppearanceChange::TextureTransform(_) => Property::TextureTransform,
                AppearanceChange::Visible(_) => Property::Visible,
                AppearanceChange::CullFace(_) => Property::CullFace,
                AppearanceChange::BackFaceNormalFlip(_) => Property::BackFaceNormalFlip,
            },
        }
    }
}

/// Receives graph changes synchronously, after the change is applied and
/// before the mutating call returns.
pub trait SceneListener {
    fn scene_changed(&self, graph: &SceneGraph, event: &SceneEvent);
}

struct Subscription {
    subject: Subject,
    property: Option<Property>,
    listener: Rc<dyn SceneListener>,
}

#[derive(Default)]
pub(crate) struct Subscriptions {
    entries: SlotMap<SubscriptionId, Subscription>,
    by_subject: HashMap<Subject, Vec<SubscriptionId>>,
}

impl Subscriptions {
    pub(crate) fn insert(
        &mut self,
        subject: Subject,
        property: Option<Property>,
        listener: Rc<dyn SceneListener>,
    ) -> SubscriptionId {
        let id = self.entries.insert(Subscription {
            subject,
            property,
            listener,
        });
        self.by_subject.entry(subject).or_default().push(id);
        id
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        let Some(subscription) = self.entries.remove(id) else {
            return false;
        };
        if let Some(ids) = self.by_subject.get_mut(&subscription.subject) {
            ids.retain(|&other| other != id);
            if ids.is_empty() {
                self.by_subject.remove(&subscription.subject);
            }
        }
        true
    }

    pub(crate) fn remove_subject(&mut self, subject: Subject) {
        if let Some(ids) = self.by_subject.remove(&subject) {
            for id in ids {
                self.entries.remove(id);
            }
        }
    }

    pub(crate) fn count(&self, subject: Subject) -> usize {
        self.by_subject.get(&subject).map_or(0, Vec::len)
    }

    /// Listeners interested in `event`, in subscription order.
    pub(crate) fn matching(&self, event: &SceneEvent) -> Vec<Rc<dyn SceneListener>> {
        let property = event.property();
        self.by_subject
            .get(&event.subject())
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(*id))
            .filter(|subscription| subscription.property.map_or(true, |p| p == property))
            .map(|subscription| Rc::clone(&subscription.listener))
            .collect()
    }
}
