use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use glam::{Mat3, Mat4, Vec3};
use slotmap::SlotMap;

use crate::scene::{
    Appearance, AppearanceChange, AppearanceId, Capabilities, CullFace, GeometryArray, GeometryId,
    GeometryKind, LightKind, NodeId, NodeKind, SceneEvent, SceneGraph, SceneListener, Subject,
    SubscriptionId, TexCoordGeneration, TextureImage,
};

use super::backend::{GeometryBuffers, RenderMode};
use super::schedule::RepaintRequest;

slotmap::new_key_type! {
    pub struct RecordKey;
    pub struct LightKey;
    pub struct GeometrySlot;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStage {
    BindingModel,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BuildProgress {
    pub stage: LoadStage,
    pub fraction: f32,
}

pub type ProgressCallback = Box<dyn FnMut(BuildProgress)>;

/// Appearance fields copied into a draw record.
#[derive(Clone, Debug)]
pub struct ResolvedAppearance {
    pub ambient: Option<Vec3>,
    pub diffuse: Option<Vec3>,
    pub specular: Option<Vec3>,
    pub shininess: Option<f32>,
    pub texture: Option<Arc<TextureImage>>,
    pub tex_coord_generation: Option<TexCoordGeneration>,
    pub texture_transform: Option<Mat3>,
    /// `1 - transparency`.
    pub alpha: f32,
    pub visible: bool,
    pub cull_face: Option<CullFace>,
    pub back_face_normal_flip: bool,
    pub illumination: Option<u32>,
}

impl Default for ResolvedAppearance {
    fn default() -> Self {
        Self::from(&Appearance::default())
    }
}

impl From<&Appearance> for ResolvedAppearance {
    fn from(appearance: &Appearance) -> Self {
        Self {
            ambient: appearance.ambient_color,
            diffuse: appearance.diffuse_color,
            specular: appearance.specular_color,
            shininess: appearance.shininess,
            texture: appearance.texture_image.clone(),
            tex_coord_generation: appearance.texture_coordinates_generation,
            texture_transform: appearance.texture_transform,
            alpha: alpha_of(appearance.transparency),
            visible: appearance.visible,
            cull_face: appearance.cull_face,
            back_face_normal_flip: appearance.back_face_normal_flip,
            illumination: appearance.illumination,
        }
    }
}

impl ResolvedAppearance {
    fn apply(&mut self, change: &AppearanceChange) {
        match change {
            AppearanceChange::AmbientColor(color) => self.ambient = *color,
            AppearanceChange::DiffuseColor(color) => self.diffuse = *color,
            AppearanceChange::SpecularColor(color) => self.specular = *color,
            AppearanceChange::Shininess(shininess) => self.shininess = *shininess,
            AppearanceChange::Transparency(transparency) => self.alpha = alpha_of(*transparency),
            AppearanceChange::Illumination(illumination) => self.illumination = *illumination,
            AppearanceChange::TextureImage(image) => self.texture = image.clone(),
            AppearanceChange::TextureCoordinatesGeneration(generation) => {
                self.tex_coord_generation = *generation
            }
            AppearanceChange::TextureTransform(transform) => self.texture_transform = *transform,
            AppearanceChange::Visible(visible) => self.visible = *visible,
            AppearanceChange::CullFace(cull_face) => self.cull_face = *cull_face,
            AppearanceChange::BackFaceNormalFlip(flip) => self.back_face_normal_flip = *flip,
        }
    }
}

fn alpha_of(transparency: Option<f32>) -> f32 {
    1.0 - transparency.unwrap_or(0.0).clamp(0.0, 1.0)
}

/// One geometry array of one displayed shape instance.
#[derive(Clone, Debug)]
pub struct DrawRecord {
    pub node: NodeId,
    /// Links crossed to reach `node`, outermost first.
    pub links: Vec<NodeId>,
    pub appearance: Option<AppearanceId>,
    pub geometry: Arc<GeometryArray>,
    pub slot: GeometrySlot,
    pub transform: Mat4,
    pub material: ResolvedAppearance,
    pub lighting_enabled: bool,
    pub background: bool,
    pub mode: RenderMode,
    pub pickable: bool,
}

impl DrawRecord {
    pub fn is_color_transparent(&self) -> bool {
        self.material.alpha < 1.0
    }

    pub fn is_texture_transparent(&self) -> bool {
        self.material
            .texture
            .as_ref()
            .is_some_and(|texture| texture.is_transparent())
    }

    fn refresh_lighting(&mut self) {
        // Lines carry no normals and are lit with a fixed one.
        self.lighting_enabled = self.material.illumination.map_or(true, |i| i >= 1)
            && (self.mode == RenderMode::Lines || self.geometry.has_normals());
    }
}

#[derive(Clone, Debug)]
pub struct LightRecord {
    pub node: NodeId,
    pub links: Vec<NodeId>,
    pub kind: LightKind,
    pub color: Vec3,
    pub transform: Mat4,
}

struct SlotData {
    geometry: Arc<GeometryArray>,
    buffers: Option<GeometryBuffers>,
    references: usize,
}

#[derive(Clone, Debug)]
struct Instance {
    links: Vec<NodeId>,
    background: bool,
}

#[derive(Clone)]
struct Context {
    transform: Mat4,
    links: Vec<NodeId>,
    background: bool,
}

struct ProgressState {
    callback: ProgressCallback,
    total: usize,
    bound: usize,
}

/// Flat, draw-ready view of a scene graph, patched in place by graph events.
pub struct RenderList {
    root: NodeId,
    records: SlotMap<RecordKey, DrawRecord>,
    order: Vec<RecordKey>,
    records_by_node: HashMap<NodeId, Vec<RecordKey>>,
    records_by_appearance: HashMap<AppearanceId, Vec<RecordKey>>,
    lights: SlotMap<LightKey, LightRecord>,
    light_order: Vec<LightKey>,
    lights_by_node: HashMap<NodeId, Vec<LightKey>>,
    slots: SlotMap<GeometrySlot, SlotData>,
    shared_slots: HashMap<GeometryId, GeometrySlot>,
    released_buffers: Vec<GeometryBuffers>,
    instances: HashMap<NodeId, Vec<Instance>>,
    subscriptions: HashMap<Subject, SubscriptionId>,
    listener: Option<Rc<dyn SceneListener>>,
    progress: Option<ProgressState>,
}

impl RenderList {
    /// Walks `root` once and subscribes to every node that can change.
    /// Patches request a repaint through `repaint`.
    pub fn build(
        graph: &SceneGraph,
        root: NodeId,
        repaint: Rc<RepaintRequest>,
        progress: Option<ProgressCallback>,
    ) -> Rc<RefCell<RenderList>> {
        let list = Rc::new(RefCell::new(RenderList::new(root)));
        let listener: Rc<dyn SceneListener> = Rc::new(RenderListListener {
            list: Rc::downgrade(&list),
            repaint,
        });
        {
            let mut inner = list.borrow_mut();
            inner.listener = Some(listener);
            inner.progress = progress.map(|callback| ProgressState {
                callback,
                total: graph.count_displayed_geometries(root),
                bound: 0,
            });
            inner.prepare(
                graph,
                root,
                &Context {
                    transform: Mat4::IDENTITY,
                    links: Vec::new(),
                    background: false,
                },
            );
            log::info!(
                "Built render list: {} draw records, {} lights, {} geometry slots",
                inner.order.len(),
                inner.light_order.len(),
                inner.slots.len()
            );
        }
        list
    }

    fn new(root: NodeId) -> Self {
        Self {
            root,
            records: SlotMap::with_key(),
            order: Vec::new(),
            records_by_node: HashMap::new(),
            records_by_appearance: HashMap::new(),
            lights: SlotMap::with_key(),
            light_order: Vec::new(),
            lights_by_node: HashMap::new(),
            slots: SlotMap::with_key(),
            shared_slots: HashMap::new(),
            released_buffers: Vec::new(),
            instances: HashMap::new(),
            subscriptions: HashMap::new(),
            listener: None,
            progress: None,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Draw records in traversal order; the position is the picking index.
    pub fn records(&self) -> impl Iterator<Item = &DrawRecord> + '_ {
        self.order.iter().filter_map(|key| self.records.get(*key))
    }

    pub fn record_at(&self, index: usize) -> Option<&DrawRecord> {
        self.order.get(index).and_then(|key| self.records.get(*key))
    }

    pub fn records_of(&self, node: NodeId) -> Vec<&DrawRecord> {
        self.records_by_node
            .get(&node)
            .into_iter()
            .flatten()
            .filter_map(|key| self.records.get(*key))
            .collect()
    }

    pub fn lights(&self) -> impl Iterator<Item = &LightRecord> + '_ {
        self.light_order.iter().filter_map(|key| self.lights.get(*key))
    }

    pub fn lights_of(&self, node: NodeId) -> Vec<&LightRecord> {
        self.lights_by_node
            .get(&node)
            .into_iter()
            .flatten()
            .filter_map(|key| self.lights.get(*key))
            .collect()
    }

    pub fn geometry_slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn buffers(&self, slot: GeometrySlot) -> Option<GeometryBuffers> {
        self.slots.get(slot).and_then(|data| data.buffers)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Slots whose geometry has not been uploaded yet.
    pub(crate) fn pending_uploads(&self) -> Vec<(GeometrySlot, Arc<GeometryArray>)> {
        self.slots
            .iter()
            .filter(|(_, data)| data.buffers.is_none())
            .map(|(slot, data)| (slot, Arc::clone(&data.geometry)))
            .collect()
    }

    pub(crate) fn set_buffers(&mut self, slot: GeometrySlot, buffers: GeometryBuffers) {
        if let Some(data) = self.slots.get_mut(slot) {
            data.buffers = Some(buffers);
        }
    }

    pub(crate) fn take_released_buffers(&mut self) -> Vec<GeometryBuffers> {
        std::mem::take(&mut self.released_buffers)
    }

    pub(crate) fn take_progress(&mut self) -> Option<ProgressCallback> {
        self.progress.take().map(|state| state.callback)
    }

    /// Stops observing the graph and hands back every uploaded buffer.
    pub(crate) fn detach(&mut self, graph: &SceneGraph) -> Vec<GeometryBuffers> {
        for (_, subscription) in self.subscriptions.drain() {
            graph.unsubscribe(subscription);
        }
        for (node, instances) in self.instances.drain() {
            if let Some(node) = graph.node(node) {
                for _ in &instances {
                    node.release();
                }
            }
        }
        let mut buffers = std::mem::take(&mut self.released_buffers);
        buffers.extend(self.slots.drain().filter_map(|(_, data)| data.buffers));
        self.shared_slots.clear();
        self.records.clear();
        self.order.clear();
        self.records_by_node.clear();
        self.records_by_appearance.clear();
        self.lights.clear();
        self.light_order.clear();
        self.lights_by_node.clear();
        self.listener = None;
        buffers
    }

    fn apply(&mut self, graph: &SceneGraph, event: &SceneEvent) {
        match event {
            SceneEvent::TransformChanged { node, .. } => self.update_transforms(graph, *node),
            SceneEvent::ChildAdded { parent, child, .. } => self.child_added(graph, *parent, *child),
            SceneEvent::ChildRemoved { child, .. } => self.remove_subtree(graph, *child),
            SceneEvent::GeometryAdded { shape, geometry } => {
                self.geometry_added(graph, *shape, geometry)
            }
            SceneEvent::GeometryRemoved { shape, geometry } => {
                self.geometry_removed(graph, *shape, geometry)
            }
            SceneEvent::PickableChanged { shape, pickable } => {
                for key in self.records_by_node.get(shape).into_iter().flatten() {
                    if let Some(record) = self.records.get_mut(*key) {
                        record.pickable = *pickable;
                    }
                }
            }
            SceneEvent::LightColorChanged { light, color } => {
                for key in self.lights_by_node.get(light).into_iter().flatten() {
                    if let Some(record) = self.lights.get_mut(*key) {
                        record.color = *color;
                    }
                }
            }
            SceneEvent::LightDirectionChanged { light, direction } => {
                for key in self.lights_by_node.get(light).into_iter().flatten() {
                    if let Some(record) = self.lights.get_mut(*key) {
                        record.kind = LightKind::Directional {
                            direction: *direction,
                        };
                    }
                }
            }
            SceneEvent::AppearanceChanged { appearance, change } => {
                let mut patched = 0;
                for key in self.records_by_appearance.get(appearance).into_iter().flatten() {
                    if let Some(record) = self.records.get_mut(*key) {
                        record.material.apply(change);
                        record.refresh_lighting();
                        patched += 1;
                    }
                }
                log::trace!("Patched {} records for {:?}", patched, event.property());
            }
        }
    }

    fn prepare(&mut self, graph: &SceneGraph, id: NodeId, context: &Context) {
        let Some(node) = graph.node(id) else {
            log::warn!("Skipping missing node {:?}", id);
            return;
        };
        self.register_instance(graph, id, context);
        match node.kind() {
            NodeKind::Group(_) | NodeKind::SharedGroup(_) => {
                for &child in graph.children(id) {
                    self.prepare(graph, child, context);
                }
            }
            NodeKind::TransformGroup(group) => {
                let inner = Context {
                    transform: context.transform * group.transform,
                    ..context.clone()
                };
                for &child in graph.children(id) {
                    self.prepare(graph, child, &inner);
                }
            }
            NodeKind::Link(link) => {
                let mut inner = context.clone();
                inner.links.push(id);
                self.prepare(graph, link.shared_group, &inner);
            }
            NodeKind::Shape(shape) => {
                let material = shape
                    .appearance()
                    .and_then(|appearance| graph.appearance(appearance))
                    .map(ResolvedAppearance::from)
                    .unwrap_or_default();
                if let Some(appearance) = shape.appearance() {
                    self.subscribe(graph, Subject::Appearance(appearance));
                }
                let shared = !node
                    .capabilities()
                    .contains(Capabilities::ALLOW_GEOMETRY_WRITE);
                for geometry in shape.geometries() {
                    self.add_record(
                        id,
                        shape.appearance(),
                        geometry,
                        material.clone(),
                        context,
                        shape.is_pickable(),
                        shared,
                    );
                    if !context.background {
                        self.report_geometry_bound();
                    }
                }
            }
            NodeKind::Light(light) => {
                let key = self.lights.insert(LightRecord {
                    node: id,
                    links: context.links.clone(),
                    kind: light.kind,
                    color: light.color,
                    transform: context.transform,
                });
                self.light_order.push(key);
                self.lights_by_node.entry(id).or_default().push(key);
            }
            NodeKind::Background(background) => {
                let inner = Context {
                    background: true,
                    ..context.clone()
                };
                self.prepare(graph, background.geometry, &inner);
            }
        }
    }

    fn register_instance(&mut self, graph: &SceneGraph, id: NodeId, context: &Context) {
        let Some(node) = graph.node(id) else {
            return;
        };
        node.acquire();
        self.instances.entry(id).or_default().push(Instance {
            links: context.links.clone(),
            background: context.background,
        });

        let capabilities = node.capabilities();
        let observed = match node.kind() {
            NodeKind::Group(_) | NodeKind::SharedGroup(_) => {
                capabilities.contains(Capabilities::ALLOW_CHILDREN_EXTEND)
            }
            NodeKind::TransformGroup(_) => capabilities.intersects(
                Capabilities::ALLOW_TRANSFORM_WRITE | Capabilities::ALLOW_CHILDREN_EXTEND,
            ),
            NodeKind::Shape(_) | NodeKind::Light(_) => true,
            NodeKind::Link(_) | NodeKind::Background(_) => false,
        };
        if observed {
            self.subscribe(graph, Subject::Node(id));
        }
    }

    fn subscribe(&mut self, graph: &SceneGraph, subject: Subject) {
        if self.subscriptions.contains_key(&subject) {
            return;
        }
        if let Some(listener) = &self.listener {
            let id = graph.subscribe(subject, None, Rc::clone(listener));
            self.subscriptions.insert(subject, id);
        }
    }

    fn unsubscribe(&mut self, graph: &SceneGraph, subject: Subject) {
        if let Some(id) = self.subscriptions.remove(&subject) {
            graph.unsubscribe(id);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_record(
        &mut self,
        node: NodeId,
        appearance: Option<AppearanceId>,
        geometry: &Arc<GeometryArray>,
        material: ResolvedAppearance,
        context: &Context,
        pickable: bool,
        shared: bool,
    ) {
        let slot = self.acquire_slot(geometry, shared);
        let mode = match geometry.kind() {
            GeometryKind::Lines => RenderMode::Lines,
            GeometryKind::Triangles => RenderMode::Triangles,
        };
        let mut record = DrawRecord {
            node,
            links: context.links.clone(),
            appearance,
            geometry: Arc::clone(geometry),
            slot,
            transform: context.transform,
            material,
            lighting_enabled: false,
            background: context.background,
            mode,
            pickable,
        };
        record.refresh_lighting();
        let key = self.records.insert(record);
        self.order.push(key);
        self.records_by_node.entry(node).or_default().push(key);
        if let Some(appearance) = appearance {
            self.records_by_appearance
                .entry(appearance)
                .or_default()
                .push(key);
        }
    }

    fn acquire_slot(&mut self, geometry: &Arc<GeometryArray>, shared: bool) -> GeometrySlot {
        if shared {
            if let Some(&slot) = self.shared_slots.get(&geometry.id()) {
                if let Some(data) = self.slots.get_mut(slot) {
                    data.references += 1;
                    return slot;
                }
            }
        }
        let slot = self.slots.insert(SlotData {
            geometry: Arc::clone(geometry),
            buffers: None,
            references: 1,
        });
        if shared {
            self.shared_slots.insert(geometry.id(), slot);
        }
        slot
    }

    fn release_slot(&mut self, slot: GeometrySlot) {
        let Some(data) = self.slots.get_mut(slot) else {
            return;
        };
        data.references -= 1;
        if data.references > 0 {
            return;
        }
        if let Some(data) = self.slots.remove(slot) {
            let id = data.geometry.id();
            if self.shared_slots.get(&id) == Some(&slot) {
                self.shared_slots.remove(&id);
            }
            self.released_buffers.extend(data.buffers);
        }
    }

    /// Leaves `key` in `order`; callers compact it once with `compact_order`.
    fn remove_record(&mut self, graph: &SceneGraph, key: RecordKey) {
        let Some(record) = self.records.remove(key) else {
            return;
        };
        if let Some(keys) = self.records_by_node.get_mut(&record.node) {
            keys.retain(|&other| other != key);
            if keys.is_empty() {
                self.records_by_node.remove(&record.node);
            }
        }
        if let Some(appearance) = record.appearance {
            if let Some(keys) = self.records_by_appearance.get_mut(&appearance) {
                keys.retain(|&other| other != key);
                if keys.is_empty() {
                    self.records_by_appearance.remove(&appearance);
                    self.unsubscribe(graph, Subject::Appearance(appearance));
                }
            }
        }
        self.release_slot(record.slot);
    }

    fn remove_light(&mut self, key: LightKey) {
        let Some(light) = self.lights.remove(key) else {
            return;
        };
        if let Some(keys) = self.lights_by_node.get_mut(&light.node) {
            keys.retain(|&other| other != key);
            if keys.is_empty() {
                self.lights_by_node.remove(&light.node);
            }
        }
    }

    /// Drops keys of removed records and lights in one pass over each order.
    fn compact_order(&mut self) {
        let (records, lights) = (&self.records, &self.lights);
        self.order.retain(|key| records.contains_key(*key));
        self.light_order.retain(|key| lights.contains_key(*key));
    }

    /// Recomputes the transform of every record and light below `group`.
    fn update_transforms(&mut self, graph: &SceneGraph, group: NodeId) {
        let mut updated = 0usize;
        let mut stack: Vec<(NodeId, Vec<NodeId>)> = graph
            .children(group)
            .iter()
            .map(|&child| (child, Vec::new()))
            .collect();
        while let Some((id, suffix)) = stack.pop() {
            let Some(node) = graph.node(id) else {
                continue;
            };
            match node.kind() {
                NodeKind::Group(_) | NodeKind::SharedGroup(_) | NodeKind::TransformGroup(_) => {
                    stack.extend(graph.children(id).iter().map(|&c| (c, suffix.clone())));
                }
                NodeKind::Link(link) => {
                    let mut inner = suffix;
                    inner.push(id);
                    stack.push((link.shared_group, inner));
                }
                NodeKind::Background(background) => stack.push((background.geometry, suffix)),
                NodeKind::Shape(_) => {
                    for key in self.records_by_node.get(&id).into_iter().flatten() {
                        if let Some(record) = self.records.get_mut(*key) {
                            if record.links.ends_with(&suffix) {
                                record.transform = graph.transform_from_root(id, &record.links);
                                updated += 1;
                            }
                        }
                    }
                }
                NodeKind::Light(_) => {
                    for key in self.lights_by_node.get(&id).into_iter().flatten() {
                        if let Some(light) = self.lights.get_mut(*key) {
                            if light.links.ends_with(&suffix) {
                                light.transform = graph.transform_from_root(id, &light.links);
                                updated += 1;
                            }
                        }
                    }
                }
            }
        }
        log::trace!("Transform of {:?} updated {} records", group, updated);
    }

    fn child_added(&mut self, graph: &SceneGraph, parent: NodeId, child: NodeId) {
        let Some(instances) = self.instances.get(&parent).cloned() else {
            return;
        };
        for instance in instances {
            let context = Context {
                transform: graph.transform_from_root(parent, &instance.links),
                links: instance.links,
                background: instance.background,
            };
            self.prepare(graph, child, &context);
        }
        log::debug!("Prepared subtree {:?} added under {:?}", child, parent);
    }

    /// Drops everything displayed below `root`. Running it again is a no-op.
    fn remove_subtree(&mut self, graph: &SceneGraph, root: NodeId) {
        let mut stack = vec![(root, Vec::<NodeId>::new())];
        while let Some((id, suffix)) = stack.pop() {
            self.release_instances(graph, id, &suffix);
            let Some(node) = graph.node(id) else {
                continue;
            };
            match node.kind() {
                NodeKind::Group(_) | NodeKind::SharedGroup(_) | NodeKind::TransformGroup(_) => {
                    stack.extend(graph.children(id).iter().map(|&c| (c, suffix.clone())));
                }
                NodeKind::Link(link) => {
                    let mut inner = suffix;
                    inner.push(id);
                    stack.push((link.shared_group, inner));
                }
                NodeKind::Background(background) => stack.push((background.geometry, suffix)),
                NodeKind::Shape(_) => {
                    let doomed: Vec<RecordKey> = self
                        .records_by_node
                        .get(&id)
                        .into_iter()
                        .flatten()
                        .copied()
                        .filter(|key| {
                            self.records
                                .get(*key)
                                .is_some_and(|record| record.links.ends_with(&suffix))
                        })
                        .collect();
                    for key in doomed {
                        self.remove_record(graph, key);
                    }
                }
                NodeKind::Light(_) => {
                    let doomed: Vec<LightKey> = self
                        .lights_by_node
                        .get(&id)
                        .into_iter()
                        .flatten()
                        .copied()
                        .filter(|key| {
                            self.lights
                                .get(*key)
                                .is_some_and(|light| light.links.ends_with(&suffix))
                        })
                        .collect();
                    for key in doomed {
                        self.remove_light(key);
                    }
                }
            }
        }
        self.compact_order();
        log::debug!("Removed subtree {:?}", root);
    }

    fn release_instances(&mut self, graph: &SceneGraph, id: NodeId, suffix: &[NodeId]) {
        let Some(instances) = self.instances.get_mut(&id) else {
            return;
        };
        let before = instances.len();
        instances.retain(|instance| !instance.links.ends_with(suffix));
        let released = before - instances.len();
        let emptied = instances.is_empty();
        if let Some(node) = graph.node(id) {
            for _ in 0..released {
                node.release();
            }
        }
        if emptied {
            self.instances.remove(&id);
            self.unsubscribe(graph, Subject::Node(id));
        }
    }

    fn geometry_added(&mut self, graph: &SceneGraph, shape: NodeId, geometry: &Arc<GeometryArray>) {
        let Some(data) = graph.shape(shape) else {
            return;
        };
        let material = data
            .appearance()
            .and_then(|appearance| graph.appearance(appearance))
            .map(ResolvedAppearance::from)
            .unwrap_or_default();
        let instances = self.instances.get(&shape).cloned().unwrap_or_default();
        for instance in instances {
            let context = Context {
                transform: graph.transform_from_root(shape, &instance.links),
                links: instance.links,
                background: instance.background,
            };
            self.add_record(
                shape,
                data.appearance(),
                geometry,
                material.clone(),
                &context,
                data.is_pickable(),
                false,
            );
        }
    }

    fn geometry_removed(
        &mut self,
        graph: &SceneGraph,
        shape: NodeId,
        geometry: &Arc<GeometryArray>,
    ) {
        let doomed: Vec<RecordKey> = self
            .records_by_node
            .get(&shape)
            .into_iter()
            .flatten()
            .copied()
            .filter(|key| {
                self.records
                    .get(*key)
                    .is_some_and(|record| Arc::ptr_eq(&record.geometry, geometry))
            })
            .collect();
        let removed = !doomed.is_empty();
        for key in doomed {
            self.remove_record(graph, key);
        }
        if removed {
            self.compact_order();
        }
    }

    fn report_geometry_bound(&mut self) {
        let Some(progress) = &mut self.progress else {
            return;
        };
        if progress.total == 0 {
            return;
        }
        let before = progress.bound * 10 / progress.total;
        progress.bound += 1;
        let after = progress.bound * 10 / progress.total;
        if after > before && progress.bound < progress.total {
            (progress.callback)(BuildProgress {
                stage: LoadStage::BindingModel,
                fraction: progress.bound as f32 / progress.total as f32,
            });
        }
    }
}

struct RenderListListener {
    list: Weak<RefCell<RenderList>>,
    repaint: Rc<RepaintRequest>,
}

impl SceneListener for RenderListListener {
    fn scene_changed(&self, graph: &SceneGraph, event: &SceneEvent) {
        let Some(list) = self.list.upgrade() else {
            return;
        };
        match list.try_borrow_mut() {
            Ok(mut list) => list.apply(graph, event),
            Err(_) => {
                log::warn!("Render list busy, dropped {:?} change", event.property());
                return;
            }
        }
        self.repaint.request();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Appearance, GeometryArray};
    use std::cell::Cell;

    fn triangle() -> Arc<GeometryArray> {
        Arc::new(
            GeometryArray::triangles(
                vec![Vec3::ZERO, Vec3::X, Vec3::Y],
                vec![0, 1, 2],
                vec![Vec3::Z],
                vec![0, 0, 0],
            )
            .unwrap(),
        )
    }

    fn shape(graph: &mut SceneGraph, geometry: &Arc<GeometryArray>) -> NodeId {
        let shape = graph.create_shape(None, Capabilities::empty()).unwrap();
        graph.add_geometry(shape, Arc::clone(geometry)).unwrap();
        shape
    }

    fn build(graph: &SceneGraph, root: NodeId) -> (Rc<RefCell<RenderList>>, Rc<RepaintRequest>) {
        let repaint = Rc::new(RepaintRequest::detached());
        (RenderList::build(graph, root, repaint.clone(), None), repaint)
    }

    #[test]
    fn instances_share_one_geometry_slot() {
        let mut graph = SceneGraph::new();
        let geometry = triangle();
        let root = graph.create_group(Capabilities::empty());
        let a = shape(&mut graph, &geometry);
        let b = shape(&mut graph, &geometry);
        graph.add_child(root, a).unwrap();
        graph.add_child(root, b).unwrap();

        let (list, _) = build(&graph, root);
        let list = list.borrow();
        assert_eq!(list.len(), 2);
        assert_eq!(list.geometry_slot_count(), 1);
        assert_eq!(list.records_of(a)[0].slot, list.records_of(b)[0].slot);
    }

    #[test]
    fn writable_geometry_shapes_get_their_own_slot() {
        let mut graph = SceneGraph::new();
        let geometry = triangle();
        let root = graph.create_group(Capabilities::empty());
        let a = shape(&mut graph, &geometry);
        let b = shape(&mut graph, &geometry);
        graph
            .grant_capabilities(b, Capabilities::ALLOW_GEOMETRY_WRITE)
            .unwrap();
        graph.add_child(root, a).unwrap();
        graph.add_child(root, b).unwrap();

        let (list, _) = build(&graph, root);
        assert_eq!(list.borrow().geometry_slot_count(), 2);
    }

    #[test]
    fn transform_change_reaches_only_descendants() {
        let mut graph = SceneGraph::new();
        let geometry = triangle();
        let root = graph.create_group(Capabilities::empty());
        let moving = graph.create_transform_group(Mat4::IDENTITY, Capabilities::ALLOW_TRANSFORM_WRITE);
        let inside = shape(&mut graph, &geometry);
        let outside = shape(&mut graph, &geometry);
        let light = graph.create_directional_light(Vec3::ONE, Vec3::NEG_Y);
        graph.add_child(root, moving).unwrap();
        graph.add_child(moving, inside).unwrap();
        graph.add_child(moving, light).unwrap();
        graph.add_child(root, outside).unwrap();

        let (list, repaint) = build(&graph, root);
        let moved = Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0));
        graph.set_transform(moving, moved).unwrap();

        let list = list.borrow();
        assert!(list.records_of(inside)[0].transform.abs_diff_eq(moved, 1e-6));
        assert!(list.lights_of(light)[0].transform.abs_diff_eq(moved, 1e-6));
        assert_eq!(list.records_of(outside)[0].transform, Mat4::IDENTITY);
        assert!(repaint.is_needed());
    }

    #[test]
    fn transform_inside_shared_group_moves_every_instance() {
        let mut graph = SceneGraph::new();
        let geometry = triangle();
        let shared = graph.create_shared_group(Capabilities::empty());
        let spin = graph.create_transform_group(Mat4::IDENTITY, Capabilities::ALLOW_TRANSFORM_WRITE);
        let model = shape(&mut graph, &geometry);
        graph.add_child(shared, spin).unwrap();
        graph.add_child(spin, model).unwrap();

        let root = graph.create_group(Capabilities::empty());
        let left = graph.create_transform_group(Mat4::from_translation(Vec3::NEG_X), Capabilities::ALLOW_TRANSFORM_WRITE);
        let right = graph.create_transform_group(Mat4::from_translation(Vec3::X), Capabilities::empty());
        for parent in [left, right] {
            graph.add_child(root, parent).unwrap();
            let link = graph.create_link(shared).unwrap();
            graph.add_child(parent, link).unwrap();
        }

        let (list, _) = build(&graph, root);
        let scale = Mat4::from_scale(Vec3::splat(2.0));
        graph.set_transform(spin, scale).unwrap();
        {
            let list = list.borrow();
            let records = list.records_of(model);
            assert_eq!(records.len(), 2);
            assert_eq!(list.geometry_slot_count(), 1);
            let translations: Vec<f32> = records.iter().map(|r| r.transform.w_axis.x).collect();
            assert!(translations.contains(&-1.0) && translations.contains(&1.0));
            assert!(records.iter().all(|r| (r.transform.x_axis.x - 2.0).abs() < 1e-6));
        }

        // Moving one instance parent leaves the other instance alone.
        graph.set_transform(left, Mat4::from_translation(Vec3::new(-5.0, 0.0, 0.0))).unwrap();
        let list = list.borrow();
        let xs: Vec<f32> = list.records_of(model).iter().map(|r| r.transform.w_axis.x).collect();
        assert!(xs.contains(&-5.0) && xs.contains(&1.0));
    }

    #[test]
    fn added_and_removed_subtrees_are_patched() {
        let mut graph = SceneGraph::new();
        let geometry = triangle();
        let root = graph.create_group(Capabilities::ALLOW_CHILDREN_EXTEND);
        let (list, _) = build(&graph, root);

        let branch = graph.create_transform_group(Mat4::from_translation(Vec3::Z), Capabilities::empty());
        let added = shape(&mut graph, &geometry);
        let light = graph.create_ambient_light(Vec3::splat(0.3));
        graph.add_child(branch, added).unwrap();
        graph.add_child(branch, light).unwrap();
        graph.add_child(root, branch).unwrap();
        {
            let list = list.borrow();
            assert_eq!(list.len(), 1);
            assert_eq!(list.lights().count(), 1);
            assert!(list.records_of(added)[0]
                .transform
                .abs_diff_eq(Mat4::from_translation(Vec3::Z), 1e-6));
        }
        assert!(graph.node(added).unwrap().is_live());

        graph.remove_child(root, branch).unwrap();
        {
            let mut list = list.borrow_mut();
            assert!(list.is_empty());
            assert_eq!(list.lights().count(), 0);
            assert_eq!(list.geometry_slot_count(), 0);
            assert!(list.take_released_buffers().is_empty(), "never uploaded");
        }
        assert!(!graph.node(added).unwrap().is_live());
        assert_eq!(graph.subscriber_count(Subject::Node(added)), 0);

        // A second removal pass over the detached subtree finds nothing to do.
        list.borrow_mut().remove_subtree(&graph, branch);
        assert!(list.borrow().is_empty());
    }

    #[test]
    fn appearance_edits_patch_records() {
        let mut graph = SceneGraph::new();
        let appearance = graph.create_appearance(Appearance::default().with_diffuse_color(Vec3::X));
        let root = graph.create_group(Capabilities::empty());
        let model = graph.create_shape(Some(appearance), Capabilities::empty()).unwrap();
        graph.add_geometry(model, triangle()).unwrap();
        graph.add_child(root, model).unwrap();

        let (list, _) = build(&graph, root);
        assert!(list.borrow().records_of(model)[0].lighting_enabled);

        graph
            .update_appearance(appearance, AppearanceChange::Transparency(Some(0.5)))
            .unwrap();
        graph
            .update_appearance(appearance, AppearanceChange::Illumination(Some(0)))
            .unwrap();
        let list = list.borrow();
        let record = list.records_of(model)[0];
        assert!(record.is_color_transparent());
        assert!((record.material.alpha - 0.5).abs() < 1e-6);
        assert!(!record.lighting_enabled);
    }

    #[test]
    fn removing_a_subtree_keeps_the_remaining_order() {
        let mut graph = SceneGraph::new();
        let geometry = triangle();
        let root = graph.create_group(Capabilities::ALLOW_CHILDREN_EXTEND);
        let first = shape(&mut graph, &geometry);
        let branch = graph.create_group(Capabilities::empty());
        let inner = [shape(&mut graph, &geometry), shape(&mut graph, &geometry)];
        let light = graph.create_ambient_light(Vec3::ONE);
        let last = shape(&mut graph, &geometry);
        graph.add_child(root, first).unwrap();
        for node in inner {
            graph.add_child(branch, node).unwrap();
        }
        graph.add_child(branch, light).unwrap();
        graph.add_child(root, branch).unwrap();
        graph.add_child(root, last).unwrap();

        let (list, _) = build(&graph, root);
        assert_eq!(list.borrow().len(), 4);
        graph.remove_child(root, branch).unwrap();

        let list = list.borrow();
        assert_eq!(list.len(), 2);
        assert_eq!(list.lights().count(), 0);
        assert_eq!(list.record_at(0).map(|record| record.node), Some(first));
        assert_eq!(list.record_at(1).map(|record| record.node), Some(last));
        assert!(list.record_at(2).is_none());
    }

    #[test]
    fn removing_one_geometry_keeps_the_others() {
        let mut graph = SceneGraph::new();
        let root = graph.create_group(Capabilities::empty());
        let model = graph.create_shape(None, Capabilities::ALLOW_GEOMETRY_WRITE).unwrap();
        let (a, b) = (triangle(), triangle());
        graph.add_geometry(model, Arc::clone(&a)).unwrap();
        graph.add_geometry(model, Arc::clone(&b)).unwrap();
        graph.add_child(root, model).unwrap();

        let (list, _) = build(&graph, root);
        graph.remove_geometry(model, &a).unwrap();
        let list = list.borrow();
        assert_eq!(list.len(), 1);
        assert!(Arc::ptr_eq(&list.record_at(0).unwrap().geometry, &b));
    }

    #[test]
    fn lines_are_lit_unless_illumination_is_off() {
        let mut graph = SceneGraph::new();
        let root = graph.create_group(Capabilities::empty());
        let outline = Arc::new(GeometryArray::lines(vec![Vec3::ZERO, Vec3::X], vec![0, 1]).unwrap());
        let lit = shape(&mut graph, &outline);
        let appearance = graph.create_appearance(Appearance {
            illumination: Some(0),
            ..Appearance::default()
        });
        let flat = graph.create_shape(Some(appearance), Capabilities::empty()).unwrap();
        graph.add_geometry(flat, Arc::clone(&outline)).unwrap();
        graph.add_child(root, lit).unwrap();
        graph.add_child(root, flat).unwrap();

        let (list, _) = build(&graph, root);
        let list = list.borrow();
        let record = list.records_of(lit)[0];
        assert_eq!(record.mode, RenderMode::Lines);
        assert!(record.lighting_enabled);
        assert!(!list.records_of(flat)[0].lighting_enabled);
    }

    #[test]
    fn background_records_are_flagged() {
        let mut graph = SceneGraph::new();
        let root = graph.create_group(Capabilities::empty());
        let sky = graph.create_group(Capabilities::empty());
        let dome = shape(&mut graph, &triangle());
        graph.add_child(sky, dome).unwrap();
        let background = graph.create_background(sky).unwrap();
        graph.add_child(root, background).unwrap();

        let (list, _) = build(&graph, root);
        assert!(list.borrow().records_of(dome)[0].background);
    }

    #[test]
    fn progress_fires_at_ten_percent_steps() {
        let mut graph = SceneGraph::new();
        let root = graph.create_group(Capabilities::empty());
        let geometry = triangle();
        for _ in 0..20 {
            let s = shape(&mut graph, &geometry);
            graph.add_child(root, s).unwrap();
        }
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        let list = RenderList::build(
            &graph,
            root,
            Rc::new(RepaintRequest::detached()),
            Some(Box::new(move |progress: BuildProgress| {
                assert_eq!(progress.stage, LoadStage::BindingModel);
                assert!(progress.fraction < 1.0);
                seen.set(seen.get() + 1);
            })),
        );
        assert_eq!(calls.get(), 9);
        assert!(list.borrow_mut().take_progress().is_some());
    }

    #[test]
    fn detach_releases_everything() {
        let mut graph = SceneGraph::new();
        let root = graph.create_group(Capabilities::ALLOW_CHILDREN_EXTEND);
        let model = shape(&mut graph, &triangle());
        graph.add_child(root, model).unwrap();
        let (list, _) = build(&graph, root);
        assert!(list.borrow().subscription_count() > 0);

        list.borrow_mut().detach(&graph);
        assert_eq!(list.borrow().subscription_count(), 0);
        assert!(!graph.node(root).unwrap().is_live());
        assert_eq!(graph.subscriber_count(Subject::Node(root)), 0);

        // Detached lists no longer follow the graph.
        let extra = shape(&mut graph, &triangle());
        graph.add_child(root, extra).unwrap();
        assert!(list.borrow().is_empty());
    }
}
