//! Scene edits reaching a live canvas through the render list.
//!
//! Every test drives `Canvas3D<SoftwareBackend>` the way a host would: build
//! a graph, `set_scene`, answer animation frames, then mutate the graph and
//! check what the flat list and the backend saw.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use canvas3d::renderer::{
    BuildProgress, Canvas3D, FrameScheduler, LoadStage, ProgressCallback, SoftwareBackend,
};
use canvas3d::scene::{Capabilities, GeometryArray, NodeId, SceneGraph};
use canvas3d::RenderSettings;
use glam::{Mat4, Vec3};

fn quad(half: f32) -> Arc<GeometryArray> {
    Arc::new(
        GeometryArray::triangles(
            vec![
                Vec3::new(-half, -half, 0.0),
                Vec3::new(half, -half, 0.0),
                Vec3::new(half, half, 0.0),
                Vec3::new(-half, half, 0.0),
            ],
            vec![0, 1, 2, 0, 2, 3],
            vec![Vec3::Z],
            vec![0; 6],
        )
        .unwrap(),
    )
}

fn shape_with(graph: &mut SceneGraph, geometry: &Arc<GeometryArray>) -> NodeId {
    let shape = graph.create_shape(None, Capabilities::empty()).unwrap();
    graph.add_geometry(shape, Arc::clone(geometry)).unwrap();
    shape
}

fn canvas() -> Canvas3D<SoftwareBackend> {
    Canvas3D::new(SoftwareBackend::new(32, 32), RenderSettings::default())
}

fn show(canvas: &mut Canvas3D<SoftwareBackend>, graph: &SceneGraph, root: NodeId) {
    canvas.set_scene(root, None);
    assert!(canvas.on_animation_frame(graph).unwrap());
}

struct CountingScheduler(Rc<Cell<u32>>);

impl FrameScheduler for CountingScheduler {
    fn request_frame(&self) {
        self.0.set(self.0.get() + 1);
    }
}

#[test]
fn shared_geometry_is_uploaded_once() {
    let mut graph = SceneGraph::new();
    let geometry = quad(0.5);
    let root = graph.create_group(Capabilities::empty());
    let a = shape_with(&mut graph, &geometry);
    let b = shape_with(&mut graph, &geometry);
    graph.add_child(root, a).unwrap();
    graph.add_child(root, b).unwrap();

    let mut canvas = canvas();
    show(&mut canvas, &graph, root);

    let list = canvas.render_list().unwrap();
    let list = list.borrow();
    let slot_a = list.records_of(a)[0].slot;
    let slot_b = list.records_of(b)[0].slot;
    assert_eq!(slot_a, slot_b);
    assert_eq!(list.geometry_slot_count(), 1);
    assert_eq!(list.buffers(slot_a), list.buffers(slot_b));
    assert!(list.buffers(slot_a).is_some());
    // Positions and normals, once.
    assert_eq!(canvas.backend().stats().buffers_created, 2);
}

#[test]
fn linked_instances_share_buffers_with_their_own_transforms() {
    let mut graph = SceneGraph::new();
    let model = graph.create_shared_group(Capabilities::empty());
    let shape = shape_with(&mut graph, &quad(0.5));
    graph.add_child(model, shape).unwrap();

    let root = graph.create_group(Capabilities::empty());
    for x in [-1.0, 1.0] {
        let placement =
            graph.create_transform_group(Mat4::from_translation(Vec3::X * x), Capabilities::empty());
        let link = graph.create_link(model).unwrap();
        graph.add_child(placement, link).unwrap();
        graph.add_child(root, placement).unwrap();
    }

    let mut canvas = canvas();
    show(&mut canvas, &graph, root);

    let list = canvas.render_list().unwrap();
    let list = list.borrow();
    let records = list.records_of(shape);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].slot, records[1].slot);
    assert_eq!(records[0].node, shape);
    let xs: Vec<f32> = records.iter().map(|r| r.transform.w_axis.x).collect();
    assert!(xs.contains(&-1.0) && xs.contains(&1.0));
    assert_eq!(canvas.backend().stats().buffers_created, 2);
}

#[test]
fn transform_edits_reach_only_descendants() {
    let mut graph = SceneGraph::new();
    let root = graph.create_group(Capabilities::empty());
    let moving = graph.create_transform_group(Mat4::IDENTITY, Capabilities::ALLOW_TRANSFORM_WRITE);
    let fixed = graph.create_transform_group(
        Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0)),
        Capabilities::empty(),
    );
    let a = shape_with(&mut graph, &quad(0.5));
    let b = shape_with(&mut graph, &quad(0.5));
    let light = graph.create_directional_light(Vec3::ONE, Vec3::NEG_Y);
    graph.add_child(moving, a).unwrap();
    graph.add_child(moving, light).unwrap();
    graph.add_child(fixed, b).unwrap();
    graph.add_child(root, moving).unwrap();
    graph.add_child(root, fixed).unwrap();

    let mut canvas = canvas();
    show(&mut canvas, &graph, root);
    assert!(!canvas.needs_repaint());

    let moved = Mat4::from_translation(Vec3::new(2.0, 0.0, -1.0));
    graph.set_transform(moving, moved).unwrap();
    assert!(canvas.needs_repaint());

    let list = canvas.render_list().unwrap();
    let list = list.borrow();
    assert_eq!(list.records_of(a)[0].transform, moved);
    assert_eq!(list.lights_of(light)[0].transform, moved);
    assert_eq!(
        list.records_of(b)[0].transform,
        Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0))
    );
}

#[test]
fn locked_transform_group_rejects_writes() {
    let mut graph = SceneGraph::new();
    let group = graph.create_transform_group(Mat4::IDENTITY, Capabilities::empty());
    assert!(graph.set_transform(group, Mat4::from_scale(Vec3::splat(2.0))).is_err());
    assert_eq!(graph.transform(group), Some(Mat4::IDENTITY));
}

#[test]
fn removed_subtree_leaves_the_list_and_frees_its_buffers() {
    let mut graph = SceneGraph::new();
    let root = graph.create_group(Capabilities::ALLOW_CHILDREN_EXTEND);
    let branch = graph.create_group(Capabilities::empty());
    let shape = shape_with(&mut graph, &quad(0.5));
    let light = graph.create_ambient_light(Vec3::splat(0.3));
    graph.add_child(branch, shape).unwrap();
    graph.add_child(branch, light).unwrap();
    graph.add_child(root, branch).unwrap();

    let mut canvas = canvas();
    show(&mut canvas, &graph, root);
    assert_eq!(canvas.backend().stats().live_buffers, 2);

    assert!(graph.remove_child(root, branch).unwrap());
    {
        let list = canvas.render_list().unwrap();
        let list = list.borrow();
        assert!(list.records_of(shape).is_empty());
        assert!(list.lights_of(light).is_empty());
        assert!(list.is_empty());
    }
    assert!(canvas.on_animation_frame(&graph).unwrap());
    assert_eq!(canvas.backend().stats().live_buffers, 0);

    // Removing again is a no-op.
    assert!(!graph.remove_child(root, branch).unwrap());
}

#[test]
fn added_subtree_is_bound_without_a_rebuild() {
    let mut graph = SceneGraph::new();
    let root = graph.create_group(Capabilities::ALLOW_CHILDREN_EXTEND);
    let mut canvas = canvas();
    show(&mut canvas, &graph, root);
    let list = canvas.render_list().unwrap();
    assert!(list.borrow().is_empty());

    let shape = shape_with(&mut graph, &quad(0.5));
    graph.add_child(root, shape).unwrap();
    assert_eq!(list.borrow().records_of(shape).len(), 1);
    assert!(canvas.on_animation_frame(&graph).unwrap());
    assert_eq!(canvas.backend().stats().live_buffers, 2);
    assert!(Rc::ptr_eq(&list, &canvas.render_list().unwrap()));
}

#[test]
fn repaint_requests_fold_into_one_frame() {
    let frames = Rc::new(Cell::new(0));
    let mut graph = SceneGraph::new();
    let root = graph.create_group(Capabilities::empty());
    let moving = graph.create_transform_group(Mat4::IDENTITY, Capabilities::ALLOW_TRANSFORM_WRITE);
    let shape = shape_with(&mut graph, &quad(0.5));
    graph.add_child(moving, shape).unwrap();
    graph.add_child(root, moving).unwrap();

    let mut canvas = Canvas3D::with_scheduler(
        SoftwareBackend::new(16, 16),
        RenderSettings::default(),
        Box::new(CountingScheduler(frames.clone())),
    );
    canvas.set_scene(root, None);
    assert_eq!(frames.get(), 1);
    assert!(canvas.on_animation_frame(&graph).unwrap());
    assert_eq!(frames.get(), 1);

    canvas.set_field_of_view(0.9);
    canvas.set_back_clip_distance(50.0);
    graph.set_transform(moving, Mat4::from_translation(Vec3::X)).unwrap();
    graph.set_transform(moving, Mat4::from_translation(Vec3::Y)).unwrap();
    assert_eq!(frames.get(), 2);

    let drawn = canvas.backend().stats().frames;
    assert!(canvas.on_animation_frame(&graph).unwrap());
    assert!(!canvas.on_animation_frame(&graph).unwrap());
    assert_eq!(canvas.backend().stats().frames, drawn + 1);
    let list = canvas.render_list().unwrap();
    assert_eq!(
        list.borrow().records_of(shape)[0].transform,
        Mat4::from_translation(Vec3::Y)
    );
}

#[test]
fn scene_swap_is_deferred_and_superseded() {
    let mut graph = SceneGraph::new();
    let first = graph.create_group(Capabilities::empty());
    let second = graph.create_group(Capabilities::empty());
    let shape = shape_with(&mut graph, &quad(0.5));
    graph.add_child(second, shape).unwrap();

    let mut canvas = canvas();
    canvas.set_scene(first, None);
    canvas.set_scene(second, None);
    assert!(canvas.render_list().is_none());
    canvas.on_animation_frame(&graph).unwrap();
    assert_eq!(canvas.render_list().unwrap().borrow().root(), second);
}

#[test]
fn replacing_the_scene_releases_the_old_one() {
    let mut graph = SceneGraph::new();
    let first = graph.create_group(Capabilities::ALLOW_CHILDREN_EXTEND);
    let shape = shape_with(&mut graph, &quad(0.5));
    graph.add_child(first, shape).unwrap();
    let second = graph.create_group(Capabilities::empty());

    let mut canvas = canvas();
    show(&mut canvas, &graph, first);
    assert_eq!(canvas.backend().stats().live_buffers, 2);
    assert!(graph.subscriber_count(canvas3d::scene::Subject::Node(first)) > 0);

    show(&mut canvas, &graph, second);
    assert_eq!(canvas.backend().stats().live_buffers, 0);
    assert_eq!(graph.subscriber_count(canvas3d::scene::Subject::Node(first)), 0);
}

#[test]
fn progress_reports_tenths_then_completion() {
    let mut graph = SceneGraph::new();
    let root = graph.create_group(Capabilities::empty());
    for _ in 0..20 {
        let shape = shape_with(&mut graph, &quad(0.1));
        graph.add_child(root, shape).unwrap();
    }

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let progress: ProgressCallback = Box::new(move |progress: BuildProgress| {
        assert_eq!(progress.stage, LoadStage::BindingModel);
        sink.borrow_mut().push(progress.fraction);
    });

    let mut canvas = canvas();
    canvas.set_scene(root, Some(progress));
    assert!(seen.borrow().is_empty());
    canvas.on_animation_frame(&graph).unwrap();

    let seen = seen.borrow();
    assert_eq!(seen.len(), 10);
    assert_eq!(seen.last().copied(), Some(1.0));
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn cancelled_repaint_skips_the_frame() {
    let mut graph = SceneGraph::new();
    let root = graph.create_group(Capabilities::empty());
    let moving = graph.create_transform_group(Mat4::IDENTITY, Capabilities::ALLOW_TRANSFORM_WRITE);
    graph.add_child(root, moving).unwrap();

    let mut canvas = canvas();
    show(&mut canvas, &graph, root);
    graph.set_transform(moving, Mat4::from_translation(Vec3::Z)).unwrap();
    assert!(canvas.needs_repaint());
    canvas.cancel_repaint();
    assert!(!canvas.on_animation_frame(&graph).unwrap());
}
