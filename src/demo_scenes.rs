use std::sync::Arc;

use glam::{Mat4, Quat, Vec3};
use image::{Rgba, RgbaImage};

use crate::scene::shapes::box_geometry;
use crate::scene::{
    Appearance, Capabilities, CullFace, NodeId, SceneError, SceneGraph, TextureImage, Transform,
};

/// Handles the viewer keeps after building the demo.
pub struct DemoScene {
    pub root: NodeId,
    /// Writable transform group spinning the instanced boxes.
    pub carousel: NodeId,
}

/// Checkerboard with a side that is not a power of two.
fn checker_image(size: u32, cells: u32) -> RgbaImage {
    let cell = (size / cells).max(1);
    RgbaImage::from_fn(size, size, |x, y| {
        if ((x / cell) + (y / cell)) % 2 == 0 {
            Rgba([200, 200, 190, 255])
        } else {
            Rgba([90, 90, 100, 255])
        }
    })
}

fn named_shape(
    graph: &mut SceneGraph,
    name: &str,
    appearance: Appearance,
    half_extents: Vec3,
) -> Result<NodeId, SceneError> {
    let appearance = graph.create_appearance(appearance);
    let shape = graph.create_shape(Some(appearance), Capabilities::empty())?;
    graph.add_geometry(shape, Arc::new(box_geometry(half_extents)?))?;
    graph.set_name(shape, name)?;
    Ok(shape)
}

/// A textured floor, five instances of one box through a shared group, a
/// half-transparent pane, a sky background and two lights.
pub fn build_demo_scene(graph: &mut SceneGraph) -> Result<DemoScene, SceneError> {
    let root = graph.create_group(Capabilities::ALLOW_CHILDREN_EXTEND);

    let sky = graph.create_group(Capabilities::empty());
    let sky_box = named_shape(
        graph,
        "sky",
        Appearance::default()
            .with_diffuse_color(Vec3::new(0.35, 0.5, 0.75))
            .with_cull_face(CullFace::None),
        Vec3::splat(0.5),
    )?;
    graph.add_child(sky, sky_box)?;
    let background = graph.create_background(sky)?;
    graph.add_child(root, background)?;

    let floor = named_shape(
        graph,
        "floor",
        Appearance::default()
            .with_ambient_color(Vec3::splat(0.6))
            .with_texture(TextureImage::from_rgba(checker_image(96, 8))),
        Vec3::new(3.0, 0.05, 3.0),
    )?;
    let floor_group = graph.create_transform_group(
        Mat4::from_translation(Vec3::new(0.0, -0.55, 0.0)),
        Capabilities::empty(),
    );
    graph.add_child(floor_group, floor)?;
    graph.add_child(root, floor_group)?;

    let crate_model = graph.create_shared_group(Capabilities::empty());
    let crate_box = named_shape(
        graph,
        "crate",
        Appearance::default()
            .with_ambient_color(Vec3::new(0.5, 0.3, 0.1))
            .with_diffuse_color(Vec3::new(0.8, 0.5, 0.2))
            .with_specular(Vec3::splat(0.4), 24.0),
        Vec3::splat(0.25),
    )?;
    graph.add_child(crate_model, crate_box)?;

    let carousel =
        graph.create_transform_group(Mat4::IDENTITY, Capabilities::ALLOW_TRANSFORM_WRITE);
    for index in 0..5 {
        let angle = index as f32 * std::f32::consts::TAU / 5.0;
        let position = Vec3::new(1.5 * angle.cos(), -0.25, 1.5 * angle.sin());
        let placement =
            Transform::from_translation(position).with_rotation(Quat::from_rotation_y(angle));
        let slot = graph.create_transform_group(placement.matrix(), Capabilities::empty());
        let link = graph.create_link(crate_model)?;
        graph.add_child(slot, link)?;
        graph.add_child(carousel, slot)?;
    }
    graph.add_child(root, carousel)?;

    let pane = named_shape(
        graph,
        "glass pane",
        Appearance::default()
            .with_diffuse_color(Vec3::new(0.6, 0.8, 0.9))
            .with_transparency(0.5)
            .with_cull_face(CullFace::None),
        Vec3::new(0.6, 0.4, 0.02),
    )?;
    graph.add_child(root, pane)?;

    let ambient = graph.create_ambient_light(Vec3::splat(0.25));
    let sun = graph.create_directional_light(Vec3::splat(0.85), Vec3::new(-0.4, -1.0, -0.6));
    graph.add_child(root, ambient)?;
    graph.add_child(root, sun)?;

    log::info!("Demo scene built with {} nodes", graph.len());
    Ok(DemoScene { root, carousel })
}
