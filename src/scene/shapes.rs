use std::sync::Arc;

use glam::{Vec2, Vec3};

use super::error::SceneError;
use super::geometry::GeometryArray;
use super::node::{AppearanceId, Capabilities, NodeId};
use super::SceneGraph;

/// Faces as (normal, u, v) with `u × v = normal`, so corners listed
/// (-u,-v) (+u,-v) (+u,+v) (-u,+v) wind counter-clockwise seen from outside.
const FACES: [(Vec3, Vec3, Vec3); 6] = [
    (Vec3::X, Vec3::Y, Vec3::Z),
    (Vec3::NEG_X, Vec3::Z, Vec3::Y),
    (Vec3::Y, Vec3::Z, Vec3::X),
    (Vec3::NEG_Y, Vec3::X, Vec3::Z),
    (Vec3::Z, Vec3::X, Vec3::Y),
    (Vec3::NEG_Z, Vec3::Y, Vec3::X),
];

const CORNERS: [(f32, f32); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

/// Textured, lit box centered on the origin.
pub fn box_geometry(half_extents: Vec3) -> Result<GeometryArray, SceneError> {
    let mut vertices = Vec::with_capacity(24);
    let mut vertex_indices = Vec::with_capacity(36);
    let mut normal_indices = Vec::with_capacity(36);
    let mut uv_indices = Vec::with_capacity(36);

    for (face, (normal, u, v)) in FACES.iter().enumerate() {
        let base = vertices.len() as u32;
        for (su, sv) in CORNERS {
            vertices.push((*normal + *u * su + *v * sv) * half_extents);
        }
        for corner in [0, 1, 2, 0, 2, 3] {
            vertex_indices.push(base + corner);
            normal_indices.push(face as u32);
            uv_indices.push(corner);
        }
    }

    let normals = FACES.iter().map(|(normal, _, _)| *normal).collect();
    let uvs = vec![
        Vec2::new(0.0, 0.0),
        Vec2::new(1.0, 0.0),
        Vec2::new(1.0, 1.0),
        Vec2::new(0.0, 1.0),
    ];
    GeometryArray::triangles(vertices, vertex_indices, normals, normal_indices)?
        .with_texture_coordinates(uvs, uv_indices)
}

/// Unit box shape standing in for a model that failed to load.
pub fn placeholder_box(
    graph: &mut SceneGraph,
    appearance: Option<AppearanceId>,
) -> Result<NodeId, SceneError> {
    let shape = graph.create_shape(appearance, Capabilities::empty())?;
    graph.add_geometry(shape, Arc::new(box_geometry(Vec3::splat(0.5))?))?;
    graph.set_name(shape, "placeholder")?;
    Ok(shape)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faces_wind_outward() {
        let geometry = box_geometry(Vec3::new(1.0, 2.0, 3.0)).unwrap();
        let vertices = geometry.vertices();
        for (face, triangle) in geometry.vertex_indices().chunks(3).enumerate() {
            let [a, b, c] = [0, 1, 2].map(|i| vertices[triangle[i] as usize]);
            let normal = (b - a).cross(c - a).normalize();
            let expected = FACES[face / 2].0;
            assert!(normal.abs_diff_eq(expected, 1e-6), "face {face}: {normal:?}");
        }
    }

    #[test]
    fn placeholder_spans_unit_cube() {
        let mut graph = SceneGraph::new();
        let shape = placeholder_box(&mut graph, None).unwrap();
        let bounds = graph.shape_bounds(shape).unwrap();
        assert_eq!(bounds.lower(), Vec3::splat(-0.5));
        assert_eq!(bounds.upper(), Vec3::splat(0.5));
        assert_eq!(graph.node(shape).unwrap().name(), Some("placeholder"));
    }
}
