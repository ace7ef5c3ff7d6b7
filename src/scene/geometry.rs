use std::sync::atomic::{AtomicU64, Ordering};

use glam::{Vec2, Vec3};

use super::bounds::BoundingBox;
use super::error::SceneError;

/// Process-unique identity of a geometry array. Two shapes referencing the
/// same `Arc<GeometryArray>` see the same id; equal data built twice does not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryId(u64);

impl GeometryId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    /// Pairs of indices, one segment each.
    Lines,
    Triangles,
}

/// Vertex data where every attribute has its own index list.
#[derive(Debug)]
pub struct GeometryArray {
    id: GeometryId,
    kind: GeometryKind,
    vertices: Vec<Vec3>,
    vertex_indices: Vec<u32>,
    normals: Vec<Vec3>,
    normal_indices: Vec<u32>,
    texture_coordinates: Vec<Vec2>,
    texture_coordinate_indices: Vec<u32>,
}

impl GeometryArray {
    pub fn lines(vertices: Vec<Vec3>, vertex_indices: Vec<u32>) -> Result<Self, SceneError> {
        if vertex_indices.len() % 2 != 0 {
            return Err(SceneError::InvalidGeometry(format!(
                "line geometry needs index pairs, got {} indices",
                vertex_indices.len()
            )));
        }
        check_indices("vertex", &vertex_indices, vertices.len())?;
        Ok(Self {
            id: GeometryId::next(),
            kind: GeometryKind::Lines,
            vertices,
            vertex_indices,
            normals: Vec::new(),
            normal_indices: Vec::new(),
            texture_coordinates: Vec::new(),
            texture_coordinate_indices: Vec::new(),
        })
    }

    pub fn triangles(
        vertices: Vec<Vec3>,
        vertex_indices: Vec<u32>,
        normals: Vec<Vec3>,
        normal_indices: Vec<u32>,
    ) -> Result<Self, SceneError> {
        if vertex_indices.len() % 3 != 0 {
            return Err(SceneError::InvalidGeometry(format!(
                "triangle geometry needs index triples, got {} indices",
                vertex_indices.len()
            )));
        }
        if normal_indices.len() != vertex_indices.len() {
            return Err(SceneError::InvalidGeometry(format!(
                "{} normal indices for {} vertex indices",
                normal_indices.len(),
                vertex_indices.len()
            )));
        }
        check_indices("vertex", &vertex_indices, vertices.len())?;
        check_indices("normal", &normal_indices, normals.len())?;
        Ok(Self {
            id: GeometryId::next(),
            kind: GeometryKind::Triangles,
            vertices,
            vertex_indices,
            normals,
            normal_indices,
            texture_coordinates: Vec::new(),
            texture_coordinate_indices: Vec::new(),
        })
    }

    pub fn with_texture_coordinates(
        mut self,
        texture_coordinates: Vec<Vec2>,
        texture_coordinate_indices: Vec<u32>,
    ) -> Result<Self, SceneError> {
        if texture_coordinate_indices.len() != self.vertex_indices.len() {
            return Err(SceneError::InvalidGeometry(format!(
                "{} texture coordinate indices for {} vertex indices",
                texture_coordinate_indices.len(),
                self.vertex_indices.len()
            )));
        }
        check_indices(
            "texture coordinate",
            &texture_coordinate_indices,
            texture_coordinates.len(),
        )?;
        self.texture_coordinates = texture_coordinates;
        self.texture_coordinate_indices = texture_coordinate_indices;
        Ok(self)
    }

    pub fn id(&self) -> GeometryId {
        self.id
    }

    pub fn kind(&self) -> GeometryKind {
        self.kind
    }

    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    pub fn vertex_indices(&self) -> &[u32] {
        &self.vertex_indices
    }

    /// Number of vertices drawn once every stream is expanded.
    pub fn vertex_count(&self) -> usize {
        self.vertex_indices.len()
    }

    pub fn has_normals(&self) -> bool {
        self.kind == GeometryKind::Triangles && !self.normal_indices.is_empty()
    }

    pub fn has_texture_coordinates(&self) -> bool {
        !self.texture_coordinate_indices.is_empty()
    }

    pub fn expanded_positions(&self) -> Vec<f32> {
        expand(&self.vertices, &self.vertex_indices, |v| v.to_array())
    }

    pub fn expanded_normals(&self) -> Option<Vec<f32>> {
        self.has_normals()
            .then(|| expand(&self.normals, &self.normal_indices, |n| n.to_array()))
    }

    pub fn expanded_texture_coordinates(&self) -> Option<Vec<f32>> {
        self.has_texture_coordinates().then(|| {
            expand(
                &self.texture_coordinates,
                &self.texture_coordinate_indices,
                |uv| uv.to_array(),
            )
        })
    }

    /// Bounds of the referenced vertices only.
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::from_points(
            self.vertex_indices
                .iter()
                .map(|&index| self.vertices[index as usize]),
        )
    }
}

fn check_indices(attribute: &str, indices: &[u32], len: usize) -> Result<(), SceneError> {
    match indices.iter().find(|&&index| index as usize >= len) {
        Some(index) => Err(SceneError::InvalidGeometry(format!(
            "{attribute} index {index} out of range for {len} entries"
        ))),
        None => Ok(()),
    }
}

fn expand<T: Copy, const N: usize>(
    data: &[T],
    indices: &[u32],
    components: impl Fn(T) -> [f32; N],
) -> Vec<f32> {
    let mut out = Vec::with_capacity(indices.len() * N);
    for &index in indices {
        out.extend_from_slice(&components(data[index as usize]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> GeometryArray {
        let vertices = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ];
        GeometryArray::triangles(
            vertices,
            vec![0, 1, 2, 0, 2, 3],
            vec![Vec3::Z],
            vec![0; 6],
        )
        .unwrap()
    }

    #[test]
    fn streams_are_expanded_through_their_own_indices() {
        let geometry = quad()
            .with_texture_coordinates(vec![Vec2::ZERO, Vec2::ONE], vec![0, 1, 1, 0, 1, 0])
            .unwrap();
        let positions = geometry.expanded_positions();
        assert_eq!(positions.len(), 18);
        assert_eq!(&positions[6..9], &[1.0, 1.0, 0.0]);

        let normals = geometry.expanded_normals().unwrap();
        assert_eq!(normals.len(), 18);
        assert!(normals.chunks(3).all(|n| n == [0.0, 0.0, 1.0]));

        let uvs = geometry.expanded_texture_coordinates().unwrap();
        assert_eq!(&uvs[0..4], &[0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let err = GeometryArray::lines(vec![Vec3::ZERO, Vec3::X], vec![0, 2]).unwrap_err();
        assert!(matches!(err, SceneError::InvalidGeometry(_)));
    }

    #[test]
    fn normal_indices_must_match_vertex_indices() {
        let err = GeometryArray::triangles(
            vec![Vec3::ZERO, Vec3::X, Vec3::Y],
            vec![0, 1, 2],
            vec![Vec3::Z],
            vec![0],
        )
        .unwrap_err();
        assert!(matches!(err, SceneError::InvalidGeometry(_)));
    }

    #[test]
    fn lines_have_no_normals() {
        let lines = GeometryArray::lines(vec![Vec3::ZERO, Vec3::X], vec![0, 1]).unwrap();
        assert!(!lines.has_normals());
        assert!(lines.expanded_normals().is_none());
    }

    #[test]
    fn identity_differs_for_equal_data() {
        assert_ne!(quad().id(), quad().id());
    }

    #[test]
    fn bounds_cover_referenced_vertices() {
        let bounds = quad().bounds();
        assert_eq!(bounds.lower(), Vec3::ZERO);
        assert_eq!(bounds.upper(), Vec3::new(1.0, 1.0, 0.0));
    }
}
