//! Cell shapes and their reference sub-entity numbering.
//!
//! Vertex numbering follows the UFC/DOLFINx convention: simplices number
//! edges opposite to vertices, tensor-product cells use lexicographic
//! (x fastest) vertex order.

use serde::{Deserialize, Serialize};

/// Supported cell shapes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum CellType {
    /// 0D vertex.
    Vertex,
    /// 1D segment/interval.
    Segment,
    /// 2D simplex (triangle).
    Triangle,
    /// 2D tensor-product cell (quad).
    Quadrilateral,
    /// 3D simplex (tet).
    Tetrahedron,
    /// 3D tensor-product cell (hex).
    Hexahedron,
}

impl Default for CellType {
    fn default() -> Self {
        CellType::Vertex
    }
}

const SEGMENT_EDGES: &[&[usize]] = &[&[0, 1]];
const TRIANGLE_EDGES: &[&[usize]] = &[&[1, 2], &[0, 2], &[0, 1]];
const QUADRILATERAL_EDGES: &[&[usize]] = &[&[0, 1], &[0, 2], &[1, 3], &[2, 3]];
const TETRAHEDRON_EDGES: &[&[usize]] = &[&[2, 3], &[1, 3], &[1, 2], &[0, 3], &[0, 2], &[0, 1]];
const TETRAHEDRON_FACES: &[&[usize]] = &[&[1, 2, 3], &[0, 2, 3], &[0, 1, 3], &[0, 1, 2]];
const HEXAHEDRON_EDGES: &[&[usize]] = &[
    &[0, 1],
    &[0, 2],
    &[0, 4],
    &[1, 3],
    &[1, 5],
    &[2, 3],
    &[2, 6],
    &[3, 7],
    &[4, 5],
    &[4, 6],
    &[5, 7],
    &[6, 7],
];
const HEXAHEDRON_FACES: &[&[usize]] = &[
    &[0, 1, 2, 3],
    &[0, 1, 4, 5],
    &[0, 2, 4, 6],
    &[1, 3, 5, 7],
    &[2, 3, 6, 7],
    &[4, 5, 6, 7],
];

impl CellType {
    /// Topological dimension of the cell.
    pub fn dimension(self) -> usize {
        match self {
            CellType::Vertex => 0,
            CellType::Segment => 1,
            CellType::Triangle | CellType::Quadrilateral => 2,
            CellType::Tetrahedron | CellType::Hexahedron => 3,
        }
    }

    pub fn num_vertices(self) -> usize {
        match self {
            CellType::Vertex => 1,
            CellType::Segment => 2,
            CellType::Triangle => 3,
            CellType::Quadrilateral | CellType::Tetrahedron => 4,
            CellType::Hexahedron => 8,
        }
    }

    /// Vertex lists (in cell-local numbering) of the reference sub-entities
    /// of dimension `dim`. Empty if `dim` exceeds the cell dimension.
    pub fn entity_vertices(self, dim: usize) -> Vec<Vec<usize>> {
        let tdim = self.dimension();
        if dim > tdim {
            return Vec::new();
        }
        if dim == 0 {
            return (0..self.num_vertices()).map(|v| vec![v]).collect();
        }
        if dim == tdim {
            return vec![(0..self.num_vertices()).collect()];
        }
        let table: &[&[usize]] = match (self, dim) {
            (CellType::Triangle, 1) => TRIANGLE_EDGES,
            (CellType::Quadrilateral, 1) => QUADRILATERAL_EDGES,
            (CellType::Tetrahedron, 1) => TETRAHEDRON_EDGES,
            (CellType::Tetrahedron, 2) => TETRAHEDRON_FACES,
            (CellType::Hexahedron, 1) => HEXAHEDRON_EDGES,
            (CellType::Hexahedron, 2) => HEXAHEDRON_FACES,
            (CellType::Segment, 1) => SEGMENT_EDGES,
            _ => &[],
        };
        table.iter().map(|e| e.to_vec()).collect()
    }

    /// Number of sub-entities of dimension `dim`.
    pub fn num_entities(self, dim: usize) -> usize {
        self.entity_vertices(dim).len()
    }

    /// Shape of the sub-entities of dimension `dim`.
    pub fn entity_type(self, dim: usize) -> CellType {
        match (self, dim) {
            (_, 0) => CellType::Vertex,
            (_, 1) => CellType::Segment,
            (CellType::Tetrahedron, 2) => CellType::Triangle,
            (CellType::Hexahedron, 2) => CellType::Quadrilateral,
            _ => self,
        }
    }

    /// Shape of the codimension-1 sub-entities.
    pub fn facet_type(self) -> CellType {
        self.entity_type(self.dimension().saturating_sub(1))
    }

    /// True for simplex shapes.
    pub fn is_simplex(self) -> bool {
        matches!(
            self,
            CellType::Vertex | CellType::Segment | CellType::Triangle | CellType::Tetrahedron
        )
    }

    /// For each reference sub-entity of dimension `d0`, the reference
    /// sub-entities of dimension `d1 <= d0` it contains.
    pub fn sub_entity_inclusion(self, d0: usize, d1: usize) -> Vec<Vec<usize>> {
        let outer = self.entity_vertices(d0);
        let inner = self.entity_vertices(d1);
        outer
            .iter()
            .map(|ov| {
                inner
                    .iter()
                    .enumerate()
                    .filter(|(_, iv)| iv.iter().all(|v| ov.contains(v)))
                    .map(|(j, _)| j)
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_match_euler() {
        // V - E + F - C = 1 for 3-cells, V - E + F = 1 for 2-cells
        for c in [CellType::Tetrahedron, CellType::Hexahedron] {
            let v = c.num_entities(0) as i64;
            let e = c.num_entities(1) as i64;
            let f = c.num_entities(2) as i64;
            assert_eq!(v - e + f - 1, 1, "{c:?}");
        }
        for c in [CellType::Triangle, CellType::Quadrilateral] {
            let v = c.num_entities(0) as i64;
            let e = c.num_entities(1) as i64;
            assert_eq!(v - e + 1, 1, "{c:?}");
        }
    }

    #[test]
    fn facet_types() {
        assert_eq!(CellType::Hexahedron.facet_type(), CellType::Quadrilateral);
        assert_eq!(CellType::Triangle.facet_type(), CellType::Segment);
        assert_eq!(CellType::Segment.facet_type(), CellType::Vertex);
    }

    #[test]
    fn triangle_edge_opposite_vertex() {
        for (i, e) in CellType::Triangle.entity_vertices(1).iter().enumerate() {
            assert!(!e.contains(&i));
        }
    }

    #[test]
    fn hex_face_contains_four_edges() {
        let inc = CellType::Hexahedron.sub_entity_inclusion(2, 1);
        assert_eq!(inc.len(), 6);
        assert!(inc.iter().all(|edges| edges.len() == 4));
        assert_eq!(CellType::Tetrahedron.sub_entity_inclusion(2, 0)[0], vec![1, 2, 3]);
    }
}
