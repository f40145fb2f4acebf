//! Cell and facet permutation tables.
//!
//! A sub-entity seen from a cell may be traversed in a different order than
//! the entity's reference ordering (lowest global vertex first). The tables
//! record that difference:
//!
//! - facet permutation `n` of a (cell, facet) pair: `n % 2` reflections and
//!   `n / 2` rotations to apply;
//! - cell permutation info (one `u32` per cell): in 3-D, three bits per face
//!   starting at bit `3 * face` (reflection, then two rotation bits),
//!   followed by one reflection bit per edge; in 2-D one reflection bit per
//!   edge starting at bit 0; always 0 in 1-D.
//!
//! Both tables are produced and published together.

use crate::mesh_error::TopologyError;
use crate::topology::cell_type::CellType;

/// Jointly computed facet and cell permutation tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityPermutations {
    facets_per_cell: usize,
    facet_permutations: Vec<u8>,
    cell_permutations: Vec<u32>,
}

impl EntityPermutations {
    /// `facet_permutations` is stored cell-major: entry
    /// `cell * facets_per_cell + facet`.
    pub fn new(
        facets_per_cell: usize,
        facet_permutations: Vec<u8>,
        cell_permutations: Vec<u32>,
    ) -> Result<Self, TopologyError> {
        if facet_permutations.len() != facets_per_cell * cell_permutations.len() {
            return Err(TopologyError::ComputationFailed(format!(
                "{} facet permutations for {} cells with {facets_per_cell} facets each",
                facet_permutations.len(),
                cell_permutations.len()
            )));
        }
        Ok(Self {
            facets_per_cell,
            facet_permutations,
            cell_permutations,
        })
    }

    pub fn num_cells(&self) -> usize {
        self.cell_permutations.len()
    }

    pub fn facets_per_cell(&self) -> usize {
        self.facets_per_cell
    }

    pub fn facet_permutation(&self, cell: usize, facet: usize) -> u8 {
        self.facet_permutations[cell * self.facets_per_cell + facet]
    }

    /// Permutation codes of every facet of `cell`.
    pub fn cell_facets(&self, cell: usize) -> &[u8] {
        let start = cell * self.facets_per_cell;
        &self.facet_permutations[start..start + self.facets_per_cell]
    }

    pub fn facet_permutations(&self) -> &[u8] {
        &self.facet_permutations
    }

    pub fn cell_permutation_info(&self, cell: usize) -> u32 {
        self.cell_permutations[cell]
    }

    pub fn cell_permutations(&self) -> &[u32] {
        &self.cell_permutations
    }
}

/// `(rotations, reflections)` taking the reference order of a sub-entity
/// to the order given by `globals` (its vertices as seen from the cell).
pub fn rotations_and_reflections(shape: CellType, globals: &[i64]) -> (u8, u8) {
    match shape {
        CellType::Segment => (0, u8::from(globals[0] > globals[1])),
        CellType::Triangle => {
            let r = argmin(globals);
            let w = [globals[r], globals[(r + 1) % 3], globals[(r + 2) % 3]];
            (r as u8, u8::from(w[1] > w[2]))
        }
        CellType::Quadrilateral => {
            // tensor-product numbering; walk it cyclically
            let cyc = [globals[0], globals[1], globals[3], globals[2]];
            let r = argmin(&cyc);
            let w = [cyc[r], cyc[(r + 1) % 4], cyc[(r + 3) % 4]];
            (r as u8, u8::from(w[1] > w[2]))
        }
        _ => (0, 0),
    }
}

/// Facet permutation code `2 * rotations + reflections`.
pub fn facet_permutation_code(facet_shape: CellType, globals: &[i64]) -> u8 {
    let (rots, refl) = rotations_and_reflections(facet_shape, globals);
    2 * rots + refl
}

/// Packed permutation info of one cell given its vertices' global indices.
pub fn cell_permutation_info(cell_type: CellType, cell_globals: &[i64]) -> u32 {
    let sub = |verts: &Vec<usize>| -> Vec<i64> { verts.iter().map(|&v| cell_globals[v]).collect() };
    let mut info = 0u32;
    let mut edge_offset = 0;
    if cell_type.dimension() == 3 {
        let face_shape = cell_type.entity_type(2);
        for (i, face) in cell_type.entity_vertices(2).iter().enumerate() {
            let (rots, refl) = rotations_and_reflections(face_shape, &sub(face));
            info |= u32::from(refl) << (3 * i);
            info |= u32::from(rots) << (3 * i + 1);
        }
        edge_offset = 3 * cell_type.num_entities(2);
    }
    if cell_type.dimension() >= 2 {
        for (j, edge) in cell_type.entity_vertices(1).iter().enumerate() {
            let (_, refl) = rotations_and_reflections(CellType::Segment, &sub(edge));
            info |= u32::from(refl) << (edge_offset + j);
        }
    }
    info
}

fn argmin(v: &[i64]) -> usize {
    v.iter()
        .enumerate()
        .min_by_key(|(_, x)| **x)
        .map_or(0, |(i, _)| i)
}
