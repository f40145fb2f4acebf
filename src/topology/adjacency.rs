//! Compressed-sparse-row adjacency list.
//!
//! `AdjacencyList<T>` maps node `i` to the ordered slice
//! `array[offsets[i]..offsets[i + 1]]`. It is the storage for every
//! connectivity in the crate: cell→vertex with global indices (`i64`) at
//! construction time, and entity→entity with local indices (`i32`) after.
//! Once published into a topology storage tier an adjacency list is shared
//! through `Arc` and never mutated.

use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::TopologyError;
use num_traits::PrimInt;
use serde::{Deserialize, Serialize};

/// CSR adjacency list over integer node indices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdjacencyList<T> {
    array: Vec<T>,
    offsets: Vec<i32>,
}

impl<T: PrimInt> AdjacencyList<T> {
    /// Build from a flat link array and `num_nodes + 1` offsets.
    pub fn new(array: Vec<T>, offsets: Vec<i32>) -> Result<Self, TopologyError> {
        let list = Self { array, offsets };
        list.validate_invariants()?;
        Ok(list)
    }

    /// Build from one link vector per node.
    pub fn from_nested<I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = Vec<T>>,
    {
        let mut array = Vec::new();
        let mut offsets = vec![0i32];
        for links in nodes {
            array.extend(links);
            offsets.push(array.len() as i32);
        }
        Self { array, offsets }
    }

    /// Build a list where every node has the same number of links.
    pub fn from_uniform(array: Vec<T>, degree: usize) -> Result<Self, TopologyError> {
        if degree == 0 || array.len() % degree != 0 {
            return Err(TopologyError::InvalidAdjacency(format!(
                "{} links cannot be split into nodes of degree {degree}",
                array.len()
            )));
        }
        let n = array.len() / degree;
        let offsets = (0..=n).map(|i| (i * degree) as i32).collect();
        Ok(Self { array, offsets })
    }

    /// `n` nodes, node `i` linked to itself only.
    pub fn identity(n: usize) -> Self {
        let array = (0..n)
            .map(|i| <T as num_traits::NumCast>::from(i).unwrap_or_else(T::max_value))
            .collect();
        let offsets = (0..=n).map(|i| i as i32).collect();
        Self { array, offsets }
    }

    pub fn num_nodes(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    pub fn num_links(&self, node: usize) -> usize {
        (self.offsets[node + 1] - self.offsets[node]) as usize
    }

    pub fn links(&self, node: usize) -> &[T] {
        &self.array[self.offsets[node] as usize..self.offsets[node + 1] as usize]
    }

    pub fn array(&self) -> &[T] {
        &self.array
    }

    pub fn offsets(&self) -> &[i32] {
        &self.offsets
    }

    /// Iterate over `(node, links)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[T])> + '_ {
        (0..self.num_nodes()).map(move |i| (i, self.links(i)))
    }

    /// Same structure, links mapped through `f`.
    pub fn map_links<U, F>(&self, f: F) -> Result<AdjacencyList<U>, TopologyError>
    where
        U: PrimInt,
        F: FnMut(&T) -> Result<U, TopologyError>,
    {
        let array = self.array.iter().map(f).collect::<Result<Vec<U>, _>>()?;
        Ok(AdjacencyList {
            array,
            offsets: self.offsets.clone(),
        })
    }
}

impl AdjacencyList<i32> {
    /// Reverse the direction of every link.
    ///
    /// `num_targets` is the number of nodes in the target index space; node
    /// `j` of the result lists, in ascending order, every source linking to `j`.
    pub fn transpose(&self, num_targets: usize) -> Result<Self, TopologyError> {
        let mut degree = vec![0i32; num_targets];
        for &t in &self.array {
            let slot = usize::try_from(t)
                .ok()
                .and_then(|t| degree.get_mut(t))
                .ok_or_else(|| {
                    TopologyError::InvalidAdjacency(format!(
                        "link {t} outside target range 0..{num_targets}"
                    ))
                })?;
            *slot += 1;
        }
        let mut offsets = vec![0i32; num_targets + 1];
        for j in 0..num_targets {
            offsets[j + 1] = offsets[j] + degree[j];
        }
        let mut write = offsets.clone();
        let mut array = vec![0i32; self.array.len()];
        for (src, links) in self.iter() {
            for &t in links {
                let pos = &mut write[t as usize];
                array[*pos as usize] = src as i32;
                *pos += 1;
            }
        }
        Ok(Self { array, offsets })
    }
}

impl<T: PrimInt> DebugInvariants for AdjacencyList<T> {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "AdjacencyList");
    }

    fn validate_invariants(&self) -> Result<(), TopologyError> {
        let Some(&first) = self.offsets.first() else {
            return Err(TopologyError::InvalidAdjacency(
                "offsets must contain at least one entry".into(),
            ));
        };
        if first != 0 {
            return Err(TopologyError::InvalidAdjacency(format!(
                "offsets must start at 0, got {first}"
            )));
        }
        if self.offsets.windows(2).any(|w| w[1] < w[0]) {
            return Err(TopologyError::InvalidAdjacency(
                "offsets must be non-decreasing".into(),
            ));
        }
        let last = *self.offsets.last().unwrap_or(&0) as usize;
        if last != self.array.len() {
            return Err(TopologyError::InvalidAdjacency(format!(
                "last offset {last} does not match {} links",
                self.array.len()
            )));
        }
        Ok(())
    }
}
