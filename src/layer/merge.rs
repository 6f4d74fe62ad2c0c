//! Merge links and common-ancestor graph reconstruction.
//!
//! A merge layer (fan-in) combines `k` predecessor branches. When gradient
//! checking flows through it, each branch carries one pair of probes per
//! learned parameter of every layer it depends on, in ascending id order.
//! [`merged_graph`] lines those columns up: the merge gets one column per
//! probe of any branch, and each column tells which branches perturbed it.
//!
//! # Algorithm
//!
//! The ancestor set of every branch is collected by following all links,
//! merges included. The common ancestor is the highest id present in every
//! set; the probes of its own ancestors are shared by every branch. The
//! remaining layers of the union are credited to each branch whose set
//! contains them, so a layer reached by two branches through a nested merge
//! is perturbed in both.

use std::collections::BTreeSet;

use super::{Graph, LayerId};
use crate::error::Result;

/// Layers between a merge and the common ancestor of its branches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedGraph {
    /// Probes shared by every branch (those of the common ancestor).
    pub nb_same_elems: usize,
    /// Layers after the fork, ascending, once per branch depending on them.
    pub layers: Vec<LayerId>,
    /// Branch of each entry of `layers`.
    pub layers_index: Vec<usize>,
    /// Probes introduced by each entry of `layers`.
    pub nb_elems: Vec<usize>,
    /// Latest layer every branch depends on, `None` when branches start at
    /// different graph inputs.
    pub common_ancestor: Option<LayerId>,
    columns: Vec<Column>,
}

impl MergedGraph {
    /// Total number of probes the merge produces.
    pub fn nb_gc(&self) -> usize {
        self.columns.len()
    }

    /// Probes of branch `branch`: shared ones plus the ones its layers added.
    pub fn branch_nb_gc(&self, branch: usize) -> usize {
        self.nb_same_elems
            + self
                .layers_index
                .iter()
                .zip(&self.nb_elems)
                .filter(|(index, _)| **index == branch)
                .map(|(_, nb)| nb)
                .sum::<usize>()
    }

    /// Source of every probe column of the merge, in order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}

/// Where a merge reads one probe column from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    sources: Vec<Option<usize>>,
}

impl Column {
    /// Column of `branch` carrying this probe, `None` when the perturbed
    /// layer is not upstream of that branch: it then contributes its
    /// unperturbed output.
    pub fn source(&self, branch: usize) -> Option<usize> {
        self.sources.get(branch).copied().flatten()
    }
}

/// Every layer `id` depends on, itself included.
pub fn ancestors(graph: &Graph<'_>, id: LayerId) -> Result<BTreeSet<LayerId>> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![id];
    while let Some(id) = stack.pop() {
        if seen.insert(id) {
            stack.extend(graph.base(id)?.links().ids().iter().copied());
        }
    }
    Ok(seen)
}

/// Reconstructs the branches of a merge of `layers_prev`.
///
/// The layout only depends on the graph structure; it matches the probes the
/// branches computed during `forward_gc`.
pub fn merged_graph(graph: &Graph<'_>, layers_prev: &[LayerId]) -> Result<MergedGraph> {
    let branches = layers_prev
        .iter()
        .map(|&id| ancestors(graph, id))
        .collect::<Result<Vec<_>>>()?;
    let common_ancestor = branches.split_first().and_then(|(first, rest)| {
        first
            .iter()
            .rev()
            .copied()
            .find(|id| rest.iter().all(|set| set.contains(id)))
    });
    let shared = match common_ancestor {
        Some(id) => ancestors(graph, id)?,
        None => BTreeSet::new(),
    };
    let union: BTreeSet<LayerId> = branches.iter().flatten().copied().collect();

    let mut merged = MergedGraph {
        common_ancestor,
        ..MergedGraph::default()
    };
    let mut offsets = vec![0; branches.len()];
    for id in union {
        let nb = graph.get(id)?.nb_probes();
        if shared.contains(&id) {
            merged.nb_same_elems += nb;
        } else {
            for (branch, set) in branches.iter().enumerate() {
                if set.contains(&id) {
                    merged.layers.push(id);
                    merged.layers_index.push(branch);
                    merged.nb_elems.push(nb);
                }
            }
        }
        for e in 0..nb {
            let sources = branches
                .iter()
                .zip(&offsets)
                .map(|(set, &offset)| set.contains(&id).then_some(offset + e))
                .collect();
            merged.columns.push(Column { sources });
        }
        for (set, offset) in branches.iter().zip(&mut offsets) {
            if set.contains(&id) {
                *offset += nb;
            }
        }
    }
    Ok(merged)
}

/// Down-sampling factor shared by every branch.
///
/// # Panics
///
/// Panics when branches disagree: the graph is structurally invalid.
pub fn stride_factor(graph: &Graph<'_>, layers_prev: &[LayerId]) -> Result<f64> {
    let mut factor = None;
    for &id in layers_prev {
        let value = graph.get(id)?.stride_factor(graph)?;
        match factor {
            None => factor = Some(value),
            Some(expected) => assert!(
                expected == value,
                "merged branches do not have the same stride factor ({expected} vs {value})"
            ),
        }
    }
    Ok(factor.unwrap_or(1.0))
}

/// Largest receptive field among the branches, after checking they agree on
/// the stride factor.
///
/// # Panics
///
/// Panics when branches disagree on the stride factor.
pub fn receptive_field(graph: &Graph<'_>, layers_prev: &[LayerId]) -> Result<usize> {
    stride_factor(graph, layers_prev)?;
    let mut field = 1;
    for &id in layers_prev {
        field = field.max(graph.get(id)?.receptive_field(graph)?);
    }
    Ok(field)
}
