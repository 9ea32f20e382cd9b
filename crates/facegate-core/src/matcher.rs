//! Nearest-neighbour identity matching over enrolled embeddings.
//!
//! The index is a k-d tree over an `n × dim` point matrix. It is rebuilt
//! wholesale from the embedding store; a rebuild constructs the new tree
//! completely before swapping it in, so a reader never observes a partial
//! index.

use crate::types::{EnrolledIdentity, Embedding, IdentityMatch};
use ndarray::Array2;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("identity {name:?} has a {actual}-dim embedding, index expects {expected}")]
    DimensionMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("failed to shape point matrix: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

#[derive(Debug, Clone)]
struct KdNode {
    /// Row in the point matrix.
    point: usize,
    axis: usize,
    left: Option<usize>,
    right: Option<usize>,
}

/// Static k-d tree over the rows of a point matrix.
#[derive(Debug, Clone)]
pub struct KdTree {
    points: Array2<f32>,
    nodes: Vec<KdNode>,
    root: Option<usize>,
}

impl KdTree {
    pub fn build(points: Array2<f32>) -> Self {
        let mut order: Vec<usize> = (0..points.nrows()).collect();
        let mut nodes = Vec::with_capacity(points.nrows());
        let root = if points.ncols() == 0 {
            None
        } else {
            build_subtree(&mut nodes, &points, &mut order, 0)
        };
        Self { points, nodes, root }
    }

    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn dim(&self) -> usize {
        self.points.ncols()
    }

    /// Row index and Euclidean distance of the point nearest to `query`.
    ///
    /// Returns `None` for an empty tree or a query of the wrong length.
    pub fn nearest(&self, query: &[f32]) -> Option<(usize, f32)> {
        if query.len() != self.dim() {
            return None;
        }
        let mut best: Option<(usize, f32)> = None;
        if let Some(root) = self.root {
            self.search(root, query, &mut best);
        }
        best.map(|(row, sq)| (row, sq.sqrt()))
    }

    fn search(&self, node_id: usize, query: &[f32], best: &mut Option<(usize, f32)>) {
        let node = &self.nodes[node_id];
        let row = self.points.row(node.point);
        let sq: f32 = row
            .iter()
            .zip(query.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        if best.map_or(true, |(_, b)| sq < b) {
            *best = Some((node.point, sq));
        }

        let diff = query[node.axis] - self.points[[node.point, node.axis]];
        let (near, far) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };
        if let Some(child) = near {
            self.search(child, query, best);
        }
        if let Some(child) = far {
            // The far side can only hold a closer point if the splitting
            // plane itself is closer than the current best.
            if best.map_or(true, |(_, b)| diff * diff < b) {
                self.search(child, query, best);
            }
        }
    }
}

fn build_subtree(
    nodes: &mut Vec<KdNode>,
    points: &Array2<f32>,
    order: &mut [usize],
    depth: usize,
) -> Option<usize> {
    if order.is_empty() {
        return None;
    }
    let axis = depth % points.ncols();
    let mid = order.len() / 2;
    order.select_nth_unstable_by(mid, |a, b| points[[*a, axis]].total_cmp(&points[[*b, axis]]));

    let node_id = nodes.len();
    nodes.push(KdNode {
        point: order[mid],
        axis,
        left: None,
        right: None,
    });

    let (lower, rest) = order.split_at_mut(mid);
    let upper = &mut rest[1..];
    let left = build_subtree(nodes, points, lower, depth + 1);
    let right = build_subtree(nodes, points, upper, depth + 1);
    nodes[node_id].left = left;
    nodes[node_id].right = right;
    Some(node_id)
}

/// Maps embeddings to the closest enrolled identity.
#[derive(Debug, Clone)]
pub struct IdentityMatcher {
    dim: usize,
    names: Vec<String>,
    tree: Option<KdTree>,
}

impl IdentityMatcher {
    /// Create an empty matcher for `dim`-length embeddings.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            names: Vec::new(),
            tree: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Replace the index with one built from `entries`.
    ///
    /// On error the previous index stays in place.
    pub fn rebuild<'a, I>(&mut self, entries: I) -> Result<(), IndexError>
    where
        I: IntoIterator<Item = &'a EnrolledIdentity>,
    {
        let mut names = Vec::new();
        let mut flat = Vec::new();
        for entry in entries {
            if entry.embedding.dim() != self.dim {
                return Err(IndexError::DimensionMismatch {
                    name: entry.name.clone(),
                    expected: self.dim,
                    actual: entry.embedding.dim(),
                });
            }
            names.push(entry.name.clone());
            flat.extend_from_slice(&entry.embedding.values);
        }

        let tree = if names.is_empty() {
            None
        } else {
            Some(KdTree::build(Array2::from_shape_vec((names.len(), self.dim), flat)?))
        };

        self.names = names;
        self.tree = tree;
        tracing::debug!(entries = self.names.len(), dim = self.dim, "identity index rebuilt");
        Ok(())
    }

    /// Nearest enrolled identity, if it lies within `threshold`.
    ///
    /// An empty index or an embedding of the wrong length never matches.
    pub fn match_one(&self, embedding: &Embedding, threshold: f32) -> Option<IdentityMatch> {
        let tree = self.tree.as_ref()?;
        let (row, distance) = tree.nearest(&embedding.values)?;
        (distance <= threshold).then(|| IdentityMatch {
            name: self.names[row].clone(),
            distance,
        })
    }

    /// [`match_one`](Self::match_one) for a whole frame, results in input order.
    pub fn match_batch(&self, embeddings: &[&Embedding], threshold: f32) -> Vec<Option<IdentityMatch>> {
        if self.tree.is_none() {
            return vec![None; embeddings.len()];
        }
        embeddings
            .iter()
            .map(|embedding| self.match_one(embedding, threshold))
            .collect()
    }

    /// Linear scan reference used to cross-check the tree.
    #[cfg(test)]
    fn brute_force(entries: &[EnrolledIdentity], query: &Embedding) -> Option<f32> {
        entries
            .iter()
            .map(|e| e.embedding.euclidean_distance(query))
            .min_by(|a, b| a.total_cmp(b))
    }
}
