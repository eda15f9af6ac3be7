//! Disjoint section partitioning.

pub mod partitioner;

pub use partitioner::*;

use serde::{Deserialize, Serialize};

/// A group of chunk indices processed as one independent unit.
///
/// Indices are sorted ascending. Across a partition every chunk index appears
/// in exactly one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub id: usize,
    pub chunk_indices: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Section {
    pub fn new(id: usize, chunk_indices: Vec<usize>) -> Self {
        Self {
            id,
            chunk_indices,
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Human-readable name used when the model gives the structure none.
    pub fn display_name(&self) -> String {
        self.title
            .clone()
            .unwrap_or_else(|| format!("section_{}", self.id))
    }
}
