//! Domain model: graph artifacts, hierarchy levels, analysis and view selection.

pub mod analysis;
pub mod graph;
pub mod hierarchy;
pub mod view;
