//! Timeline ancestry graph: tenants, timelines, parent/child links.

mod graph;

pub use graph::{AncestryGraph, TimelineRecord};
