//! Resource dependency graph.
//!
//! Edges come from attribute references and `depends_on` entries. The graph
//! rejects unknown targets and cycles, and yields a deterministic creation
//! order with declaration order as the tie-break.

mod builder;
mod order;

pub use builder::DependencyGraph;
pub use order::stable_order;
