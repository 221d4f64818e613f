//! The low-level build graph: arena-based DAG, content fingerprinting, and
//! the AST-to-graph lowering pass.

pub mod fingerprint;
pub mod lower;
pub mod node;

pub use fingerprint::{Fingerprint, Fingerprinter};
pub use lower::{lower, ImageConfig, LowerOptions, Lowered};
pub use node::{ExecMount, FileOpAction, FileOpSource, Graph, LlbNode, NodeId};
