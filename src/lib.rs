#![forbid(unsafe_code)]

//! Arbor facade crate.
//!
//! Re-exports the core declarative layer with a single entry point.

pub use arbor_core as core;

pub use arbor_core::{
    Disposition, EntryChannel, Eventual, StateKey, TreeBuildContext, TreeBuilder,
    TreeDefinitionError,
};

pub mod prelude {
    pub use arbor_core::prelude::*;
}
