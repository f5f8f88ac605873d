//! Shared infrastructure for the llgo compiler.
//!
//! This crate holds the pieces every other crate needs: the build error
//! taxonomy ([`error::BuildError`]) and the package dependency graph used to
//! compute the leaf-first compilation order ([`pkg_graph`]).

pub mod error;
pub mod pkg_graph;

pub use error::BuildError;
pub use pkg_graph::{dependency_order, CycleError, PkgGraph, PkgId};
