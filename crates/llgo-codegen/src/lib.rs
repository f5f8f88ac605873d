//! LLVM IR generation for the llgo compiler.
//!
//! This crate lowers typed Go-SSA packages (as delivered by `llgo-ssa`)
//! into LLVM modules using Inkwell, and hosts the post-link method-binding
//! pass plus the clang link driver.
//!
//! ## Architecture
//!
//! - [`Program`]: build-wide context (target machine, type mirror cache)
//! - [`types`]: Go type to LLVM type mapping, per ABI background
//! - [`PackageEmitter`]: per-package module, symbol tables, block layout
//! - [`Builder`]: instruction-level façade over the Inkwell builder
//! - [`walker`]: the SSA walker translating instructions via the builder
//! - [`invoke`]: the late method-binding (invoke lowering) pass
//! - [`link`]: clang invocation and link-flag resolution

pub mod abi;
pub mod builder;
pub mod intrinsics;
pub mod invoke;
pub mod link;
pub mod package;
pub mod program;
pub mod types;
pub mod walker;

pub use builder::{Builder, Expr};
pub use package::{Function, Global, PackageEmitter};
pub use program::Program;
pub use walker::{lower_package, PatchOptions, Patches};

/// Debug flag: trace each lowered instruction to stderr.
pub const DBG_FLAG_INSTRUCTION: u32 = 1 << 0;
/// Debug flag: dump each SSA function before lowering.
pub const DBG_FLAG_GOSSA: u32 = 1 << 1;
/// All debug flags.
pub const DBG_FLAG_ALL: u32 = DBG_FLAG_INSTRUCTION | DBG_FLAG_GOSSA;

use std::sync::atomic::{AtomicU32, Ordering};

static DEBUG_FLAGS: AtomicU32 = AtomicU32::new(0);

/// Set the crate-wide debug flags.
pub fn set_debug(flags: u32) {
    DEBUG_FLAGS.store(flags, Ordering::Relaxed);
}

pub(crate) fn debug_instr() -> bool {
    DEBUG_FLAGS.load(Ordering::Relaxed) & DBG_FLAG_INSTRUCTION != 0
}

pub(crate) fn debug_gossa() -> bool {
    DEBUG_FLAGS.load(Ordering::Relaxed) & DBG_FLAG_GOSSA != 0
}
