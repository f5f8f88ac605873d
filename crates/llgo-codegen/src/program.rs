//! The build-wide code generation context.

use std::cell::{Cell, RefCell};

use inkwell::context::Context;
use inkwell::targets::{
    CodeModel, InitializationConfig, RelocMode, Target, TargetData, TargetMachine, TargetTriple,
};
use inkwell::types::{BasicTypeEnum, IntType, StructType};
use inkwell::OptimizationLevel;
use rustc_hash::FxHashMap;

use llgo_ssa::symbols;
use llgo_ssa::{Background, TypeEnv};

/// The root code generation context, created once per build.
///
/// Owns the target machine and data layout, the memoized type mirror, and
/// the two flags the walker raises when lowering emits runtime or Python
/// calls. Packages borrow it for their whole lifetime; all mutation goes
/// through interior mutability so the borrow stays shared.
pub struct Program<'ctx> {
    pub(crate) ctx: &'ctx Context,
    pub(crate) target_machine: TargetMachine,
    pub(crate) td: TargetData,

    /// The program-wide named type table delivered by the frontend.
    pub(crate) type_env: TypeEnv,

    /// Memoized mirror: canonical type key + background -> IR type.
    pub(crate) mirror: RefCell<FxHashMap<(String, Background), BasicTypeEnum<'ctx>>>,
    /// Named LLVM struct types, keyed by qualified Go name. Two-phase:
    /// the opaque shell is registered before the body is filled in, so
    /// self-referential types terminate.
    pub(crate) named_structs: RefCell<FxHashMap<String, StructType<'ctx>>>,

    /// Import path designated as the runtime package.
    pub(crate) runtime_pkg: String,
    /// Import path designated as the Python bridge package.
    pub(crate) python_pkg: String,

    /// Raised when lowering emitted a call into the runtime package.
    pub need_runtime: Cell<bool>,
    /// Raised when lowering emitted a call into the Python bridge.
    pub need_py_init: Cell<bool>,
}

impl<'ctx> Program<'ctx> {
    /// Create a program context for the host target.
    ///
    /// # Errors
    ///
    /// Returns an error if native target initialization fails or no target
    /// machine can be created for the triple.
    pub fn new(
        ctx: &'ctx Context,
        type_env: TypeEnv,
        target_triple: Option<&str>,
    ) -> Result<Self, String> {
        Target::initialize_native(&InitializationConfig::default())
            .map_err(|e| format!("failed to initialize native target: {e}"))?;

        let triple = match target_triple {
            Some(s) => TargetTriple::create(s),
            None => TargetMachine::get_default_triple(),
        };
        let target = Target::from_triple(&triple)
            .map_err(|e| format!("invalid target triple '{triple}': {e}"))?;
        let target_machine = target
            .create_target_machine(
                &triple,
                "generic",
                "",
                OptimizationLevel::Default,
                RelocMode::PIC,
                CodeModel::Default,
            )
            .ok_or_else(|| format!("failed to create target machine for '{triple}'"))?;
        let td = target_machine.get_target_data();

        Ok(Program {
            ctx,
            target_machine,
            td,
            type_env,
            mirror: RefCell::new(FxHashMap::default()),
            named_structs: RefCell::new(FxHashMap::default()),
            runtime_pkg: symbols::PKG_RUNTIME.to_string(),
            python_pkg: symbols::PKG_PYTHON.to_string(),
            need_runtime: Cell::new(false),
            need_py_init: Cell::new(false),
        })
    }

    pub fn context(&self) -> &'ctx Context {
        self.ctx
    }

    pub fn target_machine(&self) -> &TargetMachine {
        &self.target_machine
    }

    pub fn target_data(&self) -> &TargetData {
        &self.td
    }

    pub fn type_env(&self) -> &TypeEnv {
        &self.type_env
    }

    /// Designate a different runtime package path (tests use this).
    pub fn set_runtime(&mut self, path: impl Into<String>) {
        self.runtime_pkg = path.into();
    }

    pub fn runtime_pkg(&self) -> &str {
        &self.runtime_pkg
    }

    pub fn python_pkg(&self) -> &str {
        &self.python_pkg
    }

    /// The pointer-sized integer type (`int` / `uint` / `uintptr`).
    pub fn int_type(&self) -> IntType<'ctx> {
        self.td.ptr_sized_int_type_in_context(self.ctx, None)
    }

    /// Store size of an IR type in bytes.
    pub fn size_of(&self, ty: &BasicTypeEnum<'ctx>) -> u64 {
        self.td.get_store_size(ty)
    }

    /// ABI alignment of an IR type in bytes.
    pub fn align_of(&self, ty: &BasicTypeEnum<'ctx>) -> u32 {
        self.td.get_abi_alignment(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_target_initializes() {
        let ctx = Context::create();
        let prog = Program::new(&ctx, TypeEnv::new(), None);
        assert!(prog.is_ok(), "native target should initialize");
    }

    #[test]
    fn invalid_triple_is_an_error() {
        let ctx = Context::create();
        let result = Program::new(&ctx, TypeEnv::new(), Some("not-a-triple-at-all"));
        assert!(result.is_err());
    }

    #[test]
    fn int_type_is_pointer_sized() {
        let ctx = Context::create();
        let prog = Program::new(&ctx, TypeEnv::new(), None).unwrap();
        let int = prog.int_type();
        let width = int.get_bit_width();
        assert!(width == 32 || width == 64, "unexpected pointer width {width}");
    }
}
