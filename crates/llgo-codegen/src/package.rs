//! Per-package IR module ownership: named globals, functions, blocks.
//!
//! All symbol creation is idempotent: asking for the same name twice hands
//! back the entry created the first time, which is what lets forward
//! references and cross-package declarations resolve without coordination.

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;

use inkwell::basic_block::BasicBlock;
use inkwell::module::Module;
use inkwell::values::{FunctionValue, GlobalValue, PointerValue};
use rustc_hash::FxHashMap;

use llgo_ssa::symbols;
use llgo_ssa::{Background, GoType, Signature};

use crate::builder::Expr;
use crate::program::Program;

/// A package-level variable: an IR global plus its mirror type.
pub struct Global<'ctx> {
    pub value: GlobalValue<'ctx>,
    /// The variable's Go type (not the pointer-to it).
    pub ty: GoType,
    pub background: Background,
}

impl<'ctx> Global<'ctx> {
    /// The global as an expression: its address, typed as a pointer.
    pub fn expr(&self) -> Expr<'ctx> {
        Expr {
            val: self.value.as_pointer_value().into(),
            ty: GoType::pointer(self.ty.clone()),
        }
    }

    /// Install a zero initializer, turning the declaration into a
    /// definition.
    pub fn init_nil(&self) {
        let ty = self.value.get_value_type();
        if let Ok(basic) = inkwell::types::BasicTypeEnum::try_from(ty) {
            self.init_zero_of(basic);
        }
    }

    fn init_zero_of(&self, ty: inkwell::types::BasicTypeEnum<'ctx>) {
        use inkwell::types::BasicTypeEnum as T;
        match ty {
            T::IntType(t) => self.value.set_initializer(&t.const_zero()),
            T::FloatType(t) => self.value.set_initializer(&t.const_zero()),
            T::PointerType(t) => self.value.set_initializer(&t.const_null()),
            T::StructType(t) => self.value.set_initializer(&t.const_zero()),
            T::ArrayType(t) => self.value.set_initializer(&t.const_zero()),
            T::VectorType(t) => self.value.set_initializer(&t.const_zero()),
            T::ScalableVectorType(t) => self.value.set_initializer(&t.const_zero()),
        }
    }

    /// Install a constant initializer.
    pub fn init(&self, value: &Expr<'ctx>) {
        self.value.set_initializer(&value.val);
    }
}

/// A deferred call recorded by the walker, replayed in LIFO order at
/// function exit.
pub struct DeferRecord<'ctx> {
    pub target: DeferTarget<'ctx>,
    pub args: Vec<Expr<'ctx>>,
    /// For defers reached conditionally: an entry-block i1 slot that is
    /// false until the defer statement executes.
    pub flag: Option<PointerValue<'ctx>>,
}

/// What a defer record calls.
pub enum DeferTarget<'ctx> {
    Direct(Rc<Function<'ctx>>),
    /// An indirect target: a function value `{code, ctx}`.
    Indirect { value: Expr<'ctx>, sig: Signature },
    /// A runtime helper (deferred builtins such as `println`).
    Runtime(FunctionValue<'ctx>),
}

/// An IR function under construction: blocks, parameter mirror types,
/// optional recover block, and the function-scoped defer stack.
pub struct Function<'ctx> {
    pub name: String,
    pub val: FunctionValue<'ctx>,
    pub sig: Signature,
    pub background: Background,
    /// Mirror types of the declared parameters (receiver first; the
    /// closure context, when present, is *not* included).
    param_tys: Vec<GoType>,
    has_ctx: bool,
    pub has_varg: bool,
    blocks: RefCell<Vec<BasicBlock<'ctx>>>,
    recover: Cell<Option<usize>>,
    pub(crate) defers: RefCell<Vec<DeferRecord<'ctx>>>,
}

impl<'ctx> Function<'ctx> {
    /// Whether a body has been started (any blocks exist).
    pub fn has_body(&self) -> bool {
        !self.blocks.borrow().is_empty()
    }

    pub fn has_ctx(&self) -> bool {
        self.has_ctx
    }

    pub fn n_blocks(&self) -> usize {
        self.blocks.borrow().len()
    }

    /// Append `n` blocks labeled `_llgo_<i>` in creation order; the first
    /// block ever created is the entry, `_llgo_0`.
    pub fn make_blocks(&self, prog: &Program<'ctx>, n: usize) -> Vec<BasicBlock<'ctx>> {
        let mut blocks = self.blocks.borrow_mut();
        let base = blocks.len();
        let mut created = Vec::with_capacity(n);
        for i in 0..n {
            let blk = prog
                .context()
                .append_basic_block(self.val, &symbols::block_label(base + i));
            blocks.push(blk);
            created.push(blk);
        }
        created
    }

    /// Append a single extra block (bounds-check arms, import guards...).
    pub fn make_block(&self, prog: &Program<'ctx>) -> BasicBlock<'ctx> {
        self.make_blocks(prog, 1)[0]
    }

    pub fn block(&self, index: usize) -> BasicBlock<'ctx> {
        self.blocks.borrow()[index]
    }

    pub fn set_recover(&self, index: usize) {
        self.recover.set(Some(index));
    }

    pub fn recover_block(&self) -> Option<usize> {
        self.recover.get()
    }

    /// The i-th declared parameter as a typed expression. The index skips
    /// the closure context parameter when one exists.
    pub fn param(&self, i: usize) -> Expr<'ctx> {
        let base = usize::from(self.has_ctx);
        let val = self
            .val
            .get_nth_param((base + i) as u32)
            .unwrap_or_else(|| panic!("{}: no parameter {i}", self.name));
        Expr {
            val,
            ty: self.param_tys[i].clone(),
        }
    }

    /// The raw closure-context pointer (parameter 0 of a closure body).
    pub fn ctx_param(&self) -> Option<PointerValue<'ctx>> {
        if !self.has_ctx {
            return None;
        }
        self.val.get_nth_param(0).map(|p| p.into_pointer_value())
    }

    /// The function as a value expression (its code address).
    pub fn ptr_expr(&self) -> Expr<'ctx> {
        Expr {
            val: self.val.as_global_value().as_pointer_value().into(),
            ty: GoType::Func(Box::new(self.sig.clone())),
        }
    }
}

/// One IR module per compilation unit, owning its symbol tables.
pub struct PackageEmitter<'ctx> {
    pub name: String,
    pub path: String,
    module: Module<'ctx>,
    vars: RefCell<FxHashMap<String, Rc<Global<'ctx>>>>,
    fns: RefCell<FxHashMap<String, Rc<Function<'ctx>>>>,
    wrapper_count: Cell<u32>,
}

impl<'ctx> PackageEmitter<'ctx> {
    pub fn new(prog: &Program<'ctx>, name: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        let module = prog.context().create_module(&path);
        module.set_triple(&prog.target_machine().get_triple());
        module.set_data_layout(&prog.target_data().get_data_layout());
        PackageEmitter {
            name: name.into(),
            path,
            module,
            vars: RefCell::new(FxHashMap::default()),
            fns: RefCell::new(FxHashMap::default()),
            wrapper_count: Cell::new(0),
        }
    }

    pub fn module(&self) -> &Module<'ctx> {
        &self.module
    }

    /// Create (or return) the package-level variable `name`. The global is
    /// left uninitialized (external); call [`Global::init_nil`] or
    /// [`Global::init`] to make it a definition.
    pub fn new_var(
        &self,
        prog: &Program<'ctx>,
        name: &str,
        ty: &GoType,
        bg: Background,
    ) -> Result<Rc<Global<'ctx>>, String> {
        if let Some(existing) = self.vars.borrow().get(name) {
            return Ok(existing.clone());
        }
        let lowered = prog.llvm_type(ty, bg)?;
        let global = self.module.add_global(lowered, None, name);
        global.set_alignment(prog.align_of(&lowered));
        let entry = Rc::new(Global {
            value: global,
            ty: ty.clone(),
            background: bg,
        });
        self.vars.borrow_mut().insert(name.to_string(), entry.clone());
        Ok(entry)
    }

    pub fn var_of(&self, name: &str) -> Option<Rc<Global<'ctx>>> {
        self.vars.borrow().get(name).cloned()
    }

    /// Create (or return) the function `name`. Declaration only; bodies
    /// are started by [`Function::make_blocks`].
    pub fn new_func(
        &self,
        prog: &Program<'ctx>,
        name: &str,
        sig: Signature,
        bg: Background,
        has_ctx: bool,
    ) -> Result<Rc<Function<'ctx>>, String> {
        if let Some(existing) = self.fns.borrow().get(name) {
            return Ok(existing.clone());
        }
        let fn_ty = prog.fn_sig(&sig, bg, has_ctx)?;
        // The runtime declaration table may already have added this
        // symbol; reuse it rather than shadowing the name.
        let val = match self.module.get_function(name) {
            Some(existing) => existing,
            None => self.module.add_function(name, fn_ty, None),
        };
        if crate::debug_instr() {
            eprintln!("==> NewFunc {name} hasCtx: {has_ctx}");
        }
        let mut param_tys: Vec<GoType> = Vec::new();
        if let Some(recv) = &sig.recv {
            param_tys.push(recv.ty.clone());
        }
        param_tys.extend(sig.params.iter().map(|p| p.ty.clone()));
        let has_varg = sig.variadic;
        let entry = Rc::new(Function {
            name: name.to_string(),
            val,
            sig,
            background: bg,
            param_tys,
            has_ctx,
            has_varg,
            blocks: RefCell::new(Vec::new()),
            recover: Cell::new(None),
            defers: RefCell::new(Vec::new()),
        });
        self.fns.borrow_mut().insert(name.to_string(), entry.clone());
        Ok(entry)
    }

    pub fn func_of(&self, name: &str) -> Option<Rc<Function<'ctx>>> {
        self.fns.borrow().get(name).cloned()
    }

    /// A fresh module-unique name for synthesized helper functions
    /// (goroutine trampolines, function-value shims).
    pub(crate) fn fresh_wrapper_name(&self, parent: &str, tag: &str) -> String {
        let n = self.wrapper_count.get();
        self.wrapper_count.set(n + 1);
        format!("{parent}${tag}{n}")
    }

    /// Register a global constructor that calls the Python bridge
    /// initializer before `main` runs. Returns true when something was
    /// added (the module became dirty).
    pub fn py_init(&self, prog: &Program<'ctx>) -> bool {
        if self.module.get_function("__llgo_py_init_ctor").is_some() {
            return false;
        }
        let ctx = prog.context();
        let void = ctx.void_type();
        let ctor = self
            .module
            .add_function("__llgo_py_init_ctor", void.fn_type(&[], false), None);
        let entry = ctx.append_basic_block(ctor, "_llgo_0");
        let b = ctx.create_builder();
        b.position_at_end(entry);
        let init = crate::intrinsics::py_fn(prog, &self.module, crate::intrinsics::PyFn::Init);
        let _ = b.build_call(init, &[], "");
        let _ = b.build_return(None);

        let ptr = ctx.ptr_type(inkwell::AddressSpace::default());
        let entry_ty = ctx.struct_type(&[ctx.i32_type().into(), ptr.into(), ptr.into()], false);
        let ctor_entry = entry_ty.const_named_struct(&[
            ctx.i32_type().const_int(65535, false).into(),
            ctor.as_global_value().as_pointer_value().into(),
            ptr.const_null().into(),
        ]);
        let ctors = self
            .module
            .add_global(entry_ty.array_type(1), None, "llvm.global_ctors");
        ctors.set_linkage(inkwell::module::Linkage::Appending);
        ctors.set_initializer(&entry_ty.const_array(&[ctor_entry]));
        true
    }

    /// The module as textual IR.
    pub fn serialize(&self) -> String {
        self.module.print_to_string().to_string()
    }

    /// Write the module as textual IR.
    pub fn write_to(&self, path: &Path) -> Result<(), String> {
        self.module
            .print_to_file(path)
            .map_err(|e| format!("failed to write {}: {e}", path.display()))
    }

    /// Write the module as bitcode (consumed by the method-binding pass).
    pub fn write_bitcode_to(&self, path: &Path) -> bool {
        self.module.write_bitcode_to_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell::context::Context;
    use llgo_ssa::{BasicKind, TypeEnv};

    fn test_prog(ctx: &Context) -> Program<'_> {
        Program::new(ctx, TypeEnv::new(), None).unwrap()
    }

    fn no_args_no_ret() -> Signature {
        Signature::default()
    }

    #[test]
    fn new_var_is_idempotent() {
        let ctx = Context::create();
        let prog = test_prog(&ctx);
        let pkg = PackageEmitter::new(&prog, "main", "main");
        let int = GoType::Basic(BasicKind::Int);

        let a = pkg.new_var(&prog, "main.x", &int, Background::InGo).unwrap();
        let b = pkg.new_var(&prog, "main.x", &int, Background::InGo).unwrap();
        assert!(Rc::ptr_eq(&a, &b), "same name must return the same global");
        assert!(pkg.var_of("main.x").is_some());
        assert!(pkg.var_of("main.y").is_none());
    }

    #[test]
    fn new_func_is_idempotent() {
        let ctx = Context::create();
        let prog = test_prog(&ctx);
        let pkg = PackageEmitter::new(&prog, "main", "main");

        let a = pkg
            .new_func(&prog, "main.f", no_args_no_ret(), Background::InGo, false)
            .unwrap();
        let b = pkg
            .new_func(&prog, "main.f", no_args_no_ret(), Background::InGo, false)
            .unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert!(pkg.func_of("main.f").is_some());
        assert!(pkg.func_of("main.g").is_none());
    }

    #[test]
    fn blocks_are_labeled_llgo_i() {
        let ctx = Context::create();
        let prog = test_prog(&ctx);
        let pkg = PackageEmitter::new(&prog, "main", "main");
        let f = pkg
            .new_func(&prog, "main.f", no_args_no_ret(), Background::InGo, false)
            .unwrap();

        f.make_blocks(&prog, 3);
        f.make_block(&prog);
        assert_eq!(f.n_blocks(), 4);

        let ir = pkg.serialize();
        assert!(ir.contains("_llgo_0"), "entry block is _llgo_0: {ir}");
        assert!(ir.contains("_llgo_3"), "extra block continues numbering: {ir}");
    }

    #[test]
    fn uninitialized_global_is_a_declaration() {
        let ctx = Context::create();
        let prog = test_prog(&ctx);
        let pkg = PackageEmitter::new(&prog, "main", "main");
        let g = pkg
            .new_var(&prog, "main.ext", &GoType::Basic(BasicKind::Int), Background::InGo)
            .unwrap();
        assert!(g.value.get_initializer().is_none());

        g.init_nil();
        assert!(g.value.get_initializer().is_some());
    }

    #[test]
    fn py_init_registers_a_ctor_once() {
        let ctx = Context::create();
        let prog = test_prog(&ctx);
        let pkg = PackageEmitter::new(&prog, "main", "main");
        assert!(pkg.py_init(&prog));
        assert!(!pkg.py_init(&prog), "second call must be a no-op");
        let ir = pkg.serialize();
        assert!(ir.contains("llvm.global_ctors"));
        assert!(ir.contains("llgo/py.Init"));
    }
}
