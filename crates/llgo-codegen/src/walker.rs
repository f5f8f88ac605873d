//! The SSA walker: translates Go-SSA packages into IR via the builder.
//!
//! [`lower_package`] drives one package: members are lowered in
//! sorted-by-name order (types first compile their methods, globals get
//! zero initializers, functions get declarations), and every function body
//! is queued as a deferred emit job so forward references resolve. The
//! queue drains FIFO and may grow while draining (anonymous inner
//! functions queue their own bodies).
//!
//! Patched packages lower the patch first (under the original package's
//! symbol namespace), then the original with the patch's member names
//! skipped; the original `init` survives under `init$hasPatch` so the
//! patch's `init` can bridge to it.

use std::collections::VecDeque;
use std::rc::Rc;

use inkwell::module::Linkage;
use inkwell::values::{BasicMetadataValueEnum, PhiValue};
use rustc_hash::{FxHashMap, FxHashSet};

use llgo_ssa::symbols;
use llgo_ssa::{
    Background, BasicKind, Block, Builtin, CallInstr, Callee, Const, FuncRef, GoType, Instr,
    Member, PackageKind, Param, RegId, Signature, SsaFunction, SsaPackage, TypeDef, UnOpToken,
    Value,
};

use crate::abi::{self, MethodTableEntry};
use crate::builder::{iface_method_table, Builder, Expr};
use crate::intrinsics::{py_fn, runtime_fn, PyFn, RtFn};
use crate::package::{DeferTarget, Function, PackageEmitter};
use crate::program::Program;

/// Alternate (patch) packages, keyed by the import path of the package
/// they replace.
pub type Patches = FxHashMap<String, Rc<SsaPackage>>;

/// Explicit configuration for patched packages.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchOptions {
    /// When true the patch fully replaces the package: no member of the
    /// original is lowered at all.
    pub skip_all: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PkgState {
    Normal,
    /// Lowering the patch package's members.
    InPatch,
    /// Lowering the original members of a patched package.
    HasPatch,
}

/// How a call instruction is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Call,
    Defer,
    Go,
}

/// Lower one package (plus its optional patch) into `pkg`'s module.
pub fn lower_package<'ctx>(
    prog: &Program<'ctx>,
    pkg: &PackageEmitter<'ctx>,
    ssa_pkg: &SsaPackage,
    patch: Option<&SsaPackage>,
    opts: PatchOptions,
) -> Result<(), String> {
    let py_module = match ssa_pkg.kind() {
        PackageKind::PyModule(m) => Some(m),
        _ => None,
    };

    // The patch's member names shadow the original's, with one exception:
    // `init` is never shadowed, because the original initializer survives
    // under `init$hasPatch` and the patch's `init` bridges to it.
    let mut skips: FxHashSet<String> = FxHashSet::default();
    if let Some(alt) = patch {
        for m in &alt.members {
            if m.name() != "init" {
                skips.insert(m.name().to_string());
            }
        }
    }
    let original_has_init = ssa_pkg
        .members
        .iter()
        .any(|m| matches!(m, Member::Func(f) if f.is_init()));
    let no_old_init = opts.skip_all || patch.is_none() || !original_has_init;

    let mut w = Walker {
        prog,
        pkg,
        ssa_pkg,
        py_module,
        no_old_init,
        queue: VecDeque::new(),
    };

    if let Some(alt) = patch {
        // The patch's members are lowered under the original package's
        // symbol namespace, preserving identity.
        for m in alt.sorted_members() {
            w.lower_member(m, PkgState::InPatch, None)?;
        }
    }
    if !opts.skip_all {
        let state = if patch.is_some() {
            PkgState::HasPatch
        } else {
            PkgState::Normal
        };
        let skips = if patch.is_some() { Some(&skips) } else { None };
        for m in ssa_pkg.sorted_members() {
            w.lower_member(m, state, skips)?;
        }
    }

    while let Some(job) = w.queue.pop_front() {
        let symbol = job.symbol.clone();
        w.run_job(job).map_err(|e| format!("{symbol}: {e}"))?;
    }
    Ok(())
}

struct EmitJob<'a, 'ctx> {
    func: &'a SsaFunction,
    symbol: String,
    fn_: Rc<Function<'ctx>>,
    state: PkgState,
}

struct Walker<'a, 'ctx> {
    prog: &'a Program<'ctx>,
    pkg: &'a PackageEmitter<'ctx>,
    ssa_pkg: &'a SsaPackage,
    py_module: Option<String>,
    no_old_init: bool,
    queue: VecDeque<EmitJob<'a, 'ctx>>,
}

struct PhiFixup<'ctx> {
    phi: PhiValue<'ctx>,
    preds: Vec<u32>,
    edges: Vec<Value>,
}

/// Per-function-body lowering state.
struct BodyCtx<'a, 'ctx> {
    f: &'a SsaFunction,
    fn_: Rc<Function<'ctx>>,
    state: PkgState,
    in_c: bool,
    /// SSA register -> lowered expression, scoped to this body.
    bvals: FxHashMap<RegId, Expr<'ctx>>,
    /// Register of each value-producing instruction, for referrer-shape
    /// queries.
    defs: FxHashMap<RegId, &'a Instr>,
    /// Variadic-packaging state: elided alloca -> element slots.
    vargs: FxHashMap<RegId, Vec<Option<Expr<'ctx>>>>,
    /// IndexAddr registers into an elided alloca -> (alloca, index).
    varg_index: FxHashMap<RegId, (RegId, u64)>,
    /// Slice registers over an elided alloca -> alloca.
    varg_slice: FxHashMap<RegId, RegId>,
    phis: Vec<PhiFixup<'ctx>>,
}

impl<'a, 'ctx> Walker<'a, 'ctx> {
    fn lower_member(
        &mut self,
        m: &'a Member,
        state: PkgState,
        skips: Option<&FxHashSet<String>>,
    ) -> Result<(), String> {
        if let Some(skips) = skips {
            if skips.contains(m.name()) {
                return Ok(());
            }
        }
        match m {
            Member::Global { name, ty, background } => self.lower_global(name, ty, *background),
            Member::Func(f) => {
                if matches!(self.ssa_pkg.kind(), PackageKind::PyModule(_)) && !f.has_body() {
                    // Python-module functions resolve through the imported
                    // module object at runtime; nothing to declare.
                    return Ok(());
                }
                self.compile_func_decl(f, state).map(|_| ())
            }
            Member::Type(td) => self.lower_type(td, state),
        }
    }

    fn lower_global(&self, name: &str, ty: &GoType, bg: Background) -> Result<(), String> {
        let sym = symbols::full_name(&self.ssa_pkg.path, name);
        if symbols::ignore_name(&sym) {
            return Ok(());
        }
        if crate::debug_instr() {
            eprintln!("==> NewVar {sym}");
        }
        let g = self.pkg.new_var(self.prog, &sym, ty, bg)?;
        // Python modules leave their globals to the interpreter; everything
        // else is zero-initialized.
        if self.py_module.is_none() {
            g.init_nil();
        }
        Ok(())
    }

    fn lower_type(&mut self, td: &'a TypeDef, state: PkgState) -> Result<(), String> {
        let named = GoType::Named {
            pkg: self.ssa_pkg.path.clone(),
            name: td.name.clone(),
        };
        if crate::debug_instr() {
            eprintln!("==> NewType {}", named.key());
        }
        if let GoType::Interface(def) = &td.underlying {
            abi::define_iface_descriptor(
                self.prog,
                self.pkg.module(),
                &symbols::type_symbol(&named),
                &iface_method_table(def),
            );
            return Ok(());
        }

        let mut value_entries: Vec<MethodTableEntry<'ctx>> = Vec::new();
        let mut ptr_entries: Vec<MethodTableEntry<'ctx>> = Vec::new();
        let value_sym = symbols::type_symbol(&named);
        let ptr_sym = symbols::type_symbol(&GoType::pointer(named.clone()));

        for method in &td.methods {
            let Some(fnv) = self.compile_func_decl(method, state)? else {
                continue;
            };
            let recv = method
                .sig
                .recv
                .as_ref()
                .ok_or_else(|| format!("method without receiver: {}", method.name))?;
            let by_pointer = matches!(recv.ty, GoType::Pointer(_));
            let bare = bare_method_name(&method.name);
            let mut msig = method.sig.clone();
            msig.recv = None;
            let mtype_sym = symbols::type_symbol(&GoType::Func(Box::new(msig)));

            let ifn = if by_pointer {
                fnv.clone()
            } else {
                self.make_ifn_wrapper(method, &fnv)?
            };
            abi::attach_ifn_attr(self.prog, ifn.val, &ptr_sym, &bare, &mtype_sym);
            let entry = MethodTableEntry {
                name: bare.clone(),
                method_type_symbol: mtype_sym.clone(),
                ifn: ifn.val.as_global_value().as_pointer_value(),
                tfn: fnv.val.as_global_value().as_pointer_value(),
            };
            if !by_pointer {
                abi::attach_ifn_attr(self.prog, ifn.val, &value_sym, &bare, &mtype_sym);
                value_entries.push(MethodTableEntry {
                    name: entry.name.clone(),
                    method_type_symbol: entry.method_type_symbol.clone(),
                    ifn: entry.ifn,
                    tfn: entry.tfn,
                });
            }
            ptr_entries.push(entry);
        }

        abi::define_type_descriptor(self.prog, self.pkg.module(), &value_sym, &value_entries);
        abi::define_type_descriptor(self.prog, self.pkg.module(), &ptr_sym, &ptr_entries);
        Ok(())
    }

    /// An interface-call shim for a value-receiver method: takes the
    /// receiver as the boxed data pointer, loads the value, and tail-calls
    /// the real method.
    fn make_ifn_wrapper(
        &self,
        method: &SsaFunction,
        target: &Rc<Function<'ctx>>,
    ) -> Result<Rc<Function<'ctx>>, String> {
        let recv = method.sig.recv.as_ref().expect("checked by caller");
        let wrapper_name = format!(
            "{}$ifn",
            symbols::full_name(&self.ssa_pkg.path, &method.name)
        );
        if let Some(existing) = self.pkg.func_of(&wrapper_name) {
            return Ok(existing);
        }
        let mut sig = method.sig.clone();
        sig.recv = Some(Param {
            name: recv.name.clone(),
            ty: GoType::pointer(recv.ty.clone()),
        });
        let wrapper = self
            .pkg
            .new_func(self.prog, &wrapper_name, sig, Background::InGo, false)?;
        wrapper.make_blocks(self.prog, 1);

        let b = Builder::new(self.prog, self.pkg, wrapper.clone());
        b.set_block(wrapper.block(0));
        let recv_ptr = wrapper.param(0);
        let loaded = b.load(&recv_ptr)?;
        let mut args = vec![loaded];
        for i in 1..=method.sig.params.len() {
            args.push(wrapper.param(i));
        }
        match b.call_fn(target, &args)? {
            Some(ret) => b.ret(&[ret])?,
            None => b.ret(&[])?,
        }
        Ok(wrapper)
    }

    /// Declare a function (idempotently) and queue its body for emission.
    fn compile_func_decl(
        &mut self,
        f: &'a SsaFunction,
        state: PkgState,
    ) -> Result<Option<Rc<Function<'ctx>>>, String> {
        let mut sym = symbols::full_name(&self.ssa_pkg.path, &f.name);
        if symbols::ignore_name(&sym) {
            return Ok(None);
        }
        if f.is_init() && state == PkgState::HasPatch {
            sym = symbols::init_fn_name_of_has_patch(&sym);
        }
        if let Some(existing) = self.pkg.func_of(&sym) {
            if existing.has_body() {
                return Ok(Some(existing));
            }
        }

        let has_ctx = !f.free_vars.is_empty();
        let sig = if sym == "main" {
            c_main_signature()
        } else {
            f.sig.clone()
        };
        let fnv = self
            .pkg
            .new_func(self.prog, &sym, sig, f.background, has_ctx)?;

        if f.has_body() && fnv.n_blocks() == 0 {
            fnv.make_blocks(self.prog, f.blocks.len());
            if let Some(r) = f.recover_block {
                fnv.set_recover(r as usize);
            }
            self.queue.push_back(EmitJob {
                func: f,
                symbol: sym,
                fn_: fnv.clone(),
                state,
            });
            for anon in &f.anon_funcs {
                self.compile_func_decl(anon, state)?;
            }
        }
        Ok(Some(fnv))
    }

    // ── Body emission ────────────────────────────────────────────────

    fn run_job(&mut self, job: EmitJob<'a, 'ctx>) -> Result<(), String> {
        if crate::debug_gossa() {
            eprintln!("==> FuncBody {}", job.symbol);
        }
        let f = job.func;
        let b = Builder::new(self.prog, self.pkg, job.fn_.clone());
        let mut bc = BodyCtx {
            f,
            fn_: job.fn_.clone(),
            state: job.state,
            in_c: f.background == Background::InC,
            bvals: FxHashMap::default(),
            defs: FxHashMap::default(),
            vargs: FxHashMap::default(),
            varg_index: FxHashMap::default(),
            varg_slice: FxHashMap::default(),
            phis: Vec::new(),
        };

        for block in &f.blocks {
            for ins in &block.instrs {
                if let Some(reg) = ins.reg {
                    bc.defs.insert(reg, &ins.kind);
                }
            }
        }
        self.scan_vararg_allocs(&mut bc);

        // Phi placeholders come first so cross-block references resolve.
        let mut offsets = vec![0usize; f.blocks.len()];
        for (i, block) in f.blocks.iter().enumerate() {
            offsets[i] = self.compile_phis(&b, &mut bc, block)?;
        }

        let is_main = job.symbol == "main";
        let is_init = f.is_init();
        let infos = block_infos(f);
        let mut i = 0usize;
        loop {
            let block = &f.blocks[i];
            let do_main_init = i == 0 && is_main;
            let do_mod_init = i == 1 && is_init;
            self.compile_block(&b, &mut bc, block, offsets[i], do_main_init, do_mod_init)?;
            match infos[i].next {
                Some(next) => i = next,
                None => break,
            }
        }

        // Fill in phi edges from each predecessor's end.
        let fixups = std::mem::take(&mut bc.phis);
        for fixup in fixups {
            for (pred, edge) in fixup.preds.iter().zip(fixup.edges.iter()) {
                let pred_blk = bc.fn_.block(*pred as usize);
                b.set_block_before_last(pred_blk);
                let v = self.compile_value(&b, &mut bc, edge)?;
                fixup.phi.add_incoming(&[(&v.val, pred_blk)]);
            }
        }
        Ok(())
    }

    /// Detect `Alloc`s whose referrer chain is exactly
    /// `{IndexAddr+Store}* -> Slice -> (Call|Defer|Go)` on a known
    /// variadic Go function. Only that shape elides the alloca; anything
    /// else takes the standard path.
    fn scan_vararg_allocs(&self, bc: &mut BodyCtx<'a, 'ctx>) {
        let f = bc.f;
        for block in &f.blocks {
            for ins in &block.instrs {
                let Some(alloc_reg) = ins.reg else { continue };
                let Instr::Alloc { elem, comment, .. } = &ins.kind else {
                    continue;
                };
                if comment != "varargs" {
                    continue;
                }
                let GoType::Array { elem: arr_elem, len } = elem else {
                    continue;
                };
                let GoType::Interface(def) = &**arr_elem else {
                    continue;
                };
                if !def.is_empty() {
                    continue;
                }
                if self.vararg_shape_ok(f, alloc_reg) {
                    bc.vargs.insert(alloc_reg, vec![None; *len as usize]);
                }
            }
        }
    }

    fn vararg_shape_ok(&self, f: &SsaFunction, alloc_reg: RegId) -> bool {
        let mut slice_reg: Option<RegId> = None;
        let mut index_regs: Vec<RegId> = Vec::new();
        let mut last_is_slice = false;

        for block in &f.blocks {
            for ins in &block.instrs {
                if !instr_uses_reg(&ins.kind, alloc_reg) {
                    continue;
                }
                match &ins.kind {
                    Instr::IndexAddr { x: Value::Reg(r), .. } if *r == alloc_reg => {
                        index_regs.push(ins.reg.unwrap_or(u32::MAX));
                        last_is_slice = false;
                    }
                    Instr::Slice { x: Value::Reg(r), .. } if *r == alloc_reg => {
                        if slice_reg.is_some() {
                            return false;
                        }
                        slice_reg = ins.reg;
                        last_is_slice = true;
                    }
                    _ => return false,
                }
            }
        }
        let Some(slice_reg) = slice_reg else { return false };
        if !last_is_slice {
            return false;
        }

        // Each element address must feed exactly one store.
        for idx_reg in &index_regs {
            let mut stores = 0usize;
            for block in &f.blocks {
                for ins in &block.instrs {
                    if !instr_uses_reg(&ins.kind, *idx_reg) {
                        continue;
                    }
                    match &ins.kind {
                        Instr::Store { addr: Value::Reg(r), .. } if r == idx_reg => stores += 1,
                        _ => return false,
                    }
                }
            }
            if stores != 1 {
                return false;
            }
        }

        // The slice feeds exactly one call-like consumer of a known
        // variadic Go function, as its final argument.
        let mut consumer: Option<&CallInstr> = None;
        for block in &f.blocks {
            for ins in &block.instrs {
                if !instr_uses_reg(&ins.kind, slice_reg) {
                    continue;
                }
                match &ins.kind {
                    Instr::Call(c) | Instr::Defer(c) | Instr::Go(c) => {
                        if consumer.is_some() {
                            return false;
                        }
                        consumer = Some(c);
                    }
                    _ => return false,
                }
            }
        }
        let Some(call) = consumer else { return false };
        if !matches!(call.args.last(), Some(Value::Reg(r)) if *r == slice_reg) {
            return false;
        }
        match &call.callee {
            Callee::Func(fr) => fr.sig.variadic && fr.background == Background::InGo,
            Callee::Builtin(Builtin::Append) => true,
            _ => false,
        }
    }

    fn compile_phis(
        &self,
        b: &Builder<'a, 'ctx>,
        bc: &mut BodyCtx<'a, 'ctx>,
        block: &Block,
    ) -> Result<usize, String> {
        let mut n = 0usize;
        b.set_block(bc.fn_.block(block.index as usize));
        for ins in &block.instrs {
            let Instr::Phi { edges, ty } = &ins.kind else { break };
            let (phi, expr) = b.phi(ty)?;
            if let Some(reg) = ins.reg {
                bc.bvals.insert(reg, expr);
            }
            bc.phis.push(PhiFixup {
                phi,
                preds: block.preds.clone(),
                edges: edges.clone(),
            });
            n += 1;
        }
        Ok(n)
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_block(
        &mut self,
        b: &Builder<'a, 'ctx>,
        bc: &mut BodyCtx<'a, 'ctx>,
        block: &Block,
        skip: usize,
        do_main_init: bool,
        do_mod_init: bool,
    ) -> Result<(), String> {
        b.set_block(bc.fn_.block(block.index as usize));
        let mut instrs: &[llgo_ssa::Instruction] = &block.instrs[skip..];

        // A Python module's `init` ends in a guarded one-shot import
        // instead of its trailing jump.
        let mut py_mod_jump: Option<u32> = None;
        if do_mod_init
            && self.py_module.is_some()
            && matches!(instrs.last().map(|i| &i.kind), Some(Instr::Jump))
        {
            py_mod_jump = block.succs.first().copied();
            instrs = &instrs[..instrs.len() - 1];
        }

        if do_main_init {
            self.emit_main_prelude(b, bc)?;
        }

        for (i, ins) in instrs.iter().enumerate() {
            if i == 1 && do_mod_init && bc.state == PkgState::InPatch && !self.no_old_init {
                // Bridge to the original package's renamed initializer.
                let old = symbols::init_fn_name_of_has_patch(&symbols::full_name(
                    &self.ssa_pkg.path,
                    "init",
                ));
                let old_fn =
                    self.pkg
                        .new_func(self.prog, &old, Signature::default(), Background::InC, false)?;
                b.call_fn(&old_fn, &[])?;
            }
            if crate::debug_instr() {
                eprintln!("==> Instr {}", ins.kind.opcode());
            }
            self.compile_instr(b, bc, block, ins)?;
        }

        if let Some(target) = py_mod_jump {
            self.emit_py_module_import(b, bc, target)?;
        }
        Ok(())
    }

    /// The `main.main` prelude: persist argc/argv, bring up the runtime,
    /// then run the package initializers.
    fn emit_main_prelude(&self, b: &Builder<'a, 'ctx>, bc: &BodyCtx<'a, 'ctx>) -> Result<(), String> {
        let argc_ty = GoType::Basic(BasicKind::Int32);
        let argv_ty = GoType::pointer(GoType::pointer(GoType::Basic(BasicKind::Uint8)));
        let argc = self
            .pkg
            .new_var(self.prog, symbols::NAME_ARGC, &argc_ty, Background::InC)?;
        let argv = self
            .pkg
            .new_var(self.prog, symbols::NAME_ARGV, &argv_ty, Background::InC)?;
        argc.init_nil();
        argv.init_nil();
        b.store(&argc.expr(), &bc.fn_.param(0))?;
        b.store(&argv.expr(), &bc.fn_.param(1))?;

        let rt_init = format!("{}.init", self.prog.runtime_pkg());
        let rt = self
            .pkg
            .new_func(self.prog, &rt_init, Signature::default(), Background::InC, false)?;
        b.call_fn(&rt, &[])?;

        let main_init =
            self.pkg
                .new_func(self.prog, "main.init", Signature::default(), Background::InGo, false)?;
        b.call_fn(&main_init, &[])?;
        Ok(())
    }

    /// Guarded one-shot Python module import at the end of a Python
    /// module's `init`.
    fn emit_py_module_import(
        &self,
        b: &Builder<'a, 'ctx>,
        bc: &BodyCtx<'a, 'ctx>,
        jump_to: u32,
    ) -> Result<(), String> {
        let module = self.py_module.as_deref().unwrap_or_default().to_string();
        let mod_var_ty = GoType::Basic(BasicKind::UnsafePointer);
        let mod_var = self.pkg.new_var(
            self.prog,
            &format!("{}{module}", symbols::PY_SYM_PREFIX),
            &mod_var_ty,
            Background::InC,
        )?;
        mod_var.init_nil();

        let target = bc.fn_.block(jump_to as usize);
        let loaded = b.load(&mod_var.expr())?;
        let nil = b.zero_value(&mod_var_ty, Background::InC)?;
        let cond = b.binop(llgo_ssa::BinOpToken::Neq, &loaded, &nil)?;
        let import_blk = bc.fn_.make_block(self.prog);
        b.cond_br(&cond, target, import_blk)?;

        b.set_block(import_blk);
        let name = b.const_string(&module, Background::InC)?;
        let import = py_fn(self.prog, self.pkg.module(), PyFn::ImportModule);
        let imported = b
            .call_raw(import, &[name.val.into()])?
            .ok_or("ImportModule returned void")?;
        b.store(&mod_var.expr(), &Expr::new(imported, mod_var_ty))?;
        b.jump(target)?;
        Ok(())
    }

    // ── Instructions ─────────────────────────────────────────────────

    fn compile_instr(
        &mut self,
        b: &Builder<'a, 'ctx>,
        bc: &mut BodyCtx<'a, 'ctx>,
        block: &Block,
        ins: &llgo_ssa::Instruction,
    ) -> Result<(), String> {
        let ret: Option<Expr<'ctx>> = match &ins.kind {
            Instr::BinOp { op, x, y, .. } => {
                let x = self.compile_value(b, bc, x)?;
                let y = self.compile_value(b, bc, y)?;
                Some(b.binop(*op, &x, &y)?)
            }
            Instr::UnOp { op, x, comma_ok, ty } => {
                let xv = self.compile_value(b, bc, x)?;
                match op {
                    UnOpToken::Recv => Some(b.recv(&xv, *comma_ok, ty)?),
                    _ => Some(b.unop(*op, &xv)?),
                }
            }
            Instr::Alloc { elem, heap, .. } => {
                if let Some(reg) = ins.reg {
                    if bc.vargs.contains_key(&reg) {
                        return Ok(());
                    }
                }
                Some(b.alloc(elem, *heap)?)
            }
            Instr::IndexAddr { x, index, .. } => {
                if let Value::Reg(base) = x {
                    if bc.vargs.contains_key(base) {
                        let idx = const_index(index)?;
                        if let Some(reg) = ins.reg {
                            bc.varg_index.insert(reg, (*base, idx));
                        }
                        return Ok(());
                    }
                }
                let xv = self.compile_value(b, bc, x)?;
                let iv = self.compile_value(b, bc, index)?;
                Some(b.index_addr(&xv, &iv)?)
            }
            Instr::Index { x, index, .. } => {
                let xv = self.compile_value(b, bc, x)?;
                let iv = self.compile_value(b, bc, index)?;
                Some(b.index(&xv, &iv)?)
            }
            Instr::FieldAddr { x, field, .. } => {
                let xv = self.compile_value(b, bc, x)?;
                Some(b.field_addr(&xv, *field)?)
            }
            Instr::Field { x, field, .. } => {
                let xv = self.compile_value(b, bc, x)?;
                Some(b.field(&xv, *field)?)
            }
            Instr::Slice { x, low, high, max, ty } => {
                if let Value::Reg(base) = x {
                    if bc.vargs.contains_key(base) {
                        if let Some(reg) = ins.reg {
                            bc.varg_slice.insert(reg, *base);
                        }
                        return Ok(());
                    }
                }
                let xv = self.compile_value(b, bc, x)?;
                let lo = low.as_ref().map(|v| self.compile_value(b, bc, v)).transpose()?;
                let hi = high.as_ref().map(|v| self.compile_value(b, bc, v)).transpose()?;
                let mx = max.as_ref().map(|v| self.compile_value(b, bc, v)).transpose()?;
                Some(b.slice_op(&xv, lo.as_ref(), hi.as_ref(), mx.as_ref(), ty)?)
            }
            Instr::Lookup { x, index, comma_ok, ty } => {
                let xv = self.compile_value(b, bc, x)?;
                let iv = self.compile_value(b, bc, index)?;
                Some(b.lookup(&xv, &iv, *comma_ok, ty)?)
            }
            Instr::MakeSlice { len, cap, ty } => {
                let len_v = self.compile_value(b, bc, len)?;
                let cap_v = cap.as_ref().map(|v| self.compile_value(b, bc, v)).transpose()?;
                Some(b.make_slice(ty, &len_v, cap_v.as_ref())?)
            }
            Instr::MakeMap { reserve, ty } => {
                let r = reserve.as_ref().map(|v| self.compile_value(b, bc, v)).transpose()?;
                Some(b.make_map(ty, r.as_ref())?)
            }
            Instr::MakeInterface { x, x_ty, ty } => {
                let xv = self.compile_value(b, bc, x)?;
                Some(b.make_interface(ty, x_ty, &xv)?)
            }
            Instr::MakeClosure { func, bindings, ty } => {
                Some(self.lower_make_closure(b, bc, func, bindings, ty)?)
            }
            Instr::TypeAssert { x, asserted, comma_ok, .. } => {
                let xv = self.compile_value(b, bc, x)?;
                Some(b.type_assert(&xv, asserted, *comma_ok)?)
            }
            Instr::ChangeType { x, ty } => {
                let xv = self.compile_value(b, bc, x)?;
                Some(b.change_type(ty, &xv)?)
            }
            Instr::Convert { x, ty, .. } => {
                let xv = self.compile_value(b, bc, x)?;
                Some(b.convert(ty, &xv)?)
            }
            Instr::ChangeInterface { x, ty } => {
                let xv = self.compile_value(b, bc, x)?;
                Some(b.change_interface(ty, &xv)?)
            }
            Instr::Range { x, .. } => {
                let xv = self.compile_value(b, bc, x)?;
                Some(b.range_iter(&xv)?)
            }
            Instr::Next { iter, is_string, ty } => {
                let it = self.compile_value(b, bc, iter)?;
                Some(b.next(&it, *is_string, ty)?)
            }
            Instr::Extract { tuple, index, .. } => {
                let t = self.compile_value(b, bc, tuple)?;
                Some(b.extract(&t, *index)?)
            }
            Instr::Phi { .. } => {
                return Err("compileInstr: phi outside block prologue".into());
            }
            Instr::Call(call) => self.lower_call(b, bc, CallKind::Call, call)?,
            Instr::Defer(call) => self.lower_call(b, bc, CallKind::Defer, call)?,
            Instr::Go(call) => self.lower_call(b, bc, CallKind::Go, call)?,
            Instr::Store { addr, val } => {
                if let Value::Reg(r) = addr {
                    if let Some((alloc, idx)) = bc.varg_index.get(r).copied() {
                        let v = self.compile_value(b, bc, val)?;
                        let slots = bc.vargs.get_mut(&alloc).expect("tracked alloc");
                        slots[idx as usize] = Some(v);
                        return Ok(());
                    }
                }
                let ptr = self.compile_value(b, bc, addr)?;
                let v = self.compile_value(b, bc, val)?;
                b.store(&ptr, &v)?;
                None
            }
            Instr::MapUpdate { map, key, value } => {
                let m = self.compile_value(b, bc, map)?;
                let k = self.compile_value(b, bc, key)?;
                let v = self.compile_value(b, bc, value)?;
                b.map_update(&m, &k, &v)?;
                None
            }
            Instr::Send { chan, x } => {
                let ch = self.compile_value(b, bc, chan)?;
                let v = self.compile_value(b, bc, x)?;
                b.send(&ch, &v)?;
                None
            }
            Instr::Jump => {
                let target = block.succs.first().ok_or("jump without successor")?;
                b.jump(bc.fn_.block(*target as usize))?;
                None
            }
            Instr::If { cond } => {
                let c = self.compile_value(b, bc, cond)?;
                let (then_i, else_i) = match block.succs.as_slice() {
                    [t, e, ..] => (*t, *e),
                    _ => return Err("if without two successors".into()),
                };
                b.cond_br(&c, bc.fn_.block(then_i as usize), bc.fn_.block(else_i as usize))?;
                None
            }
            Instr::Return { results } => {
                if bc.fn_.name == "main" {
                    // C ABI: main returns int 0 regardless of the user's
                    // signature.
                    let zero = b.const_int(0, &GoType::Basic(BasicKind::Int32), Background::InC)?;
                    b.ret(&[zero])?;
                } else {
                    let mut vals = Vec::with_capacity(results.len());
                    for r in results {
                        vals.push(self.compile_value(b, bc, r)?);
                    }
                    b.ret(&vals)?;
                }
                None
            }
            Instr::RunDefers => {
                b.run_defers()?;
                None
            }
            Instr::Panic { x } => {
                let v = self.compile_value(b, bc, x)?;
                b.panic(&v)?;
                None
            }
        };

        if let (Some(reg), Some(expr)) = (ins.reg, ret) {
            bc.bvals.insert(reg, expr);
        }
        Ok(())
    }

    // ── Values ───────────────────────────────────────────────────────

    fn compile_value(
        &mut self,
        b: &Builder<'a, 'ctx>,
        bc: &mut BodyCtx<'a, 'ctx>,
        v: &Value,
    ) -> Result<Expr<'ctx>, String> {
        match v {
            Value::Reg(r) => bc
                .bvals
                .get(r)
                .cloned()
                .ok_or_else(|| format!("compileValue: register %{r} used before definition")),
            Value::Param(i) => Ok(bc.fn_.param(*i as usize)),
            Value::FreeVar(i) => self.compile_free_var(b, bc, *i as usize),
            Value::Const(c) => {
                let bg = if bc.in_c { Background::InC } else { Background::InGo };
                b.const_expr(c, bg)
            }
            Value::Global { sym, ty } => {
                if let Some(g) = self.pkg.var_of(sym) {
                    return Ok(g.expr());
                }
                let g = self.pkg.new_var(self.prog, sym, ty, Background::InGo)?;
                Ok(g.expr())
            }
            Value::Func(fref) => {
                if fref.intrinsic.is_some() {
                    return Err(format!(
                        "compileValue: llgo instruction {} is not a value",
                        fref.name
                    ));
                }
                self.func_value(b, fref)
            }
        }
    }

    fn compile_free_var(
        &self,
        b: &Builder<'a, 'ctx>,
        bc: &BodyCtx<'a, 'ctx>,
        i: usize,
    ) -> Result<Expr<'ctx>, String> {
        let ctx_ptr = bc
            .fn_
            .ctx_param()
            .ok_or("free variable in a function without context")?;
        let fields: Vec<llgo_ssa::Field> = bc
            .f
            .free_vars
            .iter()
            .map(|p| llgo_ssa::Field {
                name: p.name.clone(),
                ty: p.ty.clone(),
                embedded: false,
            })
            .collect();
        let fv_ty = bc
            .f
            .free_vars
            .get(i)
            .map(|p| p.ty.clone())
            .ok_or_else(|| format!("no free variable {i}"))?;
        let ctx_struct = GoType::Struct(llgo_ssa::StructDef { fields });
        let ctx_expr = Expr::new(ctx_ptr, GoType::pointer(ctx_struct));
        let loaded = b.load(&ctx_expr)?;
        let field = b.field(&loaded, i as u32)?;
        debug_assert_eq!(field.ty.key(), fv_ty.key());
        Ok(field)
    }

    /// Resolve a function reference to its (idempotent) declaration,
    /// raising the runtime/python flags when the reference crosses into
    /// those packages.
    fn resolve_func_ref(&mut self, fref: &FuncRef) -> Result<Rc<Function<'ctx>>, String> {
        if fref.pkg == self.prog.runtime_pkg() {
            self.prog.need_runtime.set(true);
        } else if fref.pkg == self.prog.python_pkg() {
            self.prog.need_py_init.set(true);
        }
        let sym = symbols::full_name(&fref.pkg, &fref.name);
        if let Some(f) = self.pkg.func_of(&sym) {
            return Ok(f);
        }
        self.pkg
            .new_func(self.prog, &sym, fref.sig.clone(), fref.background, false)
    }

    /// A function reference used as a *value*: every Go function value is
    /// `{code, ctx}` and indirect call sites always pass the context, so a
    /// plain function gets a one-time shim that ignores it.
    fn func_value(&mut self, b: &Builder<'a, 'ctx>, fref: &FuncRef) -> Result<Expr<'ctx>, String> {
        let target = self.resolve_func_ref(fref)?;
        let value_ty = GoType::Func(Box::new(fref.sig.clone()));
        let null = self
            .prog
            .context()
            .ptr_type(inkwell::AddressSpace::default())
            .const_null();
        if target.has_ctx() {
            return b.make_func_value(
                target.val.as_global_value().as_pointer_value(),
                null,
                value_ty,
            );
        }
        let shim_name = format!("{}$fv", symbols::full_name(&fref.pkg, &fref.name));
        let shim = match self.pkg.func_of(&shim_name) {
            Some(existing) => existing,
            None => {
                let shim =
                    self.pkg
                        .new_func(self.prog, &shim_name, fref.sig.clone(), Background::InGo, true)?;
                shim.make_blocks(self.prog, 1);
                let sb = Builder::new(self.prog, self.pkg, shim.clone());
                sb.set_block(shim.block(0));
                let n = fref.sig.recv.iter().count() + fref.sig.params.len();
                let args: Vec<Expr<'ctx>> = (0..n).map(|i| shim.param(i)).collect();
                match sb.call_fn(&target, &args)? {
                    Some(ret) => sb.ret(&[ret])?,
                    None => sb.ret(&[])?,
                }
                shim
            }
        };
        b.make_func_value(shim.val.as_global_value().as_pointer_value(), null, value_ty)
    }

    fn lower_make_closure(
        &mut self,
        b: &Builder<'a, 'ctx>,
        bc: &mut BodyCtx<'a, 'ctx>,
        func: &FuncRef,
        bindings: &[Value],
        ty: &GoType,
    ) -> Result<Expr<'ctx>, String> {
        let sym = symbols::full_name(&func.pkg, &func.name);
        let target = match self.pkg.func_of(&sym) {
            Some(f) => f,
            None => self
                .pkg
                .new_func(self.prog, &sym, func.sig.clone(), func.background, true)?,
        };

        let mut bound = Vec::with_capacity(bindings.len());
        for v in bindings {
            bound.push(self.compile_value(b, bc, v)?);
        }
        let fields: Vec<inkwell::types::BasicTypeEnum<'ctx>> =
            bound.iter().map(|e| e.val.get_type()).collect();
        let ctx_struct = self.prog.context().struct_type(&fields, false);
        let size = self.prog.size_of(&ctx_struct.into());
        let alloc = runtime_fn(self.prog, self.pkg.module(), RtFn::AllocZ);
        let size_v = self.prog.int_type().const_int(size, false);
        let cell = b
            .call_raw(alloc, &[size_v.into()])?
            .ok_or("AllocZ returned void")?
            .into_pointer_value();
        for (i, e) in bound.iter().enumerate() {
            let slot = b
                .raw()
                .build_struct_gep(ctx_struct, cell, i as u32, "")
                .map_err(|e| e.to_string())?;
            b.raw().build_store(slot, e.val).map_err(|e| e.to_string())?;
        }
        b.make_func_value(
            target.val.as_global_value().as_pointer_value(),
            cell,
            ty.clone(),
        )
    }

    // ── Calls ────────────────────────────────────────────────────────

    fn lower_call(
        &mut self,
        b: &Builder<'a, 'ctx>,
        bc: &mut BodyCtx<'a, 'ctx>,
        kind: CallKind,
        call: &CallInstr,
    ) -> Result<Option<Expr<'ctx>>, String> {
        match &call.callee {
            Callee::Func(fref) if fref.intrinsic.is_some() => {
                if kind != CallKind::Call {
                    return Err(format!(
                        "cannot defer or spawn llgo instruction {}",
                        fref.name
                    ));
                }
                self.lower_llgo_instr(b, bc, fref, &call.args)
            }
            Callee::Func(fref) => {
                let f = self.resolve_func_ref(fref)?;
                let args = self.compile_call_args(b, bc, &call.args)?;
                match kind {
                    CallKind::Call => b.call_fn(&f, &args),
                    CallKind::Defer => {
                        b.add_defer(DeferTarget::Direct(f), args, true)?;
                        Ok(None)
                    }
                    CallKind::Go => {
                        self.lower_go_direct(b, bc, &f, &args)?;
                        Ok(None)
                    }
                }
            }
            Callee::Value(v) => {
                let callee = self.compile_value(b, bc, v)?;
                let sig = match callee.ty.underlying(self.prog.type_env()) {
                    GoType::Func(sig) => (**sig).clone(),
                    other => return Err(format!("call of non-function {}", other.key())),
                };
                let args = self.compile_call_args(b, bc, &call.args)?;
                match kind {
                    CallKind::Call => b.call_value(&callee, &sig, &args),
                    CallKind::Defer => {
                        b.add_defer(DeferTarget::Indirect { value: callee, sig }, args, true)?;
                        Ok(None)
                    }
                    CallKind::Go => {
                        self.lower_go_indirect(b, bc, &callee, &sig, &args)?;
                        Ok(None)
                    }
                }
            }
            Callee::Invoke { iface, iface_ty, method_index, sig, .. } => {
                let thunk = self.invoke_thunk(b, iface_ty, *method_index, sig)?;
                let iface_v = self.compile_value(b, bc, iface)?;
                let mut args = Vec::with_capacity(call.args.len() + 1);
                args.push(iface_v);
                args.extend(self.compile_call_args(b, bc, &call.args)?);
                match kind {
                    CallKind::Call => b.call_fn(&thunk, &args),
                    CallKind::Defer => {
                        b.add_defer(DeferTarget::Direct(thunk), args, true)?;
                        Ok(None)
                    }
                    CallKind::Go => {
                        self.lower_go_direct(b, bc, &thunk, &args)?;
                        Ok(None)
                    }
                }
            }
            Callee::Builtin(builtin) => self.lower_builtin(b, bc, kind, *builtin, &call.args, &call.ty),
        }
    }

    fn compile_call_args(
        &mut self,
        b: &Builder<'a, 'ctx>,
        bc: &mut BodyCtx<'a, 'ctx>,
        args: &[Value],
    ) -> Result<Vec<Expr<'ctx>>, String> {
        let mut out = Vec::with_capacity(args.len());
        for a in args {
            if let Value::Reg(r) = a {
                if let Some(alloc) = bc.varg_slice.get(r).copied() {
                    out.push(self.pack_vararg_slice(b, bc, alloc)?);
                    continue;
                }
            }
            out.push(self.compile_value(b, bc, a)?);
        }
        Ok(out)
    }

    /// Materialize the packed variadic slice for an elided alloca: one
    /// stack array, one store per element, one slice header.
    fn pack_vararg_slice(
        &self,
        b: &Builder<'a, 'ctx>,
        bc: &mut BodyCtx<'a, 'ctx>,
        alloc: RegId,
    ) -> Result<Expr<'ctx>, String> {
        let slots = bc
            .vargs
            .get(&alloc)
            .cloned()
            .ok_or("untracked variadic allocation")?;
        self.pack_any_slice(b, &slots)
    }

    fn pack_any_slice(
        &self,
        b: &Builder<'a, 'ctx>,
        slots: &[Option<Expr<'ctx>>],
    ) -> Result<Expr<'ctx>, String> {
        let any = GoType::any();
        let iface_ty = self.prog.iface_type();
        let n = slots.len();
        let arr_ty = iface_ty.array_type(n as u32);
        let arr = b.entry_alloca(arr_ty.into(), "vargs")?;
        let i32_ty = self.prog.context().i32_type();
        for (i, slot) in slots.iter().enumerate() {
            let gep = unsafe {
                b.raw().build_in_bounds_gep(
                    arr_ty,
                    arr,
                    &[i32_ty.const_zero(), i32_ty.const_int(i as u64, false)],
                    "",
                )
            }
            .map_err(|e| e.to_string())?;
            let v = match slot {
                Some(e) => e.val,
                None => iface_ty.const_zero().into(),
            };
            b.raw().build_store(gep, v).map_err(|e| e.to_string())?;
        }
        let len = self.prog.int_type().const_int(n as u64, false);
        let packed = b.pack_struct(
            self.prog.slice_type(),
            &[arr.into(), len.into(), len.into()],
        )?;
        Ok(Expr::new(packed, GoType::slice(any)))
    }

    // ── Interface invocation ─────────────────────────────────────────

    /// The invoke thunk for one interface method. Emitted weak with an
    /// itab-indirect body, so programs stay correct when the late
    /// method-binding pass is disabled; the pass links a strong
    /// type-switch replacement over it.
    fn invoke_thunk(
        &mut self,
        b: &Builder<'a, 'ctx>,
        iface_ty: &GoType,
        method_index: u32,
        sig: &Signature,
    ) -> Result<Rc<Function<'ctx>>, String> {
        // The pass needs the interface descriptor to recover method keys.
        b.iface_descriptor(iface_ty)?;

        let iface_sym = symbols::type_symbol(iface_ty);
        let name = symbols::invoke_thunk_name(&iface_sym, method_index, sig);
        if let Some(existing) = self.pkg.func_of(&name) {
            return Ok(existing);
        }

        let mut thunk_sig = sig.clone();
        thunk_sig.recv = None;
        let mut params = vec![Param {
            name: "i".into(),
            ty: iface_ty.clone(),
        }];
        params.extend(thunk_sig.params.clone());
        thunk_sig.params = params;

        let thunk = self
            .pkg
            .new_func(self.prog, &name, thunk_sig.clone(), Background::InGo, false)?;
        thunk.val.set_linkage(Linkage::WeakAny);
        thunk.make_blocks(self.prog, 1);

        let tb = Builder::new(self.prog, self.pkg, thunk.clone());
        tb.set_block(thunk.block(0));
        let iface_param = thunk.param(0);
        let receiver = tb
            .call_raw(
                runtime_fn(self.prog, self.pkg.module(), RtFn::IfacePtrData),
                &[iface_param.val.into()],
            )?
            .ok_or("IfacePtrData returned void")?
            .into_pointer_value();

        let ptr_ty = self.prog.context().ptr_type(inkwell::AddressSpace::default());
        let i64_ty = self.prog.context().i64_type();
        let itab = tb
            .raw()
            .build_extract_value(iface_param.struct_val(), 0, "itab")
            .map_err(|e| e.to_string())?
            .into_pointer_value();
        let slot = unsafe {
            tb.raw().build_in_bounds_gep(
                ptr_ty,
                itab,
                &[i64_ty.const_int(u64::from(method_index) + 3, false)],
                "fn.ptr",
            )
        }
        .map_err(|e| e.to_string())?;
        let fn_ptr = tb
            .raw()
            .build_load(ptr_ty, slot, "fn")
            .map_err(|e| e.to_string())?
            .into_pointer_value();

        let mut callee_sig = sig.clone();
        callee_sig.recv = Some(Param {
            name: "recv".into(),
            ty: GoType::Basic(BasicKind::UnsafePointer),
        });
        let callee_ty = self.prog.fn_sig(&callee_sig, Background::InGo, false)?;
        let mut call_args: Vec<BasicMetadataValueEnum<'ctx>> = vec![receiver.into()];
        for i in 1..=sig.params.len() {
            call_args.push(thunk.param(i).val.into());
        }
        let site = tb
            .raw()
            .build_indirect_call(callee_ty, fn_ptr, &call_args, "")
            .map_err(|e| e.to_string())?;
        match site.try_as_basic_value().basic() {
            Some(v) => tb.ret(&[Expr::new(v, Program::result_go_type(sig))])?,
            None => tb.ret(&[])?,
        }
        Ok(thunk)
    }

    // ── Goroutines ───────────────────────────────────────────────────

    /// `go f(args)`: heap-package the arguments and hand a trampoline to
    /// the runtime scheduler.
    fn lower_go_direct(
        &mut self,
        b: &Builder<'a, 'ctx>,
        bc: &BodyCtx<'a, 'ctx>,
        target: &Rc<Function<'ctx>>,
        args: &[Expr<'ctx>],
    ) -> Result<(), String> {
        let wrapper_name = self.pkg.fresh_wrapper_name(&bc.fn_.name, "go");
        let (ctx_ptr, ctx_struct) = self.pack_go_ctx(b, args)?;

        let wrapper_sig = Signature {
            recv: Some(Param {
                name: "ctx".into(),
                ty: GoType::Basic(BasicKind::UnsafePointer),
            }),
            params: vec![],
            results: vec![],
            variadic: false,
        };
        let wrapper = self
            .pkg
            .new_func(self.prog, &wrapper_name, wrapper_sig, Background::InC, false)?;
        wrapper.make_blocks(self.prog, 1);
        let wb = Builder::new(self.prog, self.pkg, wrapper.clone());
        wb.set_block(wrapper.block(0));
        let ctx_param = wrapper.param(0).ptr_val();
        let mut loaded = Vec::with_capacity(args.len());
        for (i, a) in args.iter().enumerate() {
            let slot = wb
                .raw()
                .build_struct_gep(ctx_struct, ctx_param, i as u32, "")
                .map_err(|e| e.to_string())?;
            let v = wb
                .raw()
                .build_load(a.val.get_type(), slot, "")
                .map_err(|e| e.to_string())?;
            loaded.push(Expr::new(v, a.ty.clone()));
        }
        wb.call_fn(target, &loaded)?;
        wb.ret(&[])?;

        let spawn = runtime_fn(self.prog, self.pkg.module(), RtFn::Go);
        b.call_raw(
            spawn,
            &[
                wrapper.val.as_global_value().as_pointer_value().into(),
                ctx_ptr.into(),
            ],
        )?;
        Ok(())
    }

    fn lower_go_indirect(
        &mut self,
        b: &Builder<'a, 'ctx>,
        bc: &BodyCtx<'a, 'ctx>,
        callee: &Expr<'ctx>,
        sig: &Signature,
        args: &[Expr<'ctx>],
    ) -> Result<(), String> {
        // The function value rides in the context alongside the arguments.
        let mut packed: Vec<Expr<'ctx>> = Vec::with_capacity(args.len() + 1);
        packed.push(callee.clone());
        packed.extend(args.iter().cloned());
        let (ctx_ptr, ctx_struct) = self.pack_go_ctx(b, &packed)?;

        let wrapper_name = self.pkg.fresh_wrapper_name(&bc.fn_.name, "go");
        let wrapper_sig = Signature {
            recv: Some(Param {
                name: "ctx".into(),
                ty: GoType::Basic(BasicKind::UnsafePointer),
            }),
            params: vec![],
            results: vec![],
            variadic: false,
        };
        let wrapper = self
            .pkg
            .new_func(self.prog, &wrapper_name, wrapper_sig, Background::InC, false)?;
        wrapper.make_blocks(self.prog, 1);
        let wb = Builder::new(self.prog, self.pkg, wrapper.clone());
        wb.set_block(wrapper.block(0));
        let ctx_param = wrapper.param(0).ptr_val();
        let mut loaded = Vec::with_capacity(packed.len());
        for (i, a) in packed.iter().enumerate() {
            let slot = wb
                .raw()
                .build_struct_gep(ctx_struct, ctx_param, i as u32, "")
                .map_err(|e| e.to_string())?;
            let v = wb
                .raw()
                .build_load(a.val.get_type(), slot, "")
                .map_err(|e| e.to_string())?;
            loaded.push(Expr::new(v, a.ty.clone()));
        }
        wb.call_value(&loaded[0], sig, &loaded[1..])?;
        wb.ret(&[])?;

        let spawn = runtime_fn(self.prog, self.pkg.module(), RtFn::Go);
        b.call_raw(
            spawn,
            &[
                wrapper.val.as_global_value().as_pointer_value().into(),
                ctx_ptr.into(),
            ],
        )?;
        Ok(())
    }

    fn pack_go_ctx(
        &self,
        b: &Builder<'a, 'ctx>,
        args: &[Expr<'ctx>],
    ) -> Result<(inkwell::values::PointerValue<'ctx>, inkwell::types::StructType<'ctx>), String>
    {
        let fields: Vec<inkwell::types::BasicTypeEnum<'ctx>> =
            args.iter().map(|a| a.val.get_type()).collect();
        let ctx_struct = self.prog.context().struct_type(&fields, false);
        let size = self.prog.size_of(&ctx_struct.into());
        let alloc = runtime_fn(self.prog, self.pkg.module(), RtFn::AllocZ);
        let cell = b
            .call_raw(alloc, &[self.prog.int_type().const_int(size, false).into()])?
            .ok_or("AllocZ returned void")?
            .into_pointer_value();
        for (i, a) in args.iter().enumerate() {
            let slot = b
                .raw()
                .build_struct_gep(ctx_struct, cell, i as u32, "")
                .map_err(|e| e.to_string())?;
            b.raw().build_store(slot, a.val).map_err(|e| e.to_string())?;
        }
        Ok((cell, ctx_struct))
    }

    // ── Builtins ─────────────────────────────────────────────────────

    fn lower_builtin(
        &mut self,
        b: &Builder<'a, 'ctx>,
        bc: &mut BodyCtx<'a, 'ctx>,
        kind: CallKind,
        builtin: Builtin,
        args: &[Value],
        result_ty: &GoType,
    ) -> Result<Option<Expr<'ctx>>, String> {
        match builtin {
            Builtin::Println | Builtin::Print => {
                let rt = if matches!(builtin, Builtin::Println) {
                    RtFn::Println
                } else {
                    RtFn::Print
                };
                let f = runtime_fn(self.prog, self.pkg.module(), rt);
                let mut boxed: Vec<Option<Expr<'ctx>>> = Vec::with_capacity(args.len());
                for a in args {
                    let v = self.compile_value(b, bc, a)?;
                    let any = if v.ty.is_interface(self.prog.type_env()) {
                        v
                    } else {
                        let ty = v.ty.clone();
                        b.make_interface(&GoType::any(), &ty, &v)?
                    };
                    boxed.push(Some(any));
                }
                let slice = self.pack_any_slice(b, &boxed)?;
                match kind {
                    CallKind::Call => {
                        b.call_raw(f, &[slice.val.into()])?;
                        Ok(None)
                    }
                    CallKind::Defer => {
                        b.add_defer(DeferTarget::Runtime(f), vec![slice], true)?;
                        Ok(None)
                    }
                    CallKind::Go => {
                        let print_sig = Signature {
                            recv: None,
                            params: vec![Param {
                                name: symbols::NAME_VALIST.into(),
                                ty: GoType::slice(GoType::any()),
                            }],
                            results: vec![],
                            variadic: true,
                        };
                        let sym = format!(
                            "{}.{}",
                            self.prog.runtime_pkg(),
                            if matches!(builtin, Builtin::Println) { "Println" } else { "Print" }
                        );
                        let fnv = self
                            .pkg
                            .new_func(self.prog, &sym, print_sig, Background::InGo, false)?;
                        self.lower_go_direct(b, bc, &fnv, &[slice])?;
                        Ok(None)
                    }
                }
            }
            _ if kind != CallKind::Call => {
                Err(format!("cannot defer or spawn builtin {builtin:?}"))
            }
            Builtin::Len | Builtin::Cap => {
                let x = self.compile_value(b, bc, &args[0])?;
                let env = self.prog.type_env();
                let int = GoType::Basic(BasicKind::Int);
                let v = match (builtin, x.ty.underlying(env).clone()) {
                    (Builtin::Len, GoType::Basic(BasicKind::Str)) => b.extract_field(&x, 1, &int)?,
                    (Builtin::Len, GoType::Slice(_)) => b.extract_field(&x, 1, &int)?,
                    (Builtin::Cap, GoType::Slice(_)) => b.extract_field(&x, 2, &int)?,
                    (_, GoType::Array { len, .. }) => b.const_int(len as i64, &int, Background::InGo)?,
                    (Builtin::Len, GoType::Map { .. }) => {
                        let f = runtime_fn(self.prog, self.pkg.module(), RtFn::MapLen);
                        let r = b
                            .call_raw(f, &[x.val.into()])?
                            .ok_or("MapLen returned void")?;
                        Expr::new(r, int.clone())
                    }
                    (_, other) => {
                        return Err(format!("{builtin:?} of {}", other.key()));
                    }
                };
                Ok(Some(v))
            }
            Builtin::Append => {
                let dst = self.compile_value(b, bc, &args[0])?;
                let src = match &args[1] {
                    Value::Reg(r) if bc.varg_slice.contains_key(r) => {
                        let alloc = bc.varg_slice[r];
                        self.pack_vararg_slice(b, bc, alloc)?
                    }
                    v => self.compile_value(b, bc, v)?,
                };
                let elem = match dst.ty.underlying(self.prog.type_env()) {
                    GoType::Slice(e) => (**e).clone(),
                    other => return Err(format!("append to {}", other.key())),
                };
                let elem_lowered = self.prog.llvm_type(&elem, Background::InGo)?;
                let elem_size = self
                    .prog
                    .int_type()
                    .const_int(self.prog.size_of(&elem_lowered), false);
                let f = runtime_fn(self.prog, self.pkg.module(), RtFn::Append);
                let r = b
                    .call_raw(f, &[dst.val.into(), src.val.into(), elem_size.into()])?
                    .ok_or("Append returned void")?;
                Ok(Some(Expr::new(r, dst.ty)))
            }
            Builtin::Copy => {
                let dst = self.compile_value(b, bc, &args[0])?;
                let src = self.compile_value(b, bc, &args[1])?;
                let elem = match dst.ty.underlying(self.prog.type_env()) {
                    GoType::Slice(e) => (**e).clone(),
                    other => return Err(format!("copy to {}", other.key())),
                };
                let elem_lowered = self.prog.llvm_type(&elem, Background::InGo)?;
                let elem_size = self
                    .prog
                    .int_type()
                    .const_int(self.prog.size_of(&elem_lowered), false);
                let f = runtime_fn(self.prog, self.pkg.module(), RtFn::SliceCopy);
                let r = b
                    .call_raw(f, &[dst.val.into(), src.val.into(), elem_size.into()])?
                    .ok_or("SliceCopy returned void")?;
                Ok(Some(Expr::new(r, GoType::Basic(BasicKind::Int))))
            }
            Builtin::Recover => {
                let f = runtime_fn(self.prog, self.pkg.module(), RtFn::Recover);
                let r = b.call_raw(f, &[])?.ok_or("Recover returned void")?;
                let ty = match result_ty {
                    GoType::Tuple(elems) if elems.len() == 1 => elems[0].clone(),
                    other => other.clone(),
                };
                Ok(Some(Expr::new(r, ty)))
            }
        }
    }

    // ── Compiler intrinsics (`llgo:instr`) ───────────────────────────

    fn lower_llgo_instr(
        &mut self,
        b: &Builder<'a, 'ctx>,
        bc: &mut BodyCtx<'a, 'ctx>,
        fref: &FuncRef,
        args: &[Value],
    ) -> Result<Option<Expr<'ctx>>, String> {
        let ctx = self.prog.context();
        let name = fref.intrinsic.as_deref().unwrap_or_default();
        match name {
            "cstr" => match args.first() {
                Some(Value::Const(Const::Str(s))) => {
                    Ok(Some(b.const_string(s, Background::InC)?))
                }
                _ => Err("cstr requires a constant string literal".into()),
            },
            "advance" => {
                let p = self.compile_value(b, bc, &args[0])?;
                let n = self.compile_value(b, bc, &args[1])?;
                let elem = Program::elem(&p.ty)?.clone();
                let elem_lowered = self.prog.llvm_type(&elem, Background::InGo)?;
                let gep = unsafe {
                    b.raw()
                        .build_in_bounds_gep(elem_lowered, p.ptr_val(), &[n.int_val()], "")
                }
                .map_err(|e| e.to_string())?;
                Ok(Some(Expr::new(gep, p.ty)))
            }
            "index" => {
                let p = self.compile_value(b, bc, &args[0])?;
                let n = self.compile_value(b, bc, &args[1])?;
                let elem = Program::elem(&p.ty)?.clone();
                let elem_lowered = self.prog.llvm_type(&elem, Background::InGo)?;
                let gep = unsafe {
                    b.raw()
                        .build_in_bounds_gep(elem_lowered, p.ptr_val(), &[n.int_val()], "")
                }
                .map_err(|e| e.to_string())?;
                let v = b
                    .raw()
                    .build_load(elem_lowered, gep, "")
                    .map_err(|e| e.to_string())?;
                Ok(Some(Expr::new(v, elem)))
            }
            "alloca" => {
                let n = self.compile_value(b, bc, &args[0])?;
                let p = b
                    .raw()
                    .build_array_alloca(ctx.i8_type(), n.int_val(), "")
                    .map_err(|e| e.to_string())?;
                Ok(Some(Expr::new(p, GoType::Basic(BasicKind::UnsafePointer))))
            }
            "allocaCStr" => {
                let s = self.compile_value(b, bc, &args[0])?;
                let data = b.extract_field(&s, 0, &GoType::Basic(BasicKind::UnsafePointer))?;
                let len = b.extract_field(&s, 1, &GoType::Basic(BasicKind::Int))?;
                let one = self.prog.int_type().const_int(1, false);
                let size = b
                    .raw()
                    .build_int_add(len.int_val(), one, "")
                    .map_err(|e| e.to_string())?;
                let buf = b
                    .raw()
                    .build_array_alloca(ctx.i8_type(), size, "")
                    .map_err(|e| e.to_string())?;
                b.raw()
                    .build_memcpy(buf, 1, data.ptr_val(), 1, len.int_val())
                    .map_err(|e| e.to_string())?;
                let end = unsafe {
                    b.raw()
                        .build_in_bounds_gep(ctx.i8_type(), buf, &[len.int_val()], "")
                }
                .map_err(|e| e.to_string())?;
                b.raw()
                    .build_store(end, ctx.i8_type().const_zero())
                    .map_err(|e| e.to_string())?;
                Ok(Some(Expr::new(buf, GoType::Basic(BasicKind::Str))))
            }
            "stringData" => {
                let s = self.compile_value(b, bc, &args[0])?;
                Ok(Some(b.extract_field(&s, 0, &GoType::Basic(BasicKind::UnsafePointer))?))
            }
            "pyList" => {
                let list = py_fn(self.prog, self.pkg.module(), PyFn::List);
                let mut meta: Vec<BasicMetadataValueEnum<'ctx>> = Vec::with_capacity(args.len() + 1);
                meta.push(self.prog.int_type().const_int(args.len() as u64, false).into());
                for a in args {
                    meta.push(self.compile_value(b, bc, a)?.val.into());
                }
                let r = b.call_raw(list, &meta)?.ok_or("py.List returned void")?;
                Ok(Some(Expr::new(r, GoType::Basic(BasicKind::UnsafePointer))))
            }
            "unreachable" => {
                b.unreachable()?;
                Ok(None)
            }
            "funcAddr" => {
                let target = match &args[0] {
                    Value::Func(fr) => self.resolve_func_ref(fr)?,
                    Value::Reg(r) => match bc.defs.get(r) {
                        Some(Instr::MakeInterface { x: Value::Func(fr), .. }) => {
                            self.resolve_func_ref(fr)?
                        }
                        _ => return Err("funcAddr requires a direct function reference".into()),
                    },
                    _ => return Err("funcAddr requires a direct function reference".into()),
                };
                Ok(Some(Expr::new(
                    target.val.as_global_value().as_pointer_value(),
                    GoType::Basic(BasicKind::UnsafePointer),
                )))
            }
            other => Err(format!("unknown llgo instruction: {other}")),
        }
    }
}

/// Emission order of a function's blocks: the successor table the body
/// walk follows.
///
/// The order is reverse post-order over the CFG, which puts every block
/// after its forward-edge predecessors: register definitions land ahead
/// of their cross-block uses and defer sites ahead of the run-defers
/// sites they feed, whatever order the frontend declared the blocks in.
/// The recover block runs after every normal block; blocks unreachable
/// from the entry keep declaration order at the tail.
struct BlockInfo {
    next: Option<usize>,
}

fn block_infos(f: &SsaFunction) -> Vec<BlockInfo> {
    let n = f.blocks.len();
    let recover = f
        .recover_block
        .map(|r| r as usize)
        .filter(|r| *r != 0 && *r < n);

    let mut visited = vec![false; n];
    // Keep the recover block (and everything only it reaches) out of the
    // main traversal; it forms its own trailing segment.
    if let Some(r) = recover {
        visited[r] = true;
    }
    let mut order: Vec<usize> = Vec::with_capacity(n);
    append_rpo(f, 0, &mut visited, &mut order);
    if let Some(r) = recover {
        visited[r] = false;
        append_rpo(f, r, &mut visited, &mut order);
    }
    for i in 0..n {
        append_rpo(f, i, &mut visited, &mut order);
    }

    let mut infos: Vec<BlockInfo> = (0..n).map(|_| BlockInfo { next: None }).collect();
    for pair in order.windows(2) {
        infos[pair[0]].next = Some(pair[1]);
    }
    infos
}

/// Append the reverse post-order of the subgraph reachable from `start`
/// (skipping blocks already visited) to `order`.
fn append_rpo(f: &SsaFunction, start: usize, visited: &mut [bool], order: &mut Vec<usize>) {
    let n = f.blocks.len();
    if start >= n || visited[start] {
        return;
    }
    let mut post: Vec<usize> = Vec::new();
    let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
    visited[start] = true;
    while let Some(top) = stack.len().checked_sub(1) {
        let (blk, step) = stack[top];
        let succs = &f.blocks[blk].succs;
        if step < succs.len() {
            stack[top].1 += 1;
            // Successors are explored last-to-first so the reversed
            // post-order lists them first-to-last.
            let s = succs[succs.len() - 1 - step] as usize;
            if s < n && !visited[s] {
                visited[s] = true;
                stack.push((s, 0));
            }
        } else {
            post.push(blk);
            stack.pop();
        }
    }
    order.extend(post.into_iter().rev());
}

/// `func main(argc int32, argv **int8) int32`: the C entry signature
/// every user `main` is rewritten to.
fn c_main_signature() -> Signature {
    Signature {
        recv: None,
        params: vec![
            Param {
                name: "argc".into(),
                ty: GoType::Basic(BasicKind::Int32),
            },
            Param {
                name: "argv".into(),
                ty: GoType::pointer(GoType::pointer(GoType::Basic(BasicKind::Uint8))),
            },
        ],
        results: vec![GoType::Basic(BasicKind::Int32)],
        variadic: false,
    }
}

fn bare_method_name(mangled: &str) -> String {
    match mangled.rfind(')') {
        Some(pos) => mangled[pos + 1..].trim_start_matches('.').to_string(),
        None => mangled.to_string(),
    }
}

fn const_index(v: &Value) -> Result<u64, String> {
    match v {
        Value::Const(Const::Int { value, .. }) => Ok(*value as u64),
        _ => Err("variadic element index is not a constant".into()),
    }
}

fn instr_uses_reg(ins: &Instr, reg: RegId) -> bool {
    let mut used = false;
    visit_values(ins, &mut |v| {
        if matches!(v, Value::Reg(r) if *r == reg) {
            used = true;
        }
    });
    used
}

fn visit_values(ins: &Instr, f: &mut dyn FnMut(&Value)) {
    let mut call_values = |c: &CallInstr, f: &mut dyn FnMut(&Value)| {
        if let Callee::Value(v) = &c.callee {
            f(v);
        }
        if let Callee::Invoke { iface, .. } = &c.callee {
            f(iface);
        }
        for a in &c.args {
            f(a);
        }
    };
    match ins {
        Instr::BinOp { x, y, .. } => {
            f(x);
            f(y);
        }
        Instr::UnOp { x, .. }
        | Instr::FieldAddr { x, .. }
        | Instr::Field { x, .. }
        | Instr::MakeInterface { x, .. }
        | Instr::TypeAssert { x, .. }
        | Instr::ChangeType { x, .. }
        | Instr::Convert { x, .. }
        | Instr::ChangeInterface { x, .. }
        | Instr::Range { x, .. }
        | Instr::Panic { x } => f(x),
        Instr::Alloc { .. } | Instr::Jump | Instr::RunDefers | Instr::Phi { .. } => {}
        Instr::IndexAddr { x, index, .. } | Instr::Index { x, index, .. } => {
            f(x);
            f(index);
        }
        Instr::Slice { x, low, high, max, .. } => {
            f(x);
            if let Some(v) = low {
                f(v);
            }
            if let Some(v) = high {
                f(v);
            }
            if let Some(v) = max {
                f(v);
            }
        }
        Instr::Lookup { x, index, .. } => {
            f(x);
            f(index);
        }
        Instr::MakeSlice { len, cap, .. } => {
            f(len);
            if let Some(v) = cap {
                f(v);
            }
        }
        Instr::MakeMap { reserve, .. } => {
            if let Some(v) = reserve {
                f(v);
            }
        }
        Instr::MakeClosure { bindings, .. } => {
            for v in bindings {
                f(v);
            }
        }
        Instr::Next { iter, .. } => f(iter),
        Instr::Extract { tuple, .. } => f(tuple),
        Instr::Call(c) | Instr::Defer(c) | Instr::Go(c) => call_values(c, f),
        Instr::Store { addr, val } => {
            f(addr);
            f(val);
        }
        Instr::MapUpdate { map, key, value } => {
            f(map);
            f(key);
            f(value);
        }
        Instr::Send { chan, x } => {
            f(chan);
            f(x);
        }
        Instr::If { cond } => f(cond),
        Instr::Return { results } => {
            for v in results {
                f(v);
            }
        }
    }
}
