//! The late method-binding pass.
//!
//! After every package has emitted bitcode, this pass links the bitcode
//! into one scratch module, enumerates the weak invoke thunks
//! (`__llgo_invoke.<iface>$m<idx>.<tag>`), discovers which concrete types
//! implement each interface, and synthesizes strong replacement thunks
//! that dispatch through a chain of direct-call comparisons before falling
//! back to the itab's function pointer. The replacements live in a small
//! patch module compiled to one extra object on the link line; the strong
//! symbols override the weak fallback bodies.
//!
//! The pass is an optimization, never a soundness requirement: every
//! degradation (unparsable bitcode, failed link) downgrades to a warning
//! and the weak thunks' indirect dispatch carries the program.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use inkwell::context::Context;
use inkwell::module::{Linkage, Module};
use inkwell::passes::PassBuilderOptions;
use inkwell::targets::TargetMachine;
use inkwell::types::BasicType;
use inkwell::values::{BasicMetadataValueEnum, BasicValueEnum, FunctionValue};
use inkwell::{AddressSpace, IntPredicate};
use rustc_hash::FxHashMap;

use llgo_ssa::method_binding;
use llgo_ssa::symbols::{self, INVOKE_THUNK_PREFIX};

static LATE_BINDING: AtomicBool = AtomicBool::new(false);

/// Toggle the experimental pre-lowering cleanup (global DCE before thunk
/// collection).
pub fn set_late_binding(enabled: bool) {
    LATE_BINDING.store(enabled, Ordering::Relaxed);
}

pub fn late_binding_enabled() -> bool {
    LATE_BINDING.load(Ordering::Relaxed)
}

/// Whether the pass is requested via `LLGO_INVOKE_LOWERING`.
pub fn enabled_by_env() -> bool {
    matches!(
        std::env::var("LLGO_INVOKE_LOWERING")
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "on" | "yes"
    )
}

/// One concrete dispatch target of a thunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThunkTarget {
    pub type_symbol: String,
    pub ifn_symbol: String,
}

/// The rewrite plan for one invoke thunk.
#[derive(Debug, Clone)]
pub struct ThunkPlan {
    pub thunk_name: String,
    pub method_index: usize,
    pub targets: Vec<ThunkTarget>,
}

struct TypeMethods {
    type_symbol: String,
    /// method key (`name \x00 methodTypeSymbol`) -> IFn symbol.
    methods: FxHashMap<String, String>,
}

/// Parse and link all per-package bitcode, then build the patch module.
/// Returns `None` (after a `warning:` line) whenever the pass has nothing
/// to do or must disable itself.
pub fn build_patch_module<'ctx>(
    ctx: &'ctx Context,
    tm: &TargetMachine,
    bitcode_files: &[std::path::PathBuf],
    verbose: bool,
) -> Result<Option<(Module<'ctx>, usize)>, String> {
    if bitcode_files.is_empty() {
        return Ok(None);
    }
    let mut files: Vec<&Path> = bitcode_files.iter().map(|p| p.as_path()).collect();
    files.sort();

    let mut merged: Option<Module<'ctx>> = None;
    for file in files {
        let module = match Module::parse_bitcode_from_path(file, ctx) {
            Ok(m) => m,
            Err(e) => {
                // Best-effort: a module that fails the bitcode round-trip
                // must not block normal linking.
                eprintln!(
                    "warning: invoke-lowering skip invalid bitcode {}: {e}",
                    file.display()
                );
                continue;
            }
        };
        match merged.take() {
            None => merged = Some(module),
            Some(acc) => {
                if let Err(e) = acc.link_in_module(module) {
                    eprintln!(
                        "warning: invoke-lowering disable pass, link bitcode {} failed: {e}",
                        file.display()
                    );
                    return Ok(None);
                }
                merged = Some(acc);
            }
        }
    }
    let Some(merged) = merged else { return Ok(None) };

    if late_binding_enabled() {
        merged
            .run_passes("globaldce", tm, PassBuilderOptions::create())
            .map_err(|e| format!("run invoke pre-lowering passes failed: {e}"))?;
    }

    let plans = collect_thunk_plans(&merged);
    if plans.is_empty() {
        return Ok(None);
    }

    let (patch, patched) = emit_patch_module(ctx, tm, &merged, &plans)?;
    if patched == 0 {
        return Ok(None);
    }
    if verbose {
        eprintln!(
            "invoke-lowering: linked {} bc files, generated {patched} invoke thunks",
            bitcode_files.len()
        );
    }
    Ok(Some((patch, patched)))
}

/// Enumerate invoke thunks and compute their dispatch targets.
pub fn collect_thunk_plans(module: &Module<'_>) -> Vec<ThunkPlan> {
    let types = collect_concrete_type_methods(module);
    if types.is_empty() {
        return Vec::new();
    }

    let mut iface_cache: FxHashMap<String, Vec<String>> = FxHashMap::default();
    let mut plans = Vec::new();

    let mut func = module.get_first_function();
    while let Some(f) = func {
        func = f.get_next_function();
        let thunk_name = f.get_name().to_string_lossy().into_owned();
        if !thunk_name.starts_with(INVOKE_THUNK_PREFIX) {
            continue;
        }
        let Some((iface_sym, method_idx)) = symbols::parse_invoke_thunk_name(&thunk_name) else {
            continue;
        };
        let method_idx = method_idx as usize;

        let iface_methods = iface_cache
            .entry(iface_sym.to_string())
            .or_insert_with(|| parse_interface_methods(module, iface_sym));
        if iface_methods.is_empty() || method_idx >= iface_methods.len() {
            continue;
        }
        let target_key = iface_methods[method_idx].clone();

        let mut targets = Vec::new();
        for ty in &types {
            if !type_implements(&ty.methods, iface_methods) {
                continue;
            }
            if let Some(ifn) = ty.methods.get(&target_key) {
                targets.push(ThunkTarget {
                    type_symbol: ty.type_symbol.clone(),
                    ifn_symbol: ifn.clone(),
                });
            }
        }
        let targets = dedup_targets(targets);
        if targets.is_empty() {
            continue;
        }
        plans.push(ThunkPlan {
            thunk_name,
            method_index: method_idx,
            targets,
        });
    }
    plans
}

/// Sort targets lexicographically and drop duplicate
/// `(typeSymbol, ifnSymbol)` pairs.
pub fn dedup_targets(mut targets: Vec<ThunkTarget>) -> Vec<ThunkTarget> {
    if targets.len() < 2 {
        return targets;
    }
    targets.sort_by(|a, b| {
        a.type_symbol
            .cmp(&b.type_symbol)
            .then_with(|| a.ifn_symbol.cmp(&b.ifn_symbol))
    });
    targets.dedup();
    targets
}

fn type_implements(type_methods: &FxHashMap<String, String>, iface_methods: &[String]) -> bool {
    iface_methods.iter().all(|key| type_methods.contains_key(key))
}

fn method_key(name: &str, type_sym: &str) -> String {
    format!("{name}\u{0}{type_sym}")
}

// ── Interface descriptors ────────────────────────────────────────────

/// Recover the ordered method keys of an interface from its descriptor
/// global: field 2 is `{methods ptr, len, cap}`, the methods global a
/// constant struct of `{name, methodType}` entries.
fn parse_interface_methods(module: &Module<'_>, iface_sym: &str) -> Vec<String> {
    let Some(global) = module.get_global(iface_sym) else {
        return Vec::new();
    };
    let Some(BasicValueEnum::StructValue(init)) = global.get_initializer() else {
        return Vec::new();
    };
    if init.count_fields() < 3 {
        return Vec::new();
    }
    let Some(BasicValueEnum::StructValue(method_slice)) = init.get_field_at_index(2) else {
        return Vec::new();
    };
    if method_slice.count_fields() < 3 {
        return Vec::new();
    }
    let Some(array_sym) = value_symbol(method_slice.get_field_at_index(0)) else {
        return Vec::new();
    };
    let Some(array_global) = module.get_global(&array_sym) else {
        return Vec::new();
    };
    let Some(BasicValueEnum::StructValue(entries)) = array_global.get_initializer() else {
        return Vec::new();
    };

    let declared = const_int_value(method_slice.get_field_at_index(1)).unwrap_or(0) as u32;
    let n = declared.min(entries.count_fields());
    let mut out = Vec::with_capacity(n as usize);
    for i in 0..n {
        let Some(BasicValueEnum::StructValue(entry)) = entries.get_field_at_index(i) else {
            continue;
        };
        if entry.count_fields() < 2 {
            continue;
        }
        let Some(name) = decode_string_literal(module, entry.get_field_at_index(0)) else {
            continue;
        };
        let Some(type_sym) = value_symbol(entry.get_field_at_index(1)) else {
            continue;
        };
        out.push(method_key(&name, &type_sym));
    }
    out
}

// ── Concrete-type method tables ──────────────────────────────────────

/// Two sources, for robustness: function-level method-binding attributes
/// first, the runtime's abi method-table globals as fallback.
fn collect_concrete_type_methods(module: &Module<'_>) -> Vec<TypeMethods> {
    let from_attrs = collect_from_attrs(module);
    if !from_attrs.is_empty() {
        return from_attrs;
    }
    collect_from_abi_tables(module)
}

fn collect_from_attrs(module: &Module<'_>) -> Vec<TypeMethods> {
    use inkwell::attributes::AttributeLoc;

    let mut types: FxHashMap<String, FxHashMap<String, String>> = FxHashMap::default();
    let mut func = module.get_first_function();
    while let Some(f) = func {
        func = f.get_next_function();
        let name = f.get_name().to_string_lossy().into_owned();
        if name.is_empty() {
            continue;
        }
        let Some(attr) = f.get_string_attribute(AttributeLoc::Function, method_binding::ATTR_IFN)
        else {
            continue;
        };
        let value = attr.get_string_value().to_string_lossy().into_owned();
        for entry in method_binding::decode_attr_value(&value) {
            types
                .entry(entry.type_symbol)
                .or_default()
                .insert(method_key(&entry.method_name, &entry.method_type_symbol), name.clone());
        }
    }
    into_sorted_type_methods(types)
}

fn collect_from_abi_tables(module: &Module<'_>) -> Vec<TypeMethods> {
    let mut types: FxHashMap<String, FxHashMap<String, String>> = FxHashMap::default();
    let mut global = module.get_first_global();
    while let Some(g) = global {
        global = g.get_next_global();
        let name = g.get_name().to_string_lossy().into_owned();
        if name.is_empty() {
            continue;
        }
        let Some(BasicValueEnum::StructValue(init)) = g.get_initializer() else {
            continue;
        };
        if init.count_fields() < 3 {
            continue;
        }
        let Some(BasicValueEnum::StructValue(uncommon)) = init.get_field_at_index(1) else {
            continue;
        };
        if uncommon.count_fields() < 2 {
            continue;
        }
        let mcount = const_int_value(uncommon.get_field_at_index(1)).unwrap_or(0) as u32;
        if mcount == 0 {
            continue;
        }
        let Some(BasicValueEnum::StructValue(entries)) = init.get_field_at_index(2) else {
            continue;
        };
        let n = mcount.min(entries.count_fields());
        let mut methods = FxHashMap::default();
        for i in 0..n {
            let Some(BasicValueEnum::StructValue(entry)) = entries.get_field_at_index(i) else {
                continue;
            };
            if entry.count_fields() < 4 {
                continue;
            }
            let Some(mname) = decode_string_literal(module, entry.get_field_at_index(0)) else {
                continue;
            };
            let Some(type_sym) = value_symbol(entry.get_field_at_index(1)) else {
                continue;
            };
            let Some(ifn_sym) = value_symbol(entry.get_field_at_index(2)) else {
                continue;
            };
            methods.insert(method_key(&mname, &type_sym), ifn_sym);
        }
        if methods.is_empty() {
            continue;
        }
        types.insert(name, methods);
    }
    into_sorted_type_methods(types)
}

fn into_sorted_type_methods(
    types: FxHashMap<String, FxHashMap<String, String>>,
) -> Vec<TypeMethods> {
    let mut names: Vec<String> = types.keys().cloned().collect();
    names.sort();
    names
        .into_iter()
        .map(|type_symbol| {
            let methods = types[&type_symbol].clone();
            TypeMethods { type_symbol, methods }
        })
        .collect()
}

// ── Patch module emission ────────────────────────────────────────────

fn emit_patch_module<'ctx>(
    ctx: &'ctx Context,
    tm: &TargetMachine,
    src: &Module<'_>,
    plans: &[ThunkPlan],
) -> Result<(Module<'ctx>, usize), String> {
    let patch = ctx.create_module("llgo.invoke.lowering");
    patch.set_triple(&tm.get_triple());
    patch.set_data_layout(&tm.get_target_data().get_data_layout());

    let mut patched = 0usize;
    for plan in plans {
        if emit_thunk(ctx, src, &patch, plan)? {
            patched += 1;
        }
    }
    Ok((patch, patched))
}

/// Synthesize one strong thunk: a linear `icmp` chain over the dynamic
/// type against every known implementor, with the itab-slot indirect call
/// preserved as the final fallback (types loaded or reflected at run time
/// stay correct).
fn emit_thunk<'ctx>(
    ctx: &'ctx Context,
    src: &Module<'_>,
    patch: &Module<'ctx>,
    plan: &ThunkPlan,
) -> Result<bool, String> {
    let Some(src_thunk) = src.get_function(&plan.thunk_name) else {
        return Ok(false);
    };
    let src_ty = src_thunk.get_type();
    let param_types = src_ty.get_param_types();
    if param_types.is_empty() {
        return Ok(false);
    }

    // Rebuild the function type inside the patch context.
    let thunk_ty = match src_ty.get_return_type() {
        Some(ret) => ret.fn_type(&param_types, src_ty.is_var_arg()),
        None => ctx.void_type().fn_type(&param_types, src_ty.is_var_arg()),
    };
    let thunk = patch.add_function(&plan.thunk_name, thunk_ty, Some(Linkage::External));

    let b = ctx.create_builder();
    let entry = ctx.append_basic_block(thunk, "entry");
    let fallback = ctx.append_basic_block(thunk, "fallback");

    let ptr_ty = ctx.ptr_type(AddressSpace::default());
    let i64_ty = ctx.i64_type();
    let params = thunk.get_params();
    let iface_param = params[0];

    b.position_at_end(entry);
    let iface_ptr_data = ensure_function(patch, &symbols::iface_ptr_data(), {
        ptr_ty.fn_type(&[iface_param.get_type().into()], false)
    });
    let receiver = b
        .build_call(iface_ptr_data, &[iface_param.into()], "receiver")
        .map_err(|e| e.to_string())?
        .try_as_basic_value()
        .basic()
        .ok_or("IfacePtrData returned void")?
        .into_pointer_value();

    let itab = b
        .build_extract_value(iface_param.into_struct_value(), 0, "itab")
        .map_err(|e| e.to_string())?
        .into_pointer_value();
    let actual_type_ptr = unsafe {
        b.build_in_bounds_gep(ptr_ty, itab, &[i64_ty.const_int(1, false)], "actualType.ptr")
    }
    .map_err(|e| e.to_string())?;
    let actual_type = b
        .build_load(ptr_ty, actual_type_ptr, "actualType")
        .map_err(|e| e.to_string())?
        .into_pointer_value();

    // The concrete methods take the receiver data pointer in place of the
    // interface pair.
    let mut callee_params: Vec<inkwell::types::BasicMetadataTypeEnum<'ctx>> =
        vec![ptr_ty.into()];
    callee_params.extend(param_types.iter().skip(1).cloned());
    let callee_ty = match src_ty.get_return_type() {
        Some(ret) => ret.fn_type(&callee_params, src_ty.is_var_arg()),
        None => ctx.void_type().fn_type(&callee_params, src_ty.is_var_arg()),
    };
    let mut call_args: Vec<BasicMetadataValueEnum<'ctx>> = vec![receiver.into()];
    for p in params.iter().skip(1) {
        call_args.push((*p).into());
    }

    let mut dispatch = entry;
    for (i, target) in plan.targets.iter().enumerate() {
        b.position_at_end(dispatch);
        let matched = ctx.append_basic_block(thunk, &format!("type.{i}"));
        let miss = if i + 1 < plan.targets.len() {
            ctx.append_basic_block(thunk, &format!("type.next.{i}"))
        } else {
            fallback
        };

        let Some(type_global) = ensure_type_symbol(patch, src, &target.type_symbol) else {
            // Symbol collides with a function; skip the arm but keep the
            // chain intact.
            b.build_unconditional_branch(miss).map_err(|e| e.to_string())?;
            dispatch = miss;
            continue;
        };
        let cmp = b
            .build_int_compare(IntPredicate::EQ, actual_type, type_global, "")
            .map_err(|e| e.to_string())?;
        b.build_conditional_branch(cmp, matched, miss)
            .map_err(|e| e.to_string())?;

        b.position_at_end(matched);
        let callee = ensure_function(patch, &target.ifn_symbol, callee_ty);
        let ret = b
            .build_call(callee, &call_args, "")
            .map_err(|e| e.to_string())?;
        build_return(&b, ret.try_as_basic_value().basic())?;

        dispatch = miss;
    }

    b.position_at_end(fallback);
    let slot_index = plan.method_index as u64 + 3;
    let fn_ptr_ptr = unsafe {
        b.build_in_bounds_gep(ptr_ty, itab, &[i64_ty.const_int(slot_index, false)], "fn.ptr")
    }
    .map_err(|e| e.to_string())?;
    let fn_ptr = b
        .build_load(ptr_ty, fn_ptr_ptr, "fn")
        .map_err(|e| e.to_string())?
        .into_pointer_value();
    let ret = b
        .build_indirect_call(callee_ty, fn_ptr, &call_args, "")
        .map_err(|e| e.to_string())?;
    build_return(&b, ret.try_as_basic_value().basic())?;
    Ok(true)
}

fn build_return<'ctx>(
    b: &inkwell::builder::Builder<'ctx>,
    ret: Option<BasicValueEnum<'ctx>>,
) -> Result<(), String> {
    match ret {
        Some(v) => b.build_return(Some(&v)).map_err(|e| e.to_string())?,
        None => b.build_return(None).map_err(|e| e.to_string())?,
    };
    Ok(())
}

fn ensure_function<'ctx>(
    module: &Module<'ctx>,
    name: &str,
    ty: inkwell::types::FunctionType<'ctx>,
) -> FunctionValue<'ctx> {
    module
        .get_function(name)
        .unwrap_or_else(|| module.add_function(name, ty, Some(Linkage::External)))
}

/// Declare a type descriptor in the patch module. Returns `None` when the
/// symbol actually names a function in the source module (not a type).
fn ensure_type_symbol<'ctx>(
    patch: &Module<'ctx>,
    src: &Module<'_>,
    name: &str,
) -> Option<inkwell::values::PointerValue<'ctx>> {
    if let Some(existing) = patch.get_global(name) {
        return Some(existing.as_pointer_value());
    }
    if src.get_global(name).is_none() && src.get_function(name).is_some() {
        return None;
    }
    let g = patch.add_global(patch.get_context().i8_type(), None, name);
    g.set_linkage(Linkage::External);
    Some(g.as_pointer_value())
}

// ── Constant decoding ────────────────────────────────────────────────

fn value_symbol(v: Option<BasicValueEnum<'_>>) -> Option<String> {
    let BasicValueEnum::PointerValue(p) = v? else {
        return None;
    };
    if p.is_null() {
        return None;
    }
    let name = p.get_name().to_string_lossy().into_owned();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn const_int_value(v: Option<BasicValueEnum<'_>>) -> Option<u64> {
    match v? {
        BasicValueEnum::IntValue(i) => i.get_zero_extended_constant(),
        _ => None,
    }
}

/// Decode a `{ptr, len}` string constant whose data pointer names a
/// private bytes global.
fn decode_string_literal(module: &Module<'_>, v: Option<BasicValueEnum<'_>>) -> Option<String> {
    let BasicValueEnum::StructValue(s) = v? else {
        return None;
    };
    if s.count_fields() < 2 {
        return None;
    }
    let len = const_int_value(s.get_field_at_index(1))? as usize;
    if len == 0 {
        return Some(String::new());
    }
    let data_sym = value_symbol(s.get_field_at_index(0))?;
    let data_global = module.get_global(&data_sym)?;
    let BasicValueEnum::ArrayValue(bytes) = data_global.get_initializer()? else {
        return None;
    };
    let text = bytes.get_string_constant()?.to_bytes();
    let text = if len < text.len() { &text[..len] } else { text };
    Some(String::from_utf8_lossy(text).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi;
    use crate::program::Program;
    use crate::PackageEmitter;
    use llgo_ssa::{Background, GoType, Signature, TypeEnv};

    #[test]
    fn dedup_sorts_and_drops_duplicates() {
        let targets = vec![
            ThunkTarget { type_symbol: "_llgo_main.Dog".into(), ifn_symbol: "dog".into() },
            ThunkTarget { type_symbol: "_llgo_main.Cat".into(), ifn_symbol: "cat".into() },
            ThunkTarget { type_symbol: "_llgo_main.Dog".into(), ifn_symbol: "dog".into() },
        ];
        let out = dedup_targets(targets);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].type_symbol, "_llgo_main.Cat");
        assert_eq!(out[1].type_symbol, "_llgo_main.Dog");
    }

    #[test]
    fn method_keys_use_nul_separator() {
        assert_eq!(method_key("Sound", "T"), "Sound\u{0}T");
    }

    fn sound_sig() -> Signature {
        Signature {
            recv: None,
            params: vec![],
            results: vec![GoType::Basic(llgo_ssa::BasicKind::Str)],
            variadic: false,
        }
    }

    /// Build a module shaped like the emitter's output: an interface
    /// descriptor, a tagged concrete method, and a weak invoke thunk.
    fn build_source_module<'ctx>(
        prog: &Program<'ctx>,
    ) -> (PackageEmitter<'ctx>, String) {
        let pkg = PackageEmitter::new(prog, "main", "main");
        let sig = sound_sig();
        let mtype_sym = symbols::type_symbol(&GoType::Func(Box::new(sig.clone())));

        abi::define_iface_descriptor(
            prog,
            pkg.module(),
            "_llgo_main.Animal",
            &[("Sound".to_string(), mtype_sym.clone())],
        );

        let dog = pkg
            .new_func(prog, "main.(Dog).Sound$ifn", sig.clone(), Background::InGo, false)
            .unwrap();
        abi::attach_ifn_attr(prog, dog.val, "_llgo_main.Dog", "Sound", &mtype_sym);

        let thunk_name = symbols::invoke_thunk_name("_llgo_main.Animal", 0, &sig);
        let mut thunk_sig = sig;
        thunk_sig.params.insert(
            0,
            llgo_ssa::Param { name: "i".into(), ty: GoType::any() },
        );
        let thunk = pkg
            .new_func(prog, &thunk_name, thunk_sig, Background::InGo, false)
            .unwrap();
        thunk.val.set_linkage(Linkage::WeakAny);
        (pkg, thunk_name)
    }

    #[test]
    fn plans_recover_targets_from_attrs_and_descriptor() {
        let ctx = Context::create();
        let prog = Program::new(&ctx, TypeEnv::new(), None).unwrap();
        let (pkg, thunk_name) = build_source_module(&prog);

        let plans = collect_thunk_plans(pkg.module());
        assert_eq!(plans.len(), 1, "one thunk expected");
        let plan = &plans[0];
        assert_eq!(plan.thunk_name, thunk_name);
        assert_eq!(plan.method_index, 0);
        assert_eq!(plan.targets.len(), 1);
        assert_eq!(plan.targets[0].type_symbol, "_llgo_main.Dog");
        assert_eq!(plan.targets[0].ifn_symbol, "main.(Dog).Sound$ifn");
    }

    #[test]
    fn patch_thunk_has_direct_arm_and_indirect_fallback() {
        let ctx = Context::create();
        let prog = Program::new(&ctx, TypeEnv::new(), None).unwrap();
        let (pkg, _) = build_source_module(&prog);

        let plans = collect_thunk_plans(pkg.module());
        let (patch, patched) =
            emit_patch_module(&ctx, prog.target_machine(), pkg.module(), &plans).unwrap();
        assert_eq!(patched, 1);

        let ir = patch.print_to_string().to_string();
        assert!(ir.contains("__llgo_invoke."), "{ir}");
        assert!(ir.contains("icmp eq"), "direct dispatch arm expected: {ir}");
        assert!(
            ir.contains("main.(Dog).Sound$ifn"),
            "direct call target expected: {ir}"
        );
        assert!(ir.contains("fallback"), "indirect fallback expected: {ir}");
        assert!(
            ir.contains("llgo/runtime.IfacePtrData"),
            "receiver extraction expected: {ir}"
        );
    }

    #[test]
    fn env_toggle_recognizes_truthy_values() {
        std::env::remove_var("LLGO_INVOKE_LOWERING");
        assert!(!enabled_by_env());
        std::env::set_var("LLGO_INVOKE_LOWERING", "on");
        assert!(enabled_by_env());
        std::env::set_var("LLGO_INVOKE_LOWERING", "0");
        assert!(!enabled_by_env());
        std::env::remove_var("LLGO_INVOKE_LOWERING");
    }
}
