//! Runtime type descriptors and method tables.
//!
//! The emitter materializes two global shapes the late method-binding pass
//! parses back out of linked IR:
//!
//! - a **concrete type descriptor** `{ ptr, { ptr, i64 mcount }, { entry* } }`
//!   where each entry is `{ {ptr,int} name, ptr methodType, ptr ifn, ptr tfn }`;
//! - an **interface descriptor** `{ ptr, { ptr, i64 }, { ptr methods, i64 n, i64 n } }`
//!   whose `methods` global is a constant struct of `{ {ptr,int} name, ptr methodType }`
//!   entries.
//!
//! Method arrays are emitted as constant *structs* rather than arrays so
//! both sides decode fields uniformly. Descriptors are defined link-once
//! in every module that needs them; the linker folds the copies.

use inkwell::module::{Linkage, Module};
use inkwell::values::{BasicValueEnum, GlobalValue, PointerValue};
use inkwell::AddressSpace;

use llgo_ssa::method_binding;

use crate::program::Program;

/// One row of a concrete type's method table.
pub struct MethodTableEntry<'ctx> {
    pub name: String,
    pub method_type_symbol: String,
    pub ifn: PointerValue<'ctx>,
    pub tfn: PointerValue<'ctx>,
}

/// Get or create a declaration-only global for a type symbol. Used when a
/// module references a descriptor it does not define.
pub fn declare_type_global<'ctx>(
    prog: &Program<'ctx>,
    module: &Module<'ctx>,
    sym: &str,
) -> GlobalValue<'ctx> {
    if let Some(existing) = module.get_global(sym) {
        return existing;
    }
    let g = module.add_global(prog.context().i8_type(), None, sym);
    g.set_linkage(Linkage::External);
    g
}

/// A Go string constant `{ptr, len}` backed by a private byte global.
pub fn const_go_string<'ctx>(
    prog: &Program<'ctx>,
    module: &Module<'ctx>,
    text: &str,
    name_hint: &str,
) -> BasicValueEnum<'ctx> {
    let ctx = prog.context();
    // NUL-terminated so the late pass can decode it as a C string; the
    // recorded length excludes the terminator.
    let bytes = ctx.const_string(text.as_bytes(), true);
    let data = module.add_global(bytes.get_type(), None, name_hint);
    data.set_linkage(Linkage::Private);
    data.set_constant(true);
    data.set_initializer(&bytes);
    prog.string_type()
        .const_named_struct(&[
            data.as_pointer_value().into(),
            prog.int_type().const_int(text.len() as u64, false).into(),
        ])
        .into()
}

/// Define the descriptor for a concrete type with the given method table.
/// Idempotent per module; re-definition requests return the first global.
pub fn define_type_descriptor<'ctx>(
    prog: &Program<'ctx>,
    module: &Module<'ctx>,
    sym: &str,
    methods: &[MethodTableEntry<'ctx>],
) -> GlobalValue<'ctx> {
    // A symbol already present (even declaration-only) wins: the defining
    // module ran first, or another module owns the definition.
    if let Some(existing) = module.get_global(sym) {
        return existing;
    }
    let ctx = prog.context();
    let ptr = ctx.ptr_type(AddressSpace::default());
    let i64_ty = ctx.i64_type();

    let mut entries: Vec<BasicValueEnum<'ctx>> = Vec::with_capacity(methods.len());
    for (i, m) in methods.iter().enumerate() {
        let name = const_go_string(prog, module, &m.name, &format!("{sym}$name{i}"));
        let mtype = declare_type_global(prog, module, &m.method_type_symbol);
        let entry = ctx.const_struct(
            &[
                name,
                mtype.as_pointer_value().into(),
                m.ifn.into(),
                m.tfn.into(),
            ],
            false,
        );
        entries.push(entry.into());
    }
    let method_block = ctx.const_struct(&entries, false);
    let uncommon = ctx.const_struct(
        &[
            ptr.const_null().into(),
            i64_ty.const_int(methods.len() as u64, false).into(),
        ],
        false,
    );
    let init = ctx.const_struct(&[ptr.const_null().into(), uncommon.into(), method_block.into()], false);

    let g = module.add_global(init.get_type(), None, sym);
    g.set_linkage(Linkage::LinkOnceODR);
    g.set_constant(true);
    g.set_initializer(&init);
    g
}

/// Define the descriptor for an interface type: the ordered method list
/// the invoke thunk indexes into.
pub fn define_iface_descriptor<'ctx>(
    prog: &Program<'ctx>,
    module: &Module<'ctx>,
    sym: &str,
    methods: &[(String, String)],
) -> GlobalValue<'ctx> {
    if let Some(existing) = module.get_global(sym) {
        return existing;
    }
    let ctx = prog.context();
    let ptr = ctx.ptr_type(AddressSpace::default());
    let i64_ty = ctx.i64_type();

    let mut entries: Vec<BasicValueEnum<'ctx>> = Vec::with_capacity(methods.len());
    for (i, (name, mtype_sym)) in methods.iter().enumerate() {
        let name_val = const_go_string(prog, module, name, &format!("{sym}$mname{i}"));
        let mtype = declare_type_global(prog, module, mtype_sym);
        entries.push(
            ctx.const_struct(&[name_val, mtype.as_pointer_value().into()], false)
                .into(),
        );
    }
    let methods_init = ctx.const_struct(&entries, false);
    let methods_name = format!("{sym}$methods");
    let methods_global = match module.get_global(&methods_name) {
        Some(existing) => existing,
        None => {
            let g = module.add_global(methods_init.get_type(), None, &methods_name);
            g.set_linkage(Linkage::LinkOnceODR);
            g.set_constant(true);
            g.set_initializer(&methods_init);
            g
        }
    };

    let n = i64_ty.const_int(methods.len() as u64, false);
    let method_slice = ctx.const_struct(
        &[methods_global.as_pointer_value().into(), n.into(), n.into()],
        false,
    );
    let uncommon = ctx.const_struct(&[ptr.const_null().into(), i64_ty.const_zero().into()], false);
    let init = ctx.const_struct(
        &[ptr.const_null().into(), uncommon.into(), method_slice.into()],
        false,
    );

    let g = module.add_global(init.get_type(), None, sym);
    g.set_linkage(Linkage::LinkOnceODR);
    g.set_constant(true);
    g.set_initializer(&init);
    g
}

/// Tag `func` as the interface-call target (IFn) implementing
/// `method_name` of the type `type_symbol`. Entries accumulate into one
/// attribute value, duplicates dropped.
pub fn attach_ifn_attr<'ctx>(
    prog: &Program<'ctx>,
    func: inkwell::values::FunctionValue<'ctx>,
    type_symbol: &str,
    method_name: &str,
    method_type_symbol: &str,
) {
    use inkwell::attributes::AttributeLoc;

    let payload = method_binding::encode_payload(type_symbol, method_name, method_type_symbol);
    let existing = func
        .get_string_attribute(AttributeLoc::Function, method_binding::ATTR_IFN)
        .map(|a| a.get_string_value().to_string_lossy().into_owned())
        .unwrap_or_default();
    let merged = method_binding::merge_payload(&existing, &payload);
    let attr = prog
        .context()
        .create_string_attribute(method_binding::ATTR_IFN, &merged);
    func.add_attribute(AttributeLoc::Function, attr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell::context::Context;
    use llgo_ssa::{Signature, TypeEnv};

    fn test_prog(ctx: &Context) -> Program<'_> {
        Program::new(ctx, TypeEnv::new(), None).unwrap()
    }

    #[test]
    fn iface_descriptor_shape() {
        let ctx = Context::create();
        let prog = test_prog(&ctx);
        let pkg = crate::PackageEmitter::new(&prog, "main", "main");

        let g = define_iface_descriptor(
            &prog,
            pkg.module(),
            "_llgo_main.Animal",
            &[("Sound".into(), "_llgo_func() string".into())],
        );
        assert!(g.get_initializer().is_some());

        let ir = pkg.serialize();
        assert!(ir.contains("_llgo_main.Animal$methods"), "{ir}");
        assert!(ir.contains("Sound"), "{ir}");

        // Defining again returns the same global.
        let g2 = define_iface_descriptor(&prog, pkg.module(), "_llgo_main.Animal", &[]);
        assert_eq!(g.as_pointer_value(), g2.as_pointer_value());
    }

    #[test]
    fn type_descriptor_counts_methods() {
        let ctx = Context::create();
        let prog = test_prog(&ctx);
        let pkg = crate::PackageEmitter::new(&prog, "main", "main");
        let f = pkg
            .new_func(&prog, "main.(Dog).Sound", Signature::default(), llgo_ssa::Background::InGo, false)
            .unwrap();
        let fptr = f.val.as_global_value().as_pointer_value();

        define_type_descriptor(
            &prog,
            pkg.module(),
            "_llgo_main.Dog",
            &[MethodTableEntry {
                name: "Sound".into(),
                method_type_symbol: "_llgo_func() string".into(),
                ifn: fptr,
                tfn: fptr,
            }],
        );
        let ir = pkg.serialize();
        assert!(ir.contains("_llgo_main.Dog"), "{ir}");
        assert!(ir.contains("i64 1"), "mcount must be recorded: {ir}");
    }

    #[test]
    fn ifn_attr_merges() {
        let ctx = Context::create();
        let prog = test_prog(&ctx);
        let pkg = crate::PackageEmitter::new(&prog, "main", "main");
        let f = pkg
            .new_func(&prog, "main.(Dog).Sound", Signature::default(), llgo_ssa::Background::InGo, false)
            .unwrap();

        attach_ifn_attr(&prog, f.val, "_llgo_main.Dog", "Sound", "_llgo_func() string");
        attach_ifn_attr(&prog, f.val, "_llgo_*main.Dog", "Sound", "_llgo_func() string");

        let attr = f
            .val
            .get_string_attribute(inkwell::attributes::AttributeLoc::Function, method_binding::ATTR_IFN)
            .expect("attribute must exist");
        let entries = method_binding::decode_attr_value(&attr.get_string_value().to_string_lossy());
        assert_eq!(entries.len(), 2);
    }
}
