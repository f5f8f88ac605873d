//! End-to-end lowering tests: build small SSA packages in memory, run the
//! walker, and assert on the emitted IR text.

use inkwell::context::Context;

use llgo_codegen::{invoke, lower_package, Builder, PackageEmitter, PatchOptions, Program};
use llgo_ssa::{
    Background, BasicKind, BinOpToken, Block, Builtin, CallInstr, Callee, Const, Field, FuncRef,
    GoType, IfaceMethod, Instr, Instruction, InterfaceDef, Member, Param, Signature, SsaFunction,
    SsaPackage, StructDef, TypeDef, TypeEnv, Value,
};

// ── Fixture helpers ──────────────────────────────────────────────────

fn ins(reg: Option<u32>, kind: Instr) -> Instruction {
    Instruction { reg, kind }
}

fn block(index: u32, instrs: Vec<Instruction>, preds: Vec<u32>, succs: Vec<u32>) -> Block {
    Block { index, instrs, preds, succs }
}

fn func(name: &str, sig: Signature, blocks: Vec<Block>) -> SsaFunction {
    SsaFunction {
        name: name.into(),
        sig,
        blocks,
        free_vars: vec![],
        recover_block: None,
        anon_funcs: vec![],
        background: Background::InGo,
    }
}

fn decl(name: &str, sig: Signature) -> SsaFunction {
    func(name, sig, vec![])
}

fn no_args() -> Signature {
    Signature::default()
}

fn int() -> GoType {
    GoType::Basic(BasicKind::Int)
}

fn str_ty() -> GoType {
    GoType::Basic(BasicKind::Str)
}

fn int_const(v: i64) -> Value {
    Value::Const(Const::Int { value: v, ty: int() })
}

fn package(path: &str, members: Vec<Member>) -> SsaPackage {
    SsaPackage {
        name: path.rsplit('/').next().unwrap_or(path).into(),
        path: path.into(),
        llgo_package: None,
        llgo_files: None,
        deps: vec![],
        members,
    }
}

/// `func main() { ... }` with an implicit empty `init`.
fn main_package(main_blocks: Vec<Block>) -> SsaPackage {
    package(
        "main",
        vec![
            Member::Func(func(
                "init",
                no_args(),
                vec![
                    block(0, vec![ins(None, Instr::Jump)], vec![], vec![1]),
                    block(
                        1,
                        vec![
                            ins(
                                Some(90),
                                Instr::BinOp {
                                    op: BinOpToken::Add,
                                    x: int_const(0),
                                    y: int_const(0),
                                    ty: int(),
                                },
                            ),
                            ins(None, Instr::Return { results: vec![] }),
                        ],
                        vec![0],
                        vec![],
                    ),
                ],
            )),
            Member::Func(func("main", no_args(), main_blocks)),
        ],
    )
}

fn lower<'ctx>(
    ctx: &'ctx Context,
    env: TypeEnv,
    pkg: &SsaPackage,
    patch: Option<&SsaPackage>,
) -> (Program<'ctx>, PackageEmitter<'ctx>) {
    let prog = Program::new(ctx, env, None).expect("program");
    let emitter = PackageEmitter::new(&prog, pkg.name.clone(), pkg.path.clone());
    lower_package(&prog, &emitter, pkg, patch, PatchOptions::default()).expect("lowering");
    (prog, emitter)
}

// ── main ABI and init ordering ───────────────────────────────────────

#[test]
fn main_gets_c_signature_and_returns_zero() {
    let ctx = Context::create();
    let pkg = main_package(vec![block(
        0,
        vec![ins(None, Instr::Return { results: vec![] })],
        vec![],
        vec![],
    )]);
    let (_prog, emitter) = lower(&ctx, TypeEnv::new(), &pkg, None);
    let ir = emitter.serialize();

    assert!(
        ir.contains("define i32 @main(i32 %0, ptr %1)"),
        "main must carry the C (argc, argv) -> int signature:\n{ir}"
    );
    assert!(ir.contains("ret i32 0"), "user return rewritten to 0:\n{ir}");
}

#[test]
fn main_prelude_stores_args_then_inits_runtime_then_package() {
    let ctx = Context::create();
    let pkg = main_package(vec![block(
        0,
        vec![ins(None, Instr::Return { results: vec![] })],
        vec![],
        vec![],
    )]);
    let (_prog, emitter) = lower(&ctx, TypeEnv::new(), &pkg, None);
    let ir = emitter.serialize();

    assert!(ir.contains("@__llgo_argc"), "{ir}");
    assert!(ir.contains("@__llgo_argv"), "{ir}");
    let rt_init = ir
        .find("call void @\"llgo/runtime.init\"()")
        .expect("runtime.init call");
    let pkg_init = ir.find("call void @main.init()").expect("main.init call");
    let argc_store = ir.find("store i32 %0").expect("argc persisted");
    assert!(argc_store < rt_init, "argc/argv stored first:\n{ir}");
    assert!(rt_init < pkg_init, "runtime.init precedes main.init:\n{ir}");
}

// ── Defer ordering ───────────────────────────────────────────────────

#[test]
fn defers_replay_in_lifo_order() {
    let ctx = Context::create();
    let call_a = CallInstr {
        callee: Callee::Func(FuncRef {
            pkg: "main".into(),
            name: "A".into(),
            sig: no_args(),
            background: Background::InGo,
            intrinsic: None,
        }),
        args: vec![],
        ty: GoType::Tuple(vec![]),
    };
    let mut call_b = call_a.clone();
    if let Callee::Func(fr) = &mut call_b.callee {
        fr.name = "B".into();
    }
    let pkg = main_package(vec![block(
        0,
        vec![
            ins(None, Instr::Defer(call_a)),
            ins(None, Instr::Defer(call_b)),
            ins(None, Instr::RunDefers),
            ins(None, Instr::Return { results: vec![] }),
        ],
        vec![],
        vec![],
    )]);
    let (_prog, emitter) = lower(&ctx, TypeEnv::new(), &pkg, None);
    let ir = emitter.serialize();

    let pos_b = ir.find("call void @main.B()").expect("B invoked");
    let pos_a = ir.find("call void @main.A()").expect("A invoked");
    assert!(pos_b < pos_a, "defer B must run before defer A:\n{ir}");
}

#[test]
fn deferred_println_evaluates_args_at_defer_site() {
    let ctx = Context::create();
    let defer_println = |s: &str| {
        ins(
            None,
            Instr::Defer(CallInstr {
                callee: Callee::Builtin(Builtin::Println),
                args: vec![Value::Const(Const::Str(s.into()))],
                ty: GoType::Tuple(vec![]),
            }),
        )
    };
    let pkg = main_package(vec![block(
        0,
        vec![
            defer_println("B"),
            defer_println("A"),
            ins(None, Instr::RunDefers),
            ins(None, Instr::Return { results: vec![] }),
        ],
        vec![],
        vec![],
    )]);
    let (prog, emitter) = lower(&ctx, TypeEnv::new(), &pkg, None);
    let ir = emitter.serialize();

    assert!(prog.need_runtime.get());
    assert!(
        ir.matches("call void @\"llgo/runtime.Println\"").count() >= 2,
        "both deferred printlns must be emitted:\n{ir}"
    );
}

// ── Patched packages ─────────────────────────────────────────────────

fn init_fn() -> SsaFunction {
    func(
        "init",
        no_args(),
        vec![
            block(0, vec![ins(None, Instr::Jump)], vec![], vec![1]),
            block(
                1,
                vec![
                    ins(
                        Some(50),
                        Instr::BinOp {
                            op: BinOpToken::Add,
                            x: int_const(0),
                            y: int_const(0),
                            ty: int(),
                        },
                    ),
                    ins(None, Instr::Return { results: vec![] }),
                ],
                vec![0],
                vec![],
            ),
        ],
    )
}

fn new_fn(ret: i64) -> SsaFunction {
    func(
        "New",
        Signature {
            recv: None,
            params: vec![],
            results: vec![int()],
            variadic: false,
        },
        vec![block(
            0,
            vec![ins(None, Instr::Return { results: vec![int_const(ret)] })],
            vec![],
            vec![],
        )],
    )
}

#[test]
fn patched_package_bridges_init_and_replaces_members() {
    let ctx = Context::create();
    let original = package(
        "errors",
        vec![Member::Func(init_fn()), Member::Func(new_fn(13))],
    );
    let patch = SsaPackage {
        path: "llgo/internal/lib/errors".into(),
        ..package("errors", vec![Member::Func(init_fn()), Member::Func(new_fn(7))])
    };

    let (_prog, emitter) = lower(&ctx, TypeEnv::new(), &original, Some(&patch));
    let ir = emitter.serialize();

    // The patch's init keeps the public name and bridges to the original
    // under the renamed symbol.
    assert!(
        ir.contains("call void @errors.init$hasPatch"),
        "patched init must bridge to the original:\n{ir}"
    );
    assert!(
        ir.contains("define void @errors.init$hasPatch"),
        "original init retained under the renamed symbol:\n{ir}"
    );
    // The patch's New wins; the original's body is skipped entirely.
    assert!(ir.contains("ret i64 7"), "patched New body expected:\n{ir}");
    assert!(!ir.contains("ret i64 13"), "original New must be skipped:\n{ir}");
}

// ── Interface dispatch ───────────────────────────────────────────────

fn sound_sig() -> Signature {
    Signature {
        recv: None,
        params: vec![],
        results: vec![str_ty()],
        variadic: false,
    }
}

fn animal_env() -> TypeEnv {
    let mut env = TypeEnv::new();
    env.define(
        "main",
        "Animal",
        GoType::Interface(InterfaceDef {
            methods: vec![IfaceMethod { name: "Sound".into(), sig: sound_sig() }],
        }),
    );
    env.define(
        "main",
        "Dog",
        GoType::Struct(StructDef {
            fields: vec![Field { name: "name".into(), ty: str_ty(), embedded: false }],
        }),
    );
    env.define(
        "main",
        "Cat",
        GoType::Struct(StructDef {
            fields: vec![Field { name: "name".into(), ty: str_ty(), embedded: false }],
        }),
    );
    env
}

fn animal_ty() -> GoType {
    GoType::Named { pkg: "main".into(), name: "Animal".into() }
}

fn sound_method(recv_name: &str, word: &str) -> SsaFunction {
    let mut sig = sound_sig();
    sig.recv = Some(Param {
        name: "a".into(),
        ty: GoType::Named { pkg: "main".into(), name: recv_name.into() },
    });
    SsaFunction {
        name: format!("({recv_name}).Sound"),
        sig,
        blocks: vec![block(
            0,
            vec![ins(
                None,
                Instr::Return { results: vec![Value::Const(Const::Str(word.into()))] },
            )],
            vec![],
            vec![],
        )],
        free_vars: vec![],
        recover_block: None,
        anon_funcs: vec![],
        background: Background::InGo,
    }
}

fn animal_package() -> SsaPackage {
    let speak = func(
        "speak",
        Signature {
            recv: None,
            params: vec![Param { name: "a".into(), ty: animal_ty() }],
            results: vec![str_ty()],
            variadic: false,
        },
        vec![block(
            0,
            vec![
                ins(
                    Some(0),
                    Instr::Call(CallInstr {
                        callee: Callee::Invoke {
                            iface: Value::Param(0),
                            iface_ty: animal_ty(),
                            method: "Sound".into(),
                            method_index: 0,
                            sig: sound_sig(),
                        },
                        args: vec![],
                        ty: str_ty(),
                    }),
                ),
                ins(None, Instr::Return { results: vec![Value::Reg(0)] }),
            ],
            vec![],
            vec![],
        )],
    );
    package(
        "main",
        vec![
            Member::Type(TypeDef {
                name: "Animal".into(),
                underlying: GoType::Interface(InterfaceDef {
                    methods: vec![IfaceMethod { name: "Sound".into(), sig: sound_sig() }],
                }),
                methods: vec![],
            }),
            Member::Type(TypeDef {
                name: "Dog".into(),
                underlying: GoType::Struct(StructDef { fields: vec![] }),
                methods: vec![sound_method("Dog", "Woof")],
            }),
            Member::Type(TypeDef {
                name: "Cat".into(),
                underlying: GoType::Struct(StructDef { fields: vec![] }),
                methods: vec![sound_method("Cat", "Meow")],
            }),
            Member::Func(speak),
        ],
    )
}

#[test]
fn interface_call_emits_weak_thunk_with_indirect_fallback() {
    let ctx = Context::create();
    let (_prog, emitter) = lower(&ctx, animal_env(), &animal_package(), None);
    let ir = emitter.serialize();

    assert!(
        ir.contains("weak") && ir.contains("__llgo_invoke._llgo_main.Animal$m0."),
        "invoke thunk must be weak:\n{ir}"
    );
    // The weak body dispatches through the itab slot, keeping programs
    // correct without the lowering pass.
    assert!(ir.contains("llgo/runtime.IfacePtrData"), "{ir}");
    assert!(ir.contains("fn.ptr"), "itab slot address expected:\n{ir}");
    assert!(ir.contains("load ptr"), "method pointer load expected:\n{ir}");
}

#[test]
fn thunk_plans_cover_every_implementor_sorted_and_deduped() {
    let ctx = Context::create();
    let (_prog, emitter) = lower(&ctx, animal_env(), &animal_package(), None);

    let plans = invoke::collect_thunk_plans(emitter.module());
    assert_eq!(plans.len(), 1, "one interface method, one thunk");
    let plan = &plans[0];
    assert_eq!(plan.method_index, 0);

    let type_syms: Vec<&str> = plan
        .targets
        .iter()
        .map(|t| t.type_symbol.as_str())
        .collect();
    // Dog and Cat each implement Sound by value, so both the value and the
    // pointer type dispatch directly; order is lexicographic, no
    // duplicates.
    assert!(type_syms.contains(&"_llgo_main.Cat"), "{type_syms:?}");
    assert!(type_syms.contains(&"_llgo_main.Dog"), "{type_syms:?}");
    let mut sorted = type_syms.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(type_syms, sorted, "targets must be sorted and deduped");
}

#[test]
fn patch_module_has_direct_arms_for_dog_and_cat() {
    let ctx = Context::create();
    let (prog, emitter) = lower(&ctx, animal_env(), &animal_package(), None);

    let dir = tempfile::tempdir().unwrap();
    let bc = dir.path().join("main.bc");
    assert!(emitter.write_bitcode_to(&bc));

    let result =
        invoke::build_patch_module(&ctx, prog.target_machine(), &[bc], false).unwrap();
    let (patch, patched) = result.expect("patch module expected");
    assert_eq!(patched, 1);

    let ir = patch.print_to_string().to_string();
    assert!(ir.contains("main.(Dog).Sound$ifn"), "Dog arm expected:\n{ir}");
    assert!(ir.contains("main.(Cat).Sound$ifn"), "Cat arm expected:\n{ir}");
    assert!(ir.contains("fallback"), "indirect fallback preserved:\n{ir}");
}

// ── Variadic packaging ───────────────────────────────────────────────

fn vararg_println_ref() -> FuncRef {
    FuncRef {
        pkg: "llgo/runtime".into(),
        name: "Println".into(),
        sig: Signature {
            recv: None,
            params: vec![Param {
                name: "__llgo_va_list".into(),
                ty: GoType::slice(GoType::any()),
            }],
            results: vec![],
            variadic: true,
        },
        background: Background::InGo,
        intrinsic: None,
    }
}

/// The SSA shape the frontend produces for `println(1, 2, 3)` routed
/// through a variadic Go function: a "varargs" array allocation, one
/// boxed store per element, a full slice, then the call.
fn vararg_call_blocks() -> Vec<Block> {
    let any = GoType::any();
    let arr = GoType::Array { elem: Box::new(any.clone()), len: 3 };
    let mut instrs = vec![ins(
        Some(0),
        Instr::Alloc {
            elem: arr.clone(),
            heap: false,
            comment: "varargs".into(),
            ty: GoType::pointer(arr),
        },
    )];
    for i in 0..3u32 {
        let ia = 1 + i * 2;
        let mi = 2 + i * 2;
        instrs.push(ins(
            Some(ia),
            Instr::IndexAddr {
                x: Value::Reg(0),
                index: int_const(i as i64),
                ty: GoType::pointer(any.clone()),
            },
        ));
        instrs.push(ins(
            Some(mi),
            Instr::MakeInterface {
                x: int_const((i + 1) as i64),
                x_ty: int(),
                ty: any.clone(),
            },
        ));
        instrs.push(ins(None, Instr::Store { addr: Value::Reg(ia), val: Value::Reg(mi) }));
    }
    instrs.push(ins(
        Some(7),
        Instr::Slice {
            x: Value::Reg(0),
            low: None,
            high: None,
            max: None,
            ty: GoType::slice(any),
        },
    ));
    instrs.push(ins(
        None,
        Instr::Call(CallInstr {
            callee: Callee::Func(vararg_println_ref()),
            args: vec![Value::Reg(7)],
            ty: GoType::Tuple(vec![]),
        }),
    ));
    instrs.push(ins(None, Instr::Return { results: vec![] }));
    vec![block(0, instrs, vec![], vec![])]
}

#[test]
fn vararg_alloca_is_elided_into_one_slice_construction() {
    let ctx = Context::create();
    let pkg = main_package(vararg_call_blocks());
    let (_prog, emitter) = lower(&ctx, TypeEnv::new(), &pkg, None);
    let ir = emitter.serialize();

    assert!(
        ir.contains("call void @\"llgo/runtime.Println\""),
        "print helper receives the slice:\n{ir}"
    );
    assert_eq!(
        ir.matches("alloca [3 x").count(),
        1,
        "exactly one backing array:\n{ir}"
    );
    // The intercepted element stores never go through the bounds-checked
    // IndexAddr path.
    assert!(
        !ir.contains("llgo/runtime.PanicIndex"),
        "elided stores must not bounds-check:\n{ir}"
    );
}

#[test]
fn vararg_elision_requires_the_exact_referrer_shape() {
    let ctx = Context::create();
    // Same shape, but the slice is ALSO returned: the referrer chain no
    // longer ends at the call, so the standard alloca path applies.
    let any = GoType::any();
    let mut blocks = vararg_call_blocks();
    let last = blocks[0].instrs.len() - 1;
    blocks[0].instrs[last] = ins(
        None,
        Instr::Return { results: vec![Value::Reg(7)] },
    );
    let speak = func(
        "leak",
        Signature {
            recv: None,
            params: vec![],
            results: vec![GoType::slice(any)],
            variadic: false,
        },
        blocks,
    );
    let pkg = package("main", vec![Member::Func(speak)]);
    let (_prog, emitter) = lower(&ctx, TypeEnv::new(), &pkg, None);
    let ir = emitter.serialize();

    assert!(
        ir.contains("llgo/runtime.PanicIndex"),
        "standard path keeps bounds checks:\n{ir}"
    );
}

// ── Block linearization ──────────────────────────────────────────────

#[test]
fn blocks_emit_in_cfg_order_not_declaration_order() {
    let ctx = Context::create();
    // The loop block (2) is declared after the exit (1) and defines the
    // register the exit returns, with a back-edge onto itself. Emission
    // must follow the CFG (0, 2, 1), not the declaration order, or the
    // exit would read a register that has no definition yet.
    let count = func(
        "count",
        Signature {
            recv: None,
            params: vec![Param { name: "n".into(), ty: int() }],
            results: vec![int()],
            variadic: false,
        },
        vec![
            block(0, vec![ins(None, Instr::Jump)], vec![], vec![2]),
            block(
                1,
                vec![ins(None, Instr::Return { results: vec![Value::Reg(5)] })],
                vec![2],
                vec![],
            ),
            block(
                2,
                vec![
                    ins(
                        Some(5),
                        Instr::BinOp {
                            op: BinOpToken::Add,
                            x: Value::Param(0),
                            y: int_const(1),
                            ty: int(),
                        },
                    ),
                    ins(
                        Some(6),
                        Instr::BinOp {
                            op: BinOpToken::Lss,
                            x: Value::Reg(5),
                            y: int_const(10),
                            ty: GoType::Basic(BasicKind::Bool),
                        },
                    ),
                    ins(None, Instr::If { cond: Value::Reg(6) }),
                ],
                vec![0, 2],
                vec![2, 1],
            ),
        ],
    );
    let pkg = package("main", vec![Member::Func(count)]);
    let (_prog, emitter) = lower(&ctx, TypeEnv::new(), &pkg, None);
    let ir = emitter.serialize();

    assert!(
        ir.contains("br i1") && ir.contains("%_llgo_2"),
        "back-edge branch expected:\n{ir}"
    );
    assert!(ir.contains("ret i64"), "exit returns the loop register:\n{ir}");
}

// ── Method-binding pass degradations ─────────────────────────────────

#[test]
fn invalid_bitcode_is_skipped_not_fatal() {
    let ctx = Context::create();
    let (prog, emitter) = lower(&ctx, animal_env(), &animal_package(), None);

    let dir = tempfile::tempdir().unwrap();
    // Sorts ahead of the valid module, so the skip happens before any
    // module has been accepted.
    let broken = dir.path().join("broken.bc");
    std::fs::write(&broken, b"this is not bitcode").unwrap();
    let good = dir.path().join("main.bc");
    assert!(emitter.write_bitcode_to(&good));

    let result =
        invoke::build_patch_module(&ctx, prog.target_machine(), &[broken, good], false).unwrap();
    let (_patch, patched) = result.expect("the valid module must still be lowered");
    assert_eq!(patched, 1);
}

#[test]
fn bitcode_link_failure_disables_the_pass() {
    let ctx = Context::create();
    let prog = Program::new(&ctx, TypeEnv::new(), None).unwrap();
    let dir = tempfile::tempdir().unwrap();

    // Two modules defining the same strong symbol with conflicting
    // prototypes cannot be linked; the pass must back off to the weak
    // thunks instead of failing the build.
    let pkg_a = PackageEmitter::new(&prog, "a", "a");
    let fa = pkg_a
        .new_func(&prog, "dup", no_args(), Background::InGo, false)
        .unwrap();
    fa.make_blocks(&prog, 1);
    let ba = Builder::new(&prog, &pkg_a, fa.clone());
    ba.set_block(fa.block(0));
    ba.ret(&[]).unwrap();
    let a_bc = dir.path().join("a.bc");
    assert!(pkg_a.write_bitcode_to(&a_bc));

    let pkg_b = PackageEmitter::new(&prog, "b", "b");
    let int_sig = Signature {
        recv: None,
        params: vec![],
        results: vec![int()],
        variadic: false,
    };
    let fb = pkg_b
        .new_func(&prog, "dup", int_sig, Background::InGo, false)
        .unwrap();
    fb.make_blocks(&prog, 1);
    let bb = Builder::new(&prog, &pkg_b, fb.clone());
    bb.set_block(fb.block(0));
    let zero = bb.const_int(0, &int(), Background::InGo).unwrap();
    bb.ret(&[zero]).unwrap();
    let b_bc = dir.path().join("b.bc");
    assert!(pkg_b.write_bitcode_to(&b_bc));

    let result =
        invoke::build_patch_module(&ctx, prog.target_machine(), &[a_bc, b_bc], false).unwrap();
    assert!(
        result.is_none(),
        "the pass must disable itself when bitcode linking fails"
    );
}

// ── Phis ─────────────────────────────────────────────────────────────

#[test]
fn phi_collects_incoming_from_each_predecessor() {
    let ctx = Context::create();
    let bool_ty = GoType::Basic(BasicKind::Bool);
    let f = func(
        "pick",
        Signature {
            recv: None,
            params: vec![Param { name: "c".into(), ty: bool_ty }],
            results: vec![int()],
            variadic: false,
        },
        vec![
            block(0, vec![ins(None, Instr::If { cond: Value::Param(0) })], vec![], vec![1, 2]),
            block(1, vec![ins(None, Instr::Jump)], vec![0], vec![3]),
            block(2, vec![ins(None, Instr::Jump)], vec![0], vec![3]),
            block(
                3,
                vec![
                    ins(Some(0), Instr::Phi { edges: vec![int_const(1), int_const(2)], ty: int() }),
                    ins(None, Instr::Return { results: vec![Value::Reg(0)] }),
                ],
                vec![1, 2],
                vec![],
            ),
        ],
    );
    let pkg = package("main", vec![Member::Func(f)]);
    let (_prog, emitter) = lower(&ctx, TypeEnv::new(), &pkg, None);
    let ir = emitter.serialize();

    assert!(ir.contains("phi i64"), "{ir}");
    assert!(ir.contains("[ 1, %_llgo_1 ]"), "{ir}");
    assert!(ir.contains("[ 2, %_llgo_2 ]"), "{ir}");
}

// ── Closures ─────────────────────────────────────────────────────────

#[test]
fn closures_capture_through_a_context_struct() {
    let ctx = Context::create();
    let inner_sig = Signature {
        recv: None,
        params: vec![],
        results: vec![int()],
        variadic: false,
    };
    let inner = SsaFunction {
        name: "main$1".into(),
        sig: inner_sig.clone(),
        blocks: vec![block(
            0,
            vec![ins(None, Instr::Return { results: vec![Value::FreeVar(0)] })],
            vec![],
            vec![],
        )],
        free_vars: vec![Param { name: "x".into(), ty: int() }],
        recover_block: None,
        anon_funcs: vec![],
        background: Background::InGo,
    };
    let mut outer = func(
        "outer",
        Signature {
            recv: None,
            params: vec![],
            results: vec![int()],
            variadic: false,
        },
        vec![block(
            0,
            vec![
                ins(
                    Some(0),
                    Instr::MakeClosure {
                        func: FuncRef {
                            pkg: "main".into(),
                            name: "main$1".into(),
                            sig: inner_sig.clone(),
                            background: Background::InGo,
                            intrinsic: None,
                        },
                        bindings: vec![int_const(5)],
                        ty: GoType::Func(Box::new(inner_sig.clone())),
                    },
                ),
                ins(
                    Some(1),
                    Instr::Call(CallInstr {
                        callee: Callee::Value(Value::Reg(0)),
                        args: vec![],
                        ty: int(),
                    }),
                ),
                ins(None, Instr::Return { results: vec![Value::Reg(1)] }),
            ],
            vec![],
            vec![],
        )],
    );
    outer.anon_funcs.push(inner);

    let pkg = package("main", vec![Member::Func(outer)]);
    let (_prog, emitter) = lower(&ctx, TypeEnv::new(), &pkg, None);
    let ir = emitter.serialize();

    assert!(
        ir.contains("define i64 @main.main$1(ptr"),
        "closure body takes a context pointer first:\n{ir}"
    );
    assert!(
        ir.contains("llgo/runtime.AllocZ"),
        "bindings are heap-packaged:\n{ir}"
    );
}

// ── Goroutines ───────────────────────────────────────────────────────

#[test]
fn go_statement_spawns_through_a_trampoline() {
    let ctx = Context::create();
    let target = CallInstr {
        callee: Callee::Func(FuncRef {
            pkg: "main".into(),
            name: "work".into(),
            sig: Signature {
                recv: None,
                params: vec![Param { name: "n".into(), ty: int() }],
                results: vec![],
                variadic: false,
            },
            background: Background::InGo,
            intrinsic: None,
        }),
        args: vec![int_const(42)],
        ty: GoType::Tuple(vec![]),
    };
    let pkg = main_package(vec![block(
        0,
        vec![
            ins(None, Instr::Go(target)),
            ins(None, Instr::Return { results: vec![] }),
        ],
        vec![],
        vec![],
    )]);
    let (prog, emitter) = lower(&ctx, TypeEnv::new(), &pkg, None);
    let ir = emitter.serialize();

    assert!(prog.need_runtime.get());
    assert!(ir.contains("llgo/runtime.Go"), "{ir}");
    assert!(ir.contains("$go0"), "per-site trampoline expected:\n{ir}");
}
