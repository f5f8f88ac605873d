//! Pipeline tests: drive whole fixture programs through loading,
//! ordering, and per-package emission, asserting on the artifacts.
//!
//! Linking and running need a C toolchain and a runtime library, so these
//! tests stop at `build` (per-package IR): the same boundary the
//! `build` subcommand stops at.

use llgo_ssa::{
    Background, Block, Const, Instr, Instruction, Member, Signature, SsaFunction, SsaPackage,
    SsaProgram, Value,
};
use llgoc::build::{build_program, Config, Mode};

fn ret() -> Instruction {
    Instruction { reg: None, kind: Instr::Return { results: vec![] } }
}

fn empty_main_program() -> SsaProgram {
    let init = SsaFunction {
        name: "init".into(),
        sig: Signature::default(),
        blocks: vec![
            Block { index: 0, instrs: vec![Instruction { reg: None, kind: Instr::Jump }], preds: vec![], succs: vec![1] },
            Block {
                index: 1,
                instrs: vec![
                    Instruction {
                        reg: Some(0),
                        kind: Instr::BinOp {
                            op: llgo_ssa::BinOpToken::Add,
                            x: Value::Const(Const::Int { value: 0, ty: llgo_ssa::GoType::Basic(llgo_ssa::BasicKind::Int) }),
                            y: Value::Const(Const::Int { value: 0, ty: llgo_ssa::GoType::Basic(llgo_ssa::BasicKind::Int) }),
                            ty: llgo_ssa::GoType::Basic(llgo_ssa::BasicKind::Int),
                        },
                    },
                    ret(),
                ],
                preds: vec![0],
                succs: vec![],
            },
        ],
        free_vars: vec![],
        recover_block: None,
        anon_funcs: vec![],
        background: Background::InGo,
    };
    let main = SsaFunction {
        name: "main".into(),
        sig: Signature::default(),
        blocks: vec![Block { index: 0, instrs: vec![ret()], preds: vec![], succs: vec![] }],
        free_vars: vec![],
        recover_block: None,
        anon_funcs: vec![],
        background: Background::InGo,
    };
    SsaProgram {
        packages: vec![SsaPackage {
            name: "main".into(),
            path: "main".into(),
            llgo_package: None,
            llgo_files: None,
            deps: vec![],
            members: vec![Member::Func(init), Member::Func(main)],
        }],
        types: Default::default(),
    }
}

fn build_conf(work: &std::path::Path) -> Config {
    let mut conf = Config::new(Mode::Build);
    conf.work_dir = Some(work.to_path_buf());
    conf
}

#[test]
fn empty_main_compiles_to_an_ir_export() {
    let dir = tempfile::tempdir().unwrap();
    let program = empty_main_program();

    let code = build_program(&program, build_conf(dir.path())).unwrap();
    assert_eq!(code, 0);

    let ll = dir.path().join("main.ll");
    assert!(ll.exists(), "per-package export file expected");
    let ir = std::fs::read_to_string(&ll).unwrap();
    assert!(ir.contains("define i32 @main(i32"), "{ir}");
    assert!(ir.contains("llgo/runtime.init"), "{ir}");
}

#[test]
fn decl_only_packages_produce_no_export() {
    let dir = tempfile::tempdir().unwrap();
    let mut program = empty_main_program();
    program.packages.push(SsaPackage {
        name: "c".into(),
        path: "llgo/c".into(),
        llgo_package: Some("decl".into()),
        llgo_files: None,
        deps: vec![],
        members: vec![],
    });
    program.packages[0].deps.push("llgo/c".into());

    let code = build_program(&program, build_conf(dir.path())).unwrap();
    assert_eq!(code, 0);
    assert!(dir.path().join("main.ll").exists());
    assert!(
        !dir.path().join("llgo_c.ll").exists(),
        "declaration-only packages emit nothing"
    );
}

#[test]
fn dependencies_lower_before_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let mut program = empty_main_program();
    program.packages.push(SsaPackage {
        name: "errors".into(),
        path: "errors".into(),
        llgo_package: None,
        llgo_files: None,
        deps: vec![],
        members: vec![Member::Global {
            name: "sentinel".into(),
            ty: llgo_ssa::GoType::Basic(llgo_ssa::BasicKind::Int),
            background: Background::InGo,
        }],
    });
    program.packages[0].deps.push("errors".into());

    let code = build_program(&program, build_conf(dir.path())).unwrap();
    assert_eq!(code, 0);
    assert!(dir.path().join("errors.ll").exists());
    let ir = std::fs::read_to_string(dir.path().join("errors.ll")).unwrap();
    assert!(ir.contains("errors.sentinel"), "{ir}");
}

#[test]
fn import_cycles_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut program = empty_main_program();
    program.packages.push(SsaPackage {
        name: "a".into(),
        path: "a".into(),
        llgo_package: None,
        llgo_files: None,
        deps: vec!["b".into()],
        members: vec![],
    });
    program.packages.push(SsaPackage {
        name: "b".into(),
        path: "b".into(),
        llgo_package: None,
        llgo_files: None,
        deps: vec!["a".into()],
        members: vec![],
    });

    let err = build_program(&program, build_conf(dir.path())).unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(err.to_string().contains("import cycle"));
}

#[test]
fn running_multiple_main_packages_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut program = empty_main_program();
    let mut second = program.packages[0].clone();
    second.path = "other/main".into();
    program.packages.push(second);

    let mut conf = build_conf(dir.path());
    conf.mode = Mode::Run;
    let err = build_program(&program, conf).unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(err.to_string().contains("cannot run multiple packages"));
}
