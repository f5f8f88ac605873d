//! The build orchestrator: load packages, compute order, resolve
//! patches, drive per-package lowering, and link.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::rc::Rc;

use inkwell::context::Context;
use rustc_hash::FxHashMap;

use llgo_codegen::{invoke, link, lower_package, PackageEmitter, PatchOptions, Program};
use llgo_common::{dependency_order, BuildError, PkgGraph};
use llgo_ssa::symbols::{self, PATCH_PATH_PREFIX};
use llgo_ssa::{PackageKind, SsaPackage, SsaProgram};

use crate::loader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Build,
    Install,
    Run,
    CmpTest,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Installation destination for `install`.
    pub bin_path: PathBuf,
    /// Explicit `-o` output; only honored when a single main package is
    /// built.
    pub out_file: Option<PathBuf>,
    /// Arguments forwarded to the program for `run` / `cmptest`.
    pub run_args: Vec<String>,
    pub verbose: bool,
    /// Keep generated `.ll` artifacts next to the working directory.
    pub gen_ll: bool,
    /// Sanity-check emitted IR files with `llc`.
    pub check_ll: bool,
    /// Where intermediate artifacts go; defaults to `./.llgo`.
    pub work_dir: Option<PathBuf>,
}

impl Config {
    pub fn new(mode: Mode) -> Self {
        Config {
            mode,
            bin_path: default_bin_path(),
            out_file: None,
            run_args: Vec::new(),
            verbose: false,
            gen_ll: false,
            check_ll: false,
            work_dir: None,
        }
    }
}

/// `$GOBIN`, else `$GOPATH/bin`, else `$HOME/go/bin`.
pub fn default_bin_path() -> PathBuf {
    if let Ok(bin) = std::env::var("GOBIN") {
        if !bin.is_empty() {
            return PathBuf::from(bin);
        }
    }
    if let Ok(gopath) = std::env::var("GOPATH") {
        if !gopath.is_empty() {
            return PathBuf::from(gopath).join("bin");
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join("go").join("bin")
}

/// The root of the llgo source tree, used to locate prebuilt runtime IR.
fn llgo_root() -> Option<PathBuf> {
    std::env::var("LLGOROOT").ok().filter(|s| !s.is_empty()).map(PathBuf::from)
}

/// Entry point for the build-family subcommands. Returns the process
/// exit code.
pub fn run(patterns: &[String], conf: Config) -> Result<i32, BuildError> {
    let patterns = if patterns.is_empty() {
        vec![".".to_string()]
    } else {
        patterns.to_vec()
    };
    let program = loader::load(&patterns)?;
    build_program(&program, conf)
}

/// What one package contributed to the link line.
struct PkgArtifact {
    path: String,
    /// `.ll` export file, extern link flags, or nothing (decl-only).
    export: Option<String>,
    bitcode: Option<PathBuf>,
}

/// Drive the full pipeline over an already-loaded program.
pub fn build_program(program: &SsaProgram, conf: Config) -> Result<i32, BuildError> {
    let mode = conf.mode;

    // Patches are lowered merged into the package they replace, never on
    // their own.
    let mut patches: FxHashMap<String, Rc<SsaPackage>> = FxHashMap::default();
    for pkg in &program.packages {
        if let Some(original) = pkg.path.strip_prefix(PATCH_PATH_PREFIX) {
            patches.insert(original.to_string(), Rc::new(pkg.clone()));
        }
    }

    let mains: Vec<&SsaPackage> = program
        .packages
        .iter()
        .filter(|p| p.path == "main" || p.name == "main")
        .collect();
    match mode {
        Mode::Run | Mode::CmpTest => {
            if mains.len() > 1 {
                return Err(BuildError::Usage("cannot run multiple packages".into()));
            }
            if mains.is_empty() {
                return Err(BuildError::Usage("no main package in matched packages".into()));
            }
        }
        Mode::Install => {
            if mains.is_empty() {
                return Err(BuildError::Usage("no main package in matched packages".into()));
            }
        }
        Mode::Build => {}
    }

    // Leaf-first deterministic order.
    let mut graph = PkgGraph::new();
    for pkg in &program.packages {
        if pkg.path.starts_with(PATCH_PATH_PREFIX) {
            continue;
        }
        graph.add_package(pkg.path.clone(), pkg.path == "main");
        for dep in &pkg.deps {
            if dep.starts_with(PATCH_PATH_PREFIX) {
                continue;
            }
            graph.add_package(dep.clone(), false);
        }
    }
    for pkg in &program.packages {
        if pkg.path.starts_with(PATCH_PATH_PREFIX) {
            continue;
        }
        let from = graph.resolve(&pkg.path).expect("added above");
        for dep in &pkg.deps {
            if let Some(to) = graph.resolve(dep) {
                graph.add_import(from, to);
            }
        }
    }
    let order = dependency_order(&graph)
        .map_err(|cycle| BuildError::Usage(cycle.to_string()))?;

    let work_dir = conf.work_dir.clone().unwrap_or_else(default_work_dir);
    std::fs::create_dir_all(&work_dir)
        .map_err(|e| BuildError::io("cannot create work directory", e))?;

    let ctx = Context::create();
    let prog = Program::new(&ctx, program.types.clone(), None)
        .map_err(|e| BuildError::compile("llgo", e))?;

    let lowering_enabled = invoke::enabled_by_env();
    invoke::set_late_binding(lowering_enabled);
    let mut emitters: Vec<(String, PackageEmitter<'_>)> = Vec::new();
    let mut artifacts: Vec<PkgArtifact> = Vec::new();

    for id in &order {
        let path = graph.get(*id).path.clone();
        let Some(ssa_pkg) = program.package(&path) else {
            // Imported but not delivered: the loader treats it as
            // declarations-only (its symbols resolve at link time).
            continue;
        };
        let kind = ssa_pkg.kind();
        if conf.verbose {
            eprintln!("{path}");
        }
        match kind {
            PackageKind::DeclOnly => {
                artifacts.push(PkgArtifact { path, export: None, bitcode: None });
            }
            PackageKind::LinkIR => {
                artifacts.push(PkgArtifact {
                    path: path.clone(),
                    export: prebuilt_ir_for(&path),
                    bitcode: None,
                });
            }
            PackageKind::LinkExtern(param) => {
                let flags = link::resolve_link_flags(&param)?;
                if let Err(e) = link::check_link_args(&flags) {
                    return Err(BuildError::Usage(format!(
                        "test link args '{param}' failed\n\tresolved to: {flags}\n\terror: {e}"
                    )));
                }
                artifacts.push(PkgArtifact { path, export: Some(flags), bitcode: None });
            }
            PackageKind::Normal | PackageKind::LLGo | PackageKind::NoInit | PackageKind::PyModule(_) => {
                let emitter = PackageEmitter::new(&prog, ssa_pkg.name.clone(), path.clone());
                let patch = patches.get(&path).cloned();
                lower_package(
                    &prog,
                    &emitter,
                    ssa_pkg,
                    patch.as_deref(),
                    PatchOptions::default(),
                )
                .map_err(|e| BuildError::compile(path.clone(), e))?;

                let ll = work_dir.join(format!("{}.ll", mangle(&path)));
                emitter
                    .write_to(&ll)
                    .map_err(|e| BuildError::compile(path.clone(), e))?;
                if conf.check_ll {
                    if let Err(msg) = link::llc_check(&ll) {
                        eprintln!("warning: llc check {}: {msg}", ll.display());
                    }
                }
                let bitcode = if lowering_enabled {
                    let bc = work_dir.join(format!("{}.bc", mangle(&path)));
                    if emitter.write_bitcode_to(&bc) {
                        Some(bc)
                    } else {
                        eprintln!("warning: cannot write bitcode for {path}");
                        None
                    }
                } else {
                    None
                };
                artifacts.push(PkgArtifact {
                    path: path.clone(),
                    export: Some(ll.display().to_string()),
                    bitcode,
                });
                // C sources listed in `LLGoFiles` ride along to the link
                // line; clang compiles them next to the IR inputs.
                if let Some(files) = &ssa_pkg.llgo_files {
                    for file in files.split(';') {
                        let expanded = link::expand_env(file.trim())?;
                        if !expanded.is_empty() {
                            artifacts.push(PkgArtifact {
                                path: path.clone(),
                                export: Some(expanded),
                                bitcode: None,
                            });
                        }
                    }
                }
                emitters.push((path, emitter));
            }
        }
    }

    if mode == Mode::Build {
        return Ok(0);
    }

    // ── Link the main package ────────────────────────────────────────

    let main_pkg = mains.first().map(|p| p.path.clone()).unwrap_or_else(|| "main".into());
    let app_name = mains
        .first()
        .map(|p| binary_name(p))
        .unwrap_or_else(|| "a.out".into());
    let app = match (&conf.out_file, mode) {
        (Some(out), _) => out.clone(),
        (None, Mode::Install) => conf.bin_path.join(&app_name),
        _ => work_dir.join(&app_name),
    };
    if mode == Mode::Install {
        std::fs::create_dir_all(&conf.bin_path)
            .map_err(|e| BuildError::io("cannot create bin directory", e))?;
    }

    let main_emitter = emitters
        .iter()
        .find(|(p, _)| *p == main_pkg)
        .map(|(_, e)| e)
        .ok_or_else(|| BuildError::compile(main_pkg.clone(), "main package was not lowered"))?;

    let mut dirty_main = false;
    if !prog.need_runtime.get() {
        // Nothing called into the runtime: satisfy the mandatory
        // `runtime.init` with an empty body instead of linking it.
        if let Some(rt_init) = main_emitter.func_of(&symbols::runtime_init()) {
            if !rt_init.has_body() {
                rt_init.make_blocks(&prog, 1);
                let b = llgo_codegen::Builder::new(&prog, main_emitter, rt_init.clone());
                b.set_block(rt_init.block(0));
                b.ret(&[]).map_err(|e| BuildError::compile(main_pkg.clone(), e))?;
                dirty_main = true;
            }
        }
    } else if program.package(symbols::PKG_RUNTIME).is_none() {
        // The runtime was not part of the load; fall back to the prebuilt
        // IR shipped under LLGOROOT.
        match prebuilt_ir_for(symbols::PKG_RUNTIME) {
            Some(ll) => artifacts.push(PkgArtifact {
                path: symbols::PKG_RUNTIME.into(),
                export: Some(ll),
                bitcode: None,
            }),
            None => eprintln!(
                "warning: runtime needed but neither loaded nor found under LLGOROOT"
            ),
        }
    }
    if prog.need_py_init.get() && main_emitter.py_init(&prog) {
        dirty_main = true;
    }
    if dirty_main {
        let ll = work_dir.join(format!("{}.ll", mangle(&main_pkg)));
        main_emitter
            .write_to(&ll)
            .map_err(|e| BuildError::compile(main_pkg.clone(), e))?;
    }

    let mut inputs: Vec<String> = Vec::new();
    for a in &artifacts {
        if let Some(export) = &a.export {
            append_link_input(&mut inputs, export);
        }
    }

    // The method-binding pass contributes one extra object, or nothing.
    if lowering_enabled {
        let bitcodes: Vec<PathBuf> = artifacts.iter().filter_map(|a| a.bitcode.clone()).collect();
        match invoke::build_patch_module(&ctx, prog.target_machine(), &bitcodes, conf.verbose) {
            Ok(Some((patch, _count))) => {
                let patch_ll = if conf.gen_ll {
                    PathBuf::from("invoke-lowering.ll")
                } else {
                    work_dir.join("invoke-lowering.ll")
                };
                patch
                    .print_to_file(&patch_ll)
                    .map_err(|e| BuildError::compile("invoke-lowering", e.to_string()))?;
                let patch_obj = work_dir.join("invoke-lowering.o");
                link::compile_ir_to_object(&patch_ll, &patch_obj, conf.verbose)?;
                inputs.push(patch_obj.display().to_string());
            }
            Ok(None) => {}
            Err(e) => eprintln!("warning: invoke-lowering disabled: {e}"),
        }
    }

    if conf.verbose || mode != Mode::Run {
        eprintln!("# {main_pkg}");
    }
    link::link_executable(&app, &inputs, conf.verbose)?;

    match mode {
        Mode::Run => Ok(run_binary(&app, &conf.run_args)?),
        Mode::CmpTest => cmp_test(&main_pkg, &app, &conf.run_args),
        _ => Ok(0),
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".llgo")
}

/// Remove everything the build left under the work directory.
pub fn clean() -> Result<i32, BuildError> {
    let dir = default_work_dir();
    if dir.exists() {
        std::fs::remove_dir_all(&dir)
            .map_err(|e| BuildError::io("cannot remove build artifacts", e))?;
    }
    Ok(0)
}

fn mangle(path: &str) -> String {
    path.replace(['/', '.'], "_")
}

fn binary_name(pkg: &SsaPackage) -> String {
    let base = pkg.path.rsplit('/').next().unwrap_or(&pkg.path);
    if base.is_empty() || base == "main" {
        pkg.name.clone()
    } else {
        base.to_string()
    }
}

/// Prebuilt IR for a package shipped with the toolchain, under
/// `$LLGOROOT/<pkg-path-without-module-prefix>/llgo_autogen.ll`.
fn prebuilt_ir_for(pkg_path: &str) -> Option<String> {
    let root = llgo_root()?;
    let rel = pkg_path.strip_prefix("llgo/").unwrap_or(pkg_path);
    let ll = root.join(rel).join("llgo_autogen.ll");
    if ll.exists() {
        Some(ll.display().to_string())
    } else {
        None
    }
}

/// Extern link flags are stored as one space-separated string; `.ll`
/// exports are single files.
fn append_link_input(inputs: &mut Vec<String>, export: &str) {
    if export.starts_with('-') {
        inputs.extend(export.split_whitespace().map(|s| s.to_string()));
    } else {
        inputs.push(export.to_string());
    }
}

fn run_binary(app: &Path, args: &[String]) -> Result<i32, BuildError> {
    let status = Command::new(app)
        .args(args)
        .status()
        .map_err(|e| BuildError::io(format!("failed to run {}", app.display()), e))?;
    Ok(status.code().unwrap_or(1))
}

/// Build and run the same program with the reference Go toolchain and
/// diff stdout, stderr, and the exit code.
fn cmp_test(pkg_path: &str, app: &Path, args: &[String]) -> Result<i32, BuildError> {
    let ours = Command::new(app)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| BuildError::io(format!("failed to run {}", app.display()), e))?;

    let theirs = Command::new("go")
        .arg("run")
        .arg(pkg_path)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| BuildError::io("failed to run go", e))?;

    let mut failed = false;
    if ours.stdout != theirs.stdout {
        failed = true;
        eprintln!(
            "cmptest: stdout mismatch\n--- llgo ---\n{}--- go ---\n{}",
            String::from_utf8_lossy(&ours.stdout),
            String::from_utf8_lossy(&theirs.stdout)
        );
    }
    if ours.stderr != theirs.stderr {
        failed = true;
        eprintln!(
            "cmptest: stderr mismatch\n--- llgo ---\n{}--- go ---\n{}",
            String::from_utf8_lossy(&ours.stderr),
            String::from_utf8_lossy(&theirs.stderr)
        );
    }
    let ours_code = ours.status.code().unwrap_or(1);
    let theirs_code = theirs.status.code().unwrap_or(1);
    if ours_code != theirs_code {
        failed = true;
        eprintln!("cmptest: exit code mismatch: llgo={ours_code} go={theirs_code}");
    }
    Ok(if failed { 1 } else { 0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_path_prefers_gobin() {
        std::env::set_var("GOBIN", "/tmp/llgo-test-bin");
        assert_eq!(default_bin_path(), PathBuf::from("/tmp/llgo-test-bin"));
        std::env::remove_var("GOBIN");

        std::env::set_var("GOPATH", "/tmp/llgo-test-gopath");
        assert_eq!(
            default_bin_path(),
            PathBuf::from("/tmp/llgo-test-gopath").join("bin")
        );
        std::env::remove_var("GOPATH");
    }

    #[test]
    fn mangled_paths_are_file_safe() {
        assert_eq!(mangle("llgo/internal/lib/errors"), "llgo_internal_lib_errors");
        assert_eq!(mangle("main"), "main");
    }

    #[test]
    fn link_inputs_split_flag_strings() {
        let mut inputs = Vec::new();
        append_link_input(&mut inputs, "/tmp/a.ll");
        append_link_input(&mut inputs, "-l sqlite3 -L /opt/lib");
        assert_eq!(inputs, vec!["/tmp/a.ll", "-l", "sqlite3", "-L", "/opt/lib"]);
    }
}
