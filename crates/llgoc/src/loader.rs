//! Loading typed SSA programs from the external frontend.
//!
//! The frontend is a separate tool (`llgo-ssadump`) that parses, type
//! checks, and SSA-builds Go packages, then serializes the result as JSON
//! in the `llgo-ssa` wire format. This module accepts three pattern
//! shapes:
//!
//! - a `.ssa.json` file: parsed directly;
//! - a directory: every `*.ssa.json` inside is parsed and merged;
//! - anything else: forwarded to the dumper named by `LLGO_SSADUMP`
//!   (default `llgo-ssadump`), whose stdout is parsed.
//!
//! Parse failures are user errors: the inputs were bad, not the build.

use std::path::Path;
use std::process::{Command, Stdio};

use llgo_common::BuildError;
use llgo_ssa::SsaProgram;

/// Load and merge the SSA program for the given patterns.
pub fn load(patterns: &[String]) -> Result<SsaProgram, BuildError> {
    let mut merged = SsaProgram::default();
    let mut external: Vec<String> = Vec::new();

    for pattern in patterns {
        let path = Path::new(pattern);
        if path.is_file() && pattern.ends_with(".ssa.json") {
            merge(&mut merged, parse_file(path)?);
        } else if path.is_dir() {
            let mut entries: Vec<_> = std::fs::read_dir(path)
                .map_err(|e| BuildError::io(format!("cannot read {pattern}"), e))?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.to_string_lossy().ends_with(".ssa.json"))
                .collect();
            entries.sort();
            if entries.is_empty() {
                return Err(BuildError::Usage(format!(
                    "no Go files in matched packages: {pattern}"
                )));
            }
            for entry in entries {
                merge(&mut merged, parse_file(&entry)?);
            }
        } else {
            external.push(pattern.clone());
        }
    }

    if !external.is_empty() {
        merge(&mut merged, run_dumper(&external)?);
    }
    if merged.packages.is_empty() {
        return Err(BuildError::Usage("no Go files in matched packages".into()));
    }
    Ok(merged)
}

fn parse_file(path: &Path) -> Result<SsaProgram, BuildError> {
    let data = std::fs::read(path)
        .map_err(|e| BuildError::io(format!("cannot read {}", path.display()), e))?;
    serde_json::from_slice(&data)
        .map_err(|e| BuildError::Usage(format!("invalid SSA input {}: {e}", path.display())))
}

fn run_dumper(patterns: &[String]) -> Result<SsaProgram, BuildError> {
    let dumper = std::env::var("LLGO_SSADUMP").unwrap_or_else(|_| "llgo-ssadump".into());
    let output = Command::new(&dumper)
        .args(patterns)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| BuildError::io(format!("failed to invoke {dumper}"), e))?;
    if !output.status.success() {
        return Err(BuildError::Usage(format!(
            "{dumper} failed:\n{}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    serde_json::from_slice(&output.stdout)
        .map_err(|e| BuildError::Usage(format!("invalid SSA output from {dumper}: {e}")))
}

/// Merge one loaded program into the accumulator. Packages deduplicate by
/// import path (first wins); named types merge with later definitions
/// winning, which is the order patches rely on.
fn merge(acc: &mut SsaProgram, next: SsaProgram) {
    for pkg in next.packages {
        if acc.packages.iter().any(|p| p.path == pkg.path) {
            continue;
        }
        acc.packages.push(pkg);
    }
    acc.types.extend(next.types);
}

#[cfg(test)]
mod tests {
    use super::*;
    use llgo_ssa::{Background, Member, SsaFunction, SsaPackage, Signature};

    fn program_with(path: &str) -> SsaProgram {
        SsaProgram {
            packages: vec![SsaPackage {
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
                path: path.to_string(),
                llgo_package: None,
                llgo_files: None,
                deps: vec![],
                members: vec![Member::Func(SsaFunction {
                    name: "F".into(),
                    sig: Signature::default(),
                    blocks: vec![],
                    free_vars: vec![],
                    recover_block: None,
                    anon_funcs: vec![],
                    background: Background::InGo,
                })],
            }],
            types: Default::default(),
        }
    }

    #[test]
    fn loads_a_single_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.ssa.json");
        std::fs::write(&file, serde_json::to_vec(&program_with("main")).unwrap()).unwrap();

        let loaded = load(&[file.display().to_string()]).unwrap();
        assert_eq!(loaded.packages.len(), 1);
        assert_eq!(loaded.packages[0].path, "main");
    }

    #[test]
    fn loads_and_merges_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.ssa.json"),
            serde_json::to_vec(&program_with("a")).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.ssa.json"),
            serde_json::to_vec(&program_with("b")).unwrap(),
        )
        .unwrap();

        let loaded = load(&[dir.path().display().to_string()]).unwrap();
        assert_eq!(loaded.packages.len(), 2);
    }

    #[test]
    fn duplicate_packages_keep_first() {
        let mut acc = program_with("main");
        merge(&mut acc, program_with("main"));
        assert_eq!(acc.packages.len(), 1);
    }

    #[test]
    fn empty_directory_is_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&[dir.path().display().to_string()]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn malformed_json_is_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bad.ssa.json");
        std::fs::write(&file, b"{ not json").unwrap();
        let err = load(&[file.display().to_string()]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
