//! SSA functions and basic blocks.

use serde::{Deserialize, Serialize};

use crate::instr::Instruction;
use crate::types::{Background, Param, Signature};

/// A basic block: straight-line instructions ending in a terminator.
/// Block 0 is the function entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u32,
    pub instrs: Vec<Instruction>,
    #[serde(default)]
    pub preds: Vec<u32>,
    #[serde(default)]
    pub succs: Vec<u32>,
}

/// One function or method in SSA form.
///
/// An empty `blocks` vector means the function is external: only a
/// declaration is emitted. Methods carry their receiver in `sig.recv`;
/// nested function literals live in `anon_funcs` and reference their
/// captures through `free_vars`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SsaFunction {
    /// Name within the package: `"main"`, `"init"`, `"(T).Sound"`,
    /// `"main$1"`.
    pub name: String,
    pub sig: Signature,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub free_vars: Vec<Param>,
    /// Index of the block control resumes at after a recovered panic.
    #[serde(default)]
    pub recover_block: Option<u32>,
    #[serde(default)]
    pub anon_funcs: Vec<SsaFunction>,
    /// Linkage class the frontend resolved for this definition.
    pub background: Background,
}

impl SsaFunction {
    pub fn has_body(&self) -> bool {
        !self.blocks.is_empty()
    }

    pub fn is_init(&self) -> bool {
        self.name == "init" && self.sig.recv.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Background, GoType, Signature};

    fn decl(name: &str) -> SsaFunction {
        SsaFunction {
            name: name.into(),
            sig: Signature::default(),
            blocks: vec![],
            free_vars: vec![],
            recover_block: None,
            anon_funcs: vec![],
            background: Background::InGo,
        }
    }

    #[test]
    fn declaration_has_no_body() {
        assert!(!decl("Println").has_body());
    }

    #[test]
    fn init_detection_excludes_methods() {
        let mut f = decl("init");
        assert!(f.is_init());
        f.sig.recv = Some(crate::types::Param {
            name: "t".into(),
            ty: GoType::Named { pkg: "p".into(), name: "T".into() },
        });
        assert!(!f.is_init());
    }
}
