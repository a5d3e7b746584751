//! Kernel files.
//!
//! A kernel is an AST plus the id of its header root, serialized as
//! JSON so the engine can be driven without a C frontend. The arena
//! representation serializes directly: nodes are a flat list and
//! children are indices into it.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ast::{Ast, NodeId};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KernelFile {
    pub name: String,
    pub root: NodeId,
    pub ast: Ast,
}

impl KernelFile {
    pub fn new(name: &str, ast: Ast, root: NodeId) -> Self {
        KernelFile {
            name: name.to_string(),
            root,
            ast,
        }
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        serde_json::from_str(&text)
            .map_err(|e| format!("cannot parse {}: {}", path.display(), e))
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| format!("cannot serialize kernel: {}", e))?;
        fs::write(path, text).map_err(|e| format!("cannot write {}: {}", path.display(), e))
    }
}
