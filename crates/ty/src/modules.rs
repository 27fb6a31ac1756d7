//! Module path resolution.
//!
//! `import a.b.c` maps to `a/b/c.ty`, searched relative to the importing
//! module's directory, then `$HOME/.ty`, then the system paths fixed at
//! build time. Resolution happens at compile time; the compiler caches by
//! resolved canonical path so an initializer runs once no matter how many
//! modules import it.

use std::path::{Path, PathBuf};

use crate::location::{SourceMap, SrcId};

/// The source file extension.
pub const MODULE_EXTENSION: &str = "ty";

/// System search roots, fixed at build time.
pub const SYSTEM_PATHS: &[&str] = &["/usr/local/lib/ty", "/usr/lib/ty"];

/// Resolves a `/`-separated module path to an existing file, or `None`.
#[must_use]
pub fn resolve_module_path(sources: &SourceMap, importer: SrcId, module: &str) -> Option<PathBuf> {
    let rel = format!("{module}.{MODULE_EXTENSION}");

    // The importing module's own directory first.
    let importer_dir = Path::new(sources.name(importer)).parent().map(Path::to_path_buf);
    if let Some(dir) = importer_dir {
        let candidate = dir.join(&rel);
        if candidate.is_file() {
            return canonical(candidate);
        }
    }

    // The user's module root.
    if let Ok(home) = std::env::var("HOME") {
        let candidate = Path::new(&home).join(".ty").join(&rel);
        if candidate.is_file() {
            return canonical(candidate);
        }
    }

    for root in SYSTEM_PATHS {
        let candidate = Path::new(root).join(&rel);
        if candidate.is_file() {
            return canonical(candidate);
        }
    }

    None
}

fn canonical(p: PathBuf) -> Option<PathBuf> {
    p.canonicalize().ok().or(Some(p))
}
