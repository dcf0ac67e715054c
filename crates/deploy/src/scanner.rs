//! Project file listing.
//!
//! Walks the project tree into an ordered list of absolute file paths.
//! `.deployignore` patterns (gitignore semantics) and a fixed set of
//! always-excluded entries are skipped; when the package manifest names
//! a `files` allowlist, only those files and directories are walked.

use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::DeployError;
use crate::manifest::PackageManifest;

/// Entries never deployed regardless of ignore rules.
const ALWAYS_IGNORED: &[&str] = &[".git", ".hg", ".svn", "node_modules", ".deployignore"];

/// Lists the files to deploy under `root`, sorted for determinism.
pub fn list_files(root: &Path, manifest: &PackageManifest) -> Result<Vec<PathBuf>, DeployError> {
    let ignore = load_ignore(root);
    let mut files = Vec::new();

    match &manifest.files {
        Some(allow) if !allow.is_empty() => {
            for entry in allow {
                let path = root.join(entry);
                if path.is_dir() {
                    walk(&path, &ignore, &mut files)?;
                } else if path.is_file() {
                    files.push(path);
                }
                // Allowlist entries that do not exist are skipped.
            }
        }
        _ => walk(root, &ignore, &mut files)?,
    }

    files.sort();
    Ok(files)
}

fn load_ignore(root: &Path) -> Gitignore {
    let mut builder = GitignoreBuilder::new(root);
    // Missing `.deployignore` just yields an empty matcher.
    let _ = builder.add(root.join(".deployignore"));
    builder.build().unwrap_or_else(|_| Gitignore::empty())
}

fn walk(current: &Path, ignore: &Gitignore, files: &mut Vec<PathBuf>) -> Result<(), DeployError> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        let name = entry.file_name();

        if ALWAYS_IGNORED.iter().any(|skip| name == *skip) {
            continue;
        }
        if ignore.matched(&path, meta.is_dir()).is_ignore() {
            continue;
        }

        if meta.is_dir() {
            walk(&path, ignore, files)?;
        } else if meta.is_file() {
            files.push(path);
        }
    }
    Ok(())
}
