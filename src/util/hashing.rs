// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

use anyhow::{Context, Result};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::util::process::check_output;

fn digest_file<D: Digest>(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Opening {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = D::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha1_file(path: &Path) -> Result<String> {
    digest_file::<Sha1>(path)
}

pub fn sha256_file(path: &Path) -> Result<String> {
    digest_file::<Sha256>(path)
}

/// Resolved library paths from `ldd` output. Virtual objects (vdso) and
/// unresolved entries are skipped.
pub fn parse_ldd_output(output: &str) -> Vec<PathBuf> {
    let mut libs = Vec::new();
    for line in output.lines() {
        let Some((_, rest)) = line.split_once("=>") else {
            continue;
        };
        let Some(path) = rest.split_whitespace().next() else {
            continue;
        };
        if path.starts_with('/') {
            libs.push(PathBuf::from(path));
        }
    }
    libs
}

/// Folds a binary's own hash with the hashes of its dependencies. Dependency
/// order does not matter.
pub fn combine_hashes(binary_hash: &str, dep_hashes: &[String]) -> String {
    let mut sorted: Vec<&String> = dep_hashes.iter().collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    hasher.update(binary_hash.as_bytes());
    for h in sorted {
        hasher.update(b"\n");
        hasher.update(h.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Hash of `binary` and every shared library it links that lives under
/// `build_dir`. System libraries are not part of the key.
pub fn transitive_hash(binary: &Path, build_dir: &Path) -> Result<String> {
    transitive_hash_with(binary, build_dir, |binary| {
        let mut ldd = Command::new("ldd");
        ldd.arg(binary);
        check_output(&mut ldd)
    })
}

/// [`transitive_hash`] with the `ldd` invocation supplied by the caller.
///
/// `ldd` reports resolved absolute paths, so both sides of the
/// "lives under `build_dir`" check are canonicalized first.
pub fn transitive_hash_with<F>(binary: &Path, build_dir: &Path, list_deps: F) -> Result<String>
where
    F: FnOnce(&Path) -> Result<String>,
{
    let binary_hash = sha256_file(binary)?;
    let output = list_deps(binary).with_context(|| format!("Listing dependencies of {}", binary.display()))?;
    let build_dir = canonical(build_dir);
    let mut dep_hashes = Vec::new();
    for lib in parse_ldd_output(&output) {
        let lib = canonical(&lib);
        if lib.starts_with(&build_dir) {
            log::debug!("  dependency {}", lib.display());
            dep_hashes.push(sha256_file(&lib)?);
        }
    }
    Ok(combine_hashes(&binary_hash, &dep_hashes))
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
