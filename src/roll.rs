//! Keeping third-party pieces of the checkout current: snapshots of
//! directories from an upstream checkout, and version-pinned prebuilt
//! binaries.

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::storage::{artifact_path, download_public, extract_file};
use crate::util::process::check_output;

pub const STAMP_FILE: &str = "STAMP";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    UpToDate(String),
    Downloaded(String),
}

/// Fetches `<category>/<version>/<platform>.zip` for each platform and
/// extracts `binary` into `prebuilt_dir/<platform>/`, unless
/// `prebuilt_dir/STAMP` already names the wanted version.
pub fn fetch_prebuilt(
    client: &Client,
    version_file: &Path,
    prebuilt_dir: &Path,
    category: &str,
    platforms: &[String],
    binary: &str,
) -> Result<FetchOutcome> {
    fetch_prebuilt_with(version_file, prebuilt_dir, category, platforms, binary, |gs_path, dest| {
        download_public(client, gs_path, dest)
    })
}

pub fn fetch_prebuilt_with<F>(
    version_file: &Path,
    prebuilt_dir: &Path,
    category: &str,
    platforms: &[String],
    binary: &str,
    mut download: F,
) -> Result<FetchOutcome>
where
    F: FnMut(&str, &Path) -> Result<()>,
{
    let version = fs::read_to_string(version_file)
        .with_context(|| format!("Reading {}", version_file.display()))?
        .trim()
        .to_string();
    let stamp_path = prebuilt_dir.join(STAMP_FILE);
    // A missing stamp just means nothing was fetched yet.
    if let Ok(current) = fs::read_to_string(&stamp_path) {
        if current.trim() == version {
            log::debug!("{} already at {}", prebuilt_dir.display(), version);
            return Ok(FetchOutcome::UpToDate(version));
        }
    }

    fs::create_dir_all(prebuilt_dir)?;
    for platform in platforms {
        let gs_path = artifact_path(category, &version, platform, ".zip");
        let tmp = tempfile::Builder::new().suffix(".zip").tempfile()?;
        println!("Downloading {}", gs_path);
        download(&gs_path, tmp.path())?;
        extract_file(tmp.path(), binary, &prebuilt_dir.join(platform))
            .with_context(|| format!("Extracting {} for {}", binary, platform))?;
    }
    fs::write(&stamp_path, &version)?;
    Ok(FetchOutcome::Downloaded(version))
}

/// What to take from the upstream checkout.
#[derive(Debug, Clone, Default)]
pub struct SnapshotPlan {
    /// Directories replaced wholesale by their upstream contents.
    pub dirs: Vec<String>,
    /// Single files copied over.
    pub files: Vec<String>,
    /// Files inside `dirs` that keep their local contents.
    pub preserve: Vec<String>,
}

impl SnapshotPlan {
    /// The directories this checkout tracks from Chromium.
    pub fn chromium() -> Self {
        let dirs = [
            "base", "build", "cc", "gpu", "sandbox/linux", "sdch", "skia", "testing",
            "third_party/android_testrunner", "third_party/ashmem", "third_party/binutils",
            "third_party/boringssl", "third_party/brotli", "third_party/checkstyle",
            "third_party/cython", "third_party/fontconfig", "third_party/freetype2",
            "third_party/harfbuzz-ng", "third_party/iccjpeg", "third_party/jinja2",
            "third_party/jstemplate", "third_party/khronos", "third_party/libXNVCtrl",
            "third_party/libevent", "third_party/libjpeg", "third_party/libpng",
            "third_party/libxml", "third_party/markupsafe", "third_party/mesa",
            "third_party/modp_b64", "third_party/ots", "third_party/ply",
            "third_party/protobuf", "third_party/pymock", "third_party/qcms", "third_party/re2",
            "third_party/sfntly", "third_party/smhasher", "third_party/tcmalloc",
            "third_party/yasm", "third_party/zlib", "tools/android", "tools/clang", "tools/gdb",
            "tools/generate_library_loader", "tools/git", "tools/gritsettings",
            "tools/idl_parser", "tools/json_comment_eater", "tools/linux", "tools/msan",
            "tools/protoc_wrapper", "tools/relocation_packer", "tools/valgrind", "tools/vim",
            "tools/xdisplaycheck", "url", "ui/gl",
        ];
        Self {
            dirs: dirs.iter().map(|s| s.to_string()).collect(),
            files: vec!["sandbox/sandbox_export.h".to_string(), ".clang-format".to_string()],
            preserve: vec!["build/module_args/mojo.gni".to_string()],
        }
    }
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to).with_context(|| format!("Copying {} to {}", from.display(), to.display()))?;
    Ok(())
}

/// Applies `plan`, taking the file list of each directory from `list_files`.
pub fn snapshot_dirs_with<F>(upstream: &Path, dest: &Path, plan: &SnapshotPlan, mut list_files: F) -> Result<()>
where
    F: FnMut(&str) -> Result<Vec<String>>,
{
    let mut kept = Vec::new();
    for rel in &plan.preserve {
        if let Ok(contents) = fs::read(dest.join(rel)) {
            kept.push((rel, contents));
        }
    }

    for dir in &plan.dirs {
        let local = dest.join(dir);
        if local.exists() {
            println!("removing directory {}", dir);
            fs::remove_dir_all(&local).with_context(|| format!("Removing {}", local.display()))?;
        }
        println!("cloning directory {}", dir);
        for file in list_files(dir)? {
            copy_file(&upstream.join(&file), &dest.join(&file))?;
        }
    }
    for file in &plan.files {
        copy_file(&upstream.join(file), &dest.join(file))?;
    }

    for (rel, contents) in kept {
        let path = dest.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
    }
    Ok(())
}

fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(dir);
    check_output(&mut cmd)
}

/// `HEAD` of the git checkout at `dir`.
pub fn git_revision(dir: &Path) -> Result<String> {
    Ok(git(dir, &["rev-parse", "HEAD"])?.trim().to_string())
}

/// Applies `plan` using the files git tracks upstream. Returns the upstream
/// revision the snapshot was taken at.
pub fn snapshot_dirs(upstream: &Path, dest: &Path, plan: &SnapshotPlan) -> Result<String> {
    snapshot_dirs_with(upstream, dest, plan, |dir| {
        Ok(git(upstream, &["ls-files", dir])?.lines().map(str::to_string).collect())
    })?;
    git_revision(upstream)
}

/// Platforms the prebuilt network service is published for.
pub fn default_platforms() -> Vec<String> {
    vec!["linux-x64".to_string(), "android-arm".to_string()]
}

/// The prebuilt directory that sits next to a version file.
pub fn prebuilt_dir_for(version_file: &Path) -> PathBuf {
    version_file
        .parent()
        .map(|p| p.join("prebuilt"))
        .unwrap_or_else(|| PathBuf::from("prebuilt"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::zip_single_file;
    use walkdir::WalkDir;

    #[test]
    fn stamp_controls_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let version_file = dir.path().join("VERSION");
        fs::write(&version_file, "abc123\n").unwrap();
        let prebuilt = prebuilt_dir_for(&version_file);
        let binary_src = dir.path().join("network_service.mojo");
        fs::write(&binary_src, b"service").unwrap();

        let mut fetched = Vec::new();
        let platforms = default_platforms();
        let outcome = fetch_prebuilt_with(&version_file, &prebuilt, "network", &platforms, "network_service.mojo", |gs, dest| {
            fetched.push(gs.to_string());
            zip_single_file(&binary_src, dest, false)
        })
        .unwrap();
        assert_eq!(outcome, FetchOutcome::Downloaded("abc123".to_string()));
        assert_eq!(
            fetched,
            vec!["gs://mojo/network/abc123/linux-x64.zip", "gs://mojo/network/abc123/android-arm.zip"]
        );
        assert_eq!(fs::read(prebuilt.join("android-arm/network_service.mojo")).unwrap(), b"service");
        assert_eq!(fs::read_to_string(prebuilt.join(STAMP_FILE)).unwrap(), "abc123");

        let outcome = fetch_prebuilt_with(&version_file, &prebuilt, "network", &platforms, "network_service.mojo", |_, _| {
            panic!("should not download when the stamp matches")
        })
        .unwrap();
        assert_eq!(outcome, FetchOutcome::UpToDate("abc123".to_string()));
    }

    #[test]
    fn snapshot_replaces_dirs_and_keeps_preserved_files() {
        let upstream = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        for (path, body) in [
            ("build/config.gni", "upstream config"),
            ("build/module_args/mojo.gni", "upstream args"),
            ("url/gurl.cc", "gurl"),
            (".clang-format", "style"),
        ] {
            let p = upstream.path().join(path);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, body).unwrap();
        }
        fs::create_dir_all(dest.path().join("build/module_args")).unwrap();
        fs::write(dest.path().join("build/stale.gni"), "stale").unwrap();
        fs::write(dest.path().join("build/module_args/mojo.gni"), "local args").unwrap();

        let plan = SnapshotPlan {
            dirs: vec!["build".to_string(), "url".to_string()],
            files: vec![".clang-format".to_string()],
            preserve: vec!["build/module_args/mojo.gni".to_string()],
        };
        let root = upstream.path().to_path_buf();
        snapshot_dirs_with(upstream.path(), dest.path(), &plan, |dir| {
            Ok(WalkDir::new(root.join(dir))
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.path().strip_prefix(&root).unwrap().to_string_lossy().into_owned())
                .collect())
        })
        .unwrap();

        let d = dest.path();
        assert!(!d.join("build/stale.gni").exists());
        assert_eq!(fs::read_to_string(d.join("build/config.gni")).unwrap(), "upstream config");
        assert_eq!(fs::read_to_string(d.join("build/module_args/mojo.gni")).unwrap(), "local args");
        assert_eq!(fs::read_to_string(d.join("url/gurl.cc")).unwrap(), "gurl");
        assert_eq!(fs::read_to_string(d.join(".clang-format")).unwrap(), "style");
    }

    #[test]
    fn chromium_plan_is_well_formed() {
        let plan = SnapshotPlan::chromium();
        assert!(plan.dirs.contains(&"base".to_string()));
        assert!(plan.preserve.iter().all(|p| plan.dirs.iter().any(|d| p.starts_with(d.as_str()))));
    }
}
