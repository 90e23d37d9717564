use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

use crate::roll::git_revision;
use crate::util::process::check_call;

/// Decides whether a path under the copied root is taken. Directories that
/// are rejected are not descended into.
pub type Filter = fn(&Path) -> bool;

fn extension_is(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e == ext)
}

/// Top-level `.mojo` apps, without the apptests.
pub fn mojo_filter(path: &Path) -> bool {
    path.is_file()
        && extension_is(path, "mojo")
        && !path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().contains("apptests"))
}

/// Generated `.sky` files and mojom Dart bindings only.
pub fn gen_filter(path: &Path) -> bool {
    path.is_dir() || extension_is(path, "sky") || path.to_string_lossy().ends_with(".mojom.dart")
}

pub fn sky_or_dart_filter(path: &Path) -> bool {
    path.is_dir() || extension_is(path, "sky") || extension_is(path, "dart")
}

/// Recreates `to` and fills it with the files under `from` that `filter`
/// accepts, keeping their relative layout. Returns how many files were copied.
pub fn copy_filtered(from: &Path, to: &Path, filter: Filter) -> Result<usize> {
    if to.exists() {
        fs::remove_dir_all(to).with_context(|| format!("Removing {}", to.display()))?;
    }
    fs::create_dir_all(to).with_context(|| format!("Creating {}", to.display()))?;

    let mut copied = 0;
    let walker = WalkDir::new(from)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || filter(e.path()));
    for entry in walker {
        let entry = entry.with_context(|| format!("Walking {}", from.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(from)?;
        let dest = to.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(entry.path(), &dest).with_context(|| format!("Copying {}", entry.path().display()))?;
        copied += 1;
    }
    log::debug!("Copied {} files from {} to {}", copied, from.display(), to.display());
    Ok(copied)
}

/// Build directory deployed from, relative to the source root.
pub const DEPLOY_BUILD_DIR: &str = "out/android_Release";
const DEPLOYED_APKS: [&str; 2] = ["MojoShell.apk", "MojoShortcuts.apk"];

pub struct Deployment {
    pub src_root: PathBuf,
    pub deploy_root: PathBuf,
    pub commit: bool,
}

impl Deployment {
    fn build_dir(&self) -> PathBuf {
        self.src_root.join(DEPLOY_BUILD_DIR)
    }

    /// Copies the release build and the Sky sources into the deploy root.
    pub fn copy_outputs(&self) -> Result<()> {
        let build_dir = self.build_dir();
        let src = &self.src_root;
        let dst = &self.deploy_root;

        copy_filtered(&build_dir, &dst.join("mojo"), mojo_filter)?;
        copy_filtered(&src.join("sky/examples"), &dst.join("sky/examples"), sky_or_dart_filter)?;
        copy_filtered(&src.join("sky/framework"), &dst.join("sky/framework"), sky_or_dart_filter)?;
        copy_filtered(&build_dir.join("gen"), &dst.join("gen"), gen_filter)?;

        for apk in DEPLOYED_APKS {
            let from = build_dir.join("apks").join(apk);
            fs::copy(&from, dst.join(apk)).with_context(|| format!("Copying {}", from.display()))?;
        }
        Ok(())
    }

    pub fn commit_message(&self, revision: &str) -> String {
        format!("{} from {}", DEPLOY_BUILD_DIR, revision)
    }

    pub fn run(&self) -> Result<()> {
        self.copy_outputs()?;
        if !self.commit {
            println!("Copied build to {} (not committing)", self.deploy_root.display());
            return Ok(());
        }
        let revision = git_revision(&self.src_root)?;
        check_call(Command::new("git").args(["add", "."]).current_dir(&self.deploy_root))?;
        check_call(
            Command::new("git")
                .args(["commit", "-m", &self.commit_message(&revision)])
                .current_dir(&self.deploy_root),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, rel).unwrap();
    }

    #[test]
    fn mojo_filter_takes_top_level_apps_only() {
        let from = tempfile::tempdir().unwrap();
        let to = tempfile::tempdir().unwrap();
        for rel in ["shell.mojo", "net_apptests.mojo", "libfoo.so", "gen/nested.mojo"] {
            touch(from.path(), rel);
        }
        let dest = to.path().join("mojo");
        assert_eq!(copy_filtered(from.path(), &dest, mojo_filter).unwrap(), 1);
        assert!(dest.join("shell.mojo").exists());
        assert!(!dest.join("net_apptests.mojo").exists());
        assert!(!dest.join("gen").exists());
    }

    #[test]
    fn gen_filter_keeps_layout_and_skips_plain_dart() {
        let from = tempfile::tempdir().unwrap();
        let to = tempfile::tempdir().unwrap();
        for rel in ["a/b/view.sky", "a/b/view.mojom.dart", "a/b/main.dart", "a/c/x.h"] {
            touch(from.path(), rel);
        }
        let dest = to.path().join("gen");
        touch(&dest, "stale.sky");
        assert_eq!(copy_filtered(from.path(), &dest, gen_filter).unwrap(), 2);
        assert!(dest.join("a/b/view.sky").exists());
        assert!(dest.join("a/b/view.mojom.dart").exists());
        assert!(!dest.join("a/b/main.dart").exists());
        assert!(!dest.join("stale.sky").exists());
    }

    #[test]
    fn sky_or_dart_takes_all_dart() {
        let from = tempfile::tempdir().unwrap();
        let to = tempfile::tempdir().unwrap();
        for rel in ["widgets/basic.dart", "home.sky", "README.md"] {
            touch(from.path(), rel);
        }
        assert_eq!(copy_filtered(from.path(), to.path(), sky_or_dart_filter).unwrap(), 2);
    }

    #[test]
    fn copies_outputs_without_committing() {
        let src = tempfile::tempdir().unwrap();
        let deploy = tempfile::tempdir().unwrap();
        for rel in [
            "out/android_Release/shell.mojo",
            "out/android_Release/apks/MojoShell.apk",
            "out/android_Release/apks/MojoShortcuts.apk",
            "out/android_Release/gen/sky/a.sky",
            "sky/examples/hello.dart",
            "sky/framework/fn.dart",
        ] {
            touch(src.path(), rel);
        }
        let deployment = Deployment {
            src_root: src.path().to_path_buf(),
            deploy_root: deploy.path().to_path_buf(),
            commit: false,
        };
        deployment.run().unwrap();
        let d = deploy.path();
        for rel in [
            "mojo/shell.mojo",
            "MojoShell.apk",
            "MojoShortcuts.apk",
            "gen/sky/a.sky",
            "sky/examples/hello.dart",
            "sky/framework/fn.dart",
        ] {
            assert!(d.join(rel).exists(), "{} missing", rel);
        }
        assert_eq!(deployment.commit_message("abc"), "out/android_Release from abc");
    }
}
