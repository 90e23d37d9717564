use std::path::{Path, PathBuf};

use crate::config::{Config, Sanitizer, TargetOs};

pub const SRC_ROOT_ENV: &str = "MOJO_SRC_ROOT";

/// Commonly used locations inside a checkout, derived from a config or an
/// explicit build directory.
#[derive(Debug, Clone)]
pub struct Paths {
    pub src_root: PathBuf,
    pub build_dir: PathBuf,
    pub shell_path: PathBuf,
}

impl Paths {
    pub fn for_config(src_root: &Path, config: &Config) -> Self {
        let mut subdir = String::new();
        match config.target_os() {
            TargetOs::Android => subdir.push_str("android_"),
            TargetOs::ChromeOs => subdir.push_str("chromeos_"),
            _ => {}
        }
        subdir.push_str(if config.is_debug() { "Debug" } else { "Release" });
        if config.sanitizer() == Some(Sanitizer::Asan) {
            subdir.push_str("_asan");
        }
        Self::for_build_dir(src_root, &src_root.join("out").join(subdir))
    }

    pub fn for_build_dir(src_root: &Path, build_dir: &Path) -> Self {
        let build_dir = if build_dir.is_absolute() {
            build_dir.to_path_buf()
        } else {
            src_root.join(build_dir)
        };
        // Named after the host: a Windows target built elsewhere still gets no suffix.
        let shell_name = if cfg!(windows) { "mojo_shell.exe" } else { "mojo_shell" };
        Self {
            src_root: src_root.to_path_buf(),
            shell_path: build_dir.join(shell_name),
            build_dir,
        }
    }

    /// The Android shell package built alongside the native shell.
    pub fn apk_path(&self) -> PathBuf {
        self.build_dir.join("apks").join("MojoShell.apk")
    }

    /// The checkout's bundled adb if present, otherwise whatever is on PATH.
    pub fn adb_path(&self) -> String {
        let bundled = self
            .src_root
            .join("third_party")
            .join("android_tools")
            .join("sdk")
            .join("platform-tools")
            .join("adb");
        if bundled.is_file() {
            bundled.to_string_lossy().into_owned()
        } else {
            "adb".to_string()
        }
    }

    pub fn src_rel_path(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.src_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Flag, then environment, then persisted setting, then the working
/// directory. The result is always absolute.
pub fn resolve_src_root(flag: Option<&Path>, setting: Option<&Path>) -> PathBuf {
    let chosen = flag
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(SRC_ROOT_ENV).map(PathBuf::from))
        .or_else(|| setting.map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    absolute(&chosen)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}
