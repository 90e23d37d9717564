//! Build/test configuration for a checkout.
//!
//! A [`Config`] is built once per invocation and never changed afterwards;
//! callers that need a variation clone it and use the `with_*` builders on the
//! copy.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetOs {
    Android,
    ChromeOs,
    Linux,
    Mac,
    Windows,
}

impl TargetOs {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "android" => Some(Self::Android),
            "chromeos" => Some(Self::ChromeOs),
            "linux" => Some(Self::Linux),
            "mac" => Some(Self::Mac),
            "windows" | "win" => Some(Self::Windows),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::ChromeOs => "chromeos",
            Self::Linux => "linux",
            Self::Mac => "mac",
            Self::Windows => "windows",
        }
    }
}

impl fmt::Display for TargetOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetArch {
    X86,
    X64,
    Arm,
}

impl TargetArch {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "x86" => Some(Self::X86),
            "x64" => Some(Self::X64),
            "arm" => Some(Self::Arm),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86 => "x86",
            Self::X64 => "x64",
            Self::Arm => "arm",
        }
    }

    /// Classifies a `uname -m` style machine string.
    pub fn from_machine(machine: &str) -> Option<Self> {
        match machine {
            "x86" | "x86-32" | "x86_32" | "x8632" | "i386" | "i686" | "ia32" | "32" => {
                Some(Self::X86)
            }
            "x86-64" | "amd64" | "x86_64" | "x8664" | "64" => Some(Self::X64),
            m if m.starts_with("arm") || m == "aarch64" => Some(Self::Arm),
            _ => None,
        }
    }
}

impl fmt::Display for TargetArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sanitizer {
    Asan,
}

pub const TEST_TYPE_DEFAULT: &str = "default";
pub const TEST_TYPE_UNIT: &str = "unit";
pub const TEST_TYPE_PERF: &str = "perf";
pub const TEST_TYPE_INTEGRATION: &str = "integration";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    target_os: TargetOs,
    target_arch: TargetArch,
    is_debug: bool,
    is_clang: Option<bool>,
    sanitizer: Option<Sanitizer>,
    test_types: Vec<String>,
    extra: BTreeMap<String, String>,
}

impl Config {
    /// Unset OS/arch default to the host.
    pub fn new(target_os: Option<TargetOs>, target_arch: Option<TargetArch>, is_debug: bool) -> Result<Self> {
        let target_os = match target_os {
            Some(os) => os,
            None => Self::host_os()?,
        };
        let target_arch = match target_arch {
            Some(arch) => arch,
            None => Self::host_arch()?,
        };
        Ok(Self {
            target_os,
            target_arch,
            is_debug,
            is_clang: None,
            sanitizer: None,
            test_types: vec![TEST_TYPE_DEFAULT.to_string()],
            extra: BTreeMap::new(),
        })
    }

    pub fn host_os() -> Result<TargetOs> {
        match std::env::consts::OS {
            "linux" => Ok(TargetOs::Linux),
            "macos" => Ok(TargetOs::Mac),
            "windows" => Ok(TargetOs::Windows),
            other => bail!("Unsupported host OS: {}", other),
        }
    }

    pub fn host_arch() -> Result<TargetArch> {
        let machine = std::env::consts::ARCH;
        TargetArch::from_machine(machine).ok_or_else(|| anyhow!("Cannot identify CPU arch: {}", machine))
    }

    pub fn with_clang(mut self, is_clang: bool) -> Self {
        self.is_clang = Some(is_clang);
        self
    }

    pub fn with_sanitizer(mut self, sanitizer: Option<Sanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn with_test_types(mut self, test_types: Vec<String>) -> Self {
        self.test_types = test_types;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn target_os(&self) -> TargetOs {
        self.target_os
    }

    pub fn target_arch(&self) -> TargetArch {
        self.target_arch
    }

    pub fn is_debug(&self) -> bool {
        self.is_debug
    }

    pub fn is_clang(&self) -> Option<bool> {
        self.is_clang
    }

    pub fn sanitizer(&self) -> Option<Sanitizer> {
        self.sanitizer
    }

    pub fn test_types(&self) -> &[String] {
        &self.test_types
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }

    /// `<os>-<arch>`, as used in artifact names.
    pub fn platform(&self) -> String {
        format!("{}-{}", self.target_os, self.target_arch)
    }

    /// Evaluates a target-OS selector list such as `["*", "!android"]`.
    ///
    /// Entries are `*`, an OS name, or either of those prefixed with `!` to
    /// reject. The last matching entry decides; if none matches the config is
    /// accepted.
    pub fn match_target_os<S: AsRef<str>>(&self, selector: &[S]) -> bool {
        for entry in selector.iter().rev() {
            let entry = entry.as_ref();
            let (invert, name) = match entry.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, entry),
            };
            if name == "*" || name == self.target_os.as_str() {
                return !invert;
            }
        }
        true
    }

    /// Derives a config from the `args.gn` file of a GN build directory.
    pub fn from_gn_args(build_dir: &Path) -> Result<Self> {
        let path = build_dir.join("args.gn");
        let text = fs::read_to_string(&path).with_context(|| format!("Reading {}", path.display()))?;
        Self::from_gn_args_text(&text)
    }

    pub fn from_gn_args_text(text: &str) -> Result<Self> {
        let args = parse_gn_args(text);
        let target_os = match args.get("target_os") {
            Some(v) => Some(TargetOs::from_str(v).ok_or_else(|| anyhow!("Unknown target_os in args.gn: {}", v))?),
            None => None,
        };
        let target_arch = match args.get("target_cpu") {
            Some(v) => Some(TargetArch::from_str(v).ok_or_else(|| anyhow!("Unknown target_cpu in args.gn: {}", v))?),
            None => None,
        };
        let is_debug = args.get("is_debug").map(|v| v == "true").unwrap_or(true);
        let mut config = Self::new(target_os, target_arch, is_debug)?;
        if let Some(v) = args.get("is_clang") {
            config = config.with_clang(v == "true");
        }
        if args.get("is_asan").map(|v| v == "true").unwrap_or(false) {
            config = config.with_sanitizer(Some(Sanitizer::Asan));
        }
        Ok(config)
    }
}

fn parse_gn_args(text: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in text.lines() {
        let line = match line.find('#') {
            Some(idx) => &line[..idx],
            None => line,
        };
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        out.insert(key.trim().to_string(), value.to_string());
    }
    out
}
