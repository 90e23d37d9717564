//! Build-file checks for the SDK (`mojo/public/`) and EDK (`mojo/edk/`).

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

const SDK_WHITELISTED_EXTERNAL_PATHS: [&str; 3] = ["//testing/gtest", "//third_party/cython", "//third_party/khronos"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Package {
    Sdk,
    Edk,
}

impl Package {
    pub const ALL: [Package; 2] = [Package::Sdk, Package::Edk];

    fn name(self) -> &'static str {
        match self {
            Package::Sdk => "SDK",
            Package::Edk => "EDK",
        }
    }

    fn path_prefix(self) -> &'static str {
        match self {
            Package::Sdk => "mojo/public/",
            Package::Edk => "mojo/edk/",
        }
    }

    fn source_set_types(self) -> &'static [&'static str] {
        match self {
            Package::Sdk => &["mojo_sdk_source_set", "python_binary_source_set"],
            Package::Edk => &["mojo_edk_source_set"],
        }
    }

    /// `BUILD.gn` or `.gni` files inside this package.
    pub fn contains_build_file(self, path: &str) -> bool {
        path.starts_with(self.path_prefix()) && (path.ends_with("/BUILD.gn") || path.ends_with(".gni"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresubmitError {
    pub message: String,
    pub items: Vec<String>,
}

impl fmt::Display for PresubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for item in &self.items {
            writeln!(f, "  {}", item)?;
        }
        Ok(())
    }
}

/// A build file to check: path relative to the source root, and its text.
pub struct BuildFile {
    pub path: String,
    pub contents: String,
}

fn absolute_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""(//[^"]*)""#).expect("static regex"))
}

fn source_set_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-z_]*source_set\(").expect("static regex"))
}

fn package_files<'a>(files: &'a [BuildFile], package: Package) -> impl Iterator<Item = &'a BuildFile> {
    files.iter().filter(move |f| package.contains_build_file(&f.path))
}

/// `(file, line, referenced path)` for every disallowed absolute reference.
fn illegal_absolute_paths(files: &[BuildFile], package: Package) -> Vec<(String, usize, String)> {
    let mut found = Vec::new();
    for file in package_files(files, package) {
        for (idx, line) in file.contents.lines().enumerate() {
            let Some(caps) = absolute_path_re().captures(line) else {
                continue;
            };
            let referenced = &caps[1];
            // The EDK may depend on anything outside mojo.
            if package == Package::Edk && !referenced.starts_with("//mojo") {
                continue;
            }
            if SDK_WHITELISTED_EXTERNAL_PATHS.contains(&referenced) {
                continue;
            }
            found.push((file.path.clone(), idx + 1, referenced.to_string()));
        }
    }
    found
}

fn check_absolute_paths(files: &[BuildFile], package: Package) -> Vec<PresubmitError> {
    let mut sdk_refs = Vec::new();
    let mut edk_refs = Vec::new();
    let mut external_refs = Vec::new();

    for (file, line, referenced) in illegal_absolute_paths(files, package) {
        let item = format!("{}, line {} ({})", file, line, referenced);
        if referenced.starts_with("//mojo/public") {
            sdk_refs.push(item);
        } else if package == Package::Sdk {
            external_refs.push(item);
        } else if referenced.starts_with("//mojo/edk") {
            edk_refs.push(item);
        }
    }

    let mut errors = Vec::new();
    if !sdk_refs.is_empty() {
        errors.push(PresubmitError {
            message: format!(
                "Found references to the SDK via absolute paths within {} buildfiles.",
                package.name()
            ),
            items: sdk_refs,
        });
    }
    if !external_refs.is_empty() {
        errors.push(PresubmitError {
            message: "Found disallowed external paths within SDK buildfiles.".to_string(),
            items: external_refs,
        });
    }
    if !edk_refs.is_empty() {
        errors.push(PresubmitError {
            message: "Found references to the EDK via absolute paths within EDK buildfiles.".to_string(),
            items: edk_refs,
        });
    }
    errors
}

fn check_source_set_types(files: &[BuildFile], package: Package) -> Option<PresubmitError> {
    let allowed = package.source_set_types();
    let mut items = Vec::new();
    for file in package_files(files, package) {
        for (idx, line) in file.contents.lines().enumerate() {
            let Some(m) = source_set_re().find(line) else {
                continue;
            };
            let kind = m.as_str().trim_end_matches('(');
            if !allowed.contains(&kind) {
                items.push(format!("{}, line {}", file.path, idx + 1));
            }
        }
    }
    if items.is_empty() {
        return None;
    }
    Some(PresubmitError {
        message: format!(
            "All source sets in the {} must be constructed via {}.",
            package.name(),
            allowed.join(" or ")
        ),
        items,
    })
}

pub fn check_build_files(files: &[BuildFile]) -> Vec<PresubmitError> {
    let mut errors = Vec::new();
    for package in Package::ALL {
        errors.extend(check_absolute_paths(files, package));
        errors.extend(check_source_set_types(files, package));
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, contents: &str) -> BuildFile {
        BuildFile {
            path: path.to_string(),
            contents: contents.to_string(),
        }
    }

    #[test]
    fn sdk_reference_categories() {
        let files = [file(
            "mojo/public/cpp/bindings/BUILD.gn",
            "mojo_sdk_source_set(\"b\") {\n  deps = [ \"//mojo/public/cpp/system\" ]\n  deps += [ \"//base\" ]\n  deps += [ \"//testing/gtest\" ]\n}\n",
        )];
        let errors = check_build_files(&files);
        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors[0].items,
            ["mojo/public/cpp/bindings/BUILD.gn, line 2 (//mojo/public/cpp/system)"]
        );
        assert!(errors[0].message.contains("within SDK buildfiles"));
        assert_eq!(errors[1].items, ["mojo/public/cpp/bindings/BUILD.gn, line 3 (//base)"]);
    }

    #[test]
    fn edk_allows_external_paths() {
        let files = [file(
            "mojo/edk/system/BUILD.gn",
            "mojo_edk_source_set(\"s\") {\n  deps = [ \"//base\", ]\n  x = \"//mojo/edk/embedder\"\n  y = \"//mojo/public/c/system\"\n}\n",
        )];
        let errors = check_build_files(&files);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("SDK via absolute paths within EDK"));
        assert_eq!(errors[0].items, ["mojo/edk/system/BUILD.gn, line 4 (//mojo/public/c/system)"]);
        assert_eq!(errors[1].items, ["mojo/edk/system/BUILD.gn, line 3 (//mojo/edk/embedder)"]);
    }

    #[test]
    fn wrong_source_set_type() {
        let files = [
            file("mojo/public/c/BUILD.gn", "source_set(\"c\") {\n}\npython_binary_source_set(\"p\") {}\n"),
            file("mojo/edk/js/BUILD.gn", "mojo_sdk_source_set(\"js\") {}\n"),
            file("mojo/services/BUILD.gn", "source_set(\"ignored\") {}\n"),
            file("mojo/public/c/README.md", "source_set(\"ignored\")\n"),
        ];
        let errors = check_build_files(&files);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].items, ["mojo/public/c/BUILD.gn, line 1"]);
        assert_eq!(errors[1].items, ["mojo/edk/js/BUILD.gn, line 1"]);
        assert!(errors[1].message.contains("mojo_edk_source_set"));
    }

    #[test]
    fn clean_files_pass() {
        let files = [file(
            "mojo/public/tools/bindings/mojom.gni",
            "template(\"mojom\") {\n  deps = [ \"../system\" ]\n}\n",
        )];
        assert!(check_build_files(&files).is_empty());
    }
}
