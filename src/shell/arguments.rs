// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

//! Rewrites of the shell command line: serving local directories that
//! `--map-origin=` points at, coalescing repeated list flags, and the
//! fragments needed for the debugger and Sky.

use anyhow::Result;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::Shell;

/// Fixed ports keep URLs stable between runs so HTTP caching keeps working.
pub const LOCAL_ORIGIN_PORT: u16 = 31840;
pub const MAP_ORIGIN_BASE_PORT: u16 = 31841;

/// Host port of the `mojo:debugger` HTTP server.
pub const MOJO_DEBUGGER_PORT: u16 = 7777;
pub const SKY_SERVER_PORT: u16 = 9998;

pub const MAP_ORIGIN_PREFIX: &str = "--map-origin=";
pub const ORIGIN_PREFIX: &str = "--origin=";
pub const CONTENT_HANDLERS_PREFIX: &str = "--content-handlers=";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("argument key must be nonempty and end with '=': {0:?}")]
    InvalidKey(String),
    #[error("empty value for argument {0}")]
    EmptyValue(String),
}

pub fn is_map_origin(arg: &str) -> bool {
    arg.starts_with(MAP_ORIGIN_PREFIX)
}

/// Stable partition into `(matching, rest)`.
pub fn split_by_predicate<T, F>(items: Vec<T>, mut pred: F) -> (Vec<T>, Vec<T>)
where
    F: FnMut(&T) -> bool,
{
    items.into_iter().partition(|item| pred(item))
}

pub fn has_url_scheme(dest: &str) -> bool {
    // Windows drive letters parse as one-letter schemes.
    match url::Url::parse(dest) {
        Ok(url) => url.scheme().len() > 1,
        Err(_) => false,
    }
}

/// Rewrites one `--map-origin=<origin>=<dest>` argument. A local directory
/// destination is served on `port` and replaced with its URL; URLs and
/// malformed mappings are returned unchanged.
pub fn rewrite_map_origin_parameter(shell: &dyn Shell, mapping: &str, port: u16) -> Result<String> {
    let body = mapping.strip_prefix(MAP_ORIGIN_PREFIX).unwrap_or(mapping);
    let parts: Vec<&str> = body.split('=').collect();
    if parts.len() != 2 {
        return Ok(mapping.to_string());
    }
    let (origin, dest) = (parts[0], parts[1]);
    if has_url_scheme(dest) {
        return Ok(mapping.to_string());
    }
    let local_url = shell.serve_local_directory(Path::new(dest), port, &[])?;
    println!("started server at {} for {}", dest, local_url);
    Ok(format!("{}{}={}", MAP_ORIGIN_PREFIX, origin, local_url))
}

/// Serves every local directory named by a `--map-origin=` argument.
///
/// Other arguments keep their order and come first. The mappings follow in
/// sorted order, so a given set of mappings always gets the same ports.
pub fn rewrite_map_origin_parameters(shell: &dyn Shell, args: Vec<String>) -> Result<Vec<String>> {
    let (mut mappings, mut rewritten) = split_by_predicate(args, |a| is_map_origin(a));
    mappings.sort();
    for (port, mapping) in (MAP_ORIGIN_BASE_PORT..).zip(mappings.iter()) {
        rewritten.push(rewrite_map_origin_parameter(shell, mapping, port)?);
    }
    Ok(rewritten)
}

/// Appends `value` to the first argument starting with `key`, or adds
/// `key + value` if there is none.
pub fn append_to_argument(
    mut args: Vec<String>,
    key: &str,
    value: &str,
    delimiter: &str,
) -> Result<Vec<String>, ArgumentError> {
    if key.is_empty() || !key.ends_with('=') {
        return Err(ArgumentError::InvalidKey(key.to_string()));
    }
    if value.is_empty() {
        return Err(ArgumentError::EmptyValue(key.to_string()));
    }
    match args.iter_mut().find(|a| a.starts_with(key)) {
        Some(arg) => {
            arg.push_str(delimiter);
            arg.push_str(value);
        }
        None => args.push(format!("{}{}", key, value)),
    }
    Ok(args)
}

/// Serves `local_dir` as the origin for `mojo:` URLs.
pub fn configure_local_origin(shell: &dyn Shell, local_dir: &Path, fixed_port: bool) -> Result<Vec<String>> {
    let port = if fixed_port { LOCAL_ORIGIN_PORT } else { 0 };
    let origin_url = shell.serve_local_directory(local_dir, port, &[])?;
    Ok(vec![format!("{}{}", ORIGIN_PREFIX, origin_url)])
}

/// Runs `mojo:debugger` and makes its HTTP server reachable from the host.
pub fn configure_debugger(shell: &dyn Shell) -> Result<Vec<String>> {
    shell.forward_host_port_to_shell(MOJO_DEBUGGER_PORT)?;
    Ok(vec![format!("mojo:debugger {}", MOJO_DEBUGGER_PORT)])
}

/// Serves `root` (with `packages/` mapped to `packages`) and embeds the Sky
/// app at `target`, relative to `root`, in the window manager.
pub fn configure_sky(shell: &dyn Shell, root: &Path, packages: &Path, target: &str) -> Result<Vec<String>> {
    let mappings = [("packages/".to_string(), packages.to_path_buf())];
    let server_url = shell.serve_local_directory(root, SKY_SERVER_PORT, &mappings)?;

    let mut args = ShellArgs::new();
    // Needed only for Sky apps that do not name mojo:sky_viewer in a shebang.
    args.push_flag_value(CONTENT_HANDLERS_PREFIX, "text/sky,mojo:sky_viewer")?;
    args.push_flag_value(CONTENT_HANDLERS_PREFIX, "application/dart,mojo:sky_viewer")?;
    args.push(format!("mojo:window_manager {}{}", server_url, target));
    Ok(args.into_vec())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Flag { key: String, values: Vec<String> },
    Plain(String),
}

/// Shell arguments kept structured until they are handed to the shell.
///
/// List-valued flags such as `--content-handlers=` occupy a single position,
/// the first one they were given at, and collect their values there.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellArgs {
    entries: Vec<Entry>,
}

impl ShellArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, arg: impl Into<String>) {
        self.entries.push(Entry::Plain(arg.into()));
    }

    pub fn extend<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self.push(arg);
        }
    }

    /// Adds `value` to the list flag `key` (which includes the `=`).
    pub fn push_flag_value(&mut self, key: &str, value: &str) -> Result<(), ArgumentError> {
        if key.is_empty() || !key.ends_with('=') {
            return Err(ArgumentError::InvalidKey(key.to_string()));
        }
        if value.is_empty() {
            return Err(ArgumentError::EmptyValue(key.to_string()));
        }
        for entry in &mut self.entries {
            if let Entry::Flag { key: k, values } = entry {
                if k == key {
                    values.push(value.to_string());
                    return Ok(());
                }
            }
        }
        self.entries.push(Entry::Flag {
            key: key.to_string(),
            values: vec![value.to_string()],
        });
        Ok(())
    }

    pub fn contains_prefix(&self, prefix: &str) -> bool {
        self.entries.iter().any(|e| match e {
            Entry::Flag { key, .. } => key.starts_with(prefix),
            Entry::Plain(arg) => arg.starts_with(prefix),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.entries
            .into_iter()
            .map(|e| match e {
                Entry::Flag { key, values } => format!("{}{}", key, values.join(",")),
                Entry::Plain(arg) => arg,
            })
            .collect()
    }
}

/// Shell arguments, then `--args-for=<app> <args>` for each app, then the
/// app URLs themselves.
pub fn build_shell_arguments(shell_args: &[String], apps_and_args: &[(String, Vec<String>)]) -> Vec<String> {
    let mut result = shell_args.to_vec();
    for (app, args) in apps_and_args {
        result.push(format!("--args-for={} {}", app, args.join(" ")));
    }
    result.extend(apps_and_args.iter().map(|(app, _)| app.clone()));
    result
}

/// Returns the directories named by `--map-origin=` arguments that are local
/// paths rather than URLs. Used to validate them before launching anything.
pub fn local_map_origin_destinations(args: &[String]) -> Vec<PathBuf> {
    args.iter()
        .filter(|a| is_map_origin(a))
        .filter_map(|a| {
            let parts: Vec<&str> = a[MAP_ORIGIN_PREFIX.len()..].split('=').collect();
            match parts.as_slice() {
                [_, dest] if !has_url_scheme(dest) => Some(PathBuf::from(dest)),
                _ => None,
            }
        })
        .collect()
}
