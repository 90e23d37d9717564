// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::rc::Rc;

use super::{start_server, Shell};
use crate::util::cleanup::CleanupStack;
use crate::util::process::{describe, output_merged};

/// The shell binary run as a local child process, optionally under a command
/// prefix such as a debugger.
pub struct LinuxShell {
    executable: PathBuf,
    command_prefix: Vec<String>,
    cleanup: Rc<CleanupStack>,
}

impl LinuxShell {
    pub fn new(executable: PathBuf, command_prefix: Vec<String>, cleanup: Rc<CleanupStack>) -> Self {
        Self {
            executable,
            command_prefix,
            cleanup,
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = match self.command_prefix.split_first() {
            Some((program, prefix_args)) => {
                let mut cmd = Command::new(program);
                cmd.args(prefix_args).arg(&self.executable);
                cmd
            }
            None => Command::new(&self.executable),
        };
        cmd.args(args);
        cmd
    }
}

/// Points the child's stderr at whatever our stdout is.
#[cfg(unix)]
fn stdout_as_stdio() -> Result<Stdio> {
    use std::os::fd::AsFd;
    let fd = std::io::stdout().as_fd().try_clone_to_owned()?;
    Ok(Stdio::from(fd))
}

#[cfg(not(unix))]
fn stdout_as_stdio() -> Result<Stdio> {
    Ok(Stdio::inherit())
}

impl Shell for LinuxShell {
    fn serve_local_directory(&self, dir: &Path, _port: u16, extra_mappings: &[(String, PathBuf)]) -> Result<String> {
        let port = start_server(dir, extra_mappings, &self.cleanup)?;
        Ok(format!("http://127.0.0.1:{}/", port))
    }

    fn forward_host_port_to_shell(&self, _port: u16) -> Result<()> {
        Ok(())
    }

    fn run(&self, args: &[String]) -> Result<Option<i32>> {
        let mut cmd = self.command(args);
        let line = describe(&cmd);
        log::debug!("Running {}", line);
        let status = cmd
            .stderr(stdout_as_stdio()?)
            .status()
            .with_context(|| format!("Spawning {}", line))?;
        Ok(status.code())
    }

    fn run_and_get_output(&self, args: &[String]) -> Result<(Option<i32>, String)> {
        output_merged(&mut self.command(args))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("mojo_shell");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn captures_stdout_and_stderr_with_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "echo \"args: $*\"\necho oops >&2\nexit 3");
        let shell = LinuxShell::new(exe, vec![], Rc::new(CleanupStack::new()));

        let (code, output) = shell
            .run_and_get_output(&["--origin=x".to_string(), "mojo:app".to_string()])
            .unwrap();
        assert_eq!(code, Some(3));
        assert!(output.contains("args: --origin=x mojo:app"));
        assert!(output.contains("oops"));
    }

    #[test]
    fn command_prefix_wraps_the_executable() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "echo inner $*");
        let shell = LinuxShell::new(
            exe,
            vec!["sh".to_string(), "-c".to_string(), "echo wrapped; exec \"$0\" \"$@\"".to_string()],
            Rc::new(CleanupStack::new()),
        );
        let (code, output) = shell.run_and_get_output(&["a".to_string()]).unwrap();
        assert_eq!(code, Some(0));
        assert_eq!(output, "wrapped\ninner a\n");
        assert_eq!(shell.run(&[]).unwrap(), Some(0));
    }

    #[test]
    fn served_directory_is_reachable_until_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.mojo"), b"bits").unwrap();
        let cleanup = Rc::new(CleanupStack::new());
        let shell = LinuxShell::new(dir.path().join("mojo_shell"), vec![], cleanup.clone());

        let url = shell.serve_local_directory(dir.path(), 31840, &[]).unwrap();
        assert!(url.starts_with("http://127.0.0.1:"));
        assert!(!url.ends_with(":31840/"));
        let body = reqwest::blocking::get(format!("{}app.mojo", url)).unwrap().bytes().unwrap();
        assert_eq!(&body[..], b"bits");
        assert_eq!(cleanup.len(), 1);
        cleanup.run_all();
    }

    #[test]
    fn serving_a_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let shell = LinuxShell::new(dir.path().join("mojo_shell"), vec![], Rc::new(CleanupStack::new()));
        assert!(shell.serve_local_directory(&dir.path().join("nope"), 0, &[]).is_err());
    }
}
