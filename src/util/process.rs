// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

use anyhow::{anyhow, bail, Context, Result};
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

/// Human-readable rendering of a command, each argument debug-quoted.
pub fn format_command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&format!("{:?}", arg));
    }
    line
}

pub fn describe(cmd: &Command) -> String {
    let args: Vec<String> = cmd
        .get_args()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    format_command_line(&cmd.get_program().to_string_lossy(), &args)
}

/// Prints a failed command and its output between separator lines.
pub fn print_process_error(command_line: &str, output: &str) {
    println!("Failed command: {}", command_line);
    println!("{}", "-".repeat(72));
    println!("{}", output.trim_end());
    println!("{}", "-".repeat(72));
}

/// Runs `cmd` inheriting stdio and fails on a nonzero exit.
pub fn check_call(cmd: &mut Command) -> Result<()> {
    let line = describe(cmd);
    log::debug!("Running {}", line);
    let status = cmd.status().with_context(|| format!("Spawning {}", line))?;
    if !status.success() {
        bail!("Command failed with {}: {}", status, line);
    }
    Ok(())
}

/// Runs `cmd`, returning its stdout; fails on a nonzero exit with the
/// captured output in the error.
pub fn check_output(cmd: &mut Command) -> Result<String> {
    let line = describe(cmd);
    log::debug!("Running {}", line);
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("Spawning {}", line))?;
    if !output.status.success() {
        bail!(
            "Command failed with {}: {}\nstdout: {}\nstderr: {}",
            output.status,
            line,
            String::from_utf8_lossy(&output.stdout).trim_end(),
            String::from_utf8_lossy(&output.stderr).trim_end()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn pump<R: Read>(mut from: R, into: &Mutex<Vec<u8>>) -> std::io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let n = from.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        if let Ok(mut out) = into.lock() {
            out.extend_from_slice(&buf[..n]);
        }
    }
}

/// Runs `cmd` to completion with stdout and stderr collected into one
/// buffer, chunks in arrival order. A nonzero exit is not an error here.
pub fn output_merged(cmd: &mut Command) -> Result<(Option<i32>, String)> {
    let line = describe(cmd);
    log::debug!("Running {}", line);
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Spawning {}", line))?;

    let output = Arc::new(Mutex::new(Vec::new()));
    let stderr_reader = child.stderr.take().map(|stderr| {
        let output = output.clone();
        thread::spawn(move || pump(stderr, &output))
    });
    if let Some(stdout) = child.stdout.take() {
        pump(stdout, &output)?;
    }
    if let Some(reader) = stderr_reader {
        reader.join().map_err(|_| anyhow!("stderr reader panicked"))??;
    }
    let status = child.wait()?;

    let bytes = output.lock().map(|o| o.clone()).unwrap_or_default();
    Ok((status.code(), String::from_utf8_lossy(&bytes).into_owned()))
}
