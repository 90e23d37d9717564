// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

//! Application tests: apps run inside the shell whose pass/fail is read from
//! their output. The shell exits with 0 either way, so exit codes only ever
//! add failures.

use anyhow::Result;
use std::fmt;
use std::io::IsTerminal;
use std::time::Instant;
use thiserror::Error;

use crate::shell::arguments::build_shell_arguments;
use crate::shell::Shell;
use crate::test_list::{ApptestEntry, ApptestType};
use crate::util::process::format_command_line;

pub mod dart;
pub mod gtest;

#[derive(Debug, Error)]
pub enum ApptestError {
    #[error("Unrecognized --gtest_list_tests output:\n{0}")]
    UnrecognizedListOutput(String),
}

/// Decides from the shell output whether a run passed.
pub type OutputTest = fn(&str) -> bool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApptestOutcome {
    Succeeded,
    Failed(String),
}

impl ApptestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for ApptestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("Succeeded"),
            Self::Failed(reason) => f.write_str(reason),
        }
    }
}

const SLOW_TEST_SECS: f64 = 3.0;

/// Runs the shell once and applies `output_test` to what it printed. On
/// failure the command line and output are printed.
pub fn run_apptest(
    shell: &dyn Shell,
    shell_args: &[String],
    apps_and_args: &[(String, Vec<String>)],
    output_test: OutputTest,
) -> Result<bool> {
    let arguments = build_shell_arguments(shell_args, apps_and_args);
    let command_line = format_command_line("mojo_shell", &arguments);

    log::debug!("Starting: {}", command_line);
    let started = Instant::now();
    let (exit_code, output) = shell.run_and_get_output(&arguments)?;
    let run_time = started.elapsed().as_secs_f64();
    log::debug!("Completed: {}", command_line);

    if run_time >= SLOW_TEST_SECS {
        log::info!("Test took {:.3} seconds: {}", run_time, command_line);
    }

    let failed_exit = exit_code.filter(|c| *c != 0);
    if failed_exit.is_none() && output_test(&output) {
        return Ok(true);
    }
    println!("Failed test: {}", command_line);
    match failed_exit {
        Some(code) => println!("  due to shell exit code {}", code),
        None => println!("  due to test results"),
    }
    println!("{}", "-".repeat(72));
    println!("{}", output.trim_end());
    println!("{}", "-".repeat(72));
    Ok(false)
}

/// Asks gtest for colored output when we are on a terminal, unless the
/// caller already decided.
pub fn set_color() {
    if std::io::stdout().is_terminal() && std::env::var_os("GTEST_COLOR").is_none() {
        log::debug!("Setting GTEST_COLOR=yes");
        std::env::set_var("GTEST_COLOR", "yes");
    }
}

/// Runs one list entry with `extra_shell_args` in front of its own shell
/// arguments.
pub fn run_entry(shell: &dyn Shell, entry: &ApptestEntry, extra_shell_args: &[String]) -> Result<ApptestOutcome> {
    let mut shell_args = extra_shell_args.to_vec();
    shell_args.extend(entry.shell_args.iter().cloned());
    match entry.kind {
        ApptestType::Gtest => gtest::run_gtest_apptest(shell, entry, &shell_args, false),
        ApptestType::GtestIsolated => gtest::run_gtest_apptest(shell, entry, &shell_args, true),
        ApptestType::Dart => dart::run_dart_apptest(shell, entry, &shell_args),
    }
}

/// Runs every entry in order, printing `Running <name>... <result>` for each.
/// A failing entry does not stop the rest.
pub fn run_apptests(
    shell: &dyn Shell,
    entries: &[&ApptestEntry],
    extra_shell_args: &[String],
) -> Result<Vec<(String, ApptestOutcome)>> {
    let mut results = Vec::with_capacity(entries.len());
    for entry in entries {
        println!("Running {}...", entry.display_name());
        let outcome = run_entry(shell, entry, extra_shell_args)?;
        println!("{}: {}", entry.display_name(), outcome);
        results.push((entry.display_name().to_string(), outcome));
    }
    Ok(results)
}

pub(crate) fn failure_for(entry: &ApptestEntry) -> ApptestOutcome {
    ApptestOutcome::Failed(format!("Failed test(s) in {}", entry.test))
}
