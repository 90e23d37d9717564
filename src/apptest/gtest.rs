// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

//! gtest-based apptests.

use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;

use super::{failure_for, run_apptest, ApptestError, ApptestOutcome};
use crate::shell::Shell;
use crate::test_list::ApptestEntry;
use crate::util::process::{format_command_line, print_process_error};

/// Fails on `[  FAILED  ]` anywhere, and on a missing `[  PASSED  ]` so that
/// a broken command line never counts as a pass.
pub fn output_succeeded(output: &str) -> bool {
    !output.contains("[  FAILED  ]") && output.contains("[  PASSED  ]")
}

fn log_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^(\[|WARNING: linker:).*\n").expect("static regex"))
}

fn listing_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\w*\.\r?\n(  \w*\r?\n)+)+").expect("static regex"))
}

/// Turns `--gtest_list_tests` output into `Suite.Fixture` names, in order.
pub fn parse_list_tests(output: &str) -> Result<Vec<String>, ApptestError> {
    let cleaned = log_line_re().replace_all(output, "");
    if !listing_re().is_match(&cleaned) {
        return Err(ApptestError::UnrecognizedListOutput(cleaned.into_owned()));
    }

    let mut fixtures = Vec::new();
    let mut suite = "";
    for line in cleaned.split('\n') {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') {
            fixtures.push(format!("{}{}", suite, line.trim()));
        } else {
            suite = line.trim();
        }
    }
    Ok(fixtures)
}

/// Lists the fixtures of `apptest`. A failing shell run prints the error and
/// yields no fixtures; unparseable output is an error.
pub fn get_fixtures(shell: &dyn Shell, shell_args: &[String], apptest: &str) -> Result<Vec<String>> {
    let mut arguments = shell_args.to_vec();
    arguments.push(format!("--args-for={} --gtest_list_tests", apptest));
    arguments.push(apptest.to_string());

    let (exit_code, output) = shell.run_and_get_output(&arguments)?;
    if exit_code.is_some_and(|c| c != 0) {
        println!("Failed to get test fixtures:");
        print_process_error(&format_command_line("mojo_shell", &arguments), &output);
        return Ok(Vec::new());
    }
    log::debug!("Tests listed:\n{}", output);
    Ok(parse_list_tests(&output)?)
}

/// Runs the apptest in one shell run, or with `isolate` one run per fixture.
pub fn run_gtest_apptest(
    shell: &dyn Shell,
    entry: &ApptestEntry,
    shell_args: &[String],
    isolate: bool,
) -> Result<ApptestOutcome> {
    if !isolate {
        let apps = [(entry.test.clone(), entry.test_args.clone())];
        return Ok(if run_apptest(shell, shell_args, &apps, output_succeeded)? {
            ApptestOutcome::Succeeded
        } else {
            failure_for(entry)
        });
    }

    let fixtures = get_fixtures(shell, shell_args, &entry.test)?;
    if fixtures.is_empty() {
        return Ok(ApptestOutcome::Failed("Failed with no tests found.".to_string()));
    }

    let mut outcome = ApptestOutcome::Succeeded;
    for fixture in fixtures {
        let mut args = entry.test_args.clone();
        args.push(format!("--gtest_filter={}", fixture));
        let apps = [(entry.test.clone(), args)];
        if !run_apptest(shell, shell_args, &apps, output_succeeded)? {
            outcome = failure_for(entry);
        }
    }
    Ok(outcome)
}
