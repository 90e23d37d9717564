// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

//! Dart apptests, judged by the `PASS:` / `FAIL:` / `ERROR:` lines the Dart
//! unittest package prints.

use anyhow::Result;

use super::{failure_for, run_apptest, ApptestOutcome};
use crate::shell::Shell;
use crate::test_list::ApptestEntry;

pub fn output_succeeded(output: &str) -> bool {
    !output.is_empty()
        && !output.contains("\nFAIL: ")
        && !output.contains("\nERROR: ")
        && output.contains("\nPASS: ")
}

pub fn run_dart_apptest(shell: &dyn Shell, entry: &ApptestEntry, shell_args: &[String]) -> Result<ApptestOutcome> {
    let apps = [(entry.test.clone(), entry.test_args.clone())];
    Ok(if run_apptest(shell, shell_args, &apps, output_succeeded)? {
        ApptestOutcome::Succeeded
    } else {
        failure_for(entry)
    })
}
