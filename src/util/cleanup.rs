// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

use anyhow::Result;
use std::cell::RefCell;

type Action = Box<dyn FnOnce() -> Result<()>>;

/// Teardown actions (unmapping device ports, stopping servers, killing log
/// readers) run in reverse registration order. Failures are logged and do not
/// stop the remaining actions. Nothing runs if the process is killed outright.
#[derive(Default)]
pub struct CleanupStack {
    actions: RefCell<Vec<(String, Action)>>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.actions.borrow_mut().push((label.into(), Box::new(action)));
    }

    pub fn len(&self) -> usize {
        self.actions.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn run_all(&self) {
        loop {
            // Pop before running so an action may register further actions.
            let next = self.actions.borrow_mut().pop();
            let Some((label, action)) = next else { break };
            log::debug!("cleanup: {}", label);
            if let Err(e) = action() {
                log::warn!("cleanup step '{}' failed: {:#}", label, e);
            }
        }
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        self.run_all();
    }
}
