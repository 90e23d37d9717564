// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

//! The shell under test, running either as a local process or as an Android
//! activity. Callers pick the implementation once at startup and work with
//! `&dyn Shell` from then on.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::adb::Adb;
use crate::http_server::HttpServer;
use crate::util::cleanup::CleanupStack;

pub mod android;
pub mod arguments;
pub mod linux;

pub use android::AndroidShell;
pub use linux::LinuxShell;

pub trait Shell {
    /// Serves `dir` over HTTP and returns the URL the shell should use to
    /// reach it. `port` is the port the shell sees (0 lets the implementation
    /// choose); desktop shells ignore it.
    fn serve_local_directory(&self, dir: &Path, port: u16, extra_mappings: &[(String, PathBuf)]) -> Result<String>;

    /// Makes `port` on the host reachable under the same port from the shell.
    fn forward_host_port_to_shell(&self, port: u16) -> Result<()>;

    /// Runs the shell until it exits, its output going to our stdout. The
    /// exit code is `None` where it cannot be observed.
    fn run(&self, args: &[String]) -> Result<Option<i32>>;

    /// Runs the shell until it exits and returns its combined stdout and
    /// stderr.
    fn run_and_get_output(&self, args: &[String]) -> Result<(Option<i32>, String)>;
}

/// Starts a file server for `dir` and ties its shutdown to `cleanup`.
pub(crate) fn start_server(dir: &Path, extra_mappings: &[(String, PathBuf)], cleanup: &CleanupStack) -> Result<u16> {
    if !dir.is_dir() {
        anyhow::bail!("Cannot serve {}: not a directory", dir.display());
    }
    let mut server = HttpServer::start_with_mappings(dir, extra_mappings)
        .with_context(|| format!("starting http server for {}", dir.display()))?;
    let port = server.port();
    println!("serving {} at {}", dir.display(), server.url());
    cleanup.register(format!("stop http server on port {}", port), move || {
        server.shutdown();
        Ok(())
    });
    Ok(port)
}

/// What the command line asked for when constructing a shell.
#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub android: bool,
    pub shell_path: PathBuf,
    pub command_prefix: Vec<String>,
    pub adb_path: String,
    pub target_device: Option<String>,
    pub logcat_tags: Option<String>,
    pub apk_path: Option<PathBuf>,
    pub verbose: bool,
}

/// Builds the shell for `options`. For Android, the APK is installed (or the
/// install skipped) before returning.
pub fn create_shell(options: &ShellOptions, cleanup: Rc<CleanupStack>) -> Result<Box<dyn Shell>> {
    if !options.android {
        if !options.shell_path.exists() {
            anyhow::bail!("Shell binary not found at {}", options.shell_path.display());
        }
        return Ok(Box::new(LinuxShell::new(
            options.shell_path.clone(),
            options.command_prefix.clone(),
            cleanup,
        )));
    }

    let adb = Adb::new(options.adb_path.clone(), options.target_device.clone(), options.verbose);
    if let Some(apk) = &options.apk_path {
        let outcome = adb
            .install_if_changed(apk)
            .with_context(|| format!("installing {}", apk.display()))?;
        log::info!("{}: {:?}", apk.display(), outcome);
    }
    Ok(Box::new(AndroidShell::new(adb, options.logcat_tags.clone(), cleanup)))
}

#[cfg(test)]
pub(crate) mod recording {
    //! A shell that records what it is asked to do and replays canned output.

    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub struct RecordingShell {
        pub served: RefCell<Vec<(PathBuf, u16, Vec<(String, PathBuf)>)>>,
        pub forwarded: RefCell<Vec<u16>>,
        pub runs: RefCell<Vec<Vec<String>>>,
        pub replies: RefCell<VecDeque<(Option<i32>, String)>>,
    }

    impl RecordingShell {
        pub fn with_replies<I>(replies: I) -> Self
        where
            I: IntoIterator<Item = (Option<i32>, &'static str)>,
        {
            let shell = Self::default();
            shell
                .replies
                .borrow_mut()
                .extend(replies.into_iter().map(|(code, out)| (code, out.to_string())));
            shell
        }
    }

    impl Shell for RecordingShell {
        fn serve_local_directory(&self, dir: &Path, port: u16, extra_mappings: &[(String, PathBuf)]) -> Result<String> {
            self.served
                .borrow_mut()
                .push((dir.to_path_buf(), port, extra_mappings.to_vec()));
            Ok(format!("http://127.0.0.1:{}/", port))
        }

        fn forward_host_port_to_shell(&self, port: u16) -> Result<()> {
            self.forwarded.borrow_mut().push(port);
            Ok(())
        }

        fn run(&self, args: &[String]) -> Result<Option<i32>> {
            Ok(self.run_and_get_output(args)?.0)
        }

        fn run_and_get_output(&self, args: &[String]) -> Result<(Option<i32>, String)> {
            self.runs.borrow_mut().push(args.to_vec());
            Ok(self.replies.borrow_mut().pop_front().unwrap_or((Some(0), String::new())))
        }
    }
}
