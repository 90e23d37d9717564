// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

use anyhow::{bail, Context, Result};
use std::cell::Cell;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::arguments::{rewrite_map_origin_parameters, ORIGIN_PREFIX};
use super::{start_server, Shell};
use crate::adb::{Adb, AdbError, MOJO_SHELL_PACKAGE_NAME};
use crate::util::cleanup::CleanupStack;

type FifoReader = JoinHandle<Result<(), AdbError>>;

fn stdout_fifo_path() -> String {
    format!("/data/data/{}/stdout.fifo", MOJO_SHELL_PACKAGE_NAME)
}

/// The shell running as an Android activity. No exit code is available:
/// the activity always reports success to the launcher.
pub struct AndroidShell {
    adb: Adb,
    logcat_tags: Option<String>,
    cleanup: Rc<CleanupStack>,
    stop_registered: Cell<bool>,
}

impl AndroidShell {
    pub fn new(adb: Adb, logcat_tags: Option<String>, cleanup: Rc<CleanupStack>) -> Self {
        Self {
            adb,
            logcat_tags,
            cleanup,
            stop_registered: Cell::new(false),
        }
    }

    pub fn adb(&self) -> &Adb {
        &self.adb
    }

    /// Launches the shell activity with `args`, which must include
    /// `--origin=`.
    ///
    /// When `stdout` or `on_stop` is given, the shell's output is redirected
    /// through a FIFO on the device into `stdout`, and `on_stop` runs once
    /// that FIFO closes. The returned handle belongs to the FIFO reader.
    pub fn start_shell(
        &self,
        args: &[String],
        stdout: Option<Box<dyn Write + Send>>,
        on_stop: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<Option<FifoReader>> {
        if !self.stop_registered.replace(true) {
            let selector = self.adb.selector().clone();
            self.cleanup.register("stop shell", move || {
                selector.output(&["shell", "am", "force-stop", MOJO_SHELL_PACKAGE_NAME])?;
                Ok(())
            });
        }

        if !args.iter().any(|a| a.contains(ORIGIN_PREFIX)) {
            bail!("The shell needs an {} argument", ORIGIN_PREFIX);
        }

        let mut parameters = Vec::new();
        let mut reader = None;
        if stdout.is_some() || on_stop.is_some() {
            // The FIFO lives in the app's private data directory.
            self.adb.run_as_root()?;
            let fifo = stdout_fifo_path();
            self.adb.remove_file(&fifo)?;
            parameters.push(format!("--fifo-path={}", fifo));
            let sink = stdout.unwrap_or_else(|| Box::new(io::sink()));
            reader = Some(self.adb.read_fifo_to_sink(&fifo, sink, on_stop, None)?);
        }

        parameters.extend(rewrite_map_origin_parameters(self, args.to_vec())?);
        self.adb.start_activity(&parameters).context("starting the shell activity")?;
        Ok(reader)
    }
}

fn join_reader(reader: FifoReader) -> Result<()> {
    reader
        .join()
        .map_err(|_| anyhow::anyhow!("stdout redirector thread panicked"))??;
    Ok(())
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "output buffer poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Shell for AndroidShell {
    fn serve_local_directory(&self, dir: &Path, port: u16, extra_mappings: &[(String, PathBuf)]) -> Result<String> {
        let host_port = start_server(dir, extra_mappings, &self.cleanup)?;
        println!("local port={}", host_port);
        let device_port = self.adb.map_port(port, host_port, &self.cleanup)?;
        Ok(format!("http://127.0.0.1:{}/", device_port))
    }

    fn forward_host_port_to_shell(&self, port: u16) -> Result<()> {
        self.adb.forward_host_port(port, &self.cleanup)?;
        Ok(())
    }

    fn run(&self, args: &[String]) -> Result<Option<i32>> {
        self.adb.clean_logs()?;
        // Native logs already arrive on stdout through the FIFO.
        let logcat = self
            .adb
            .show_logs(false, self.logcat_tags.as_deref(), &self.cleanup)?;
        let reader = self.start_shell(args, Some(Box::new(io::stdout())), Some(Box::new(logcat.terminator())))?;
        logcat.wait()?;
        if let Some(reader) = reader {
            join_reader(reader)?;
        }
        Ok(None)
    }

    fn run_and_get_output(&self, args: &[String]) -> Result<(Option<i32>, String)> {
        let buffer = SharedBuffer::default();
        let reader = self.start_shell(args, Some(Box::new(buffer.clone())), None)?;
        if let Some(reader) = reader {
            join_reader(reader)?;
        }
        let bytes = buffer.0.lock().map(|b| b.clone()).unwrap_or_default();
        Ok((None, String::from_utf8_lossy(&bytes).into_owned()))
    }
}
