//! Wrapper around the `adb` executable for driving the shell on a device.
//!
//! Every call blocks until the adb command finishes; a nonzero exit is an
//! error. The only retries are the bounded wait for the stdout FIFO and the
//! implicit `wait-for-device` after restarting adbd as root.

use rand::Rng;
use std::cell::Cell;
use std::collections::HashSet;
use std::io::{self, Write};
use std::ops::Range;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

use crate::util::cleanup::CleanupStack;
use crate::util::hashing::sha1_file;
use crate::util::process::describe;

pub const MOJO_SHELL_PACKAGE_NAME: &str = "org.chromium.mojo.shell";
pub const MOJO_SHELL_ACTIVITY: &str = "org.chromium.mojo.shell/.MojoShellActivity";

/// Tags used by the shell's Java logging.
pub const LOGCAT_JAVA_TAGS: [&str; 5] = [
    "AndroidHandler",
    "MojoFileHelper",
    "MojoMain",
    "MojoShellActivity",
    "MojoShellApplication",
];

/// Tags used by native logging reflected in logcat.
pub const LOGCAT_NATIVE_TAGS: [&str; 1] = ["chromium"];

const DEVICE_PORT_RANGE: Range<u16> = 4096..16384;
const DEFAULT_FIFO_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum AdbError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` failed ({status}): {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },
    #[error("Unable to run adb as root: {0}")]
    RootDenied(String),
    #[error("Unable to find fifo {path} after {attempts} attempts")]
    FifoNotFound { path: String, attempts: u32 },
    #[error("could not find a free port on the device")]
    NoFreePort,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The adb binary plus the device it targets. Cheap to clone into helper
/// threads.
#[derive(Debug, Clone)]
pub struct DeviceSelector {
    pub adb_path: String,
    pub target_device: Option<String>,
}

impl DeviceSelector {
    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.adb_path);
        if let Some(serial) = &self.target_device {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args);
        cmd
    }

    pub fn output(&self, args: &[&str]) -> Result<String, AdbError> {
        let mut cmd = self.command(args);
        let command = describe(&cmd);
        let out = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|source| AdbError::Spawn { command: command.clone(), source })?;
        if !out.status.success() {
            let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
            output.push_str(&String::from_utf8_lossy(&out.stderr));
            return Err(AdbError::CommandFailed {
                command,
                status: out.status.to_string(),
                output: output.trim_end().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    Skipped,
}

pub struct Adb {
    selector: DeviceSelector,
    running_as_root: Cell<bool>,
    verbose: bool,
    fifo_poll_interval: Duration,
}

impl Adb {
    pub fn new(adb_path: impl Into<String>, target_device: Option<String>, verbose: bool) -> Self {
        Self {
            selector: DeviceSelector {
                adb_path: adb_path.into(),
                target_device,
            },
            running_as_root: Cell::new(false),
            verbose,
            fifo_poll_interval: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    fn with_fifo_poll_interval(mut self, interval: Duration) -> Self {
        self.fifo_poll_interval = interval;
        self
    }

    pub fn selector(&self) -> &DeviceSelector {
        &self.selector
    }

    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.selector.command(args)
    }

    /// Runs an adb command; its stdout is shown only in verbose mode.
    pub fn run(&self, args: &[&str]) -> Result<(), AdbError> {
        if !self.verbose {
            self.selector.output(args)?;
            return Ok(());
        }
        let mut cmd = self.command(args);
        let command = describe(&cmd);
        let status = cmd
            .status()
            .map_err(|source| AdbError::Spawn { command: command.clone(), source })?;
        if !status.success() {
            return Err(AdbError::CommandFailed {
                command,
                status: status.to_string(),
                output: String::new(),
            });
        }
        Ok(())
    }

    pub fn output(&self, args: &[&str]) -> Result<String, AdbError> {
        self.selector.output(args)
    }

    /// Picks a random device port in [4096, 16384) that `netstat` does not
    /// report as open.
    pub fn find_available_device_port(&self) -> Result<u16, AdbError> {
        let netstat = self.output(&["shell", "netstat"])?;
        let opened = parse_open_ports(&netstat);
        pick_free_port(&opened, &mut rand::thread_rng()).ok_or(AdbError::NoFreePort)
    }

    /// Makes `host_port` reachable from the device at `device_port` (0 picks
    /// one). The reverse mapping is removed when `cleanup` runs.
    pub fn map_port(&self, device_port: u16, host_port: u16, cleanup: &CleanupStack) -> Result<u16, AdbError> {
        let device_port = if device_port == 0 {
            self.find_available_device_port()?
        } else {
            device_port
        };
        let device = format!("tcp:{}", device_port);
        let host = format!("tcp:{}", host_port);
        self.run(&["reverse", &device, &host])?;

        let selector = self.selector.clone();
        cleanup.register(format!("adb reverse --remove {}", device), move || {
            selector.output(&["reverse", "--remove", &device])?;
            Ok(())
        });
        Ok(device_port)
    }

    /// Forwards `port` on the host to the same port on the device.
    pub fn forward_host_port(&self, port: u16, cleanup: &CleanupStack) -> Result<(), AdbError> {
        let spec = format!("tcp:{}", port);
        self.run(&["forward", &spec, &spec])?;
        let selector = self.selector.clone();
        cleanup.register(format!("adb forward --remove {}", spec), move || {
            selector.output(&["forward", "--remove", &spec])?;
            Ok(())
        });
        Ok(())
    }

    pub fn run_as_root(&self) -> Result<(), AdbError> {
        if self.running_as_root.get() {
            return Ok(());
        }
        let out = self.output(&["root"])?;
        if out.contains("cannot run as root") {
            return Err(AdbError::RootDenied(out.trim().to_string()));
        }
        // adbd restarts; wait for it to come back.
        self.run(&["wait-for-device"])?;
        self.running_as_root.set(true);
        Ok(())
    }

    pub fn is_package_installed(&self, package: &str) -> Result<bool, AdbError> {
        // One line when installed, nothing otherwise.
        let out = self.output(&["shell", "pm", "list", "packages", package])?;
        Ok(!out.trim().is_empty())
    }

    fn device_checksum_path() -> String {
        format!("/sdcard/{}/MojoShell.sha1", MOJO_SHELL_PACKAGE_NAME)
    }

    /// Installs `apk` unless the checksum recorded on the device by the
    /// previous install matches and the package is still present.
    ///
    /// A skipped install still force-stops the shell, as `adb install` would
    /// have, so the device ends up in the same state either way.
    pub fn install_if_changed(&self, apk: &Path) -> anyhow::Result<InstallOutcome> {
        let apk_sha1 = sha1_file(apk)?;
        let checksum_path = Self::device_checksum_path();
        // A missing checksum file is reported as a failure by newer adb versions.
        let device_sha1 = match self.output(&["shell", "cat", &checksum_path]) {
            Ok(sha1) => sha1,
            Err(e) => {
                log::debug!("no install checksum readable on the device: {}", e);
                String::new()
            }
        };
        let up_to_date =
            device_sha1.trim() == apk_sha1 && self.is_package_installed(MOJO_SHELL_PACKAGE_NAME)?;

        if up_to_date {
            log::debug!("{} unchanged on device ({}), skipping install", apk.display(), apk_sha1);
            self.stop_shell()?;
            return Ok(InstallOutcome::Skipped);
        }

        let apk_str = apk.to_string_lossy();
        self.run(&["install", "-r", &apk_str, "-i", MOJO_SHELL_PACKAGE_NAME])?;

        let mut stamp = tempfile::NamedTempFile::new()?;
        stamp.write_all(apk_sha1.as_bytes())?;
        stamp.flush()?;
        let stamp_path = stamp.path().to_string_lossy().into_owned();
        self.run(&["push", &stamp_path, &checksum_path])?;
        Ok(InstallOutcome::Installed)
    }

    /// Copies the device FIFO at `fifo_path` into `sink` on a background
    /// thread named `StdoutRedirector`.
    ///
    /// The FIFO is looked for up to `max_attempts` times, one poll interval
    /// apart. `on_closed` runs on every exit path: when the FIFO closes, when
    /// it never shows up ([`AdbError::FifoNotFound`]) and when adb itself
    /// fails while polling.
    pub fn read_fifo_to_sink(
        &self,
        fifo_path: &str,
        mut sink: Box<dyn Write + Send>,
        on_closed: Option<Box<dyn FnOnce() + Send>>,
        max_attempts: Option<u32>,
    ) -> io::Result<JoinHandle<Result<(), AdbError>>> {
        let selector = self.selector.clone();
        let fifo_path = fifo_path.to_string();
        let attempts = max_attempts.unwrap_or(DEFAULT_FIFO_ATTEMPTS);
        let interval = self.fifo_poll_interval;

        thread::Builder::new()
            .name("StdoutRedirector".to_string())
            .spawn(move || {
                let result = wait_for_fifo(&selector, &fifo_path, attempts, interval)
                    .and_then(|()| copy_fifo(&selector, &fifo_path, &mut sink));
                drop(sink);
                if let Some(cb) = on_closed {
                    cb();
                }
                if let Err(e) = &result {
                    log::error!("Redirecting {} failed: {}", fifo_path, e);
                }
                result
            })
    }

    /// Starts the shell activity; `parameters` travel JSON-encoded in the
    /// `encodedParameters` string extra.
    pub fn start_activity(&self, parameters: &[String]) -> anyhow::Result<()> {
        let mut args: Vec<String> = [
            "shell",
            "am",
            "start",
            "-S",
            "-a",
            "android.intent.action.VIEW",
            "-n",
            MOJO_SHELL_ACTIVITY,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if !parameters.is_empty() {
            args.push("--es".to_string());
            args.push("encodedParameters".to_string());
            args.push(serde_json::to_string(parameters)?);
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args)?;
        Ok(())
    }

    pub fn stop_shell(&self) -> Result<(), AdbError> {
        self.output(&["shell", "am", "force-stop", MOJO_SHELL_PACKAGE_NAME])?;
        Ok(())
    }

    pub fn remove_file(&self, device_path: &str) -> Result<(), AdbError> {
        self.output(&["shell", "rm", "-f", device_path])?;
        Ok(())
    }

    pub fn clean_logs(&self) -> Result<(), AdbError> {
        self.output(&["logcat", "-c"])?;
        Ok(())
    }

    /// Streams shell-related logcat output to our stdout. The process is also
    /// stopped by `cleanup` if it is still running then.
    pub fn show_logs(
        &self,
        include_native_logs: bool,
        extra_tags: Option<&str>,
        cleanup: &CleanupStack,
    ) -> Result<LogcatProcess, AdbError> {
        let tags = logcat_tags(include_native_logs, extra_tags);
        let mut cmd = self.command(["logcat", "-s", tags.join(" ").as_str()]);
        let command = describe(&cmd);
        let child = cmd
            .stdout(Stdio::inherit())
            .spawn()
            .map_err(|source| AdbError::Spawn { command, source })?;
        let logcat = LogcatProcess {
            child: Arc::new(Mutex::new(child)),
        };
        let terminate = logcat.terminator();
        cleanup.register("stop logcat", move || {
            terminate();
            Ok(())
        });
        Ok(logcat)
    }
}

fn wait_for_fifo(
    selector: &DeviceSelector,
    fifo_path: &str,
    attempts: u32,
    interval: Duration,
) -> Result<(), AdbError> {
    let test = format!("test -e \"{}\"; echo $?", fifo_path);
    for attempt in 0..attempts {
        if selector.output(&["shell", &test])?.trim_start().starts_with('0') {
            return Ok(());
        }
        if attempt + 1 < attempts {
            thread::sleep(interval);
        }
    }
    Err(AdbError::FifoNotFound {
        path: fifo_path.to_string(),
        attempts,
    })
}

fn copy_fifo(selector: &DeviceSelector, fifo_path: &str, sink: &mut Box<dyn Write + Send>) -> Result<(), AdbError> {
    let mut cmd = selector.command(["shell", "cat", fifo_path]);
    let command = describe(&cmd);
    let mut child = cmd
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|source| AdbError::Spawn { command, source })?;
    if let Some(mut stdout) = child.stdout.take() {
        io::copy(&mut stdout, sink)?;
    }
    sink.flush()?;
    child.wait()?;
    Ok(())
}

/// A running `adb logcat`, shareable with the thread that decides when it
/// should stop.
pub struct LogcatProcess {
    child: Arc<Mutex<Child>>,
}

impl LogcatProcess {
    /// A callback that kills the process if it is still alive.
    pub fn terminator(&self) -> impl FnOnce() + Send + 'static {
        let child = self.child.clone();
        move || {
            if let Ok(mut child) = child.lock() {
                if let Ok(None) = child.try_wait() {
                    let _ = child.kill();
                }
            }
        }
    }

    /// Blocks until the process exits.
    pub fn wait(&self) -> io::Result<()> {
        loop {
            {
                let mut child = self
                    .child
                    .lock()
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "logcat handle poisoned"))?;
                if child.try_wait()?.is_some() {
                    return Ok(());
                }
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}

pub fn logcat_tags(include_native_logs: bool, extra_tags: Option<&str>) -> Vec<String> {
    let mut tags: Vec<String> = LOGCAT_JAVA_TAGS.iter().map(|s| s.to_string()).collect();
    if include_native_logs {
        tags.extend(LOGCAT_NATIVE_TAGS.iter().map(|s| s.to_string()));
    }
    if let Some(extra) = extra_tags {
        tags.extend(extra.split(',').map(str::trim).filter(|t| !t.is_empty()).map(str::to_string));
    }
    tags
}

/// Local ports of TCP sockets listed by the device's `netstat`.
pub fn parse_open_ports(netstat: &str) -> HashSet<u16> {
    netstat
        .lines()
        .filter(|l| l.trim_start().starts_with("tcp"))
        .filter_map(|l| l.split_whitespace().nth(3))
        .filter_map(|addr| addr.rsplit(':').next())
        .filter_map(|port| port.parse().ok())
        .collect()
}

pub fn pick_free_port<R: Rng>(opened: &HashSet<u16>, rng: &mut R) -> Option<u16> {
    let free: Vec<u16> = DEVICE_PORT_RANGE.filter(|p| !opened.contains(p)).collect();
    if free.is_empty() {
        return None;
    }
    Some(free[rng.gen_range(0..free.len())])
}

#[cfg(all(test, unix))]
pub(crate) mod fake {
    //! A scriptable stand-in for the adb binary. Every invocation appends its
    //! arguments to `calls.log`; replies are chosen by a shell `case` on the
    //! joined argument string.

    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    pub struct FakeAdb {
        pub dir: TempDir,
    }

    impl FakeAdb {
        /// `cases` is the body of a `case "$*" in ... esac` block.
        pub fn new(cases: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("calls.log");
            let script = format!(
                "#!/bin/sh\necho \"$*\" >> '{}'\ncase \"$*\" in\n{}\n  *) ;;\nesac\n",
                log.display(),
                cases
            );
            let path = dir.path().join("adb");
            fs::write(&path, script).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            Self { dir }
        }

        pub fn path(&self) -> String {
            self.dir.path().join("adb").to_string_lossy().into_owned()
        }

        pub fn calls(&self) -> Vec<String> {
            let log: PathBuf = self.dir.path().join("calls.log");
            fs::read_to_string(log)
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }
}
