use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};

mod adb;
mod apptest;
mod config;
mod deploy;
mod http_server;
mod paths;
mod presubmit;
mod roll;
mod shell;
mod storage;
mod test_list;
mod unittest;
mod util;

use crate::config::{Config, TargetArch, TargetOs};
use crate::paths::{resolve_src_root, Paths};
use crate::shell::arguments::{
    configure_debugger, configure_local_origin, configure_sky, has_url_scheme, local_map_origin_destinations,
    rewrite_map_origin_parameters, ShellArgs, CONTENT_HANDLERS_PREFIX, MAP_ORIGIN_PREFIX, ORIGIN_PREFIX,
};
use crate::shell::{create_shell, Shell, ShellOptions};
use crate::util::cleanup::CleanupStack;
use crate::util::logging::{init_logger, LogVerbosity};
use crate::util::settings::{self, Settings};

#[derive(Debug, Parser)]
#[command(name = "mojo-devtools", version, about = "Run, test and ship Mojo shells and apps")]
struct Cli {
    /// Verbose logging (repeat for more)
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Root of the source checkout (default: $MOJO_SRC_ROOT, saved setting, cwd)
    #[arg(long, global = true)]
    src_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Which build to use.
#[derive(Debug, Args)]
struct BuildArgs {
    /// Target Android
    #[arg(long, action = ArgAction::SetTrue)]
    android: bool,
    /// Debug build (default)
    #[arg(long, action = ArgAction::SetTrue, conflicts_with = "release")]
    debug: bool,
    /// Release build
    #[arg(long, action = ArgAction::SetTrue)]
    release: bool,
    /// CPU architecture to run for
    #[arg(long, value_parser = ["x64", "x86", "arm"])]
    target_cpu: Option<String>,
    /// Build directory; its args.gn decides the configuration
    #[arg(long)]
    build_dir: Option<PathBuf>,
}

/// Android device selection.
#[derive(Debug, Args)]
struct DeviceArgs {
    /// Path of the adb binary
    #[arg(long)]
    adb_path: Option<String>,
    /// Serial of the device to run on
    #[arg(long)]
    target_device: Option<String>,
    /// Comma-separated extra logcat tags to display
    #[arg(long)]
    logcat_tags: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the shell with the given arguments
    Shell {
        #[command(flatten)]
        build: BuildArgs,
        #[command(flatten)]
        device: DeviceArgs,
        /// Origin for mojo: URLs; a URL or a local directory
        #[arg(long)]
        origin: Option<String>,
        /// Origin mapping <origin>=<url-or-local-dir> (repeatable)
        #[arg(long)]
        map_origin: Vec<String>,
        /// Content handler <mime>,<url> (repeatable)
        #[arg(long)]
        content_handlers: Vec<String>,
        /// Do not spawn mojo:debugger
        #[arg(long, action = ArgAction::SetTrue)]
        no_debugger: bool,
        /// Run this Sky app (relative to the source root) in the window manager
        #[arg(long, requires = "sky_packages")]
        sky: Option<String>,
        /// Directory served as packages/ for Sky apps
        #[arg(long)]
        sky_packages: Option<PathBuf>,
        /// Command (e.g. a debugger) to wrap the desktop shell in
        #[arg(long, value_delimiter = ' ')]
        command_prefix: Vec<String>,
        /// Arguments for the shell
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run the apptests from a test list
    Apptests {
        list: PathBuf,
        #[command(flatten)]
        build: BuildArgs,
        #[command(flatten)]
        device: DeviceArgs,
        /// Extra shell arguments for every test
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        shell_args: Vec<String>,
    },
    /// Run the unit tests from a test list
    Unittests {
        list: PathBuf,
        #[command(flatten)]
        build: BuildArgs,
        /// File recording tests that passed; unchanged passing tests are skipped
        #[arg(long)]
        successes_cache: Option<PathBuf>,
    },
    /// Serve a directory over HTTP until Enter is pressed
    Serve {
        dir: PathBuf,
        /// Extra mapping <url-prefix>=<dir> (repeatable)
        #[arg(long)]
        map: Vec<String>,
    },
    /// Upload the shell binary to cloud storage
    UploadShell {
        #[command(flatten)]
        build: BuildArgs,
        /// Print the upload commands without running them
        #[arg(long, short = 'n', action = ArgAction::SetTrue)]
        dry_run: bool,
        #[arg(long, default_value = "gsutil")]
        gsutil: PathBuf,
    },
    /// Upload the shell and all apps of a release build
    UploadBinaries {
        /// Upload the Android build
        #[arg(long, action = ArgAction::SetTrue)]
        android: bool,
        #[arg(long, short = 'n', action = ArgAction::SetTrue)]
        dry_run: bool,
        #[arg(long, default_value = "gsutil")]
        gsutil: PathBuf,
    },
    /// Download the prebuilt binaries named by a version file
    FetchPrebuilt {
        /// File holding the wanted version
        version_file: PathBuf,
        #[arg(long, default_value = "network")]
        category: String,
        #[arg(long, default_value = "network_service.mojo")]
        binary: String,
        /// Platform to fetch (repeatable; default linux-x64 and android-arm)
        #[arg(long)]
        platform: Vec<String>,
    },
    /// Replace tracked directories with their contents in an upstream checkout
    Roll {
        upstream: PathBuf,
        /// Checkout to update (default: the source root)
        #[arg(long)]
        dest: Option<PathBuf>,
    },
    /// Copy the Android release build into a deploy checkout and commit it
    Deploy {
        deploy_root: PathBuf,
        #[arg(long, action = ArgAction::SetTrue)]
        no_commit: bool,
    },
    /// Check SDK and EDK build files
    Presubmit {
        /// Build files relative to the source root (default: all of them)
        files: Vec<PathBuf>,
    },
    /// Show or change saved defaults
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Debug, Subcommand)]
enum SettingsAction {
    /// Save a default: src-root, adb-path, target-device or logcat-tags
    Set { key: String, value: String },
    /// Forget a saved default
    Clear { key: String },
    /// Print the saved defaults
    Show,
}

impl BuildArgs {
    fn config(&self, src_root: &Path) -> Result<Config> {
        if let Some(dir) = &self.build_dir {
            let dir = src_root.join(dir);
            if dir.join("args.gn").is_file() {
                return Config::from_gn_args(&dir);
            }
        }
        let os = if self.android { Some(TargetOs::Android) } else { None };
        let arch = self.target_cpu.as_deref().and_then(TargetArch::from_str);
        Config::new(os, arch, self.debug || !self.release)
    }

    fn paths(&self, src_root: &Path, config: &Config) -> Paths {
        match &self.build_dir {
            Some(dir) => Paths::for_build_dir(src_root, dir),
            None => Paths::for_config(src_root, config),
        }
    }
}

fn shell_options(
    config: &Config,
    paths: &Paths,
    device: &DeviceArgs,
    settings: &Settings,
    command_prefix: Vec<String>,
    verbose: bool,
) -> ShellOptions {
    let android = config.target_os() == TargetOs::Android;
    ShellOptions {
        android,
        shell_path: paths.shell_path.clone(),
        command_prefix,
        adb_path: device
            .adb_path
            .clone()
            .or_else(|| settings.adb_path.clone())
            .unwrap_or_else(|| paths.adb_path()),
        target_device: device.target_device.clone().or_else(|| settings.target_device.clone()),
        logcat_tags: device.logcat_tags.clone().or_else(|| settings.logcat_tags.clone()),
        apk_path: android.then(|| paths.apk_path()),
        verbose,
    }
}

fn parse_mapping(spec: &str) -> Result<(String, PathBuf)> {
    match spec.split_once('=') {
        Some((prefix, dir)) if !prefix.is_empty() && !dir.is_empty() => Ok((prefix.to_string(), PathBuf::from(dir))),
        _ => bail!("Expected <url-prefix>=<dir>, got {:?}", spec),
    }
}

fn exit_code(success: bool) -> i32 {
    if success {
        0
    } else {
        1
    }
}

struct ShellRun<'a> {
    origin: Option<String>,
    map_origin: Vec<String>,
    content_handlers: Vec<String>,
    no_debugger: bool,
    sky: Option<(String, PathBuf)>,
    args: Vec<String>,
    paths: &'a Paths,
    android: bool,
}

fn run_shell(shell: &dyn Shell, run: ShellRun<'_>) -> Result<i32> {
    let mut flat = run.args;
    flat.extend(run.map_origin.iter().map(|m| format!("{}{}", MAP_ORIGIN_PREFIX, m)));
    for dir in local_map_origin_destinations(&flat) {
        if !dir.is_dir() {
            bail!("--map-origin destination {} is not a directory", dir.display());
        }
    }
    // The Android shell rewrites mappings itself when it launches.
    let flat = if run.android {
        flat
    } else {
        rewrite_map_origin_parameters(shell, flat)?
    };

    let mut args = ShellArgs::new();
    args.extend(flat);
    for handler in &run.content_handlers {
        args.push_flag_value(CONTENT_HANDLERS_PREFIX, handler)?;
    }
    match run.origin {
        Some(origin) if has_url_scheme(&origin) => args.push(format!("{}{}", ORIGIN_PREFIX, origin)),
        Some(dir) => args.extend(configure_local_origin(shell, Path::new(&dir), true)?),
        None if run.android => args.extend(configure_local_origin(shell, &run.paths.build_dir, true)?),
        None => {}
    }
    if let Some((target, packages)) = run.sky {
        for arg in configure_sky(shell, &run.paths.src_root, &packages, &target)? {
            match arg.strip_prefix(CONTENT_HANDLERS_PREFIX) {
                Some(handlers) => args.push_flag_value(CONTENT_HANDLERS_PREFIX, handlers)?,
                None => args.push(arg),
            }
        }
    }
    if !run.no_debugger {
        args.extend(configure_debugger(shell)?);
    }

    let code = shell.run(&args.into_vec())?;
    Ok(code.unwrap_or(0))
}

/// Serves until a line arrives on `input`. When `input` is already closed
/// the server keeps running until the process is interrupted.
fn serve_until_enter(mut server: http_server::HttpServer, mut input: impl BufRead) -> Result<()> {
    let mut line = String::new();
    match input.read_line(&mut line).context("reading stdin") {
        Ok(0) => {
            log::info!("stdin closed; serving until interrupted");
            server.wait()
        }
        Ok(_) => {
            server.shutdown();
            Ok(())
        }
        Err(e) => {
            server.shutdown();
            Err(e)
        }
    }
}

fn presubmit_files(src_root: &Path, files: &[PathBuf]) -> Result<Vec<presubmit::BuildFile>> {
    let rel_paths: Vec<PathBuf> = if files.is_empty() {
        let mut found = Vec::new();
        for package_dir in ["mojo/public", "mojo/edk"] {
            let root = src_root.join(package_dir);
            if !root.is_dir() {
                continue;
            }
            for entry in walkdir::WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() {
                    found.push(entry.path().strip_prefix(src_root)?.to_path_buf());
                }
            }
        }
        found
    } else {
        files.to_vec()
    };

    let mut build_files = Vec::new();
    for rel in rel_paths {
        // Forward slashes on every host, as in GN labels.
        let path = rel.to_string_lossy().replace('\\', "/");
        if !presubmit::Package::ALL.iter().any(|p| p.contains_build_file(&path)) {
            continue;
        }
        let full = src_root.join(&rel);
        let contents = std::fs::read_to_string(&full).with_context(|| format!("Reading {}", full.display()))?;
        build_files.push(presubmit::BuildFile { path, contents });
    }
    Ok(build_files)
}

fn run(cli: Cli) -> Result<i32> {
    let mut settings = settings::load();
    let src_root = resolve_src_root(cli.src_root.as_deref(), settings.src_root.as_deref());
    log::debug!("Source root: {}", src_root.display());
    let cleanup = Rc::new(CleanupStack::new());
    let verbose = cli.verbose > 0;

    let code = match cli.command {
        Commands::Shell {
            build,
            device,
            origin,
            map_origin,
            content_handlers,
            no_debugger,
            sky,
            sky_packages,
            command_prefix,
            args,
        } => {
            let config = build.config(&src_root)?;
            let paths = build.paths(&src_root, &config);
            let options = shell_options(&config, &paths, &device, &settings, command_prefix, verbose);
            let shell = create_shell(&options, cleanup.clone())?;
            run_shell(
                shell.as_ref(),
                ShellRun {
                    origin,
                    map_origin,
                    content_handlers,
                    no_debugger,
                    sky: sky.zip(sky_packages),
                    args,
                    paths: &paths,
                    android: options.android,
                },
            )?
        }
        Commands::Apptests {
            list,
            build,
            device,
            shell_args,
        } => {
            let config = build.config(&src_root)?;
            let paths = build.paths(&src_root, &config);
            let entries = test_list::load_apptests(&list)?;
            let selected = test_list::select(&entries, &config);
            log::debug!("{} of {} apptests selected", selected.len(), entries.len());

            apptest::set_color();
            let options = shell_options(&config, &paths, &device, &settings, Vec::new(), verbose);
            let shell = create_shell(&options, cleanup.clone())?;
            let mut extra = configure_local_origin(shell.as_ref(), &paths.build_dir, false)?;
            extra.extend(shell_args);

            let results = apptest::run_apptests(shell.as_ref(), &selected, &extra)?;
            exit_code(results.iter().all(|(_, outcome)| outcome.is_success()))
        }
        Commands::Unittests {
            list,
            build,
            successes_cache,
        } => {
            let config = build.config(&src_root)?;
            let paths = build.paths(&src_root, &config);
            let entries = test_list::load_unittests(&list)?;
            let selected = test_list::select(&entries, &config);
            let cache = successes_cache
                .as_deref()
                .map(unittest::SuccessCache::open)
                .transpose()?;

            let mut runner = unittest::UnitTestRunner::new(&config, &paths.build_dir, &paths.src_root, cache);
            let summary = runner.run(&selected)?;
            for failure in summary.failures() {
                eprintln!("FAILED: {}", failure.test);
            }
            exit_code(summary.all_succeeded())
        }
        Commands::Serve { dir, map } => {
            let mappings = map.iter().map(|m| parse_mapping(m)).collect::<Result<Vec<_>>>()?;
            let server = http_server::HttpServer::start_with_mappings(&dir, &mappings)?;
            println!("Serving {} at {}", dir.display(), server.url());
            println!("Press Enter to stop.");
            serve_until_enter(server, std::io::stdin().lock())?;
            0
        }
        Commands::UploadShell { build, dry_run, gsutil } => {
            let config = build.config(&src_root)?;
            let paths = build.paths(&src_root, &config);
            let version = roll::git_revision(&src_root)?;
            let gsutil = storage::Gsutil::new(gsutil, dry_run);
            storage::upload_shell(&gsutil, &config, &paths, &version)?;
            0
        }
        Commands::UploadBinaries { android, dry_run, gsutil } => {
            let os = if android { TargetOs::Android } else { TargetOs::Linux };
            let config = Config::new(Some(os), None, false)?;
            let paths = Paths::for_config(&src_root, &config);
            let version = roll::git_revision(&src_root)?;
            let gsutil = storage::Gsutil::new(gsutil, dry_run);
            let apps = storage::upload_binaries(&gsutil, &config, &paths, &version)?;
            log::info!("Uploaded the shell and {} apps for {}", apps, config.platform());
            0
        }
        Commands::FetchPrebuilt {
            version_file,
            category,
            binary,
            platform,
        } => {
            let platforms = if platform.is_empty() { roll::default_platforms() } else { platform };
            let client = reqwest::blocking::Client::builder()
                .user_agent(concat!("mojo-devtools/", env!("CARGO_PKG_VERSION")))
                .build()?;
            let prebuilt_dir = roll::prebuilt_dir_for(&version_file);
            match roll::fetch_prebuilt(&client, &version_file, &prebuilt_dir, &category, &platforms, &binary)? {
                roll::FetchOutcome::UpToDate(v) => println!("Prebuilt {} already at {}", binary, v),
                roll::FetchOutcome::Downloaded(v) => println!("Fetched {} at {}", binary, v),
            }
            0
        }
        Commands::Roll { upstream, dest } => {
            let dest = dest.unwrap_or_else(|| src_root.clone());
            let revision = roll::snapshot_dirs(&upstream, &dest, &roll::SnapshotPlan::chromium())?;
            println!("Rolled to {}. Suggested commit message:", revision);
            println!("  Update from {}", revision);
            0
        }
        Commands::Deploy { deploy_root, no_commit } => {
            deploy::Deployment {
                src_root: src_root.clone(),
                deploy_root,
                commit: !no_commit,
            }
            .run()?;
            0
        }
        Commands::Presubmit { files } => {
            let build_files = presubmit_files(&src_root, &files)?;
            let errors = presubmit::check_build_files(&build_files);
            for error in &errors {
                eprint!("{}", error);
            }
            exit_code(errors.is_empty())
        }
        Commands::Settings { action } => {
            match action {
                SettingsAction::Set { key, value } => {
                    settings.set(&key, &value)?;
                    settings::save(&settings).context("saving settings")?;
                    println!("{} saved.", key);
                }
                SettingsAction::Clear { key } => {
                    settings.clear(&key)?;
                    settings::save(&settings).context("saving settings")?;
                    println!("{} cleared.", key);
                }
                SettingsAction::Show => {
                    println!("{}", settings::settings_path().display());
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
            }
            0
        }
    };

    cleanup.run_all();
    Ok(code)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(LogVerbosity::from_count(cli.verbose));
    let code = run(cli)?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::recording::RecordingShell;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn shell_flags_and_trailing_args() {
        let cli = Cli::try_parse_from([
            "mojo-devtools",
            "-vv",
            "shell",
            "--android",
            "--release",
            "--map-origin",
            "https://a.org/=/tmp",
            "mojo:sample_app",
            "--some-shell-flag",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Shell { build, map_origin, args, .. } = cli.command else {
            panic!("expected shell");
        };
        assert!(build.android && build.release);
        assert_eq!(map_origin, ["https://a.org/=/tmp"]);
        assert_eq!(args, ["mojo:sample_app", "--some-shell-flag"]);
    }

    #[test]
    fn debug_and_release_conflict() {
        assert!(Cli::try_parse_from(["mojo-devtools", "shell", "--debug", "--release"]).is_err());
    }

    #[test]
    fn mapping_parsing() {
        assert_eq!(
            parse_mapping("packages/=/src/packages").unwrap(),
            ("packages/".to_string(), PathBuf::from("/src/packages"))
        );
        assert!(parse_mapping("nodir=").is_err());
        assert!(parse_mapping("plain").is_err());
    }

    #[test]
    fn shell_run_assembles_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::for_build_dir(dir.path(), Path::new("out/Debug"));
        let shell = RecordingShell::default();
        let code = run_shell(
            &shell,
            ShellRun {
                origin: Some("https://example.org/".to_string()),
                map_origin: vec![],
                content_handlers: vec!["text/html,mojo:html_viewer".to_string()],
                no_debugger: false,
                sky: None,
                args: vec!["mojo:browser".to_string()],
                paths: &paths,
                android: false,
            },
        )
        .unwrap();
        assert_eq!(code, 0);
        let runs = shell.runs.borrow();
        assert_eq!(
            runs[0],
            [
                "mojo:browser",
                "--content-handlers=text/html,mojo:html_viewer",
                "--origin=https://example.org/",
                "mojo:debugger 7777",
            ]
        );
        assert_eq!(*shell.forwarded.borrow(), [7777]);
    }

    #[test]
    fn missing_map_origin_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::for_build_dir(dir.path(), Path::new("out/Debug"));
        let shell = RecordingShell::default();
        let missing = dir.path().join("missing");
        let result = run_shell(
            &shell,
            ShellRun {
                origin: None,
                map_origin: vec![format!("https://a.org/={}", missing.display())],
                content_handlers: vec![],
                no_debugger: true,
                sky: None,
                args: vec![],
                paths: &paths,
                android: false,
            },
        );
        assert!(result.is_err());
        assert!(shell.runs.borrow().is_empty());
    }
    #[cfg(unix)]
    #[test]
    fn android_map_origins_are_rewritten_once_at_launch() {
        use crate::adb::{fake::FakeAdb, Adb};
        use crate::shell::AndroidShell;

        let fake = FakeAdb::new(
            "  *'test -e'*) echo 0 ;;\n  \
             *'shell cat /data/data/'*) echo done ;;",
        );
        let cleanup = Rc::new(CleanupStack::new());
        let shell = AndroidShell::new(Adb::new(fake.path(), None, false), None, cleanup.clone());
        let dir = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let paths = Paths::for_build_dir(dir.path(), Path::new("out/android_Debug"));

        let code = run_shell(
            &shell,
            ShellRun {
                origin: Some("https://o.example/".to_string()),
                map_origin: vec![
                    "https://b.org/=https://cdn.example/b/".to_string(),
                    format!("https://a.org/={}", local.path().display()),
                ],
                content_handlers: vec![],
                no_debugger: true,
                sky: None,
                args: vec!["mojo:app".to_string()],
                paths: &paths,
                android: true,
            },
        )
        .unwrap();
        assert_eq!(code, 0);

        let calls = fake.calls();
        let start = calls.iter().find(|c| c.contains("am start")).unwrap();
        let (_, encoded) = start.split_once("--es encodedParameters ").unwrap();
        let parameters: Vec<String> = serde_json::from_str(encoded).unwrap();
        assert_eq!(
            parameters,
            [
                "--fifo-path=/data/data/org.chromium.mojo.shell/stdout.fifo",
                "mojo:app",
                "--origin=https://o.example/",
                "--map-origin=https://a.org/=http://127.0.0.1:31841/",
                "--map-origin=https://b.org/=https://cdn.example/b/",
            ]
        );
        assert_eq!(calls.iter().filter(|c| c.starts_with("reverse tcp:")).count(), 1);
        cleanup.run_all();
    }

    #[test]
    fn serve_stops_on_enter_and_reports_unreadable_input() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();

        let server = http_server::HttpServer::start(dir.path()).unwrap();
        let url = format!("{}a.txt", server.url());
        assert_eq!(reqwest::blocking::get(&url).unwrap().text().unwrap(), "abc");
        serve_until_enter(server, &b"\n"[..]).unwrap();
        assert!(reqwest::blocking::get(&url).is_err());

        let server = http_server::HttpServer::start(dir.path()).unwrap();
        let err = serve_until_enter(server, &b"\xff\n"[..]).unwrap_err();
        assert!(err.to_string().contains("reading stdin"));
    }
}
