//! gtest unit-test runner that skips tests whose inputs are unchanged since
//! they last passed.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::{Config, TargetOs};
use crate::test_list::UnittestEntry;
use crate::util::hashing::{sha256_file, transitive_hash};
use crate::util::process::output_merged;

/// Hashes of tests that passed, one per line.
///
/// Only ever appended to, and flushed after every record, so a crash loses
/// at most the test that was running.
pub struct SuccessCache {
    path: PathBuf,
    successes: HashSet<String>,
    file: File,
}

impl SuccessCache {
    pub fn open(path: &Path) -> Result<Self> {
        let successes = match fs::read_to_string(path) {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) => {
                println!("Failed to read successes cache file {} (will create)", path.display());
                log::debug!("{}: {}", path.display(), e);
                HashSet::new()
            }
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Opening successes cache {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            successes,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.successes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.successes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.successes.is_empty()
    }

    pub fn record(&mut self, hash: &str) -> Result<()> {
        if !self.successes.insert(hash.to_string()) {
            return Ok(());
        }
        writeln!(self.file, "{}", hash)?;
        self.file.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    Skipped,
    Succeeded,
    Failed { exit_code: Option<i32> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub test: String,
    pub result: RunResult,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub records: Vec<RunRecord>,
}

impl RunSummary {
    pub fn failures(&self) -> impl Iterator<Item = &RunRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r.result, RunResult::Failed { .. }))
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Computes the cache key of a test file inside a build directory.
pub type TestHasher = fn(&Path, &Path) -> Result<String>;

fn apk_hasher(file: &Path, _build_dir: &Path) -> Result<String> {
    sha256_file(file)
}

pub struct UnitTestRunner {
    target_os: TargetOs,
    build_dir: PathBuf,
    src_root: PathBuf,
    cache: Option<SuccessCache>,
    hasher: TestHasher,
}

impl UnitTestRunner {
    pub fn new(config: &Config, build_dir: &Path, src_root: &Path, cache: Option<SuccessCache>) -> Self {
        let hasher: TestHasher = if config.target_os() == TargetOs::Android {
            apk_hasher
        } else {
            transitive_hash
        };
        Self {
            target_os: config.target_os(),
            build_dir: build_dir.to_path_buf(),
            src_root: src_root.to_path_buf(),
            cache,
            hasher,
        }
    }

    pub fn with_hasher(mut self, hasher: TestHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// The file whose contents identify `test`.
    pub fn test_file(&self, test: &str) -> PathBuf {
        if self.target_os == TargetOs::Android {
            return self
                .build_dir
                .join(format!("{}_apk", test))
                .join(format!("{}-debug.apk", test));
        }
        let name = if cfg!(windows) { format!("{}.exe", test) } else { test.to_string() };
        self.build_dir.join(name)
    }

    fn command(&self, test: &str) -> Command {
        if self.target_os == TargetOs::Android {
            let mut cmd = Command::new("python");
            cmd.arg(self.src_root.join("build").join("android").join("test_runner.py"))
                .arg("gtest")
                .arg("--output-directory")
                .arg(&self.build_dir)
                .arg("-s")
                .arg(test);
            return cmd;
        }
        // Resolved against the new working directory, so relative build
        // directories work too.
        let mut cmd = Command::new(Path::new(".").join(test));
        cmd.current_dir(&self.build_dir);
        cmd
    }

    /// Runs each test in order. Failures are reported and the run goes on;
    /// only an unhashable test or one that cannot be started aborts.
    pub fn run(&mut self, entries: &[&UnittestEntry]) -> Result<RunSummary> {
        println!("Running tests in directory: {}", self.build_dir.display());
        match &self.cache {
            Some(cache) => println!("Successes cache file: {}", cache.path().display()),
            None => println!("No successes cache file (will run all tests unconditionally)"),
        }

        let mut summary = RunSummary::default();
        for entry in entries {
            let test = entry.test.as_str();
            if !entry.cacheable {
                log::debug!("{} is marked as non-cacheable", test);
            }

            let mut hash = None;
            if entry.cacheable {
                if let Some(cache) = &self.cache {
                    let file = self.test_file(test);
                    log::debug!("Getting transitive hash for {} ...", test);
                    let h = (self.hasher)(&file, &self.build_dir)
                        .with_context(|| format!("Failed to get transitive hash for {}", test))?;
                    log::debug!("  Transitive hash: {}", h);
                    if cache.contains(&h) {
                        println!("Skipping {} (previously succeeded)", test);
                        summary.records.push(RunRecord {
                            test: test.to_string(),
                            result: RunResult::Skipped,
                        });
                        continue;
                    }
                    hash = Some(h);
                }
            }

            print!("Running {}.... ", test);
            std::io::stdout().flush()?;
            let (exit_code, output) = output_merged(&mut self.command(test))
                .with_context(|| format!("Failed to start test {}", test))?;
            let result = if exit_code == Some(0) {
                println!("Succeeded");
                if let (Some(cache), Some(h)) = (self.cache.as_mut(), hash.as_deref()) {
                    cache.record(h)?;
                }
                RunResult::Succeeded
            } else {
                match exit_code {
                    Some(code) => println!("Failed with exit code {} and output:", code),
                    None => println!("Killed by a signal; output:"),
                }
                println!("{}", "-".repeat(72));
                println!("{}", output.trim_end());
                println!("{}", "-".repeat(72));
                RunResult::Failed { exit_code }
            };
            summary.records.push(RunRecord {
                test: test.to_string(),
                result,
            });
        }

        if summary.all_succeeded() {
            println!("All tests succeeded");
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetArch;

    #[test]
    fn cache_appends_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("successes");
        {
            let mut cache = SuccessCache::open(&path).unwrap();
            assert!(cache.is_empty());
            cache.record("abc").unwrap();
            cache.record("abc").unwrap();
            cache.record("def").unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "abc\ndef\n");
        let cache = SuccessCache::open(&path).unwrap();
        assert!(cache.contains("abc"));
        assert!(cache.contains("def"));
        assert!(!cache.contains("ghi"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn android_tests_are_identified_by_their_apk() {
        let config = Config::new(Some(TargetOs::Android), Some(TargetArch::Arm), true).unwrap();
        let runner = UnitTestRunner::new(&config, Path::new("/out/android_Debug"), Path::new("/src"), None);
        assert_eq!(
            runner.test_file("base_unittests"),
            PathBuf::from("/out/android_Debug/base_unittests_apk/base_unittests-debug.apk")
        );
    }

    #[cfg(unix)]
    mod with_scripts {
        use super::super::*;
        use crate::config::TargetArch;
        use std::os::unix::fs::PermissionsExt;

        fn test_script(dir: &Path, name: &str, body: &str) {
            let path = dir.join(name);
            fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }

        fn content_hash(file: &Path, _build_dir: &Path) -> Result<String> {
            sha256_file(file)
        }

        fn entries(json: &str) -> Vec<UnittestEntry> {
            serde_json::from_str(json).unwrap()
        }

        fn linux() -> Config {
            Config::new(Some(TargetOs::Linux), Some(TargetArch::X64), true).unwrap()
        }

        #[test]
        fn passing_tests_are_skipped_next_time() {
            let dir = tempfile::tempdir().unwrap();
            let marker = dir.path().join("ran");
            test_script(dir.path(), "a_unittests", &format!("echo run >> '{}'", marker.display()));
            let cache_path = dir.path().join("cache");
            let list = entries(r#"[{"test": "a_unittests"}]"#);
            let selected: Vec<&UnittestEntry> = list.iter().collect();

            for _ in 0..2 {
                let cache = SuccessCache::open(&cache_path).unwrap();
                let mut runner =
                    UnitTestRunner::new(&linux(), dir.path(), dir.path(), Some(cache)).with_hasher(content_hash);
                let summary = runner.run(&selected).unwrap();
                assert!(summary.all_succeeded());
            }
            assert_eq!(fs::read_to_string(&marker).unwrap(), "run\n");

            // A changed binary has a new hash and runs again.
            test_script(dir.path(), "a_unittests", &format!("echo rerun >> '{}'", marker.display()));
            let cache = SuccessCache::open(&cache_path).unwrap();
            let mut runner = UnitTestRunner::new(&linux(), dir.path(), dir.path(), Some(cache)).with_hasher(content_hash);
            let summary = runner.run(&selected).unwrap();
            assert_eq!(summary.records[0].result, RunResult::Succeeded);
            assert_eq!(fs::read_to_string(&marker).unwrap(), "run\nrerun\n");
        }

        #[test]
        fn failures_are_not_cached_and_do_not_stop_the_run() {
            let dir = tempfile::tempdir().unwrap();
            test_script(dir.path(), "bad_unittests", "echo '[  FAILED  ] X.Y'; exit 1");
            test_script(dir.path(), "good_unittests", "exit 0");
            test_script(dir.path(), "nocache_unittests", "exit 0");
            let cache_path = dir.path().join("cache");
            let list = entries(
                r#"[{"test": "bad_unittests"}, {"test": "good_unittests"},
                    {"test": "nocache_unittests", "cacheable": false}]"#,
            );
            let selected: Vec<&UnittestEntry> = list.iter().collect();

            let cache = SuccessCache::open(&cache_path).unwrap();
            let mut runner = UnitTestRunner::new(&linux(), dir.path(), dir.path(), Some(cache)).with_hasher(content_hash);
            let summary = runner.run(&selected).unwrap();

            assert!(!summary.all_succeeded());
            let failed: Vec<&str> = summary.failures().map(|r| r.test.as_str()).collect();
            assert_eq!(failed, vec!["bad_unittests"]);
            assert_eq!(summary.records[0].result, RunResult::Failed { exit_code: Some(1) });
            assert_eq!(summary.records[1].result, RunResult::Succeeded);
            assert_eq!(summary.records[2].result, RunResult::Succeeded);

            let cached = fs::read_to_string(&cache_path).unwrap();
            assert_eq!(cached.lines().count(), 1);
            assert_eq!(cached.trim(), sha256_file(&dir.path().join("good_unittests")).unwrap());
        }

        #[test]
        fn without_a_cache_everything_runs() {
            let dir = tempfile::tempdir().unwrap();
            test_script(dir.path(), "a_unittests", "exit 0");
            let list = entries(r#"[{"test": "a_unittests"}]"#);
            let selected: Vec<&UnittestEntry> = list.iter().collect();
            let mut runner = UnitTestRunner::new(&linux(), dir.path(), dir.path(), None);
            let summary = runner.run(&selected).unwrap();
            assert_eq!(summary.records[0].result, RunResult::Succeeded);
        }

        #[test]
        fn relative_build_dir_runs_tests() {
            let root = tempfile::Builder::new().tempdir_in(".").unwrap();
            let build_dir = root.path().join("out").join("Debug");
            fs::create_dir_all(&build_dir).unwrap();
            assert!(build_dir.is_relative());
            test_script(&build_dir, "a_unittests", "test -x ./a_unittests");
            let list = entries(r#"[{"test": "a_unittests"}]"#);
            let selected: Vec<&UnittestEntry> = list.iter().collect();

            let mut runner = UnitTestRunner::new(&linux(), &build_dir, Path::new("."), None);
            let summary = runner.run(&selected).unwrap();
            assert_eq!(summary.records[0].result, RunResult::Succeeded);
        }
    }
}
