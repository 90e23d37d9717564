//! Build artifacts in cloud storage: naming, uploads through gsutil, and
//! public downloads over HTTPS.

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use indicatif::{ProgressBar, ProgressStyle};
use md5::{Digest, Md5};
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use time::OffsetDateTime;

use crate::config::{Config, TargetOs};
use crate::paths::Paths;
use crate::util::process::{check_call, format_command_line};

pub const BUCKET: &str = "mojo";
const PUBLIC_HOST: &str = "https://storage.googleapis.com";

/// `gs://mojo/<category>/<version>/<platform><ext>`.
pub fn artifact_path(category: &str, version: &str, platform: &str, ext: &str) -> String {
    format!("gs://{}/{}/{}/{}{}", BUCKET, category, version, platform, ext)
}

/// The anonymous HTTPS URL of a `gs://` object.
pub fn public_url(gs_path: &str) -> Result<String> {
    let rest = gs_path
        .strip_prefix("gs://")
        .ok_or_else(|| anyhow!("Not a gs:// path: {}", gs_path))?;
    let encoded: Vec<String> = rest.split('/').map(|c| urlencoding::encode(c).into_owned()).collect();
    Ok(format!("{}/{}", PUBLIC_HOST, encoded.join("/")))
}

/// Files in the build directory are copied up with gsutil.
pub struct Gsutil {
    exe: PathBuf,
    dry_run: bool,
}

impl Gsutil {
    pub fn new(exe: impl Into<PathBuf>, dry_run: bool) -> Self {
        Self {
            exe: exe.into(),
            dry_run,
        }
    }

    /// The copy command as it would be run.
    pub fn copy_command(&self, source: &Path, dest: &str) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("cp").arg(source).arg(dest);
        cmd
    }

    pub fn copy(&self, source: &Path, dest: &str) -> Result<()> {
        if self.dry_run {
            let args = vec!["cp".to_string(), source.display().to_string(), dest.to_string()];
            println!("{}", format_command_line(&self.exe.to_string_lossy(), &args));
            return Ok(());
        }
        log::info!("Uploading {} to {}", source.display(), dest);
        check_call(&mut self.copy_command(source, dest)).with_context(|| format!("Uploading to {}", dest))
    }
}

/// The base64 MD5 from an `x-goog-hash` header (`crc32c=...,md5=...`).
fn goog_md5(header: &str) -> Option<Vec<u8>> {
    header
        .split(',')
        .filter_map(|part| part.trim().strip_prefix("md5="))
        .find_map(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
}

/// Downloads a public artifact to `dest`, showing progress. When the server
/// reports an MD5 for the object, the download is checked against it.
pub fn download_public(client: &Client, gs_path: &str, dest: &Path) -> Result<()> {
    let url = public_url(gs_path)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Creating {}", parent.display()))?;
    }

    let mut resp = client.get(&url).send().with_context(|| format!("GET {}", url))?;
    if !resp.status().is_success() {
        bail!("Download failed: HTTP {} from {}", resp.status(), url);
    }
    let expected_md5 = resp
        .headers()
        .get_all("x-goog-hash")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(goog_md5);

    let len = resp.content_length();
    let pb = ProgressBar::new(len.unwrap_or(0));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({percent}%)")?
            .progress_chars("=>-"),
    );

    let mut hasher = Md5::new();
    let mut file = File::create(dest).with_context(|| format!("create {}", dest.display()))?;
    let mut buf = [0u8; 128 * 1024];
    loop {
        let n = resp.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        hasher.update(&buf[..n]);
        pb.inc(n as u64);
    }
    pb.finish_and_clear();

    if let Some(expected) = expected_md5 {
        let got = hasher.finalize();
        if got.as_slice() != expected.as_slice() {
            bail!(
                "MD5 mismatch after download of {}: got {}, expected {}",
                url,
                hex::encode(got),
                hex::encode(&expected)
            );
        }
    }
    Ok(())
}

/// Apps built here but released from elsewhere.
const UPLOAD_BLACKLIST: [&str; 2] = ["network_service.mojo", "network_service_apptests.mojo"];

/// `.mojo` files directly inside `build_dir`, sorted, minus the blacklist.
pub fn find_apps_to_upload(build_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut apps = Vec::new();
    for entry in fs::read_dir(build_dir).with_context(|| format!("Listing {}", build_dir.display()))? {
        let path = entry?.path();
        if !path.is_file() || path.extension().map_or(true, |e| e != "mojo") {
            continue;
        }
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if UPLOAD_BLACKLIST.contains(&name.as_str()) {
            continue;
        }
        apps.push(path);
    }
    apps.sort();
    Ok(apps)
}

/// Where the shell for `config` at `version` is stored. Android APKs go up
/// as-is; other shells are zipped.
pub fn shell_destination(config: &Config, version: &str) -> String {
    let prefix = format!("gs://{}/shell/{}/{}", BUCKET, version, config.platform());
    if config.target_os() == TargetOs::Android {
        format!("{}/MojoShell.apk", prefix)
    } else {
        format!("{}.zip", prefix)
    }
}

pub fn upload_shell(gsutil: &Gsutil, config: &Config, paths: &Paths, version: &str) -> Result<()> {
    let dest = shell_destination(config, version);
    if config.target_os() == TargetOs::Android {
        return gsutil.copy(&paths.apk_path(), &dest);
    }
    let zip = tempfile::Builder::new().suffix(".zip").tempfile()?;
    log::debug!("zipping {}", paths.shell_path.display());
    zip_single_file(&paths.shell_path, zip.path(), false)?;
    gsutil.copy(zip.path(), &dest)
}

/// Uploads the shell, then every app in the build directory under
/// `gs://mojo/services/<platform>/<version>/`.
pub fn upload_binaries(gsutil: &Gsutil, config: &Config, paths: &Paths, version: &str) -> Result<usize> {
    upload_shell(gsutil, config, paths, version)?;
    let apps = find_apps_to_upload(&paths.build_dir)?;
    for app in &apps {
        let name = app.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let dest = format!("gs://{}/services/{}/{}/{}", BUCKET, config.platform(), version, name);
        gsutil.copy(app, &dest)?;
    }
    Ok(apps.len())
}

fn zip_time(path: &Path) -> zip::DateTime {
    let modified = fs::metadata(path).and_then(|m| m.modified());
    let Ok(modified) = modified else {
        return zip::DateTime::default();
    };
    let t = OffsetDateTime::from(modified);
    zip::DateTime::from_date_and_time(
        t.year().clamp(1980, 2107) as u16,
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second(),
    )
    .unwrap_or_default()
}

/// Writes `zip_path` containing `src` under its file name, with `src`'s
/// modification time and mode 0777. `stored` skips compression for inputs
/// that are already compressed.
pub fn zip_single_file(src: &Path, zip_path: &Path, stored: bool) -> Result<()> {
    let name = src
        .file_name()
        .ok_or_else(|| anyhow!("No file name in {}", src.display()))?
        .to_string_lossy()
        .into_owned();
    let data = fs::read(src).with_context(|| format!("Reading {}", src.display()))?;

    let method = if stored {
        zip::CompressionMethod::Stored
    } else {
        zip::CompressionMethod::Deflated
    };
    let options = zip::write::FileOptions::default()
        .compression_method(method)
        .unix_permissions(0o777)
        .last_modified_time(zip_time(src));

    let out = File::create(zip_path).with_context(|| format!("Creating {}", zip_path.display()))?;
    let mut zip = zip::ZipWriter::new(out);
    zip.start_file(name, options)?;
    zip.write_all(&data)?;
    zip.finish()?;
    Ok(())
}

/// Extracts `name` from the archive at `zip_path` into `dest_dir`, keeping
/// the unix mode recorded in the archive.
pub fn extract_file(zip_path: &Path, name: &str, dest_dir: &Path) -> Result<PathBuf> {
    let file = File::open(zip_path).with_context(|| format!("Opening {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file).with_context(|| format!("Reading {}", zip_path.display()))?;
    let mut entry = archive
        .by_name(name)
        .with_context(|| format!("{} not found in {}", name, zip_path.display()))?;

    fs::create_dir_all(dest_dir)?;
    let dest = dest_dir.join(name);
    let mut out = File::create(&dest).with_context(|| format!("Creating {}", dest.display()))?;
    std::io::copy(&mut entry, &mut out)?;

    #[cfg(unix)]
    if let Some(mode) = entry.unix_mode() {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&dest, fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_naming() {
        assert_eq!(
            artifact_path("shell", "abc123", "linux-x64", ".zip"),
            "gs://mojo/shell/abc123/linux-x64.zip"
        );
        assert_eq!(
            public_url("gs://mojo/network_service/1f2e/android-arm.zip").unwrap(),
            "https://storage.googleapis.com/mojo/network_service/1f2e/android-arm.zip"
        );
        assert!(public_url("https://example.org/x").is_err());
    }

    #[test]
    fn goog_hash_header() {
        // MD5 of "hello world".
        let header = "crc32c=yZRlqg==, md5=XrY7u+Ae7tCTyyK7j1rNww==";
        assert_eq!(hex::encode(goog_md5(header).unwrap()), "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert!(goog_md5("crc32c=yZRlqg==").is_none());
    }

    #[test]
    fn dry_run_does_not_spawn() {
        let gsutil = Gsutil::new("/nonexistent/gsutil", true);
        gsutil.copy(Path::new("/tmp/x.zip"), "gs://mojo/shell/v/linux-x64.zip").unwrap();
        let cmd = gsutil.copy_command(Path::new("/tmp/x.zip"), "gs://mojo/a");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["cp", "/tmp/x.zip", "gs://mojo/a"]);
    }

    #[test]
    fn apps_to_upload_skip_blacklist_and_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.mojo", "a.mojo", "network_service.mojo", "libx.so"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("gen.mojo")).unwrap();
        let apps = find_apps_to_upload(dir.path()).unwrap();
        let names: Vec<_> = apps.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect();
        assert_eq!(names, ["a.mojo", "b.mojo"]);
    }

    #[test]
    fn shell_destinations() {
        let linux = Config::new(Some(TargetOs::Linux), Some(crate::config::TargetArch::X64), false).unwrap();
        assert_eq!(shell_destination(&linux, "v1"), "gs://mojo/shell/v1/linux-x64.zip");
        let android = Config::new(Some(TargetOs::Android), Some(crate::config::TargetArch::Arm), false).unwrap();
        assert_eq!(shell_destination(&android, "v1"), "gs://mojo/shell/v1/android-arm/MojoShell.apk");
    }

    #[test]
    fn dry_run_upload_of_binaries() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(Some(TargetOs::Linux), Some(crate::config::TargetArch::X64), false).unwrap();
        let paths = Paths::for_build_dir(dir.path(), Path::new("out/Release"));
        fs::create_dir_all(&paths.build_dir).unwrap();
        fs::write(&paths.shell_path, b"shell").unwrap();
        fs::write(paths.build_dir.join("echo.mojo"), b"app").unwrap();
        let gsutil = Gsutil::new("/nonexistent/gsutil", true);
        assert_eq!(upload_binaries(&gsutil, &config, &paths, "v1").unwrap(), 1);
    }

    #[test]
    fn zip_and_extract_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("mojo_shell");
        fs::write(&src, b"\x7fELF shell bits").unwrap();
        let zip_path = dir.path().join("linux-x64.zip");
        zip_single_file(&src, &zip_path, false).unwrap();

        let out_dir = dir.path().join("out");
        let extracted = extract_file(&zip_path, "mojo_shell", &out_dir).unwrap();
        assert_eq!(fs::read(&extracted).unwrap(), b"\x7fELF shell bits");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&extracted).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o777);
        }
        assert!(extract_file(&zip_path, "missing", &out_dir).is_err());
    }
}
