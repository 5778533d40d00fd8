// src/install/scripts.rs

//! Package scripts and external hooks
//!
//! Package scripts (`preinstall`, `postinstall`, `preremove`,
//! `postremove`) run with the package's own directory as working
//! directory and `TPKG_HOME` set to the install base. External hooks live
//! in the externals directory and are invoked as
//! `<hook> <package-filename> install|remove` with their data on stdin.

use crate::error::{Error, Result};
use crate::metadata::External;
use std::io::{ErrorKind, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable carrying the install base
pub const HOME_ENV: &str = "TPKG_HOME";

/// Attempts when the kernel reports the script as busy
const SPAWN_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Install,
    Remove,
}

impl HookAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookAction::Install => "install",
            HookAction::Remove => "remove",
        }
    }
}

fn describe(status: std::process::ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit status {}", code),
        (None, Some(signal)) => format!("killed by signal {}", signal),
        _ => "unknown status".to_string(),
    }
}

fn log_output(label: &str, output: &Output) {
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        info!("[{}] {}", label, line);
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        warn!("[{}] {}", label, line);
    }
}

/// Spawn, retrying while the executable is still open for writing elsewhere
fn spawn(command: &mut Command) -> std::io::Result<Child> {
    let mut attempt = 1;
    loop {
        match command.spawn() {
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                debug!("Executable busy, retrying (attempt {})", attempt);
                std::thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Run a package script
///
/// Returns `Ok(false)` when the package has no such script.
pub fn run_script(script: &Path, package: &str, cwd: &Path, base: &Path) -> Result<bool> {
    if !script.is_file() {
        return Ok(false);
    }

    let name = script
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    info!("Running {} script for {}", name, package);

    let script_error = |status: String| Error::ScriptError {
        package: package.to_string(),
        script: name.clone(),
        status,
    };

    let child = spawn(
        Command::new(script)
            .current_dir(cwd)
            .env(HOME_ENV, base)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped()),
    )
    .map_err(|e| script_error(format!("failed to start: {}", e)))?;

    let output = child
        .wait_with_output()
        .map_err(|e| script_error(format!("failed to wait: {}", e)))?;
    log_output(&name, &output);

    if output.status.success() {
        debug!("{} script for {} completed", name, package);
        Ok(true)
    } else {
        Err(script_error(describe(output.status)))
    }
}

/// Data an external hook receives on stdin
///
/// `datafile` is read and `datascript` is run relative to `dir`, the
/// unpacked package directory.
pub fn external_data(external: &External, dir: &Path) -> Result<Option<String>> {
    if let Some(data) = &external.data {
        return Ok(Some(data.clone()));
    }

    if let Some(datafile) = &external.datafile {
        let path = dir.join(datafile);
        let data = std::fs::read_to_string(&path).map_err(|e| {
            Error::ExternalError(format!(
                "Failed to read data file {} for external {}: {}",
                path.display(),
                external.name,
                e
            ))
        })?;
        return Ok(Some(data));
    }

    if let Some(datascript) = &external.datascript {
        let path = dir.join(datascript);
        let output = spawn(
            Command::new(&path)
                .current_dir(dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped()),
        )
        .and_then(Child::wait_with_output)
        .map_err(|e| {
            Error::ExternalError(format!("Failed to run data script {}: {}", path.display(), e))
        })?;

        if !output.status.success() {
            return Err(Error::ExternalError(format!(
                "Data script {} for external {} failed: {}",
                path.display(),
                external.name,
                describe(output.status)
            )));
        }
        return Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()));
    }

    Ok(None)
}

/// The same hook with its data resolved inline
///
/// Installed records keep this form so removal does not need the
/// package contents.
pub fn resolve_external(external: &External, dir: &Path) -> Result<External> {
    Ok(External {
        name: external.name.clone(),
        data: external_data(external, dir)?,
        datafile: None,
        datascript: None,
    })
}

/// Invoke an external hook
pub fn run_external(
    externals_dir: &Path,
    external: &External,
    package_file: &str,
    action: HookAction,
) -> Result<()> {
    let hook = externals_dir.join(&external.name);
    if !hook.is_file() {
        return Err(Error::ExternalError(format!(
            "External {} not found in {}",
            external.name,
            externals_dir.display()
        )));
    }

    info!("Running external {} ({}) for {}", external.name, action.as_str(), package_file);

    let mut child = spawn(
        Command::new(&hook)
            .arg(package_file)
            .arg(action.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped()),
    )
    .map_err(|e| Error::ExternalError(format!("Failed to start {}: {}", hook.display(), e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        let data = external.data.as_deref().unwrap_or_default();
        match stdin.write_all(data.as_bytes()) {
            Ok(()) => {}
            // The hook may not read its data
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
            Err(e) => {
                return Err(Error::ExternalError(format!(
                    "Failed to send data to {}: {}",
                    hook.display(),
                    e
                )));
            }
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|e| Error::ExternalError(format!("Failed to wait for {}: {}", hook.display(), e)))?;
    log_output(&external.name, &output);

    if !output.status.success() {
        return Err(Error::ExternalError(format!(
            "External {} {} for {} failed: {}",
            external.name,
            action.as_str(),
            package_file,
            describe(output.status)
        )));
    }
    Ok(())
}
