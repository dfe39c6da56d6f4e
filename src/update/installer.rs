//! Installation handoff.
//!
//! Hands the downloaded artifact to the platform: either the artifact is an
//! installer that is spawned detached, or it is a replacement binary that a
//! short-lived helper script copies over the current executable once this
//! process has exited, before relaunching it.

#[cfg(test)]
use mockall::automock;

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

use crate::config::InstallMethod;
use crate::update::error::UpdateError;

/// What was started to finish the update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    /// The installer is running. App should exit.
    InstallerLaunched { artifact: PathBuf },
    /// Helper script waits for this process to exit, then swaps the binary.
    ReplaceScheduled { helper_script: PathBuf },
}

/// Starts the installation of a downloaded artifact
#[cfg_attr(test, automock)]
pub trait Installer: Send + Sync {
    /// Start the install without waiting for it to finish
    fn launch(&self, artifact: &Path) -> Result<Handoff, UpdateError>;
}

/// Ends the current process once the handoff has been issued
#[cfg_attr(test, automock)]
pub trait ProcessExit: Send + Sync {
    fn exit_after(&self, delay: Duration);
}

/// Shared slot holding the log writer guard until the process exits
pub type LogGuardSlot = Arc<Mutex<Option<WorkerGuard>>>;

/// Exits the process from a background thread after `delay`
#[derive(Debug, Default)]
pub struct DelayedExit {
    log_guard: Option<LogGuardSlot>,
}

impl DelayedExit {
    /// Flush and release the log writer in `log_guard` before exiting
    pub fn flushing(log_guard: LogGuardSlot) -> Self {
        Self {
            log_guard: Some(log_guard),
        }
    }

    /// Drop the log guard, writing out buffered lines
    fn flush_logs(&self) {
        if let Some(slot) = &self.log_guard
            && let Ok(mut guard) = slot.lock()
        {
            guard.take();
        }
    }
}

impl ProcessExit for DelayedExit {
    fn exit_after(&self, delay: Duration) {
        let exit = Self {
            log_guard: self.log_guard.clone(),
        };
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            info!("Exiting for update handoff");
            exit.flush_logs();
            std::process::exit(0);
        });
    }
}

/// `Installer` for the host platform
#[derive(Debug, Clone)]
pub struct PlatformInstaller {
    method: InstallMethod,
    /// Executable to replace in `ReplaceBinary` mode
    target: PathBuf,
    /// Process the helper script waits for
    pid: u32,
}

impl PlatformInstaller {
    pub fn new(method: InstallMethod, target: PathBuf, pid: u32) -> Self {
        Self {
            method,
            target,
            pid,
        }
    }

    /// Installer replacing the running executable, waiting on this process
    pub fn for_current_process(method: InstallMethod) -> Result<Self, UpdateError> {
        let target = std::env::current_exe().map_err(|e| {
            UpdateError::Launch(format!("cannot determine current executable path: {}", e))
        })?;
        Ok(Self::new(method, target, std::process::id()))
    }

    fn run_installer(&self, artifact: &Path) -> Result<Handoff, UpdateError> {
        set_executable(artifact)?;

        let mut command = installer_command(artifact);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        command.spawn().map_err(|e| {
            UpdateError::Launch(format!("cannot start {}: {}", artifact.display(), e))
        })?;

        info!("Installer started: {}", artifact.display());
        Ok(Handoff::InstallerLaunched {
            artifact: artifact.to_owned(),
        })
    }

    /// Write the replace-and-relaunch helper next to the artifact.
    ///
    /// Fails with `Permission` before anything is written when the install
    /// target's directory is not writable.
    pub fn stage_replace(&self, artifact: &Path) -> Result<PathBuf, UpdateError> {
        check_target_writable(&self.target)?;
        set_executable(artifact)?;

        let dir = artifact.parent().unwrap_or_else(|| Path::new("."));
        let script_path = dir.join(helper_script_name());
        let script = render_helper_script(artifact, &self.target, self.pid);

        std::fs::write(&script_path, script).map_err(|e| {
            UpdateError::Launch(format!(
                "cannot write update script to {}: {}",
                script_path.display(),
                e
            ))
        })?;
        set_executable(&script_path)?;

        info!("Update script written to {}", script_path.display());
        Ok(script_path)
    }

    fn replace_binary(&self, artifact: &Path) -> Result<Handoff, UpdateError> {
        let script_path = self.stage_replace(artifact)?;

        helper_command(&script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| UpdateError::Launch(format!("cannot start update script: {}", e)))?;

        Ok(Handoff::ReplaceScheduled {
            helper_script: script_path,
        })
    }
}

impl Installer for PlatformInstaller {
    fn launch(&self, artifact: &Path) -> Result<Handoff, UpdateError> {
        if !artifact.is_file() {
            return Err(UpdateError::Launch(format!(
                "artifact {} does not exist",
                artifact.display()
            )));
        }

        match self.method {
            InstallMethod::Installer => self.run_installer(artifact),
            InstallMethod::ReplaceBinary => self.replace_binary(artifact),
        }
    }
}

/// Pick the launcher for an installer package by its extension
fn installer_command(artifact: &Path) -> Command {
    let extension = artifact
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());

    match extension.as_deref() {
        Some("msi") => {
            let mut command = Command::new("msiexec");
            command.arg("/i").arg(artifact);
            command
        }
        Some("dmg") | Some("pkg") => {
            let mut command = Command::new("open");
            command.arg(artifact);
            command
        }
        _ => Command::new(artifact),
    }
}

fn check_target_writable(target: &Path) -> Result<(), UpdateError> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    match tempfile::NamedTempFile::new_in(dir) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Err(
            UpdateError::Permission(format!("cannot write to {}: {}", dir.display(), e)),
        ),
        Err(e) => Err(UpdateError::Write(e)),
    }
}

/// Set executable permission on Unix platforms.
#[cfg(unix)]
fn set_executable(path: &Path) -> Result<(), UpdateError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(|e| {
        UpdateError::Permission(format!(
            "cannot set executable permission on {}: {}",
            path.display(),
            e
        ))
    })
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<(), UpdateError> {
    Ok(())
}

fn helper_script_name() -> &'static str {
    if cfg!(windows) {
        "shell-update.bat"
    } else {
        "shell-update.sh"
    }
}

#[cfg(not(windows))]
fn helper_command(script: &Path) -> Command {
    let mut command = Command::new("sh");
    command.arg(script);
    command
}

#[cfg(windows)]
fn helper_command(script: &Path) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(script);
    command
}

/// Quote a path for POSIX sh
fn sh_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

/// Waits for `pid`, stages the new binary beside the target and renames it
/// into place, then relaunches.
#[cfg(not(windows))]
fn render_helper_script(new_binary: &Path, target: &Path, pid: u32) -> String {
    let staged = target.with_extension("new");
    format!(
        r#"#!/bin/sh
while kill -0 {pid} 2>/dev/null; do
    sleep 1
done
cp -f {new} {staged} || exit 1
chmod 755 {staged}
mv -f {staged} {target} || exit 1
{target} >/dev/null 2>&1 &
rm -f "$0"
"#,
        pid = pid,
        new = sh_quote(new_binary),
        staged = sh_quote(&staged),
        target = sh_quote(target),
    )
}

#[cfg(windows)]
fn render_helper_script(new_binary: &Path, target: &Path, pid: u32) -> String {
    let staged = target.with_extension("new");
    format!(
        r#"@echo off
:wait
tasklist /FI "PID eq {pid}" 2>nul | find "{pid}" >nul
if not errorlevel 1 (
    timeout /t 1 /nobreak >nul
    goto wait
)
copy /y "{new}" "{staged}" >nul
if errorlevel 1 exit /b 1
move /y "{staged}" "{target}" >nul
if errorlevel 1 exit /b 1
start "" "{target}"
del "%~f0"
"#,
        pid = pid,
        new = new_binary.display(),
        staged = staged.display(),
        target = target.display(),
    )
}
