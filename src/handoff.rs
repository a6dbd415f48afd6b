/*============================================================
  Synavera Project: Syn-Till
  Module: syntill_core::handoff
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Sequence "stop serving → apply → relaunch" as an explicit
    state machine with two exits from `staged`: a deferred
    apply carried by the pending marker and the restart exit
    status, or an immediate apply run by a detached executor
    script that outlives this process.

  Security / Safety Notes:
    The executor script is written to the install root with
    owner-only execute rights and deletes itself on success.
    All interpolated paths are shell-quoted.

  Dependencies:
    std::process for the spawn, libc for session detachment.

  Operational Scope:
    Used by the startup gate (deferred) and the `update`
    subcommand (immediate).

  Revision History:
    2025-11-12 COD  Authored process handoff.
  ------------------------------------------------------------
  SSE Principles Observed:
    - No in-memory state crosses a process boundary
    - The detached spawn is fire-and-forget, never joined
    - Illegal transitions are errors, not panics
============================================================*/

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode, Stdio};
use std::time::Duration;

use crate::config::LaunchConfig;
use crate::error::{Result, SynTillError, RESTART_EXIT_STATUS};
use crate::fetch::StagedArtifact;
use crate::logger::Logger;
use crate::marker::PendingUpdateMarker;
use crate::planner::{ProtectedFileSet, BACKUP_SUFFIX};

#[cfg(unix)]
pub const EXECUTOR_SCRIPT: &str = "syntill-apply.sh";
#[cfg(windows)]
pub const EXECUTOR_SCRIPT: &str = "syntill-apply.cmd";

/// Lifecycle of one update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    Idle,
    Checking,
    Staged,
    Applying,
    Restarting,
}

impl fmt::Display for HandoffState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HandoffState::Idle => "idle",
            HandoffState::Checking => "checking",
            HandoffState::Staged => "staged",
            HandoffState::Applying => "applying",
            HandoffState::Restarting => "restarting",
        };
        f.write_str(label)
    }
}

fn allowed(from: HandoffState, to: HandoffState) -> bool {
    use HandoffState::*;
    matches!(
        (from, to),
        (Idle, Checking)
            | (Checking, Idle)
            | (Checking, Staged)
            | (Staged, Idle)
            | (Staged, Restarting)
            | (Idle, Applying)
            | (Applying, Restarting)
            | (Restarting, Idle)
    )
}

/// How the current process must end after a successful handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffExit {
    /// Marker persisted; the supervising launcher must re-run the boot.
    RestartViaLauncher,
    /// Detached executor running; this process should exit cleanly.
    ExecutorSpawned { pid: u32, script: PathBuf },
}

impl HandoffExit {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            HandoffExit::RestartViaLauncher => ExitCode::from(RESTART_EXIT_STATUS),
            HandoffExit::ExecutorSpawned { .. } => ExitCode::SUCCESS,
        }
    }
}

/// Inputs the detached executor needs; everything else it derives.
pub struct ExecutorPlan<'a> {
    pub install_root: &'a Path,
    pub staged: &'a StagedArtifact,
    pub protected: &'a ProtectedFileSet,
    pub launch: &'a LaunchConfig,
    /// Grace period for this process to release its file handles.
    pub settle: Duration,
}

#[derive(Debug)]
pub struct ProcessHandoff {
    state: HandoffState,
}

impl Default for ProcessHandoff {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessHandoff {
    pub fn new() -> Self {
        Self {
            state: HandoffState::Idle,
        }
    }

    pub fn state(&self) -> HandoffState {
        self.state
    }

    pub fn advance(&mut self, to: HandoffState) -> Result<()> {
        if !allowed(self.state, to) {
            return Err(SynTillError::Runtime(format!(
                "Illegal update transition {} → {to}",
                self.state
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Deferred apply: persist the marker, then ask for a restart.
    pub fn defer(
        &mut self,
        marker: &PendingUpdateMarker,
        staged: &StagedArtifact,
        logger: &Logger,
    ) -> Result<HandoffExit> {
        self.expect(HandoffState::Staged)?;
        marker.create(&staged.extracted_path)?;
        self.advance(HandoffState::Restarting)?;
        logger.info(
            "HANDOFF",
            format!(
                "Update staged at {}; exiting with status {RESTART_EXIT_STATUS} for relaunch",
                staged.extracted_path.display()
            ),
        );
        Ok(HandoffExit::RestartViaLauncher)
    }

    /// Immediate apply: spawn a detached executor that applies and relaunches.
    /// On spawn failure nothing has been mutated and the state returns to idle.
    pub fn immediate(&mut self, plan: &ExecutorPlan<'_>, logger: &Logger) -> Result<HandoffExit> {
        self.expect(HandoffState::Staged)?;
        let script = plan.install_root.join(EXECUTOR_SCRIPT);
        let spawned = write_executor_script(&script, plan)
            .and_then(|()| spawn_detached(&script, plan.install_root));
        match spawned {
            Ok(pid) => {
                self.advance(HandoffState::Restarting)?;
                logger.info(
                    "HANDOFF",
                    format!("Detached executor {} started (pid {pid})", script.display()),
                );
                Ok(HandoffExit::ExecutorSpawned { pid, script })
            }
            Err(err) => {
                let _ = fs::remove_file(&script);
                self.advance(HandoffState::Idle)?;
                logger.error("HANDOFF", format!("Executor handoff failed: {err}"));
                Err(match err {
                    SynTillError::Handoff(_) => err,
                    other => SynTillError::Handoff(other.to_string()),
                })
            }
        }
    }

    fn expect(&self, state: HandoffState) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(SynTillError::Runtime(format!(
                "Handoff requires state {state}, current state is {}",
                self.state
            )))
        }
    }
}

fn write_executor_script(script: &Path, plan: &ExecutorPlan<'_>) -> Result<()> {
    #[cfg(unix)]
    let body = render_unix_script(plan);
    #[cfg(windows)]
    let body = render_windows_script(plan);

    fs::write(script, body).map_err(|err| {
        SynTillError::Handoff(format!(
            "Failed to write executor script {}: {err}",
            script.display()
        ))
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(script, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Spawn `script` fully detached and return without waiting on it.
pub fn spawn_detached(script: &Path, working_dir: &Path) -> Result<u32> {
    #[cfg(unix)]
    let mut command = {
        use std::os::unix::process::CommandExt;
        let mut command = Command::new("/bin/sh");
        command.arg(script);
        // New session so the executor drops the controlling terminal as well;
        // `process_group(0)` alone would leave it attached to our session.
        // SAFETY: runs in the forked child before exec and only calls setsid,
        // which is async-signal-safe and touches no memory shared with the parent.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        command
    };
    #[cfg(windows)]
    let mut command = {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        let mut command = Command::new("cmd");
        command.arg("/C").arg(script);
        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        command
    };

    let child = command
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| {
            SynTillError::Handoff(format!(
                "Failed to spawn executor {}: {err}",
                script.display()
            ))
        })?;
    Ok(child.id())
}

/// Path as the script should reference it: relative when under the root.
fn script_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(|relative| relative.display().to_string())
        .unwrap_or_else(|_| path.display().to_string())
}

fn archive_name(staged: &StagedArtifact) -> String {
    staged
        .archive_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(unix)]
fn sh_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(unix)]
fn render_unix_script(plan: &ExecutorPlan<'_>) -> String {
    let root = plan.install_root;
    let protected: Vec<String> = plan
        .protected
        .iter()
        .map(|path| sh_quote(&path.display().to_string()))
        .collect();
    let protected = protected.join(" ");
    let scratch = sh_quote(&script_path(root, &plan.staged.scratch_dir));
    let extracted = sh_quote(&script_path(root, &plan.staged.extracted_path));
    let archive = sh_quote(&archive_name(plan.staged));

    let mut script = String::new();
    script.push_str("#!/bin/sh\n# Generated by syntill-core. Removes itself on success.\nset -u\n");
    script.push_str(&format!("cd {} || exit 1\n", sh_quote(&root.display().to_string())));
    script.push_str(&format!("sleep {}\n", plan.settle.as_secs()));
    script.push_str(&format!(
        "SCRATCH={scratch}\nEXTRACTED={extracted}\nARCHIVE={archive}\nSUFFIX={}\n",
        sh_quote(BACKUP_SUFFIX)
    ));
    script.push_str(&format!(
        "for f in {protected}; do\n  if [ -f \"$f$SUFFIX\" ]; then :\n  elif [ -f \"$f\" ]; then cp -p \"$f\" \"$f$SUFFIX\" || exit 1; fi\ndone\n"
    ));
    script.push_str(
        "if ! cp -R \"$EXTRACTED\"/. .; then\n  echo \"syntill: overlay failed; protected backups kept\" >&2\n  exit 1\nfi\n",
    );
    script.push_str(&format!(
        "for f in {protected}; do\n  if [ -f \"$f$SUFFIX\" ]; then cp -p \"$f$SUFFIX\" \"$f\" && rm -f \"$f$SUFFIX\" || exit 1; fi\ndone\n"
    ));
    script.push_str("rm -f \"$SCRATCH/$ARCHIVE\"\nrm -rf \"$SCRATCH\"\n");
    if let Some(dependency) = plan.launch.dependency_command.as_deref() {
        script.push_str(&format!(
            "{dependency} || echo \"syntill: dependency step failed\" >&2\n"
        ));
    }
    if let Some(command) = plan.launch.command.as_deref() {
        let mut line = sh_quote(command);
        for arg in &plan.launch.args {
            line.push(' ');
            line.push_str(&sh_quote(arg));
        }
        script.push_str(&format!("nohup {line} >/dev/null 2>&1 &\n"));
    }
    script.push_str("rm -f \"$0\"\n");
    script
}

#[cfg(windows)]
fn render_windows_script(plan: &ExecutorPlan<'_>) -> String {
    let root = plan.install_root;
    let protected: Vec<String> = plan
        .protected
        .iter()
        .map(|path| format!("\"{}\"", path.display()))
        .collect();
    let protected = protected.join(" ");
    let scratch = script_path(root, &plan.staged.scratch_dir);
    let extracted = script_path(root, &plan.staged.extracted_path);

    let mut script = String::new();
    script.push_str("@echo off\r\nrem Generated by syntill-core. Removes itself on success.\r\n");
    script.push_str(&format!("cd /d \"{}\" || exit /b 1\r\n", root.display()));
    script.push_str(&format!(
        "timeout /t {} /nobreak >nul\r\n",
        plan.settle.as_secs()
    ));
    script.push_str(&format!(
        "for %%F in ({protected}) do if not exist \"%%~F{BACKUP_SUFFIX}\" if exist \"%%~F\" copy /y \"%%~F\" \"%%~F{BACKUP_SUFFIX}\" >nul\r\n"
    ));
    script.push_str(&format!(
        "xcopy \"{extracted}\\*\" \".\" /e /h /y /q >nul\r\nif errorlevel 1 (\r\n  echo syntill: overlay failed; protected backups kept 1>&2\r\n  exit /b 1\r\n)\r\n"
    ));
    script.push_str(&format!(
        "for %%F in ({protected}) do if exist \"%%~F{BACKUP_SUFFIX}\" (copy /y \"%%~F{BACKUP_SUFFIX}\" \"%%~F\" >nul & del /q \"%%~F{BACKUP_SUFFIX}\")\r\n"
    ));
    script.push_str(&format!(
        "if exist \"{scratch}\\{}\" del /q \"{scratch}\\{}\"\r\nrmdir /s /q \"{scratch}\"\r\n",
        archive_name(plan.staged),
        archive_name(plan.staged)
    ));
    if let Some(dependency) = plan.launch.dependency_command.as_deref() {
        script.push_str(&format!("call {dependency}\r\n"));
    }
    if let Some(command) = plan.launch.command.as_deref() {
        let mut line = format!("\"{command}\"");
        for arg in &plan.launch.args {
            line.push_str(&format!(" \"{arg}\""));
        }
        script.push_str(&format!("start \"\" {line}\r\n"));
    }
    script.push_str("(goto) 2>nul & del \"%~f0\"\r\n");
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{installation, read_file, write_file};

    fn staged_in(root: &Path) -> StagedArtifact {
        let scratch_dir = root.join(".syntill-staging");
        let extracted_path = scratch_dir.join("extracted");
        fs::create_dir_all(&extracted_path).expect("staged");
        StagedArtifact {
            archive_path: scratch_dir.join("till-2.0.0.zip"),
            scratch_dir,
            extracted_path,
        }
    }

    fn staged_machine() -> ProcessHandoff {
        let mut handoff = ProcessHandoff::new();
        handoff.advance(HandoffState::Checking).expect("check");
        handoff.advance(HandoffState::Staged).expect("stage");
        handoff
    }

    #[test]
    fn transitions_follow_the_update_lifecycle() {
        let mut handoff = ProcessHandoff::new();
        assert_eq!(handoff.state(), HandoffState::Idle);
        assert!(handoff.advance(HandoffState::Staged).is_err());
        assert!(handoff.advance(HandoffState::Restarting).is_err());

        handoff.advance(HandoffState::Applying).expect("marker found");
        handoff.advance(HandoffState::Restarting).expect("applied");
        handoff.advance(HandoffState::Idle).expect("boot continues");

        handoff.advance(HandoffState::Checking).expect("check");
        handoff.advance(HandoffState::Idle).expect("declined");
        assert_eq!(handoff.state(), HandoffState::Idle);
    }

    #[test]
    fn deferred_handoff_writes_one_marker_and_requests_restart() {
        let install = tempfile::tempdir().expect("tempdir");
        let staged = staged_in(install.path());
        let marker = PendingUpdateMarker::in_root(install.path());
        let mut handoff = staged_machine();

        let exit = handoff
            .defer(&marker, &staged, &Logger::silent())
            .expect("defer");

        assert_eq!(exit, HandoffExit::RestartViaLauncher);
        assert_eq!(
            format!("{:?}", exit.exit_code()),
            format!("{:?}", ExitCode::from(RESTART_EXIT_STATUS))
        );
        assert_eq!(handoff.state(), HandoffState::Restarting);
        assert_eq!(marker.read().expect("read"), Some(staged.extracted_path.clone()));
    }

    #[test]
    fn deferred_handoff_refuses_second_marker() {
        let install = tempfile::tempdir().expect("tempdir");
        let staged = staged_in(install.path());
        let marker = PendingUpdateMarker::in_root(install.path());
        marker.create(&staged.extracted_path).expect("first");
        let mut handoff = staged_machine();

        let err = handoff
            .defer(&marker, &staged, &Logger::silent())
            .expect_err("already pending");
        assert!(matches!(err, SynTillError::Handoff(_)));
        assert_eq!(handoff.state(), HandoffState::Staged);
    }

    #[test]
    fn handoff_requires_staged_state() {
        let install = tempfile::tempdir().expect("tempdir");
        let staged = staged_in(install.path());
        let marker = PendingUpdateMarker::in_root(install.path());
        let mut handoff = ProcessHandoff::new();
        assert!(handoff.defer(&marker, &staged, &Logger::silent()).is_err());
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[test]
    fn unix_script_quotes_paths_and_relaunches() {
        let install = tempfile::tempdir().expect("tempdir");
        let staged = staged_in(install.path());
        let launch = LaunchConfig {
            command: Some("/opt/till/bin/till-server".into()),
            args: vec!["--port".into(), "it's 8080".into()],
            dependency_command: Some("npm ci --omit=dev".into()),
        };
        let protected = ProtectedFileSet::standard();
        let plan = ExecutorPlan {
            install_root: install.path(),
            staged: &staged,
            protected: &protected,
            launch: &launch,
            settle: Duration::from_secs(2),
        };

        let script = render_unix_script(&plan);
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("sleep 2\n"));
        assert!(script.contains("SCRATCH='.syntill-staging'\n"));
        assert!(script.contains("EXTRACTED='.syntill-staging/extracted'\n"));
        assert!(script.contains("ARCHIVE='till-2.0.0.zip'\n"));
        assert!(script.contains("for f in '.env' 'settings.json'; do"));
        assert!(script.contains("npm ci --omit=dev ||"));
        assert!(script.contains("nohup '/opt/till/bin/till-server' '--port' 'it'\\''s 8080'"));
        assert!(script.trim_end().ends_with("rm -f \"$0\""));

        let backup_at = script.find("cp -p \"$f\" \"$f$SUFFIX\"").expect("backup");
        let overlay_at = script.find("cp -R \"$EXTRACTED\"/. .").expect("overlay");
        let restore_at = script.find("cp -p \"$f$SUFFIX\" \"$f\"").expect("restore");
        assert!(backup_at < overlay_at && overlay_at < restore_at);
    }

    #[cfg(unix)]
    #[test]
    fn unix_script_applies_and_removes_itself() {
        let install = tempfile::tempdir().expect("tempdir");
        installation(install.path(), "1.4.0");
        let staged = staged_in(install.path());
        write_file(&staged.extracted_path, "manifest.json", "{\"version\":\"2.0.0\"}");
        write_file(&staged.extracted_path, ".env", "DB_PASSWORD=changeme\n");
        write_file(&staged.extracted_path, "server/app.js", "// packaged\n");
        let launch = LaunchConfig::default();
        let protected = ProtectedFileSet::standard();
        let plan = ExecutorPlan {
            install_root: install.path(),
            staged: &staged,
            protected: &protected,
            launch: &launch,
            settle: Duration::ZERO,
        };
        let script = install.path().join(EXECUTOR_SCRIPT);
        write_executor_script(&script, &plan).expect("write");

        let status = Command::new("/bin/sh")
            .arg(&script)
            .current_dir(install.path())
            .status()
            .expect("run script");

        assert!(status.success());
        assert_eq!(read_file(install.path(), "manifest.json"), "{\"version\":\"2.0.0\"}");
        assert_eq!(read_file(install.path(), "server/app.js"), "// packaged\n");
        assert_eq!(read_file(install.path(), ".env"), "DB_PASSWORD=hunter2\n");
        assert!(!install.path().join(".env.syntill-backup").exists());
        assert!(!staged.scratch_dir.exists());
        assert!(!script.exists());
    }

    #[cfg(unix)]
    #[test]
    fn unix_script_keeps_backup_left_by_earlier_failure() {
        let install = tempfile::tempdir().expect("tempdir");
        installation(install.path(), "1.4.0");
        write_file(install.path(), ".env.syntill-backup", "DB_PASSWORD=hunter2\n");
        write_file(install.path(), ".env", "DB_PASSWORD=changeme\n");
        let staged = staged_in(install.path());
        write_file(&staged.extracted_path, ".env", "DB_PASSWORD=changeme\n");
        let launch = LaunchConfig::default();
        let protected = ProtectedFileSet::standard();
        let plan = ExecutorPlan {
            install_root: install.path(),
            staged: &staged,
            protected: &protected,
            launch: &launch,
            settle: Duration::ZERO,
        };
        let script = install.path().join(EXECUTOR_SCRIPT);
        write_executor_script(&script, &plan).expect("write");

        let status = Command::new("/bin/sh")
            .arg(&script)
            .current_dir(install.path())
            .status()
            .expect("run script");

        assert!(status.success());
        assert_eq!(read_file(install.path(), ".env"), "DB_PASSWORD=hunter2\n");
        assert!(!install.path().join(".env.syntill-backup").exists());
    }

    #[cfg(unix)]
    #[test]
    fn detached_spawn_runs_without_being_joined() {
        let work = tempfile::tempdir().expect("tempdir");
        let script = work.path().join("touch.sh");
        fs::write(&script, "#!/bin/sh\ntouch detached.ok\n").expect("script");

        let pid = spawn_detached(&script, work.path()).expect("spawn");
        assert!(pid > 0);

        let done = work.path().join("detached.ok");
        for _ in 0..100 {
            if done.exists() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(done.exists());
    }

    #[test]
    fn failed_spawn_returns_to_idle_and_removes_script() {
        let install = tempfile::tempdir().expect("tempdir");
        let staged = staged_in(install.path());
        let launch = LaunchConfig::default();
        let protected = ProtectedFileSet::standard();
        let missing_root = install.path().join("does-not-exist");
        let plan = ExecutorPlan {
            install_root: &missing_root,
            staged: &staged,
            protected: &protected,
            launch: &launch,
            settle: Duration::ZERO,
        };
        let mut handoff = staged_machine();

        let err = handoff
            .immediate(&plan, &Logger::silent())
            .expect_err("cannot write into a missing root");
        assert!(matches!(err, SynTillError::Handoff(_)));
        assert_eq!(handoff.state(), HandoffState::Idle);
        assert!(!missing_root.join(EXECUTOR_SCRIPT).exists());
    }
}
