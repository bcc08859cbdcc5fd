//! Integration with the real rsync command.
//!
//! exodus-rsync is typically installed under the name `rsync` (or ahead
//! of it on `PATH`), so locating the genuine binary requires comparing
//! resolved paths against the current executable.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::args::Args;

#[derive(Debug, Error)]
pub enum RsyncError {
    #[error("an 'rsync' command is required but could not be found")]
    Missing,

    #[error("can't locate current executable: {0}")]
    CurrentExe(#[source] std::io::Error),

    #[error("resolving {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("exec {path}: {source}")]
    Exec {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Reconstructs the rsync argument vector from the parsed arguments,
/// forwarding the flags rsync should see for a real transfer.
pub fn arguments(args: &Args) -> Vec<String> {
    let mut argv: Vec<String> = Vec::new();
    let ignored = &args.ignored;

    if ignored.recursive {
        argv.push("--recursive".into());
    }
    if ignored.times {
        argv.push("--times".into());
    }
    if ignored.delete {
        argv.push("--delete".into());
    }
    if ignored.keep_dirlinks {
        argv.push("--keep-dirlinks".into());
    }
    if ignored.omit_dir_times {
        argv.push("--omit-dir-times".into());
    }
    if ignored.compress {
        argv.push("--compress".into());
    }
    if ignored.itemize_changes {
        argv.push("--itemize-changes".into());
    }
    if let Some(rsh) = &ignored.rsh {
        argv.push("--rsh".into());
        argv.push(rsh.clone());
    }
    if ignored.copy_links {
        argv.push("--copy-links".into());
    }
    if ignored.stats {
        argv.push("--stats".into());
    }
    if let Some(timeout) = ignored.timeout {
        argv.push("--timeout".into());
        argv.push(timeout.to_string());
    }
    if ignored.archive {
        argv.push("--archive".into());
    }
    if args.verbose > 0 {
        argv.push(format!("-{}", "v".repeat(args.verbose as usize)));
    }
    if args.ignore_existing {
        argv.push("--ignore-existing".into());
    }
    for rule in &args.filter {
        argv.push("--filter".into());
        argv.push(rule.clone());
    }

    argv.push(args.src.clone());
    argv.push(args.dest.clone());

    debug!(argv = ?argv, "prepared rsync command");

    argv
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn lookup_rsync<I>(dirs: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
{
    dirs.into_iter()
        .map(|dir| dir.join("rsync"))
        .find(|candidate| is_executable(candidate))
}

/// Finds an rsync binary on `PATH` which is not this executable,
/// comparing after symlink resolution. If the first hit resolves to the
/// current executable, the search is repeated with that directory
/// skipped.
pub fn lookup_true_rsync() -> Result<PathBuf, RsyncError> {
    let self_path = std::env::current_exe()
        .and_then(|p| p.canonicalize())
        .map_err(RsyncError::CurrentExe)?;

    let path_var = std::env::var_os("PATH").unwrap_or_default();

    let rsync = lookup_rsync(std::env::split_paths(&path_var)).ok_or(RsyncError::Missing)?;
    let resolved = rsync
        .canonicalize()
        .map_err(|source| RsyncError::Resolve {
            path: rsync.clone(),
            source,
        })?;

    debug!(self_path = %self_path.display(), rsync = %resolved.display(), "Resolved paths");

    if resolved != self_path {
        return Ok(rsync);
    }

    // Since we found ourselves, skip any PATH entry whose rsync is us
    // and try one more time.
    let rsync = lookup_rsync(
        std::env::split_paths(&path_var)
            .filter(|dir| dir.join("rsync").canonicalize().ok().as_ref() != Some(&self_path)),
    );

    match rsync {
        Some(rsync) => {
            debug!(rsync = %rsync.display(), "Resolved with adjusted PATH");
            Ok(rsync)
        }
        None => {
            error!("Cannot find 'rsync' command");
            Err(RsyncError::Missing)
        }
    }
}

fn locate() -> Result<PathBuf, RsyncError> {
    match lookup_true_rsync() {
        Ok(path) => {
            debug!(path = %path.display(), "Located rsync");
            Ok(path)
        }
        Err(err) => {
            warn!(error = %err, "Failed to look up rsync, fallback to /usr/bin/rsync");
            let fallback = PathBuf::from("/usr/bin/rsync");
            if fallback.exists() {
                Ok(fallback)
            } else {
                Err(err)
            }
        }
    }
}

/// Prepares a command for invoking rsync with arguments rebuilt from
/// the parsed command line. Stdout/stderr setup is left to the caller.
pub fn command(args: &Args) -> Result<tokio::process::Command, RsyncError> {
    let rsync = locate()?;
    let mut cmd = tokio::process::Command::new(rsync);
    cmd.args(arguments(args));
    Ok(cmd)
}

fn do_exec(path: &Path, argv: &[String]) -> RsyncError {
    use std::os::unix::process::CommandExt;

    // exec replaces the current process and only returns on failure.
    let err = std::process::Command::new(path).args(argv).exec();
    RsyncError::Exec {
        path: path.to_path_buf(),
        source: err,
    }
}

/// Executes rsync according to the parsed arguments, replacing the
/// current process. Never returns unless an error occurs.
pub fn exec(args: &Args) -> RsyncError {
    match locate() {
        Ok(path) => do_exec(&path, &arguments(args)),
        Err(err) => err,
    }
}

/// Executes rsync with a raw argument vector, unchanged. Used when we
/// are invoked by a remote peer as the server or sender side of a real
/// transfer. Never returns unless an error occurs.
pub fn raw_exec(raw_args: &[String]) -> RsyncError {
    match locate() {
        Ok(path) => do_exec(&path, raw_args),
        Err(err) => err,
    }
}

/// Runs rsync as a supervised subprocess, forwarding its stdout and
/// stderr to the log as info and warning lines respectively. Returns an
/// exit code per the publish pipeline's contract.
pub async fn run_command(token: &CancellationToken, mut cmd: tokio::process::Command) -> i32 {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(error = %err, "Failed to run rsync");
            return 25;
        }
    };

    let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => (stdout, stderr),
        _ => {
            error!("Can't connect pipes to rsync");
            return 39;
        }
    };

    let pid = child.id().unwrap_or_default();

    let out_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(rsync = pid, "{line}");
        }
    });
    let err_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(rsync = pid, "{line}");
        }
    });

    let status = tokio::select! {
        _ = token.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = out_task.await;
            let _ = err_task.await;
            error!("rsync failed");
            return 130;
        }
        status = child.wait() => status,
    };

    let _ = out_task.await;
    let _ = err_task.await;

    match status {
        Ok(status) if status.success() => 0,
        Ok(status) => {
            error!(status = ?status.code(), "rsync failed");
            130
        }
        Err(err) => {
            error!(error = %err, "rsync failed");
            130
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_forwards_transfer_flags() {
        let args = Args::parse_from_argv([
            "exodus-rsync",
            "-rtv",
            "--delete",
            "--timeout",
            "30",
            "-f",
            "- *.bak",
            "/src",
            "host:/dest",
        ]);
        let argv = arguments(&args);
        assert_eq!(
            argv,
            vec![
                "--recursive",
                "--times",
                "--delete",
                "--timeout",
                "30",
                "-v",
                "--filter",
                "- *.bak",
                "/src",
                "host:/dest",
            ]
        );
    }

    #[test]
    fn arguments_end_with_src_and_dest() {
        let args = Args::parse_from_argv(["exodus-rsync", "/src", "host:/dest"]);
        let argv = arguments(&args);
        assert_eq!(argv, vec!["/src", "host:/dest"]);
    }

    #[tokio::test]
    async fn run_command_reports_success_and_failure() {
        let token = CancellationToken::new();

        let mut ok = tokio::process::Command::new("sh");
        ok.arg("-c").arg("echo out; echo err >&2; exit 0");
        assert_eq!(run_command(&token, ok).await, 0);

        let mut bad = tokio::process::Command::new("sh");
        bad.arg("-c").arg("exit 3");
        assert_eq!(run_command(&token, bad).await, 130);
    }

    #[tokio::test]
    async fn run_command_missing_binary() {
        let token = CancellationToken::new();
        let cmd = tokio::process::Command::new("/nonexistent/rsync-binary");
        assert_eq!(run_command(&token, cmd).await, 25);
    }

    #[tokio::test]
    async fn run_command_cancelled() {
        let token = CancellationToken::new();
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg("sleep 30");

        let child_token = token.child_token();
        let handle = tokio::spawn(async move { run_command(&child_token, cmd).await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        token.cancel();
        assert_eq!(handle.await.expect("join"), 130);
    }
}
