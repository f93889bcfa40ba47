//! Worker process construction and control.
//!
//! This module builds and starts worker processes. On Unix each worker gets
//! two dedicated pipe channels, `dup2`ed onto fd 3 (host→worker requests)
//! and fd 4 (worker→host responses), so protocol traffic is isolated from
//! whatever the worker prints on stdout/stderr; those streams are captured
//! separately and only ever logged. On platforms without fd passing the
//! worker's stdin/stdout pair carries the protocol instead.
//!
//! Workers are spawned into their own process groups via `setsid()` so that
//! a termination signal reaches the worker and all of its descendants.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStderr, ChildStdout, Command as ProcessCommand};

use crate::config::{LaunchSpec, Signal};
use crate::error::{CorralError, Result};

/// Environment variable the launcher sets to tell the worker its dedicated
/// channel descriptors are wired (value: `"3,4"`).
pub const WORKER_FDS_ENV: &str = "CORRAL_WORKER_FDS";

/// Worker-side descriptor the host writes requests to.
pub const REQUEST_FD: i32 = 3;

/// Worker-side descriptor the worker writes responses to.
pub const RESPONSE_FD: i32 = 4;

/// A freshly spawned worker process with its protocol channels.
pub(crate) struct SpawnedWorker {
    pub child: Child,
    pub pid: u32,
    /// Host→worker request channel.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Worker→host response channel.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Diagnostic-only streams; `None` when the platform reuses them for
    /// the protocol.
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Compute the merged search path value: `new_dirs` deduplicated and
/// prepended, existing entries appended (never overwritten).
pub fn merge_search_path(
    new_dirs: &[PathBuf],
    existing: Option<&std::ffi::OsStr>,
) -> Result<std::ffi::OsString> {
    let mut merged: Vec<PathBuf> = Vec::with_capacity(new_dirs.len());
    for dir in new_dirs {
        if !merged.contains(dir) {
            merged.push(dir.clone());
        }
    }
    if let Some(existing) = existing {
        for entry in std::env::split_paths(existing) {
            if entry.as_os_str().is_empty() {
                continue;
            }
            if !merged.contains(&entry) {
                merged.push(entry);
            }
        }
    }
    std::env::join_paths(merged)
        .map_err(|e| CorralError::InvalidArgument(format!("invalid search path entry: {e}")))
}

/// Apply the common parts of a [`LaunchSpec`] to a command builder.
fn configure_command(spec: &LaunchSpec) -> Result<ProcessCommand> {
    let mut cmd = ProcessCommand::new(&spec.command);
    cmd.args(&spec.args);
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if !spec.library_paths.is_empty() {
        let var = spec.path_var();
        let existing = spec
            .env
            .get(var)
            .map(std::ffi::OsString::from)
            .or_else(|| std::env::var_os(var));
        let merged = merge_search_path(&spec.library_paths, existing.as_deref())?;
        cmd.env(var, merged);
    }
    // A pool dropped without stop() must not leak live processes
    cmd.kill_on_drop(true);
    Ok(cmd)
}

fn spawn_error(spec: &LaunchSpec, error: std::io::Error) -> CorralError {
    CorralError::Spawn(format!(
        "failed to spawn worker '{}': {}",
        spec.command.display(),
        error
    ))
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use tokio::net::unix::pipe;

    /// Create an anonymous pipe with both ends CLOEXEC.
    ///
    /// `dup2` in the child clears CLOEXEC on the worker's copies; the
    /// host's ends never leak into any exec'd process.
    fn raw_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_cloexec(read.as_raw_fd())?;
        set_cloexec(write.as_raw_fd())?;
        Ok((read, write))
    }

    fn set_cloexec(fd: RawFd) -> std::io::Result<()> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Install `fd` as `target` in the child. Runs between fork and exec,
    /// so only async-signal-safe calls are allowed.
    fn install_fd(fd: RawFd, target: RawFd) -> std::io::Result<()> {
        if fd == target {
            // already in place; just clear CLOEXEC so it survives exec
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            if flags < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
                return Err(std::io::Error::last_os_error());
            }
        } else if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Move `fd` above the reserved descriptor range so the two `dup2`
    /// calls cannot clobber each other's source.
    fn clear_of_targets(fd: RawFd) -> std::io::Result<RawFd> {
        if fd > RESPONSE_FD {
            return Ok(fd);
        }
        let moved = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, RESPONSE_FD + 1) };
        if moved < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(moved)
    }

    /// Spawn a worker with dedicated request/response channels on fds 3/4.
    pub(crate) fn spawn_worker(spec: &LaunchSpec) -> Result<SpawnedWorker> {
        let (child_read, host_write) = raw_pipe()?; // host → worker
        let (host_read, child_write) = raw_pipe()?; // worker → host

        let mut cmd = configure_command(spec)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env(WORKER_FDS_ENV, format!("{REQUEST_FD},{RESPONSE_FD}"));

        let request_fd = child_read.as_raw_fd();
        let response_fd = child_write.as_raw_fd();
        let uid = spec.run_as_user;
        let gid = spec.run_as_group;
        // SAFETY: the closure only performs async-signal-safe syscalls
        // (setsid, fcntl, dup2, setgid, setuid).
        unsafe {
            cmd.pre_exec(move || {
                libc::setsid();
                let request_fd = clear_of_targets(request_fd)?;
                let response_fd = clear_of_targets(response_fd)?;
                install_fd(request_fd, REQUEST_FD)?;
                install_fd(response_fd, RESPONSE_FD)?;
                if let Some(gid) = gid
                    && libc::setgid(gid) != 0
                {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some(uid) = uid
                    && libc::setuid(uid) != 0
                {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| spawn_error(spec, e))?;
        // the worker holds its own copies now
        drop(child_read);
        drop(child_write);

        let pid = child
            .id()
            .ok_or_else(|| CorralError::Spawn("spawned worker has no pid".to_string()))?;

        set_nonblocking(host_write.as_raw_fd())?;
        set_nonblocking(host_read.as_raw_fd())?;
        let writer = pipe::Sender::from_owned_fd(host_write)?;
        let reader = pipe::Receiver::from_owned_fd(host_read)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        Ok(SpawnedWorker {
            child,
            pid,
            writer: Box::new(writer),
            reader: Box::new(reader),
            stdout,
            stderr,
        })
    }

    /// Send a termination signal to the worker's process group.
    ///
    /// The worker is a session leader (`setsid` at spawn), so its process
    /// group id equals its pid and a negative-pid kill reaches the whole
    /// tree. Best-effort: a worker that already exited is a no-op.
    pub(crate) fn kill_worker(pid: u32, signal: Signal) {
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill with a negative pid only delivers a signal to the
        // process group.
        unsafe {
            libc::kill(-(pid as i32), sig);
        }
    }
}

#[cfg(unix)]
pub(crate) use unix_impl::{kill_worker, set_nonblocking, spawn_worker};

// ============================================================================
// Fallback Implementation (no fd passing)
// ============================================================================

#[cfg(not(unix))]
mod fallback_impl {
    use super::*;

    /// Spawn a worker whose stdin/stdout pair carries the protocol.
    pub(crate) fn spawn_worker(spec: &LaunchSpec) -> Result<SpawnedWorker> {
        let mut cmd = configure_command(spec)?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| spawn_error(spec, e))?;
        let pid = child
            .id()
            .ok_or_else(|| CorralError::Spawn("spawned worker has no pid".to_string()))?;

        let writer = child
            .stdin
            .take()
            .ok_or_else(|| CorralError::Spawn("worker stdin not captured".to_string()))?;
        let reader = child
            .stdout
            .take()
            .ok_or_else(|| CorralError::Spawn("worker stdout not captured".to_string()))?;
        let stderr = child.stderr.take();

        Ok(SpawnedWorker {
            child,
            pid,
            writer: Box::new(writer),
            reader: Box::new(reader),
            stdout: None,
            stderr,
        })
    }

    /// Terminate the worker's process tree. Signals are not available, so
    /// both signal kinds force-kill.
    pub(crate) fn kill_worker(pid: u32, _signal: Signal) {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output();
    }
}

#[cfg(not(unix))]
pub(crate) use fallback_impl::{kill_worker, spawn_worker};

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn test_merge_search_path_dedups_and_orders() {
        let new_dirs = vec![
            PathBuf::from("/opt/a"),
            PathBuf::from("/opt/b"),
            PathBuf::from("/opt/a"),
        ];
        let merged = merge_search_path(&new_dirs, None).unwrap();
        let entries: Vec<PathBuf> = std::env::split_paths(&merged).collect();
        assert_eq!(entries, vec![PathBuf::from("/opt/a"), PathBuf::from("/opt/b")]);
    }

    #[test]
    fn test_merge_search_path_appends_existing() {
        let new_dirs = vec![PathBuf::from("/opt/new")];
        let existing = std::env::join_paths([
            PathBuf::from("/usr/lib"),
            PathBuf::from("/opt/new"), // duplicate of a new entry
        ])
        .unwrap();
        let merged = merge_search_path(&new_dirs, Some(existing.as_os_str())).unwrap();
        let entries: Vec<PathBuf> = std::env::split_paths(&merged).collect();
        assert_eq!(
            entries,
            vec![PathBuf::from("/opt/new"), PathBuf::from("/usr/lib")]
        );
    }

    #[test]
    fn test_merge_search_path_skips_empty_existing_entries() {
        let new_dirs = vec![PathBuf::from("/opt/new")];
        let empty = OsString::new();
        let merged = merge_search_path(&new_dirs, Some(empty.as_os_str())).unwrap();
        let entries: Vec<PathBuf> = std::env::split_paths(&merged).collect();
        assert_eq!(entries, vec![PathBuf::from("/opt/new")]);
    }

    #[tokio::test]
    async fn test_spawn_worker_missing_executable() {
        let spec = LaunchSpec::new("/nonexistent/corral-worker-binary");
        let result = spawn_worker(&spec);
        assert!(matches!(result, Err(CorralError::Spawn(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_worker_wires_response_channel() {
        use tokio::io::AsyncReadExt;

        // a worker that writes straight to its response descriptor
        let mut spec = LaunchSpec::new("/bin/sh");
        spec.args = vec!["-c".to_string(), "echo ok >&4".to_string()];

        let mut spawned = spawn_worker(&spec).unwrap();
        let mut buf = Vec::new();
        spawned.reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ok\n");
        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_worker_wires_request_channel() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // a worker that echoes one request line back over the response fd
        let mut spec = LaunchSpec::new("/bin/sh");
        spec.args = vec![
            "-c".to_string(),
            "read line <&3; echo \"$line\" >&4".to_string(),
        ];

        let mut spawned = spawn_worker(&spec).unwrap();
        spawned.writer.write_all(b"ping\n").await.unwrap();
        spawned.writer.flush().await.unwrap();

        let mut buf = Vec::new();
        spawned.reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping\n");
        spawned.child.wait().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_worker_terminates_process_group() {
        let mut spec = LaunchSpec::new("/bin/sleep");
        spec.args = vec!["30".to_string()];

        let mut spawned = spawn_worker(&spec).unwrap();
        kill_worker(spawned.pid, Signal::Kill);

        let status = spawned.child.wait().await.unwrap();
        assert!(!status.success());
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(status.signal(), Some(libc::SIGKILL));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_worker_sets_search_path() {
        use tokio::io::AsyncReadExt;

        let mut spec = LaunchSpec::new("/bin/sh");
        spec.args = vec!["-c".to_string(), "echo \"$CORRAL_TEST_LIBS\" >&4".to_string()];
        spec.library_paths = vec![PathBuf::from("/opt/one"), PathBuf::from("/opt/two")];
        spec.library_path_var = Some("CORRAL_TEST_LIBS".to_string());

        let mut spawned = spawn_worker(&spec).unwrap();
        let mut buf = String::new();
        spawned.reader.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf.trim(), "/opt/one:/opt/two");
        spawned.child.wait().await.unwrap();
    }
}
