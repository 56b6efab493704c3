//! Encoder process launching
//!
//! The encoder is started with a cleared environment and the write end of
//! a pipe on [`HANDSHAKE_FD`]. Once it is registered on the bus it writes
//! its unique name there, which is how we learn where to send calls.

use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::EncoderSettings;
use crate::error::{EncoderError, Result};
use crate::session::SessionContext;

/// Descriptor the encoder writes its bus name to
pub const HANDSHAKE_FD: RawFd = 3;

/// Environment variable enabling verbose encoder diagnostics
const DEBUG_ENV: (&str, &str) = ("G_MESSAGES_DEBUG", "all");

/// A freshly started encoder and the read side of its handshake pipe
pub(crate) struct LaunchedEncoder {
    pub child: Child,
    pub pid: i32,
    pub handshake: pipe::Receiver,
}

/// Create a pipe with close-on-exec set on both ends
fn handshake_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    // SAFETY: `fds` is a valid two-element buffer.
    let r = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 succeeded, both descriptors are fresh and owned by us.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Environment handed to the encoder; nothing else from ours leaks through
pub(crate) fn encoder_env(
    settings: &EncoderSettings,
    session: &SessionContext,
) -> Vec<(&'static str, OsString)> {
    let mut env = vec![
        ("DISPLAY", OsString::from(&session.display_name)),
        ("XAUTHORITY", OsString::from(&session.display_auth)),
    ];
    if settings.debug_messages {
        env.push((DEBUG_ENV.0, OsString::from(DEBUG_ENV.1)));
    }
    env
}

/// Runs in the forked child right before exec.
///
/// Only async-signal-safe calls are allowed here.
fn prepare_child(write_fd: RawFd) -> io::Result<()> {
    // SAFETY: plain libc calls on an owned sigset and descriptors.
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        if libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }

        if write_fd == HANDSHAKE_FD {
            // dup2 onto itself keeps FD_CLOEXEC, clear it by hand
            if libc::fcntl(HANDSHAKE_FD, libc::F_SETFD, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
        } else if libc::dup2(write_fd, HANDSHAKE_FD) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Send `signal` to `pid`.
///
/// Returns `Ok(false)` when the process no longer exists; signaling an
/// encoder that already exited is not an error.
pub(crate) fn send_signal(pid: i32, signal: libc::c_int) -> Result<bool> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let r = unsafe { libc::kill(pid, signal) };
    if r == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(EncoderError::Signal { pid, source: err })
}

/// Hand the read side of the handshake pipe to the runtime.
///
/// On failure the already running encoder `pid` is SIGKILLed, so it is
/// never left behind untracked.
fn register_handshake(read_end: OwnedFd, pid: i32) -> Result<pipe::Receiver> {
    pipe::Receiver::from_owned_fd(read_end).map_err(|source| {
        if let Err(e) = send_signal(pid, libc::SIGKILL) {
            warn!("Failed to kill encoder after setup error: {}", e);
        }
        EncoderError::Register {
            what: "handshake pipe",
            source,
        }
    })
}

/// Start the encoder binary.
///
/// Must be called from within a tokio runtime context. If anything fails
/// after the child exists it is SIGKILLed before the error is returned.
pub(crate) fn launch(settings: &EncoderSettings, session: &SessionContext) -> Result<LaunchedEncoder> {
    let (read_end, write_end) = handshake_pipe().map_err(EncoderError::Pipe)?;
    let write_fd = write_end.as_raw_fd();

    let mut command = Command::new(&settings.program);
    command
        .args(&settings.args)
        .env_clear()
        .envs(encoder_env(settings, session))
        .kill_on_drop(false);
    // SAFETY: prepare_child only performs async-signal-safe libc calls.
    unsafe {
        command.pre_exec(move || prepare_child(write_fd));
    }

    let child = command.spawn().map_err(|source| EncoderError::Launch {
        program: settings.program.display().to_string(),
        source,
    })?;

    // Parent keeps only the read side
    drop(write_end);

    let Some(pid) = child.id().map(|id| id as i32) else {
        return Err(EncoderError::Launch {
            program: settings.program.display().to_string(),
            source: io::Error::new(io::ErrorKind::Other, "encoder exited before it was tracked"),
        });
    };
    info!("Encoder forked with pid {}", pid);

    let handshake = register_handshake(read_end, pid)?;

    Ok(LaunchedEncoder {
        child,
        pid,
        handshake,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> EncoderSettings {
        EncoderSettings {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_encoder_env_is_exactly_three_vars() {
        let session = SessionContext {
            display_name: ":1".to_string(),
            display_auth: "/run/user/1000/gdm/Xauthority".to_string(),
            ..Default::default()
        };
        let env = encoder_env(&EncoderSettings::default(), &session);

        assert_eq!(
            env,
            vec![
                ("DISPLAY", OsString::from(":1")),
                ("XAUTHORITY", OsString::from("/run/user/1000/gdm/Xauthority")),
                ("G_MESSAGES_DEBUG", OsString::from("all")),
            ]
        );
    }

    #[test]
    fn test_signal_to_missing_process_is_tolerated() {
        // pid_max on Linux never reaches this value
        assert!(!send_signal(i32::MAX, 0).unwrap());
    }

    #[tokio::test]
    async fn test_child_writes_to_handshake_fd() {
        let launched = launch(&sh("printf ':1.77' >&3"), &SessionContext::default()).unwrap();
        let mut handshake = launched.handshake;
        let mut child = launched.child;

        let mut name = String::new();
        handshake.read_to_string(&mut name).await.unwrap();
        assert_eq!(name, ":1.77");

        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_child_sees_only_the_encoder_env() {
        let script = r#"[ -z "$HOME" ] && [ "$DISPLAY" = ":0" ] && [ "$G_MESSAGES_DEBUG" = "all" ]"#;
        let mut launched = launch(&sh(script), &SessionContext::default()).unwrap();

        assert!(launched.child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_registration_failure_kills_child() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = Command::new("/bin/sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap() as i32;

        // A regular file is not a pipe, so the runtime refuses it
        let path = std::env::temp_dir().join(format!("wfd-encoderd-handshake-{}", std::process::id()));
        let file = std::fs::File::create(&path).unwrap();
        let err = register_handshake(OwnedFd::from(file), pid).err().unwrap();
        assert!(matches!(err, EncoderError::Register { .. }));

        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_launch_error() {
        let settings = EncoderSettings {
            program: PathBuf::from("/nonexistent/gstencoder"),
            ..Default::default()
        };

        let err = launch(&settings, &SessionContext::default()).err().unwrap();
        assert!(matches!(err, EncoderError::Launch { .. }));
    }
}
