/*!

The plugin host: spawns and manages one worker subprocess per
[crate::plugin::proxy::PluginProxy]. See spec §6.3 and §9's note on
worker isolation.

 */
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use crate::error::{Error, Result};
use crate::plugin::protocol::{self, Request, Signal};

/// Abstraction over "a thing that speaks the worker IPC protocol",
/// letting [crate::plugin::proxy::PluginProxy] be tested against a fake
/// worker without spawning real processes.
pub trait PluginWorker: Send {
    fn send(&mut self, request: &Request) -> Result<()>;
    /// Blocks for the worker's next signal. `Ok(None)` means the worker's
    /// stdout closed — a crash, from the proxy's point of view.
    fn recv(&mut self) -> Result<Option<Signal>>;
    /// Forcibly terminates the worker process, if still alive.
    fn terminate(&mut self);
}

/// A worker backed by a real OS subprocess, speaking the framed protocol
/// over its stdin/stdout, with a single handshake byte on stderr marking
/// readiness.
pub struct SubprocessWorker {
    child: Child,
    stdin: BufWriter<std::process::ChildStdin>,
    stdout: BufReader<std::process::ChildStdout>,
}

impl SubprocessWorker {
    /// Spawns `binary` and blocks until its startup handshake byte
    /// arrives on stderr, per spec §6.3.
    pub fn spawn(binary: &Path, args: &[String]) -> Result<Self> {
        let mut command = Command::new(binary);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        set_parent_death_signal(&mut command);

        let mut child = command
            .spawn()
            .map_err(|e| Error::ConnectionFailure(Box::new(e)))?;

        let mut stderr = child.stderr.take().expect("stderr piped");
        await_handshake(&mut stderr)?;

        let stdin = BufWriter::new(child.stdin.take().expect("stdin piped"));
        let stdout = BufReader::new(child.stdout.take().expect("stdout piped"));
        Ok(SubprocessWorker { child, stdin, stdout })
    }
}

fn await_handshake(stderr: &mut std::process::ChildStderr) -> Result<()> {
    use std::io::Read;
    let mut byte = [0u8; 1];
    stderr
        .read_exact(&mut byte)
        .map_err(|e| Error::ConnectionFailure(Box::new(e)))?;
    if byte[0] != 1 {
        return Err(Error::ConnectionFailure(Box::from(format!(
            "unexpected handshake byte {}",
            byte[0]
        ))));
    }
    Ok(())
}

#[cfg(unix)]
fn set_parent_death_signal(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        command.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn set_parent_death_signal(_command: &mut Command) {}

impl PluginWorker for SubprocessWorker {
    fn send(&mut self, request: &Request) -> Result<()> {
        protocol::write_request(&mut self.stdin, request).map_err(|e| Error::ConnectionFailure(Box::new(e)))
    }

    fn recv(&mut self) -> Result<Option<Signal>> {
        protocol::read_signal(&mut self.stdout)
    }

    fn terminate(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for SubprocessWorker {
    fn drop(&mut self) {
        // Best-effort: if the worker already exited cleanly this is a
        // harmless no-op error from kill().
        let _ = self.child.kill();
    }
}
