use crate::coverage::CoverageContext;
use crate::relay::{self, RelayEmitter, TranslationEngine};
use nix::unistd::{ForkResult, fork};
use std::ffi::c_void;
use std::os::unix::io::RawFd;
use std::process;
use thiserror::Error;

/// Controller-facing read descriptor ("go" signals). The controller holds
/// the other end of this pipe and of `FORKSRV_FD + 1`, the write descriptor
/// for handshake, pid and status words.
pub const FORKSRV_FD: RawFd = 198;

/// Child-side write descriptor of the translation-cache relay. A fresh pipe
/// is dup'd onto this number for every iteration.
pub const TSL_FD: RawFd = FORKSRV_FD - 1;

/// Fixed liveness token written to the controller during the handshake. Any
/// 4-byte value is accepted in the other direction.
pub const HANDSHAKE_TOKEN: [u8; 4] = *b"1234";

/// Distinct exit codes for conditions that break the fork-server protocol.
///
/// Every message is fixed-size and the protocol is strictly half-duplex per
/// phase, so a single short or failed read/write is an unrecoverable
/// desynchronization; the process terminates rather than resynchronize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FatalExit {
    /// Shared-memory attach failed during setup.
    MapAttach = 1,
    /// Controller disconnected: short read on the "go" descriptor.
    ParentDead = 2,
    /// Could not establish the per-iteration relay pipe.
    RelayPipe = 3,
    /// `fork` failed.
    Fork = 4,
    /// Short write while reporting the child pid.
    PidWrite = 5,
    /// `waitpid` on the fuzzed child failed.
    Wait = 6,
    /// Short write while reporting the child's exit status.
    StatusWrite = 7,
}

impl FatalExit {
    pub fn code(self) -> i32 {
        self as i32
    }
}

fn die(reason: FatalExit) -> ! {
    process::exit(reason.code())
}

/// A 4-byte protocol word did not transfer whole.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("short read on fork-server channel ({0} of 4 bytes)")]
    ShortRead(isize),
    #[error("short write on fork-server channel ({0} of 4 bytes)")]
    ShortWrite(isize),
}

/// The duplex link between the fork server and the external controller:
/// exact 4-byte words, blocking, no timeout. A silently absent controller
/// shows up as a blocked read, by design; timeout enforcement belongs to the
/// controller.
#[derive(Debug, Clone, Copy)]
pub struct ControlChannel {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl ControlChannel {
    /// The well-known descriptor pair the controller installs before
    /// starting the target.
    pub fn forkserver_default() -> Self {
        ControlChannel {
            read_fd: FORKSRV_FD,
            write_fd: FORKSRV_FD + 1,
        }
    }

    /// A channel over arbitrary descriptors; used by the controller side of
    /// the protocol and by tests.
    pub fn from_fds(read_fd: RawFd, write_fd: RawFd) -> Self {
        ControlChannel { read_fd, write_fd }
    }

    /// Blocks until exactly one 4-byte word arrives.
    pub fn recv(&self) -> Result<[u8; 4], ProtocolError> {
        let mut buf = [0u8; 4];
        let read = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut c_void, 4) };
        if read == 4 {
            Ok(buf)
        } else {
            Err(ProtocolError::ShortRead(read))
        }
    }

    /// Writes exactly one 4-byte word.
    pub fn send(&self, word: &[u8; 4]) -> Result<(), ProtocolError> {
        let written = unsafe { libc::write(self.write_fd, word.as_ptr() as *const c_void, 4) };
        if written == 4 {
            Ok(())
        } else {
            Err(ProtocolError::ShortWrite(written))
        }
    }

    fn close_both(&self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// How control returns to the embedding translation engine after
/// [`ForkServer::run`].
#[derive(Debug)]
pub enum ForkRole {
    /// No controller (or no bitmap): ordinary single-shot execution, no
    /// protocol spoken. A normal, non-fatal outcome.
    Standalone,
    /// This process is a freshly forked fuzzing child. It owns the emitter
    /// half of the relay channel and should resume translated execution.
    Child(RelayEmitter),
}

/// The fork-server controller: handshake once, then loop
/// `wait for go → fork → (child returns | parent relays, waits, reports)`.
///
/// The long-lived parent never returns from [`run`]: it loops until the
/// controller disconnects or a fatal condition terminates the process with a
/// [`FatalExit`] code.
#[derive(Debug)]
pub struct ForkServer {
    channel: ControlChannel,
    tsl_fd: RawFd,
    fork_child: bool,
}

impl ForkServer {
    pub fn new() -> Self {
        ForkServer {
            channel: ControlChannel::forkserver_default(),
            tsl_fd: TSL_FD,
            fork_child: false,
        }
    }

    /// A fork server over explicit descriptors, for harnesses and tests that
    /// lay out their own pipes.
    pub fn with_channel(channel: ControlChannel, tsl_fd: RawFd) -> Self {
        ForkServer {
            channel,
            tsl_fd,
            fork_child: false,
        }
    }

    /// Whether this process is a forked fuzzing child.
    pub fn is_fork_child(&self) -> bool {
        self.fork_child
    }

    /// Runs the fork-server state machine.
    ///
    /// Returns [`ForkRole::Standalone`] when the bitmap is unattached or no
    /// controller answers the handshake; returns [`ForkRole::Child`] in each
    /// forked child. In the parent this loops forever, draining the relay
    /// channel into `engine` between fork and `waitpid` of every iteration.
    pub fn run(&mut self, context: &CoverageContext, engine: &mut dyn TranslationEngine) -> ForkRole {
        // Without a bitmap there is nobody to report coverage to; run the
        // engine unmodified and never speak the protocol.
        if !context.is_active() {
            return ForkRole::Standalone;
        }

        // Tell the controller we are alive. If nobody is listening, this is
        // an ordinary uninstrumented run, not an error.
        if self.channel.send(&HANDSHAKE_TOKEN).is_err() {
            return ForkRole::Standalone;
        }
        eprintln!("covlink: fork server engaged (pid {})", process::id());

        loop {
            // A short read here means the controller has exited.
            if self.channel.recv().is_err() {
                die(FatalExit::ParentDead);
            }

            let relay_read_fd = self.open_relay_pipe();

            match unsafe { fork() } {
                Err(_) => die(FatalExit::Fork),
                Ok(ForkResult::Child) => {
                    // The child no longer speaks the handshake protocol;
                    // it keeps only the relay write end.
                    self.fork_child = true;
                    self.channel.close_both();
                    unsafe { libc::close(relay_read_fd) };
                    return ForkRole::Child(RelayEmitter::new(self.tsl_fd));
                }
                Ok(ForkResult::Parent { child }) => {
                    unsafe { libc::close(self.tsl_fd) };

                    if self.channel.send(&child.as_raw().to_ne_bytes()).is_err() {
                        die(FatalExit::PidWrite);
                    }

                    // Collect translation requests until the child dies or
                    // closes its end of the pipe.
                    relay::drain(relay_read_fd, engine);

                    let mut status: libc::c_int = 0;
                    if unsafe { libc::waitpid(child.as_raw(), &mut status, 0) } < 0 {
                        die(FatalExit::Wait);
                    }
                    if self.channel.send(&status.to_ne_bytes()).is_err() {
                        die(FatalExit::StatusWrite);
                    }
                }
            }
        }
    }

    /// Establishes the per-iteration relay pipe: the child will write to
    /// `tsl_fd`, the parent reads the returned descriptor.
    fn open_relay_pipe(&self) -> RawFd {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            die(FatalExit::RelayPipe);
        }
        if fds[1] != self.tsl_fd {
            if unsafe { libc::dup2(fds[1], self.tsl_fd) } < 0 {
                die(FatalExit::RelayPipe);
            }
            unsafe { libc::close(fds[1]) };
        }
        fds[0]
    }
}

impl Default for ForkServer {
    fn default() -> Self {
        Self::new()
    }
}
