use std::ffi::c_void;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// The narrow seam to the embedding binary-translation engine.
///
/// The relay receiver uses `precompile` to warm the parent's translation
/// cache; `Setup` uses `disable_atfork_hooks` once before the fork loop
/// starts. Decoding, block compilation and CPU emulation stay entirely on
/// the engine's side of this trait.
pub trait TranslationEngine {
    /// Compiles (but never executes) the block identified by the triple.
    /// Called in the fork-server parent, under whatever locking discipline
    /// the engine mandates for concurrent compilation.
    fn precompile(&mut self, pc: u64, cs_base: u64, flags: u64);

    /// Disables any `pthread_atfork`-style hook machinery inside the engine
    /// that could corrupt state when the fork server duplicates the process.
    fn disable_atfork_hooks(&mut self) {}
}

/// Engine stub for targets that have nothing to pre-compile.
#[derive(Debug, Default)]
pub struct NopEngine;

impl TranslationEngine for NopEngine {
    fn precompile(&mut self, _pc: u64, _cs_base: u64, _flags: u64) {}
}

/// "Block needs translation" notice relayed from a freshly forked child to
/// the long-lived parent. Purely advisory: losing one costs cache warmth,
/// never correctness.
///
/// The wire form is a fixed 24-byte native-endian frame; sender and receiver
/// always share one host, and a frame is well below `PIPE_BUF` so a single
/// `write` is atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TslMessage {
    /// Guest program counter of the untranslated block.
    pub pc: u64,
    /// Translation base of the block.
    pub cs_base: u64,
    /// Translation flags of the block.
    pub flags: u64,
}

impl TslMessage {
    pub const SIZE: usize = 24;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.pc.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.cs_base.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.flags.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        let word = |range: std::ops::Range<usize>| {
            u64::from_ne_bytes(buf[range].try_into().expect("eight-byte slice"))
        };
        TslMessage {
            pc: word(0..8),
            cs_base: word(8..16),
            flags: word(16..24),
        }
    }
}

/// A relay write that did not transfer a whole frame.
///
/// Callers are expected to discard this explicitly (`let _ = ...`): the
/// channel is best-effort by design, and surfacing the failure as a value
/// rather than swallowing it inside the emitter keeps that contract visible.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("short write on relay channel ({written} of {} bytes)", TslMessage::SIZE)]
    ShortWrite { written: isize },
}

/// Child-side half of the relay channel. Only a forked child holds one;
/// [`crate::forkserver::ForkRole::Child`] is the sole constructor path.
#[derive(Debug)]
pub struct RelayEmitter {
    fd: RawFd,
}

impl RelayEmitter {
    pub(crate) fn new(fd: RawFd) -> Self {
        RelayEmitter { fd }
    }

    /// Builds an emitter over an arbitrary descriptor. Intended for harnesses
    /// and tests that set up their own pipe pair.
    pub fn from_fd(fd: RawFd) -> Self {
        RelayEmitter { fd }
    }

    /// Sends one "needs translation" notice to the parent. Best-effort: a
    /// short or failed write only means the parent misses one cache-warming
    /// hint.
    pub fn request_translation(&self, message: &TslMessage) -> Result<(), RelayError> {
        let buf = message.to_bytes();
        let written =
            unsafe { libc::write(self.fd, buf.as_ptr() as *const c_void, TslMessage::SIZE) };
        if written == TslMessage::SIZE as isize {
            Ok(())
        } else {
            Err(RelayError::ShortWrite { written })
        }
    }
}

/// Parent-side half of the relay: reads whole frames until the child exits
/// or closes its end, pre-compiling each referenced block, then closes the
/// channel. Every anomaly is silent; the fork server proceeds to collect the
/// child's exit status regardless.
pub fn drain(fd: RawFd, engine: &mut dyn TranslationEngine) {
    let mut buf = [0u8; TslMessage::SIZE];
    loop {
        let read = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, TslMessage::SIZE) };
        if read != TslMessage::SIZE as isize {
            break;
        }
        let message = TslMessage::from_bytes(&buf);
        engine.precompile(message.pc, message.cs_base, message.flags);
    }
    unsafe { libc::close(fd) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{ForkResult, fork};

    /// Records every pre-compiled block for later assertions.
    #[derive(Debug, Default)]
    pub struct RecordingEngine {
        pub compiled: Vec<(u64, u64, u64)>,
    }

    impl TranslationEngine for RecordingEngine {
        fn precompile(&mut self, pc: u64, cs_base: u64, flags: u64) {
            self.compiled.push((pc, cs_base, flags));
        }
    }

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "pipe failed");
        (fds[0], fds[1])
    }

    #[test]
    fn message_round_trips_through_wire_form() {
        let message = TslMessage {
            pc: 0x0040_1000,
            cs_base: 0xffff_8000_0000_0000,
            flags: 0x33,
        };
        assert_eq!(TslMessage::from_bytes(&message.to_bytes()), message);
    }

    #[test]
    fn drain_stops_on_partial_frame() {
        let (read_fd, write_fd) = pipe_pair();
        // A lone half-frame: the receiver must treat it as channel closure.
        let garbage = [0u8; TslMessage::SIZE / 2];
        let written =
            unsafe { libc::write(write_fd, garbage.as_ptr() as *const c_void, garbage.len()) };
        assert_eq!(written, garbage.len() as isize);
        unsafe { libc::close(write_fd) };

        let mut engine = RecordingEngine::default();
        drain(read_fd, &mut engine);
        assert!(engine.compiled.is_empty());
    }

    #[test]
    fn emitter_reports_short_write_as_discardable_error() {
        let (read_fd, write_fd) = pipe_pair();
        unsafe { libc::close(read_fd) };
        let emitter = RelayEmitter::from_fd(write_fd);
        let message = TslMessage {
            pc: 1,
            cs_base: 2,
            flags: 3,
        };
        // The Rust runtime ignores SIGPIPE, so this surfaces as an error
        // value, which callers deliberately drop.
        let result = emitter.request_translation(&message);
        assert!(result.is_err());
        let _ = result;
        unsafe { libc::close(write_fd) };
    }

    #[test]
    fn parent_receives_all_frames_then_detects_closure() {
        let (read_fd, write_fd) = pipe_pair();
        let messages = [
            TslMessage {
                pc: 0x1000,
                cs_base: 0,
                flags: 1,
            },
            TslMessage {
                pc: 0x2000,
                cs_base: 0x10,
                flags: 2,
            },
            TslMessage {
                pc: 0x3000,
                cs_base: 0x20,
                flags: 3,
            },
        ];

        match unsafe { fork() }.expect("fork failed") {
            ForkResult::Child => {
                unsafe { libc::close(read_fd) };
                let emitter = RelayEmitter::from_fd(write_fd);
                for message in &messages {
                    let _ = emitter.request_translation(message);
                }
                unsafe { libc::close(write_fd) };
                unsafe { libc::_exit(0) };
            }
            ForkResult::Parent { child } => {
                unsafe { libc::close(write_fd) };
                let mut engine = RecordingEngine::default();
                drain(read_fd, &mut engine);

                assert_eq!(engine.compiled.len(), 3, "exactly three frames expected");
                for (received, sent) in engine.compiled.iter().zip(&messages) {
                    assert_eq!(*received, (sent.pc, sent.cs_base, sent.flags));
                }

                // Channel closure detected; the child's status is collectable.
                let mut status: libc::c_int = -1;
                let waited = unsafe { libc::waitpid(child.as_raw(), &mut status, 0) };
                assert_eq!(waited, child.as_raw());
                assert!(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0);
            }
        }
    }
}
