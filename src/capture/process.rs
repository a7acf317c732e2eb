//! Capture processes: one forked process per streaming camera
//!
//! The child owns its copy of the [`ManagedCamera`], creates the shared frame
//! buffer, overwrites it with every captured frame and unlinks it on the way
//! out. The parent keeps a [`CaptureHandle`]: the child's pid plus the
//! sending half of a stop channel.
//!
//! A child killed by a signal never reaches its unlink, so the handle
//! reclaims the segment by name once it has reaped such a child. The slot
//! stays occupied until then, so no other creator can hold that name.

use std::fmt;
use std::io;
use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockProtocol, SockType};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::libc::_exit;
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, error, info, warn};

use crate::camera::ManagedCamera;
use crate::error::{CaptureError, CaptureFailure};
use crate::shm::SharedFrameBuffer;

/// Signals the orchestrator handles for its capture processes
const ISOLATED_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// Exit status for a capture loop that failed
pub const EXIT_CAPTURE_FAILED: i32 = 1;
/// Exit status for a capture loop that panicked
pub const EXIT_CAPTURE_PANICKED: i32 = 101;

/// Orchestrator half of the stop channel
#[derive(Debug)]
pub struct StopSignal {
    stream: UnixStream,
}

/// Capture-process half of the stop channel
#[derive(Debug)]
pub struct StopListener {
    stream: UnixStream,
}

/// Create a connected stop channel
pub fn stop_channel() -> Result<(StopSignal, StopListener), Errno> {
    let (signal, listener) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None::<SockProtocol>,
        SockFlag::SOCK_CLOEXEC,
    )?;
    Ok((
        StopSignal {
            stream: UnixStream::from(signal),
        },
        StopListener {
            stream: UnixStream::from(listener),
        },
    ))
}

impl StopSignal {
    /// Request a stop. Idempotent, and harmless if the listener is gone.
    pub fn set(&self) -> io::Result<()> {
        // Shutdown acts on the socket itself, so copies of this descriptor
        // inherited by other capture processes cannot mask it
        match self.stream.shutdown(Shutdown::Write) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

impl StopListener {
    /// Non-blocking check; also true once every signal handle is closed
    pub fn is_set(&self) -> Result<bool, CaptureError> {
        let mut fds = [PollFd::new(self.stream.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(0) | Err(Errno::EINTR) => Ok(false),
            Ok(_) => Ok(true),
            Err(errno) => Err(CaptureError::StopSignal(errno)),
        }
    }
}

/// How a capture process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureExit {
    /// Stopped on request after cleaning up
    Completed,
    /// Capture failed; the buffer was still torn down
    Failed(i32),
    /// Terminated by a signal before it could clean up
    Killed(Signal),
}

impl CaptureExit {
    fn from_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, 0) => Some(Self::Completed),
            WaitStatus::Exited(_, code) => Some(Self::Failed(code)),
            WaitStatus::Signaled(_, signal, _) => Some(Self::Killed(signal)),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for CaptureExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed(code) => write!(f, "failed with exit status {}", code),
            Self::Killed(signal) => write!(f, "killed by {}", signal),
        }
    }
}

/// An active streaming session
#[derive(Debug)]
pub struct CaptureHandle {
    pid: Pid,
    stop: StopSignal,
    camera_index: usize,
    shared_memory_name: String,
    exit: Option<CaptureExit>,
}

impl CaptureHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn camera_index(&self) -> usize {
        self.camera_index
    }

    pub fn shared_memory_name(&self) -> &str {
        &self.shared_memory_name
    }

    pub(crate) fn set_camera_index(&mut self, index: usize) {
        self.camera_index = index;
    }

    /// Exit status, if the process has already been reaped
    pub fn exit(&self) -> Option<CaptureExit> {
        self.exit
    }

    pub fn signal_stop(&self) {
        if let Err(e) = self.stop.set() {
            warn!("Failed to signal capture process {}: {}", self.pid, e);
        }
    }

    /// Reap the process if it has exited, without blocking
    pub fn try_wait(&mut self) -> Result<Option<CaptureExit>, Errno> {
        if self.exit.is_none() {
            let status = waitpid(self.pid, Some(WaitPidFlag::WNOHANG))?;
            self.record(status);
        }
        Ok(self.exit)
    }

    /// Block until the process has exited
    pub fn join(&mut self) -> Result<CaptureExit, Errno> {
        loop {
            if let Some(exit) = self.exit {
                return Ok(exit);
            }
            match waitpid(self.pid, None) {
                Ok(status) => self.record(status),
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(errno),
            }
        }
    }

    fn record(&mut self, status: WaitStatus) {
        self.exit = CaptureExit::from_status(status);
        if let Some(CaptureExit::Killed(signal)) = self.exit {
            match SharedFrameBuffer::reclaim(&self.shared_memory_name) {
                Ok(true) => warn!(
                    "Capture process {} killed by {}, unlinked '{}'",
                    self.pid, signal, self.shared_memory_name
                ),
                Ok(false) => {}
                Err(e) => warn!("Failed to reclaim after capture process {}: {}", self.pid, e),
            }
        }
    }

    /// Signal the process to stop and wait for it to finish cleaning up
    pub fn stop(mut self) -> Result<CaptureExit, Errno> {
        self.signal_stop();
        self.join()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if self.exit.is_none() {
            self.signal_stop();
            if let Err(e) = self.join() {
                warn!("Failed to reap capture process {}: {}", self.pid, e);
            }
        }
    }
}

/// Fork a capture process streaming `camera`
///
/// Returns as soon as the child exists; the shared buffer appears once the
/// child has created it.
pub fn spawn(camera: &mut ManagedCamera, camera_index: usize) -> Result<CaptureHandle, Errno> {
    let (stop, listener) = stop_channel()?;

    // SAFETY: the child only runs the capture loop on memory it owns after the
    // fork and leaves through `_exit`, so no parent destructor ever runs twice.
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            drop(listener);
            debug!(
                "Forked capture process {} for camera '{}'",
                child,
                camera.name()
            );
            Ok(CaptureHandle {
                pid: child,
                stop,
                camera_index,
                shared_memory_name: camera.shared_memory_name().to_owned(),
                exit: None,
            })
        }
        ForkResult::Child => {
            drop(stop);
            // Ctrl-C and SIGTERM go to the orchestrator, which stops us cleanly
            for isolated in ISOLATED_SIGNALS {
                // SAFETY: installing SIG_IGN runs no handler code.
                let _ = unsafe { signal(isolated, SigHandler::SigIgn) };
            }
            let code = run_capture_process(camera, &listener);
            // SAFETY: `_exit` terminates the child without running parent destructors.
            unsafe { _exit(code) }
        }
    }
}

fn run_capture_process(camera: &mut ManagedCamera, stop: &StopListener) -> i32 {
    let name = camera.name().to_owned();
    match panic::catch_unwind(AssertUnwindSafe(|| stream_camera(camera, stop))) {
        Ok(Ok(())) => 0,
        Ok(Err(failure)) => {
            error!("{}", failure);
            EXIT_CAPTURE_FAILED
        }
        Err(_) => {
            error!("Capture process for camera '{}' panicked", name);
            EXIT_CAPTURE_PANICKED
        }
    }
}

/// Run the capture loop for `camera` until `stop` is set
///
/// The shared buffer is created first and is always closed and unlinked
/// before returning, whether the loop stopped or failed.
pub fn stream_camera(
    camera: &mut ManagedCamera,
    stop: &StopListener,
) -> Result<(), CaptureFailure> {
    stream_into_buffer(camera, stop).map_err(|source| CaptureFailure {
        camera: camera.name().to_owned(),
        source,
    })
}

fn stream_into_buffer(
    camera: &mut ManagedCamera,
    stop: &StopListener,
) -> Result<(), CaptureError> {
    let mut buffer =
        SharedFrameBuffer::create(camera.shared_memory_name(), camera.shared_memory_size())?;
    info!(
        "Streaming camera '{}' into '{}'",
        camera.name(),
        buffer.name()
    );

    let streamed = capture_loop(camera, &mut buffer, stop);
    let closed = buffer.close_and_unlink();

    let frames = streamed?;
    closed?;
    info!("Camera '{}' stopped after {} frames", camera.name(), frames);
    Ok(())
}

fn capture_loop(
    camera: &mut ManagedCamera,
    buffer: &mut SharedFrameBuffer,
    stop: &StopListener,
) -> Result<u64, CaptureError> {
    if let Some(id) = camera.config().cpu_affinity {
        if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
            warn!("Could not pin camera '{}' to core {}", camera.name(), id);
        }
    }

    let shape = camera.shape();
    let mut view = buffer.view_mut(shape)?;
    camera.camera_mut().start()?;

    let mut frames = 0u64;
    while !stop.is_set()? {
        let frame = camera.camera_mut().read_once()?;
        view.copy_from(&frame)?;
        frames += 1;
    }
    Ok(frames)
}
