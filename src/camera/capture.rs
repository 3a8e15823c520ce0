use crate::common::config::CameraConfig;
use crate::common::{FacegateError, Result};
use image::GrayImage;
use std::ffi::OsString;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// Environment variable through which the helper learns which camera to open.
pub const DEVICE_ENV: &str = "FACEGATE_CAMERA_DEVICE";

/// Anything that can produce one grayscale face frame within a deadline.
///
/// Implementations make a single attempt; retry policy belongs to the caller.
pub trait FrameSource: Send + Sync {
    fn capture(&self, timeout: Duration) -> Result<GrayImage>;
}

/// Runs the external camera helper and reads one raw `width * height` frame from its stdout.
pub struct HelperCapture {
    program: PathBuf,
    args: Vec<OsString>,
    device_index: u32,
    width: u32,
    height: u32,
}

impl HelperCapture {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            program: config.helper_path.clone(),
            args: Vec::new(),
            device_index: config.device_index,
            width: config.width,
            height: config.height,
        }
    }

    /// Use an explicit command line instead of the bare helper, e.g. a wrapper script.
    pub fn from_command<I, S>(program: impl Into<PathBuf>, args: I, width: u32, height: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            device_index: 0,
            width,
            height,
        }
    }

    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl FrameSource for HelperCapture {
    fn capture(&self, timeout: Duration) -> Result<GrayImage> {
        let started = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(DEVICE_ENV, self.device_index.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                FacegateError::Capture(format!("cannot start {}: {}", self.program.display(), e))
            })?;

        let mut stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                terminate(&mut child);
                return Err(FacegateError::Capture("helper stdout unavailable".into()));
            }
        };

        // The read happens off-thread so the deadline holds even if the helper stalls mid-frame.
        let need = self.frame_len();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut frame = vec![0u8; need];
            let result = read_full(&mut stdout, &mut frame).map(|got| (got, frame));
            let _ = tx.send(result);
        });

        let remaining = timeout.saturating_sub(started.elapsed());
        let outcome = rx.recv_timeout(remaining);
        terminate(&mut child);

        match outcome {
            Ok(Ok((got, frame))) if got == need => {
                tracing::debug!("Captured frame in {:?}", started.elapsed());
                GrayImage::from_raw(self.width, self.height, frame)
                    .ok_or_else(|| FacegateError::Capture("frame buffer has wrong size".into()))
            }
            Ok(Ok((got, _))) => Err(FacegateError::Capture(format!(
                "helper closed its stream after {} of {} bytes", got, need
            ))),
            Ok(Err(e)) => Err(FacegateError::Capture(format!("reading helper output: {}", e))),
            Err(RecvTimeoutError::Timeout) => Err(FacegateError::Capture(format!(
                "no frame within {:?}", timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(FacegateError::Capture("helper reader exited unexpectedly".into()))
            }
        }
    }
}

/// Fill `buf` until it is full or the stream ends; returns the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut got = 0;
    while got < buf.len() {
        match reader.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(got)
}

/// Kill the helper if it is still running, then reap it. Returns whether a kill was sent.
///
/// A `try_wait` error means the pid is no longer ours (auto-reaped under an ignored SIGCHLD),
/// so it may already belong to an unrelated process and must not be signalled.
fn terminate(child: &mut Child) -> bool {
    match child.try_wait() {
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            true
        }
        Ok(Some(_)) | Err(_) => false,
    }
}
