use crate::common::config::{Isolation, ServerConfig};
use crate::common::{FacegateError, Result};
use crate::service::protocol::{ErrorCode, Request, Response};
use std::fs;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const READ_CHUNK: usize = 1024;

/// Turns one parsed request into one response. Must not block forever.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: &Request) -> Response;
}

/// Process-wide signal dispositions, applied once when the server starts listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalPolicy {
    /// Client hang-ups surface as write errors instead of killing the process.
    pub ignore_sigpipe: bool,
    /// Let the kernel reap exited connection children.
    pub auto_reap_children: bool,
}

impl SignalPolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            ignore_sigpipe: config.ignore_sigpipe,
            auto_reap_children: config.auto_reap_children,
        }
    }

    fn apply(&self) {
        unsafe {
            if self.ignore_sigpipe {
                libc::signal(libc::SIGPIPE, libc::SIG_IGN);
            }
            if self.auto_reap_children {
                libc::signal(libc::SIGCHLD, libc::SIG_IGN);
            }
        }
        tracing::debug!("Applied signal policy {:?}", self);
    }
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_request_bytes: usize,
    read_timeout: Duration,
}

/// Local-socket listener answering one JSON request per connection.
pub struct Server {
    listener: UnixListener,
    socket_path: PathBuf,
    isolation: Isolation,
    signals: SignalPolicy,
    limits: Limits,
}

impl Server {
    /// Bind the socket, replacing a stale one, and restrict it to `socket_mode`.
    pub fn listen(config: &ServerConfig) -> Result<Self> {
        let socket_path = config.socket_path.clone();

        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        match fs::remove_file(&socket_path) {
            Ok(()) => tracing::debug!("Removed stale socket {}", socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            FacegateError::Protocol(format!("Failed to bind {}: {}", socket_path.display(), e))
        })?;
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(config.socket_mode))?;

        let signals = SignalPolicy::from_config(config);
        signals.apply();

        tracing::info!(
            "Listening on {} (mode {:o}, {:?} isolation)",
            socket_path.display(),
            config.socket_mode,
            config.isolation
        );
        Ok(Self {
            listener,
            socket_path,
            isolation: config.isolation,
            signals,
            limits: Limits {
                max_request_bytes: config.max_request_bytes,
                read_timeout: config.read_timeout(),
            },
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Run the accept loop on a dedicated thread.
    pub fn serve<H: RequestHandler>(self, handler: H) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("facegate-accept".into())
            .spawn(move || self.run(Arc::new(handler)))?;
        Ok(handle)
    }

    /// Accept connections forever. Accept errors are logged and the loop continues.
    pub fn run<H: RequestHandler>(&self, handler: Arc<H>) {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => match self.isolation {
                    Isolation::Fork => self.fork_connection(stream, handler.as_ref()),
                    Isolation::Thread => self.spawn_connection(stream, &handler),
                },
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    fn fork_connection<H: RequestHandler>(&self, stream: UnixStream, handler: &H) {
        if !self.signals.auto_reap_children {
            reap_children();
        }

        match unsafe { libc::fork() } {
            -1 => {
                tracing::error!("fork failed: {}", io::Error::last_os_error());
                reply(stream, &Response::error(ErrorCode::InternalError));
            }
            0 => {
                unsafe {
                    libc::close(self.listener.as_raw_fd());
                    // The capture gateway waits on its helper; that needs the default disposition.
                    libc::signal(libc::SIGCHLD, libc::SIG_DFL);
                    // The daemon's shutdown handler thread does not exist in the child.
                    libc::signal(libc::SIGTERM, libc::SIG_DFL);
                    libc::signal(libc::SIGINT, libc::SIG_DFL);
                }
                serve_connection(stream, handler, self.limits);
                unsafe { libc::_exit(0) }
            }
            pid => {
                tracing::debug!("Connection handed to child {}", pid);
                drop(stream);
            }
        }
    }

    fn spawn_connection<H: RequestHandler>(&self, stream: UnixStream, handler: &Arc<H>) {
        let handler = Arc::clone(handler);
        let limits = self.limits;
        let spawned = thread::Builder::new()
            .name("facegate-conn".into())
            .spawn(move || serve_connection(stream, handler.as_ref(), limits));
        if let Err(e) = spawned {
            tracing::error!("Cannot spawn connection thread: {}", e);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.socket_path);
    }
}

fn reap_children() {
    loop {
        let pid = unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
    }
}

enum ReadOutcome {
    Complete(Vec<u8>),
    TooLarge,
}

/// Read up to the first newline, end of stream, read error or timeout.
fn read_request(stream: &mut UnixStream, limits: Limits) -> ReadOutcome {
    if let Err(e) = stream.set_read_timeout(Some(limits.read_timeout)) {
        tracing::warn!("Cannot set read timeout: {}", e);
    }

    let mut data = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let start = data.len();
                data.extend_from_slice(&chunk[..n]);
                if let Some(pos) = chunk[..n].iter().position(|&b| b == b'\n') {
                    data.truncate(start + pos);
                    break;
                }
                if data.len() > limits.max_request_bytes {
                    return ReadOutcome::TooLarge;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("Request read ended early: {}", e);
                break;
            }
        }
    }

    if data.len() > limits.max_request_bytes {
        ReadOutcome::TooLarge
    } else {
        ReadOutcome::Complete(data)
    }
}

/// Read one request, answer it, close. Never panics past this point.
fn serve_connection<H: RequestHandler + ?Sized>(mut stream: UnixStream, handler: &H, limits: Limits) {
    let response = match read_request(&mut stream, limits) {
        ReadOutcome::TooLarge => {
            tracing::warn!("Rejecting request over {} bytes", limits.max_request_bytes);
            Response::error(ErrorCode::RequestTooLarge)
        }
        ReadOutcome::Complete(bytes) => match Request::parse(&bytes) {
            Ok(request) => answer(handler, &request),
            Err(detail) => {
                tracing::debug!("Malformed request: {}", detail);
                Response::parse_error(&detail)
            }
        },
    };
    reply(stream, &response);
}

fn answer<H: RequestHandler + ?Sized>(handler: &H, request: &Request) -> Response {
    panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request))).unwrap_or_else(|_| {
        tracing::error!("Handler panicked on {:?} for {:?}", request.cmd, request.user);
        Response::error(ErrorCode::InternalError)
    })
}

fn reply(mut stream: UnixStream, response: &Response) {
    if let Err(e) = stream.write_all(&response.to_line()).and_then(|_| stream.flush()) {
        tracing::debug!("Client went away before the response: {}", e);
    }
    let _ = stream.shutdown(Shutdown::Both);
}
