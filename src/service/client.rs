use crate::common::{FacegateError, Result};
use crate::service::protocol::{Request, Response, SOCKET_PATH};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest enrollment plus slack; auth answers well inside this.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Sends one request per connection to the daemon and waits for its single response line.
pub struct ServiceClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Default for ServiceClient {
    fn default() -> Self {
        Self::new(SOCKET_PATH)
    }
}

impl ServiceClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self { socket_path: socket_path.into(), timeout: DEFAULT_TIMEOUT }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn enroll(&self, user: &str) -> Result<Response> {
        self.send(&Request::enroll(user))
    }

    pub fn auth(&self, user: &str) -> Result<Response> {
        self.send(&Request::auth(user))
    }

    pub fn send(&self, request: &Request) -> Result<Response> {
        let mut stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            FacegateError::Protocol(format!(
                "Cannot connect to {}: {} (is facegated running?)",
                self.socket_path.display(),
                e
            ))
        })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        stream.write_all(&request.to_line())?;
        stream.flush()?;

        let mut line = Vec::new();
        BufReader::new(&stream)
            .read_until(b'\n', &mut line)
            .map_err(|e| FacegateError::Protocol(format!("No response from daemon: {}", e)))?;
        if line.is_empty() {
            return Err(FacegateError::Protocol("Daemon closed the connection without answering".into()));
        }

        tracing::debug!("Response: {}", String::from_utf8_lossy(&line).trim_end());
        Ok(Response::parse(&line)?)
    }
}
