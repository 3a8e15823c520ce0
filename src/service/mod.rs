pub mod client;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::ServiceClient;
pub use protocol::{Command, ErrorCode, Request, Response};
pub use server::{RequestHandler, Server, SignalPolicy};
pub use session::{SessionHandler, SessionState};
