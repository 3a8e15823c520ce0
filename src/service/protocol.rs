//! Wire format: one JSON object per line in each direction, one exchange per connection.

use serde::{Deserialize, Serialize};

pub const SOCKET_PATH: &str = "/run/facegate/facegate.sock";

// Request types
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Request {
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub user: String,
}

impl Request {
    pub fn auth(user: &str) -> Self {
        Self { cmd: Command::Auth.as_str().into(), user: user.into() }
    }

    pub fn enroll(user: &str) -> Self {
        Self { cmd: Command::Enroll.as_str().into(), user: user.into() }
    }

    /// Parse the first line of `bytes`; the error text is reported to the client verbatim.
    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, String> {
        let line = match bytes.iter().position(|&b| b == b'\n') {
            Some(end) => &bytes[..end],
            None => bytes,
        };
        serde_json::from_slice(line).map_err(|e| e.to_string())
    }

    pub fn to_line(&self) -> Vec<u8> {
        line_of(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Enroll,
    Auth,
}

impl Command {
    pub fn parse(cmd: &str) -> Option<Self> {
        match cmd {
            "enroll" => Some(Self::Enroll),
            "auth" => Some(Self::Auth),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enroll => "enroll",
            Self::Auth => "auth",
        }
    }
}

/// Wire values of the `err` field, apart from the free-form `parse_error: ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoUser,
    InvalidUser,
    UnknownCmd,
    NoFace,
    LbphLoadFailed,
    NotEnoughFaces,
    RequestTooLarge,
    Busy,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoUser => "no_user",
            Self::InvalidUser => "invalid_user",
            Self::UnknownCmd => "unknown_cmd",
            Self::NoFace => "no_face",
            Self::LbphLoadFailed => "lbph_load_failed",
            Self::NotEnoughFaces => "not_enough_faces",
            Self::RequestTooLarge => "request_too_large",
            Self::Busy => "busy",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Response types
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub got: Option<usize>,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub matched: Option<bool>,
}

impl Response {
    pub fn error(code: ErrorCode) -> Self {
        Self { ok: false, err: Some(code.as_str().into()), ..Self::default() }
    }

    pub fn parse_error(detail: &str) -> Self {
        Self { ok: false, err: Some(format!("parse_error: {}", detail)), ..Self::default() }
    }

    pub fn enrolled(samples: usize) -> Self {
        Self { ok: true, samples: Some(samples), ..Self::default() }
    }

    pub fn not_enough_faces(got: usize) -> Self {
        Self { got: Some(got), ..Self::error(ErrorCode::NotEnoughFaces) }
    }

    pub fn verdict(matched: bool) -> Self {
        Self { ok: true, matched: Some(matched), ..Self::default() }
    }

    pub fn parse(bytes: &[u8]) -> serde_json::Result<Self> {
        let line = match bytes.iter().position(|&b| b == b'\n') {
            Some(end) => &bytes[..end],
            None => bytes,
        };
        serde_json::from_slice(line)
    }

    pub fn to_line(&self) -> Vec<u8> {
        line_of(self)
    }
}

fn line_of<T: Serialize>(value: &T) -> Vec<u8> {
    // Plain structs of strings, integers and booleans always serialise.
    let mut line = serde_json::to_vec(value).unwrap_or_else(|_| b"{\"ok\":false}".to_vec());
    line.push(b'\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(response: &Response) -> String {
        String::from_utf8(response.to_line()).unwrap()
    }

    #[test]
    fn responses_match_the_wire_schema() {
        assert_eq!(text(&Response::enrolled(8)), "{\"ok\":true,\"samples\":8}\n");
        assert_eq!(
            text(&Response::not_enough_faces(3)),
            "{\"ok\":false,\"err\":\"not_enough_faces\",\"got\":3}\n"
        );
        assert_eq!(text(&Response::verdict(true)), "{\"ok\":true,\"match\":true}\n");
        assert_eq!(text(&Response::verdict(false)), "{\"ok\":true,\"match\":false}\n");
        assert_eq!(
            text(&Response::error(ErrorCode::LbphLoadFailed)),
            "{\"ok\":false,\"err\":\"lbph_load_failed\"}\n"
        );
        assert_eq!(
            text(&Response::parse_error("expected value")),
            "{\"ok\":false,\"err\":\"parse_error: expected value\"}\n"
        );
    }

    #[test]
    fn request_parsing_stops_at_the_newline() {
        let request = Request::parse(b"{\"cmd\":\"auth\",\"user\":\"alice\"}\ntrailing junk").unwrap();
        assert_eq!(request, Request::auth("alice"));
        assert_eq!(Command::parse(&request.cmd), Some(Command::Auth));
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let request = Request::parse(b"{}").unwrap();
        assert!(request.cmd.is_empty());
        assert!(request.user.is_empty());
    }

    #[test]
    fn malformed_requests_report_the_parser_message() {
        assert!(Request::parse(b"not json").is_err());
        assert!(Request::parse(b"").is_err());
        assert!(Request::parse(b"[1,2]").is_err());
        assert!(Request::parse(b"{\"user\": 5}").is_err());
    }

    #[test]
    fn responses_parse_back() {
        let line = Response::not_enough_faces(2).to_line();
        assert_eq!(Response::parse(&line).unwrap(), Response::not_enough_faces(2));
    }
}
