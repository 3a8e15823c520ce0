#[macro_use]
extern crate pamsm;

use facegate::protocol::{Response, SOCKET_PATH};
use facegate::ServiceClient;
use pamsm::{Pam, PamError, PamFlags, PamLibExt, PamServiceModule};
use std::thread;
use std::time::Duration;

const MAX_TRIES: u32 = 3;
const RETRY_PAUSE: Duration = Duration::from_secs(1);
const DEFAULT_TIMEOUT_SECS: u64 = 6;

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Match,
    NoMatch,
    /// Daemon unreachable, silent, or answered with an error: let other modules decide.
    Unavailable,
}

struct ModuleArgs {
    timeout: Duration,
    socket: String,
}

impl ModuleArgs {
    // Format: "timeout=6 socket=/run/facegate/facegate.sock"
    fn parse(args: &[String]) -> Self {
        let timeout = args
            .iter()
            .find_map(|arg| arg.strip_prefix("timeout=")?.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let socket = args
            .iter()
            .find_map(|arg| arg.strip_prefix("socket="))
            .unwrap_or(SOCKET_PATH)
            .to_string();
        Self { timeout: Duration::from_secs(timeout), socket }
    }
}

pub struct FacegatePam;

impl PamServiceModule for FacegatePam {
    fn authenticate(pamh: Pam, _flags: PamFlags, args: Vec<String>) -> PamError {
        let args = ModuleArgs::parse(&args);

        let user = match pamh.get_cached_user() {
            Ok(Some(user)) => match user.to_str() {
                Ok(user) => user.to_string(),
                Err(_) => return PamError::USER_UNKNOWN,
            },
            _ => return PamError::USER_UNKNOWN,
        };

        let client = ServiceClient::new(&args.socket).with_timeout(args.timeout);
        for attempt in 1..=MAX_TRIES {
            match verdict(client.auth(&user)) {
                Verdict::Match => return PamError::SUCCESS,
                Verdict::NoMatch if attempt < MAX_TRIES => thread::sleep(RETRY_PAUSE),
                Verdict::NoMatch => return PamError::AUTH_ERR,
                Verdict::Unavailable => return PamError::IGNORE,
            }
        }
        PamError::AUTH_ERR
    }

    fn setcred(_pamh: Pam, _flags: PamFlags, _args: Vec<String>) -> PamError {
        PamError::SUCCESS
    }
}

fn verdict(response: facegate::Result<Response>) -> Verdict {
    match response {
        Ok(Response { ok: true, matched: Some(true), .. }) => Verdict::Match,
        Ok(Response { ok: true, matched: Some(false), .. }) => Verdict::NoMatch,
        _ => Verdict::Unavailable,
    }
}

pam_module!(FacegatePam);
