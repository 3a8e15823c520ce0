use crate::camera::FrameSource;
use crate::common::{is_safe_user_component, Config, FacegateError};
use crate::core::{best_distance, DescriptorEngine};
use crate::service::protocol::{Command, ErrorCode, Request, Response};
use crate::service::server::RequestHandler;
use crate::storage::{LockMode, ModelStore, SampleStore, UserLock};
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle of one request. Every session ends in `Completed` with exactly one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Dispatched(Command),
    Capturing,
    Completed,
}

struct Session<'a> {
    user: &'a str,
    state: SessionState,
}

impl<'a> Session<'a> {
    fn new(user: &'a str) -> Self {
        Self { user, state: SessionState::Idle }
    }

    fn advance(&mut self, next: SessionState) {
        tracing::debug!("Session for {:?}: {:?} -> {:?}", self.user, self.state, next);
        self.state = next;
    }
}

/// Executes enroll and auth requests against the camera, the sample store and the model store.
///
/// Holds no per-session state, so one handler can serve any number of
/// concurrent connections.
pub struct SessionHandler {
    config: Config,
    source: Arc<dyn FrameSource>,
    models: ModelStore,
    samples: SampleStore,
}

impl SessionHandler {
    pub fn new(config: Config, source: Arc<dyn FrameSource>) -> Self {
        let data_dir = config.storage.data_dir.clone();
        Self {
            models: ModelStore::new(&data_dir, config.matcher.threshold),
            samples: SampleStore::new(&data_dir),
            config,
            source,
        }
    }

    pub fn handle(&self, request: &Request) -> Response {
        let mut session = Session::new(&request.user);
        let response = self.dispatch(&mut session, request);
        session.advance(SessionState::Completed);
        response
    }

    fn dispatch(&self, session: &mut Session<'_>, request: &Request) -> Response {
        let user = request.user.as_str();
        if user.is_empty() {
            return Response::error(ErrorCode::NoUser);
        }
        if !is_safe_user_component(user) {
            tracing::warn!("Rejecting unsafe user identifier {:?}", user);
            return Response::error(ErrorCode::InvalidUser);
        }
        let Some(command) = Command::parse(&request.cmd) else {
            return Response::error(ErrorCode::UnknownCmd);
        };

        session.advance(SessionState::Dispatched(command));
        match command {
            Command::Enroll => self.enroll(session, user),
            Command::Auth => self.auth(session, user),
        }
    }

    fn enroll(&self, session: &mut Session<'_>, user: &str) -> Response {
        let _lock = match self.lock(user, LockMode::Exclusive) {
            Ok(lock) => lock,
            Err(response) => return response,
        };
        let mut writer = match self.samples.begin(user) {
            Ok(writer) => writer,
            Err(e) => {
                tracing::error!("Cannot prepare sample directory for {}: {}", user, e);
                return Response::error(ErrorCode::InternalError);
            }
        };

        let policy = &self.config.enrollment;
        let budget = policy.budget();
        let capture_timeout = self.config.camera.timeout();
        let started = Instant::now();
        let mut attempts = 0;

        session.advance(SessionState::Capturing);
        while attempts < policy.max_attempts && writer.written() < policy.target_samples {
            let elapsed = started.elapsed();
            if elapsed >= budget {
                tracing::debug!("Enrollment budget exhausted after {} attempts", attempts);
                break;
            }
            attempts += 1;

            match self.source.capture(capture_timeout.min(budget - elapsed)) {
                Ok(frame) => match writer.append(&frame) {
                    Ok(path) => tracing::debug!("Attempt {}: stored {}", attempts, path.display()),
                    Err(e) => tracing::warn!("Attempt {}: could not store sample: {}", attempts, e),
                },
                Err(e) => tracing::debug!("Attempt {}: capture failed: {}", attempts, e),
            }
        }

        let got = writer.written();
        if got < policy.min_samples {
            tracing::info!(
                "Enrollment for {} failed: {} of {} required samples in {} attempts",
                user, got, policy.min_samples, attempts
            );
            Response::not_enough_faces(got)
        } else {
            tracing::info!("Enrolled {} samples for {} in {} attempts", got, user, attempts);
            Response::enrolled(got)
        }
    }

    fn auth(&self, session: &mut Session<'_>, user: &str) -> Response {
        let _lock = match self.lock(user, LockMode::Shared) {
            Ok(lock) => lock,
            Err(response) => return response,
        };

        session.advance(SessionState::Capturing);
        let frame = match self.source.capture(self.config.camera.timeout()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::info!("No face for {}: {}", user, e);
                return Response::error(ErrorCode::NoFace);
            }
        };

        let model = match self.models.load(user) {
            Ok(model) => model,
            Err(e) => {
                tracing::warn!("Model load failed for {}: {}", user, e);
                return Response::error(ErrorCode::LbphLoadFailed);
            }
        };

        let nearest = DescriptorEngine::new(model.policy.grid)
            .and_then(|engine| best_distance(&engine.extract(&frame), &model.descriptors));
        let nearest = match nearest {
            Ok(nearest) => nearest,
            Err(e) => {
                tracing::warn!("Model for {} is unusable: {}", user, e);
                return Response::error(ErrorCode::LbphLoadFailed);
            }
        };

        let threshold = self.config.matcher.effective_threshold(model.policy.threshold);
        let matched = nearest.distance <= threshold;
        tracing::info!(
            "Auth for {}: distance {:.4} (sample {}) threshold {:.4} -> {}",
            user,
            nearest.distance,
            nearest.index,
            threshold,
            if matched { "match" } else { "no match" }
        );
        Response::verdict(matched)
    }

    fn lock(&self, user: &str, mode: LockMode) -> std::result::Result<UserLock, Response> {
        match UserLock::try_acquire(&self.config.storage.data_dir, user, mode) {
            Ok(lock) => Ok(lock),
            Err(FacegateError::UserBusy(_)) => {
                tracing::info!("Another session holds the lock for {}", user);
                Err(Response::error(ErrorCode::Busy))
            }
            Err(e) => {
                tracing::error!("Cannot lock {}: {}", user, e);
                Err(Response::error(ErrorCode::InternalError))
            }
        }
    }
}

impl RequestHandler for SessionHandler {
    fn handle(&self, request: &Request) -> Response {
        SessionHandler::handle(self, request)
    }
}
