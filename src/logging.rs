use std::backtrace::Backtrace;
use std::fmt::{Display, Formatter};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{error, info, warn};
use rocket::{
    fairing::{Fairing, Info, Kind},
    http::StatusClass,
    request::{FromRequest, Outcome},
    serde::json::{json, Value},
    Data, Orbit, Request, Response, Rocket,
};

use crate::error::Error;
use crate::model::{document::DocumentQuery, id::UserId, user::User};

/// Log target for voting events.
pub const EVENT_TARGET: &str = "vote::event";
/// Log target for denied or suspicious requests.
pub const SECURITY_TARGET: &str = "vote::security";
/// Log target for failures of collaborators.
pub const ERROR_TARGET: &str = "vote::error";
/// Log target tracking what paper authorities look up and record.
pub const PAPER_AUTHORITY_TARGET: &str = "paper_authority";

/// Frames of backtrace kept with transient errors.
const BACKTRACE_FRAMES: usize = 5;
/// Characters of a token that may appear in a log line.
const TOKEN_PREFIX_LENGTH: usize = 8;

/// A unique identifier for a particular request.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct RequestId(pub usize);

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl RequestId {
    /// Atomically get the next ID. This wraps around back to zero if you somehow exceed a usize.
    pub fn next() -> RequestId {
        static REQUEST_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);
        RequestId(REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Who sent a request, for the security log.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub id: RequestId,
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
}

impl RequestMeta {
    fn fields(&self) -> Value {
        json!({
            "request_id": self.id.0,
            "ip": self.ip.map(|ip| ip.to_string()),
            "user_agent": self.user_agent,
        })
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestMeta {
    type Error = (); // No errors possible, use the `!` type once stabilised.

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(RequestMeta {
            id: *req.local_cache(RequestId::next),
            ip: req.client_ip(),
            user_agent: req.headers().get_one("User-Agent").map(str::to_string),
        })
    }
}

/// Merge `extra` object fields into `base`.
fn merged(mut base: Value, extra: Value) -> Value {
    if let (Some(base), Value::Object(extra)) = (base.as_object_mut(), extra) {
        base.extend(extra);
    }
    base
}

/// Record a voting event, e.g. `vote_token_created`.
pub fn event(name: &str, fields: Value) {
    let line = merged(json!({ "event": format!("vote_{name}") }), fields);
    info!(target: EVENT_TARGET, "{line}");
}

/// Record a denied or suspicious request, e.g. `vote_security_invalid_counter_token`.
pub fn security(meta: &RequestMeta, name: &str, fields: Value) {
    let line = merged(
        merged(json!({ "event": format!("vote_security_{name}") }), meta.fields()),
        fields,
    );
    warn!(target: SECURITY_TARGET, "{line}");
}

/// Record a failure. Transient errors carry a short backtrace.
pub fn failure(meta: Option<&RequestMeta>, name: &str, err: &Error) {
    let mut line = json!({
        "event": format!("vote_error_{name}"),
        "error": err.to_string(),
    });
    if let Some(meta) = meta {
        line = merged(line, meta.fields());
    }
    if matches!(err, Error::Transient(_)) {
        line = merged(line, json!({ "backtrace": short_backtrace() }));
    }
    error!(target: ERROR_TARGET, "{line}");
}

/// Record a census file that could not be used.
pub fn census_failure(file: &str, reason: &dyn std::error::Error) {
    let line = json!({
        "event": "vote_error_census_parse_error",
        "file": file,
        "error": reason.to_string(),
    });
    error!(target: ERROR_TARGET, "{line}");
}

fn short_backtrace() -> Vec<String> {
    Backtrace::force_capture()
        .to_string()
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(|c: char| c.is_ascii_digit()))
        .take(BACKTRACE_FRAMES)
        .map(str::to_string)
        .collect()
}

/// The part of a token that may be logged.
pub fn token_prefix(token: &str) -> String {
    token.chars().take(TOKEN_PREFIX_LENGTH).collect()
}

/// A paper authority looked a voter up.
pub fn paper_query(authority: &User, query: &DocumentQuery) {
    info!(
        target: PAPER_AUTHORITY_TARGET,
        "** {} {} ** QUERY: {} {}",
        authority.id,
        authority.full_name,
        query.doc_type.code(),
        query.doc_id
    );
}

/// A paper authority recorded a ballot.
pub fn paper_vote(authority: &User, voter_id: UserId) {
    info!(
        target: PAPER_AUTHORITY_TARGET,
        "** {} {} ** VOTE: {voter_id}",
        authority.id,
        authority.full_name
    );
}

/// A rocket fairing that does global logging, e.g. logging every request and response.
#[derive(Debug, Copy, Clone)]
pub struct LoggerFairing;

#[rocket::async_trait]
impl Fairing for LoggerFairing {
    fn info(&self) -> Info {
        Info {
            name: "Logger",
            kind: Kind::Liftoff | Kind::Request | Kind::Response | Kind::Shutdown,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        let protocol = if rocket.config().tls_enabled() {
            "https"
        } else {
            "http"
        };
        let ip = &rocket.config().address;
        let port = &rocket.config().port;
        info!("Server launched on {protocol}://{ip}:{port}");
    }

    async fn on_request(&self, req: &mut Request<'_>, _data: &mut Data<'_>) {
        let id = req.local_cache(RequestId::next);
        // Query strings carry tokens; log the path only.
        let method = req.method();
        let path = req.uri().path();
        info!("->req{id} {method} {path}");
    }

    async fn on_response<'r>(&self, req: &'r Request<'_>, res: &mut Response<'r>) {
        let id = req.local_cache(RequestId::next);
        let code = res.status();
        let route = match req.route() {
            Some(r) => {
                let mut str = r.uri.to_string();
                if let Some(ref name) = r.name {
                    str = format!("{name} ({str})");
                }
                str
            }
            None => "UNKNOWN ROUTE".to_string(),
        };
        let log_msg = format!("<-rsp{id} {code} {route}");
        match code.class() {
            StatusClass::ServerError => error!("{log_msg}"),
            StatusClass::ClientError => warn!("{log_msg}"),
            _ => info!("{log_msg}"),
        }
    }

    async fn on_shutdown(&self, _rocket: &Rocket<Orbit>) {
        warn!("Shutdown requested, stopping gracefully...");
    }
}
