use chrono::Utc;
use rocket::{
    request::FlashMessage,
    response::{Flash, Redirect},
    serde::json::{json, Json},
    Route, State,
};
use serde::Serialize;

use crate::config::Config;
use crate::eligibility::{Assessor, Denial, Ineligible, Verdict};
use crate::error::{Error, Result};
use crate::logging::{self, RequestMeta};
use crate::model::{auth::AuthToken, id::ElectionId, user::User};
use crate::sms::{SendOutcome, SharedSender, SmsChallenge};
use crate::store::Storage;
use crate::token::TokenCodec;
use crate::vote_token::{IssueOutcome, VoteTokenService};

use super::common::{caller, failed, parse_id};

pub fn routes() -> Vec<Route> {
    routes![create, create_token, send_sms_check, sms_check, check]
}

#[derive(Debug, PartialEq, Eq, Serialize)]
struct VoteToken {
    token: String,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
struct SmsCheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
struct EligibilityStatus {
    status: &'static str,
}

#[get("/vote/create?<election_id>&<sms_check_token>")]
async fn create(
    token: AuthToken,
    meta: RequestMeta,
    election_id: Option<&str>,
    sms_check_token: Option<&str>,
    storage: Storage,
    config: &State<Config>,
    codec: &State<TokenCodec>,
) -> Result<Json<VoteToken>> {
    let election_id = parse_id(&meta, election_id, "invalid_election_id")?;
    let user = caller(token, &storage, &meta).await?;
    let token = issue(&meta, &user, election_id, sms_check_token, &storage, config, codec).await?;
    Ok(Json(VoteToken { token }))
}

/// As `create`, for the tallying backend's client: the bare token, or 410
/// once the vote is cast.
#[get("/vote/create_token?<election_id>&<sms_check_token>")]
async fn create_token(
    token: AuthToken,
    meta: RequestMeta,
    election_id: Option<&str>,
    sms_check_token: Option<&str>,
    storage: Storage,
    config: &State<Config>,
    codec: &State<TokenCodec>,
) -> Result<String> {
    let election_id = parse_id(&meta, election_id, "invalid_election_id")?;
    let user = caller(token, &storage, &meta).await?;
    issue(&meta, &user, election_id, sms_check_token, &storage, config, codec).await
}

async fn issue(
    meta: &RequestMeta,
    user: &User,
    election_id: ElectionId,
    sms_code: Option<&str>,
    storage: &Storage,
    config: &Config,
    codec: &TokenCodec,
) -> Result<String> {
    let outcome = VoteTokenService::new(storage, config, codec)
        .issue_token(user, election_id, sms_code, Utc::now())
        .await
        .map_err(|err| failed(meta, "issue_token", err))?;

    let fields = json!({ "user_id": user.id, "election_id": election_id });
    match outcome {
        IssueOutcome::Issued(token) => {
            logging::event(
                "token_created",
                json!({ "user_id": user.id, "election_id": election_id, "token": logging::token_prefix(&token) }),
            );
            Ok(token)
        }
        IssueOutcome::Reissued(token) => {
            logging::event("token_reissued", fields);
            Ok(token)
        }
        IssueOutcome::Denied(denial) => Err(denied(meta, denial, fields)),
        IssueOutcome::Gone => {
            logging::event("token_gone", fields);
            Err(Error::Gone)
        }
    }
}

/// Log a denial under its own event name and turn it into the response error.
fn denied(meta: &RequestMeta, denial: Denial, fields: rocket::serde::json::Value) -> Error {
    match denial {
        Denial::Ineligible(Ineligible::InvalidElection) => {
            logging::security(meta, "unknown_election", fields)
        }
        Denial::Ineligible(Ineligible::ElectionClosed) => {
            logging::event("election_closed_attempt", fields)
        }
        Denial::Ineligible(Ineligible::SmsAttemptsExceeded) => {
            logging::security(meta, "sms_attempts_exceeded", fields)
        }
        // Already written to the error log by the assessor.
        Denial::Ineligible(Ineligible::EvaluationError) => {}
        _ => logging::event(denial.reason(), fields),
    }
    denial.into_error()
}

#[get("/vote/send_sms_check?<election_id>")]
async fn send_sms_check(
    token: AuthToken,
    meta: RequestMeta,
    election_id: Option<&str>,
    storage: Storage,
    config: &State<Config>,
    codec: &State<TokenCodec>,
    sender: &State<SharedSender>,
) -> Result<Flash<Redirect>> {
    let election_id = parse_id(&meta, election_id, "invalid_election_id")?;
    let user = caller(token, &storage, &meta).await?;
    let election = storage
        .election(election_id)
        .await
        .map_err(|err| failed(&meta, "send_sms_check", err))?
        .ok_or(Error::NotFound("invalid_election"))?;
    if !election.requires_sms_check {
        return Err(Error::Denied("sms_check_not_required"));
    }

    let outcome = SmsChallenge::new(&storage, config.inner(), codec.inner())
        .send(sender.inner().as_ref(), &user, &election, Utc::now())
        .await
        .map_err(|err| match err {
            Error::Transient(_) => failed(&meta, "send_sms_check", err),
            err => err,
        })?;

    let fields = json!({ "user_id": user.id, "election_id": election_id });
    let target = Redirect::to(format!("/vote/sms_check?election_id={election_id}"));
    Ok(match outcome {
        SendOutcome::Sent => {
            logging::event("sms_check_sent", fields);
            Flash::success(target, "A confirmation code has been sent to your phone.")
        }
        SendOutcome::RateLimited => {
            logging::event("sms_check_rate_limited", fields);
            Flash::warning(
                target,
                "A code was sent less than a minute ago. Please wait before requesting another.",
            )
        }
    })
}

/// Verify a submitted code. Without one, report the flash left by
/// `send_sms_check`.
#[get("/vote/sms_check?<election_id>&<code>")]
async fn sms_check(
    token: AuthToken,
    meta: RequestMeta,
    flash: Option<FlashMessage<'_>>,
    election_id: Option<&str>,
    code: Option<&str>,
    storage: Storage,
    config: &State<Config>,
    codec: &State<TokenCodec>,
) -> Result<Json<SmsCheckResult>> {
    let election_id = parse_id(&meta, election_id, "invalid_election_id")?;
    let user = caller(token, &storage, &meta).await?;
    let Some(code) = code else {
        return Ok(Json(SmsCheckResult {
            valid: false,
            message: flash.map(|flash| flash.message().to_string()),
        }));
    };
    let election = storage
        .election(election_id)
        .await
        .map_err(|err| failed(&meta, "sms_check", err))?
        .ok_or(Error::NotFound("invalid_election"))?;
    if !election.requires_sms_check {
        return Err(Error::Denied("sms_check_not_required"));
    }

    let verification = SmsChallenge::new(&storage, config.inner(), codec.inner())
        .verify(&user, code, Utc::now())
        .await
        .map_err(|err| failed(&meta, "sms_check", err))?;
    if !verification.valid {
        logging::security(
            &meta,
            "invalid_sms_code",
            json!({
                "user_id": user.id,
                "election_id": election_id,
                "failed_attempts": verification.failed_attempts,
            }),
        );
    }
    Ok(Json(SmsCheckResult {
        valid: verification.valid,
        message: None,
    }))
}

/// Report what stands between the caller and a vote token. Creates nothing.
#[get("/vote/check?<election_id>&<sms_check_token>")]
async fn check(
    token: AuthToken,
    meta: RequestMeta,
    election_id: Option<&str>,
    sms_check_token: Option<&str>,
    storage: Storage,
    config: &State<Config>,
    codec: &State<TokenCodec>,
) -> Result<Json<EligibilityStatus>> {
    let election_id = parse_id(&meta, election_id, "invalid_election_id")?;
    let user = caller(token, &storage, &meta).await?;
    let verdict = Assessor::new(&storage, config.inner(), codec.inner())
        .assess(&user, election_id, sms_check_token, Utc::now())
        .await;
    let status = match verdict {
        Verdict::Eligible { .. } => "eligible",
        Verdict::Denied(denial @ (Denial::DocumentCheckRequired | Denial::SmsCheckRequired)) => {
            denial.reason()
        }
        Verdict::Denied(denial) => {
            let fields = json!({ "user_id": user.id, "election_id": election_id });
            return Err(denied(&meta, denial, fields));
        }
    };
    Ok(Json(EligibilityStatus { status }))
}
