use chrono::Utc;
use rocket::{
    serde::json::{json, Json},
    Route, State,
};
use serde::Serialize;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::logging::{self, RequestMeta};
use crate::model::{
    auth::AuthToken,
    document::DocumentQuery,
    id::{ElectionId, LocationId, UserId},
};
use crate::paper::{PaperDesk, PaperError, Unauthenticated};
use crate::store::Storage;
use crate::token::TokenCodec;

use super::common::{caller, parse_id, rejected};

pub fn routes() -> Vec<Route> {
    routes![paper_vote]
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
struct PaperVoteResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    validation_token: Option<String>,
    authority_votes_count: u64,
    recorded: bool,
}

/// What the operator asked of the desk.
enum PaperStep<'r> {
    /// Only open the desk.
    Open,
    /// Look a voter up by document.
    Query(DocumentQuery),
    /// Register the ballot of a voter looked up earlier.
    Confirm {
        user_id: UserId,
        validation_token: Option<&'r str>,
    },
}

#[allow(clippy::too_many_arguments)]
#[get("/vote/paper_vote?<election_id>&<election_location_id>&<token>&<document_type>&<document_vatid>&<user_id>&<validation_token>")]
async fn paper_vote(
    auth: AuthToken,
    meta: RequestMeta,
    election_id: Option<&str>,
    election_location_id: Option<&str>,
    token: Option<&str>,
    document_type: Option<&str>,
    document_vatid: Option<&str>,
    user_id: Option<&str>,
    validation_token: Option<&str>,
    storage: Storage,
    config: &State<Config>,
    codec: &State<TokenCodec>,
) -> Result<Json<PaperVoteResponse>> {
    let election_id: ElectionId = parse_id(&meta, election_id, "invalid_election_id")?;
    let location_id: LocationId =
        parse_id(&meta, election_location_id, "invalid_election_location_id")?;
    let step = if document_type.is_some() || document_vatid.is_some() {
        let raw_type = document_type.unwrap_or_default();
        let raw_id = document_vatid.unwrap_or_default();
        let query = DocumentQuery::parse(raw_type, raw_id).map_err(|err| {
            rejected(&meta, err.reason(), document_type, "document rejected");
            err
        })?;
        PaperStep::Query(query)
    } else if user_id.is_some() {
        PaperStep::Confirm {
            user_id: parse_id(&meta, user_id, "invalid_user_id")?,
            validation_token,
        }
    } else {
        PaperStep::Open
    };

    let authority = caller(auth, &storage, &meta).await?;
    let authority_id = authority.id;
    let desk = PaperDesk::new(&storage, config.inner(), codec.inner());
    let now = Utc::now();
    let today = now.date_naive();
    let fields = json!({
        "authority_id": authority_id,
        "election_id": election_id,
        "election_location_id": location_id,
    });
    let fail = |err: PaperError| denied(&meta, &fields, err);
    let failed = |err: Error| fail(err.into());

    let session = Unauthenticated {
        authority,
        election_id,
        location_id,
    }
    .authenticate(&desk, token, now)
    .await
    .map_err(fail)?;

    let response = match step {
        PaperStep::Open => PaperVoteResponse {
            authority_votes_count: session.authority_votes_count(&desk).await.map_err(failed)?,
            ..Default::default()
        },
        PaperStep::Query(query) => {
            logging::paper_query(session.authority(), &query);
            let session = session
                .resolve(&desk, &query)
                .await
                .map_err(fail)?
                .validate(&desk)
                .await
                .map_err(fail)?;
            PaperVoteResponse {
                user_id: Some(session.voter().id),
                validation_token: Some(session.validation_token(&desk, today)),
                authority_votes_count: session.authority_votes_count(&desk).await.map_err(failed)?,
                recorded: false,
            }
        }
        PaperStep::Confirm {
            user_id,
            validation_token,
        } => {
            let session = session
                .resolve_by_token(&desk, user_id, validation_token, today)
                .await
                .map_err(fail)?
                .validate(&desk)
                .await
                .map_err(fail)?
                .record(&desk, now)
                .await
                .map_err(fail)?;
            logging::paper_vote(session.authority(), session.vote().user_id);
            logging::event(
                "paper_vote_recorded",
                json!({
                    "authority_id": authority_id,
                    "user_id": session.vote().user_id,
                    "election_id": election_id,
                    "election_location_id": location_id,
                }),
            );
            PaperVoteResponse {
                user_id: Some(user_id),
                validation_token: None,
                authority_votes_count: session.authority_votes_count(&desk).await.map_err(failed)?,
                recorded: true,
            }
        }
    };
    Ok(Json(response))
}

/// Log why a paper session stopped and pick the response error.
fn denied(meta: &RequestMeta, fields: &rocket::serde::json::Value, err: PaperError) -> Error {
    match err {
        PaperError::Denied(denial) => {
            if denial.is_security_event() {
                logging::security(meta, denial.reason(), fields.clone());
            } else {
                logging::event(&format!("paper_{}", denial.reason()), fields.clone());
            }
            denial.into_error()
        }
        PaperError::Failed(err) => {
            logging::failure(Some(meta), "paper_vote", &err);
            err
        }
    }
}
