use rocket::{
    serde::json::{json, Json},
    Route, State,
};
use serde::Serialize;

use crate::counter::{count, CountOutcome, CounterTarget};
use crate::error::{Error, Result};
use crate::logging::{self, RequestMeta};
use crate::store::Storage;
use crate::token::TokenCodec;

use super::common::{failed, parse_id};

pub fn routes() -> Vec<Route> {
    routes![election_votes_count, election_location_votes_count]
}

#[derive(Debug, PartialEq, Eq, Serialize)]
struct VoteCountResponse {
    count: u64,
}

/// Public counter of an election, gated only by its counter token.
#[get("/vote/election_votes_count?<election_id>&<token>")]
async fn election_votes_count(
    meta: RequestMeta,
    election_id: Option<&str>,
    token: Option<&str>,
    storage: Storage,
    codec: &State<TokenCodec>,
) -> Result<Json<VoteCountResponse>> {
    let election_id = parse_id(&meta, election_id, "invalid_election_id")?;
    respond(&meta, &storage, codec, CounterTarget::Election(election_id), token).await
}

#[get("/vote/election_location_votes_count?<election_id>&<election_location_id>&<token>")]
async fn election_location_votes_count(
    meta: RequestMeta,
    election_id: Option<&str>,
    election_location_id: Option<&str>,
    token: Option<&str>,
    storage: Storage,
    codec: &State<TokenCodec>,
) -> Result<Json<VoteCountResponse>> {
    let election_id = parse_id(&meta, election_id, "invalid_election_id")?;
    let location_id = parse_id(&meta, election_location_id, "invalid_election_location_id")?;
    let target = CounterTarget::Location(election_id, location_id);
    respond(&meta, &storage, codec, target, token).await
}

async fn respond(
    meta: &RequestMeta,
    storage: &Storage,
    codec: &TokenCodec,
    target: CounterTarget,
    token: Option<&str>,
) -> Result<Json<VoteCountResponse>> {
    match count(storage, codec, target, token)
        .await
        .map_err(|err| failed(meta, "vote_count", err))?
    {
        CountOutcome::Count(count) => Ok(Json(VoteCountResponse { count })),
        CountOutcome::Unauthorized => {
            let (election_id, location_id) = match target {
                CounterTarget::Election(election_id) => (election_id, None),
                CounterTarget::Location(election_id, location_id) => (election_id, Some(location_id)),
            };
            logging::security(
                meta,
                "invalid_counter_token",
                json!({
                    "election_id": election_id,
                    "election_location_id": location_id,
                    "token": token.map(logging::token_prefix),
                }),
            );
            Err(Error::Authorization("invalid_counter_token"))
        }
    }
}
