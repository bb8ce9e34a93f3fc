use crate::error::Result;
use crate::model::{
    id::{ElectionId, LocationId},
    vote::VoteCount,
};
use crate::store::Storage;
use crate::token::{Comparator, TokenCodec, TokenPayload};

/// A public vote counter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CounterTarget {
    Election(ElectionId),
    Location(ElectionId, LocationId),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CountOutcome {
    Count(u64),
    /// Wrong token, or unknown election or location. Indistinguishable.
    Unauthorized,
}

/// Count the cast votes of `target` if `candidate` is its counter token.
///
/// Unknown targets are verified against an empty key so the comparison runs
/// all the same.
pub async fn count<C: Comparator>(
    storage: &Storage,
    codec: &TokenCodec<C>,
    target: CounterTarget,
    candidate: Option<&str>,
) -> Result<CountOutcome> {
    let (secret, payload, count) = match target {
        CounterTarget::Election(election_id) => (
            storage
                .election(election_id)
                .await?
                .map(|election| election.counter_key),
            TokenPayload::ElectionCounter(election_id),
            VoteCount::Election(election_id),
        ),
        CounterTarget::Location(election_id, location_id) => (
            storage
                .location(election_id, location_id)
                .await?
                .map(|location| location.token_key),
            TokenPayload::LocationCounter(election_id, location_id),
            VoteCount::Location(election_id, location_id),
        ),
    };

    let known = secret.is_some();
    let verified = codec.verify(secret.unwrap_or_default().as_bytes(), &payload, candidate);
    if !(known && verified) {
        return Ok(CountOutcome::Unauthorized);
    }
    Ok(CountOutcome::Count(storage.count_cast_votes(count).await?))
}
