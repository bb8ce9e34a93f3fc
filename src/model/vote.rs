use chrono::{DateTime, Utc};
use mongodb::bson::{to_bson, Bson};
use serde::{Deserialize, Serialize};

use crate::model::id::{ElectionId, LocationId, UserId};

/// Lifecycle of a vote row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteStatus {
    /// Token issued; the tallying backend has not confirmed a ballot yet.
    Pending,
    /// A ballot has been accepted, digitally or on paper.
    Cast,
}

impl From<VoteStatus> for Bson {
    fn from(status: VoteStatus) -> Self {
        to_bson(&status).expect("Serialisation is infallible")
    }
}

/// The single vote record a user may hold per election.
///
/// Uniqueness of `(user_id, election_id)` is enforced by the store, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub user_id: UserId,
    pub election_id: ElectionId,
    #[serde(default)]
    pub election_location_id: Option<LocationId>,
    /// Opaque token handed to the tallying backend. Empty for paper votes.
    pub token: String,
    pub status: VoteStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub cast_at: Option<DateTime<Utc>>,
    /// The operator who registered a paper ballot.
    #[serde(default)]
    pub paper_authority_id: Option<UserId>,
}

impl Vote {
    /// A digital vote awaiting its ballot.
    pub fn pending(
        user_id: UserId,
        election_id: ElectionId,
        location_id: LocationId,
        token: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            election_id,
            election_location_id: Some(location_id),
            token,
            status: VoteStatus::Pending,
            created_at: now,
            cast_at: None,
            paper_authority_id: None,
        }
    }

    /// A ballot cast in person, registered by `authority_id`.
    pub fn paper(
        user_id: UserId,
        election_id: ElectionId,
        location_id: LocationId,
        authority_id: UserId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            election_id,
            election_location_id: Some(location_id),
            token: String::new(),
            status: VoteStatus::Cast,
            created_at: now,
            cast_at: Some(now),
            paper_authority_id: Some(authority_id),
        }
    }

    pub fn is_cast(&self) -> bool {
        self.status == VoteStatus::Cast
    }
}

/// Which cast votes to count.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VoteCount {
    Election(ElectionId),
    Location(ElectionId, LocationId),
    /// Paper votes an operator has registered in an election.
    Authority(ElectionId, UserId),
}
