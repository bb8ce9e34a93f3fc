//! The persistence collaborator, as seen from the voting core.
//!
//! The core never holds locks of its own: every race between concurrent
//! requests for the same user is settled by an atomic operation of the store
//! (unique vote index, conditional SMS slot claim).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rocket::{
    request::{FromRequest, Outcome, Request},
    tokio::time::timeout,
    State,
};

use crate::config::Config;
use crate::error::{Result, TransientError};
use crate::model::{
    document::{DocumentId, DocumentType},
    election::{Election, ElectionLocation},
    id::{ElectionId, LocationId, UserId},
    user::User,
    vote::{Vote, VoteCount},
};

#[cfg(test)]
mod memory;
mod mongo;

#[cfg(test)]
pub use memory::MemoryStore;
pub use mongo::MongoStore;

/// Outcome of the atomic create-or-fetch of a vote row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteSlot {
    /// No row existed; ours was inserted.
    Created(Vote),
    /// A row already existed and was left untouched.
    Existing(Vote),
    /// A concurrent insert won between our check and our write.
    RaceLost,
}

/// Storage operations the voting core needs.
#[rocket::async_trait]
pub trait VoteStore: Send + Sync {
    async fn election(&self, id: ElectionId) -> Result<Option<Election>>;

    async fn location(
        &self,
        election_id: ElectionId,
        location_id: LocationId,
    ) -> Result<Option<ElectionLocation>>;

    async fn locations(&self, election_id: ElectionId) -> Result<Vec<ElectionLocation>>;

    async fn user(&self, id: UserId) -> Result<Option<User>>;

    async fn user_by_document(
        &self,
        doc_type: DocumentType,
        doc_id: &DocumentId,
    ) -> Result<Option<User>>;

    async fn vote(&self, user_id: UserId, election_id: ElectionId) -> Result<Option<Vote>>;

    /// Insert `vote` unless a row for its user and election exists, in a
    /// single atomic operation.
    async fn create_or_fetch_vote(&self, vote: Vote) -> Result<VoteSlot>;

    async fn count_cast_votes(&self, count: VoteCount) -> Result<u64>;

    /// Start a new SMS check at `now`, but only if the previous one was sent at
    /// or before `not_before`. The failure counter is kept. Returns whether the
    /// slot was claimed.
    async fn claim_sms_slot(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
        not_before: DateTime<Utc>,
    ) -> Result<bool>;

    /// Atomically count one more failed SMS verification; returns the new total.
    async fn record_sms_failure(&self, user_id: UserId) -> Result<u32>;

    /// Forget failed SMS verifications after a successful one.
    async fn clear_sms_failures(&self, user_id: UserId) -> Result<()>;
}

/// The store handle kept in managed state.
pub type SharedStore = Arc<dyn VoteStore>;

/// A store handle whose every call is bounded by the configured timeout.
/// A call that overruns is reported as a transient failure.
#[derive(Clone)]
pub struct Storage {
    inner: SharedStore,
    timeout: Duration,
}

impl Storage {
    pub fn new(inner: SharedStore, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransientError::Timeout(self.timeout.as_millis()).into()),
        }
    }

    pub async fn election(&self, id: ElectionId) -> Result<Option<Election>> {
        self.bounded(self.inner.election(id)).await
    }

    pub async fn location(
        &self,
        election_id: ElectionId,
        location_id: LocationId,
    ) -> Result<Option<ElectionLocation>> {
        self.bounded(self.inner.location(election_id, location_id))
            .await
    }

    pub async fn locations(&self, election_id: ElectionId) -> Result<Vec<ElectionLocation>> {
        self.bounded(self.inner.locations(election_id)).await
    }

    pub async fn user(&self, id: UserId) -> Result<Option<User>> {
        self.bounded(self.inner.user(id)).await
    }

    pub async fn user_by_document(
        &self,
        doc_type: DocumentType,
        doc_id: &DocumentId,
    ) -> Result<Option<User>> {
        self.bounded(self.inner.user_by_document(doc_type, doc_id))
            .await
    }

    pub async fn vote(&self, user_id: UserId, election_id: ElectionId) -> Result<Option<Vote>> {
        self.bounded(self.inner.vote(user_id, election_id)).await
    }

    pub async fn create_or_fetch_vote(&self, vote: Vote) -> Result<VoteSlot> {
        self.bounded(self.inner.create_or_fetch_vote(vote)).await
    }

    pub async fn count_cast_votes(&self, count: VoteCount) -> Result<u64> {
        self.bounded(self.inner.count_cast_votes(count)).await
    }

    pub async fn claim_sms_slot(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
        not_before: DateTime<Utc>,
    ) -> Result<bool> {
        self.bounded(self.inner.claim_sms_slot(user_id, now, not_before))
            .await
    }

    pub async fn record_sms_failure(&self, user_id: UserId) -> Result<u32> {
        self.bounded(self.inner.record_sms_failure(user_id)).await
    }

    pub async fn clear_sms_failures(&self, user_id: UserId) -> Result<()> {
        self.bounded(self.inner.clear_sms_failures(user_id)).await
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Storage {
    type Error = ();

    /// Wrap the managed store with the configured timeout.
    ///
    /// Panics iff the store or [`Config`] is not managed by [`rocket::Rocket`].
    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let store = req.guard::<&State<SharedStore>>().await.unwrap();
        let config = req.guard::<&State<Config>>().await.unwrap();
        Outcome::Success(Storage::new(store.inner().clone(), config.storage_timeout()))
    }
}
