use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard,
};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Result, TransientError};
use crate::model::{
    document::{DocumentId, DocumentType},
    election::{Election, ElectionLocation},
    id::{ElectionId, LocationId, UserId},
    user::User,
    vote::{Vote, VoteCount},
};

use super::{VoteSlot, VoteStore};

#[derive(Default)]
struct Tables {
    elections: HashMap<ElectionId, Election>,
    locations: HashMap<(ElectionId, LocationId), ElectionLocation>,
    users: HashMap<UserId, User>,
    votes: HashMap<(UserId, ElectionId), Vote>,
    /// Inserted just before the next create-or-fetch, as a concurrent
    /// request would.
    race_winner: Option<Vote>,
    unavailable: bool,
    delay: Option<Duration>,
}

/// An in-memory store for tests. Clones share the same tables, and every
/// trait call is counted.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    calls: Arc<AtomicUsize>,
}

impl MemoryStore {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap()
    }

    /// Count a call, then fail or stall if the test asked for it.
    async fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (unavailable, delay) = {
            let tables = self.tables();
            (tables.unavailable, tables.delay)
        };
        if let Some(delay) = delay {
            rocket::tokio::time::sleep(delay).await;
        }
        if unavailable {
            return Err(TransientError::Unavailable("memory store offline".to_string()).into());
        }
        Ok(())
    }

    /// Trait calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn insert_election(&self, election: Election) {
        self.tables().elections.insert(election.id, election);
    }

    pub fn insert_location(&self, location: ElectionLocation) {
        self.tables()
            .locations
            .insert((location.election_id, location.id), location);
    }

    pub fn insert_user(&self, user: User) {
        self.tables().users.insert(user.id, user);
    }

    pub fn insert_vote(&self, vote: Vote) {
        self.tables()
            .votes
            .insert((vote.user_id, vote.election_id), vote);
    }

    pub fn get_user(&self, id: UserId) -> Option<User> {
        self.tables().users.get(&id).cloned()
    }

    pub fn get_vote(&self, user_id: UserId, election_id: ElectionId) -> Option<Vote> {
        self.tables().votes.get(&(user_id, election_id)).cloned()
    }

    pub fn vote_count(&self) -> usize {
        self.tables().votes.len()
    }

    /// Make the next create-or-fetch lose a race against `winner`.
    pub fn lose_next_race(&self, winner: Vote) {
        self.tables().race_winner = Some(winner);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.tables().unavailable = unavailable;
    }

    /// Stall every call, to exercise timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.tables().delay = delay;
    }
}

#[rocket::async_trait]
impl VoteStore for MemoryStore {
    async fn election(&self, id: ElectionId) -> Result<Option<Election>> {
        self.enter().await?;
        Ok(self.tables().elections.get(&id).cloned())
    }

    async fn location(
        &self,
        election_id: ElectionId,
        location_id: LocationId,
    ) -> Result<Option<ElectionLocation>> {
        self.enter().await?;
        Ok(self
            .tables()
            .locations
            .get(&(election_id, location_id))
            .cloned())
    }

    async fn locations(&self, election_id: ElectionId) -> Result<Vec<ElectionLocation>> {
        self.enter().await?;
        let mut locations: Vec<_> = self
            .tables()
            .locations
            .values()
            .filter(|location| location.election_id == election_id)
            .cloned()
            .collect();
        locations.sort_by_key(|location| location.id);
        Ok(locations)
    }

    async fn user(&self, id: UserId) -> Result<Option<User>> {
        self.enter().await?;
        Ok(self.get_user(id))
    }

    async fn user_by_document(
        &self,
        doc_type: DocumentType,
        doc_id: &DocumentId,
    ) -> Result<Option<User>> {
        self.enter().await?;
        Ok(self
            .tables()
            .users
            .values()
            .find(|user| {
                user.document_type == doc_type
                    && user.document_id.eq_ignore_ascii_case(doc_id.as_str())
            })
            .cloned())
    }

    async fn vote(&self, user_id: UserId, election_id: ElectionId) -> Result<Option<Vote>> {
        self.enter().await?;
        Ok(self.get_vote(user_id, election_id))
    }

    async fn create_or_fetch_vote(&self, vote: Vote) -> Result<VoteSlot> {
        self.enter().await?;
        let mut tables = self.tables();
        if let Some(winner) = tables.race_winner.take() {
            tables
                .votes
                .insert((winner.user_id, winner.election_id), winner);
            return Ok(VoteSlot::RaceLost);
        }
        let key = (vote.user_id, vote.election_id);
        if let Some(existing) = tables.votes.get(&key) {
            return Ok(VoteSlot::Existing(existing.clone()));
        }
        tables.votes.insert(key, vote.clone());
        Ok(VoteSlot::Created(vote))
    }

    async fn count_cast_votes(&self, count: VoteCount) -> Result<u64> {
        self.enter().await?;
        let tables = self.tables();
        let counted = tables
            .votes
            .values()
            .filter(|vote| vote.is_cast())
            .filter(|vote| match count {
                VoteCount::Election(election_id) => vote.election_id == election_id,
                VoteCount::Location(election_id, location_id) => {
                    vote.election_id == election_id
                        && vote.election_location_id == Some(location_id)
                }
                VoteCount::Authority(election_id, authority_id) => {
                    vote.election_id == election_id
                        && vote.paper_authority_id == Some(authority_id)
                }
            })
            .count();
        Ok(counted as u64)
    }

    async fn claim_sms_slot(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
        not_before: DateTime<Utc>,
    ) -> Result<bool> {
        self.enter().await?;
        let mut tables = self.tables();
        let Some(user) = tables.users.get_mut(&user_id) else {
            return Ok(false);
        };
        if user
            .sms_check
            .sent_at
            .is_some_and(|sent_at| sent_at > not_before)
        {
            return Ok(false);
        }
        user.sms_check.sent_at = Some(now);
        Ok(true)
    }

    async fn record_sms_failure(&self, user_id: UserId) -> Result<u32> {
        self.enter().await?;
        let mut tables = self.tables();
        Ok(tables.users.get_mut(&user_id).map_or(0, |user| {
            user.sms_check.failed_attempts += 1;
            user.sms_check.failed_attempts
        }))
    }

    async fn clear_sms_failures(&self, user_id: UserId) -> Result<()> {
        self.enter().await?;
        if let Some(user) = self.tables().users.get_mut(&user_id) {
            user.sms_check.failed_attempts = 0;
        }
        Ok(())
    }
}
