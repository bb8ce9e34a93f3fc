use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::eligibility::{Assessor, Denial, Verdict};
use crate::error::{Result, TransientError};
use crate::model::{id::ElectionId, user::User, vote::Vote};
use crate::store::{Storage, VoteSlot};
use crate::token::{vote_token, Comparator, TokenCodec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueOutcome {
    /// A vote row was created with this token.
    Issued(String),
    /// The user already held a pending vote; its token is returned unchanged.
    Reissued(String),
    Denied(Denial),
    /// The vote has been cast; no token is handed out again.
    Gone,
}

/// Issues vote tokens, keeping at most one vote row per user and election.
pub struct VoteTokenService<'a, C> {
    storage: &'a Storage,
    config: &'a Config,
    codec: &'a TokenCodec<C>,
}

impl<'a, C> VoteTokenService<'a, C>
where
    C: Comparator,
{
    pub fn new(storage: &'a Storage, config: &'a Config, codec: &'a TokenCodec<C>) -> Self {
        Self {
            storage,
            config,
            codec,
        }
    }

    /// Issue `user` a token for `election_id`, or return the one they hold.
    ///
    /// Creating the row is a single create-or-fetch in storage. Losing a race
    /// against a concurrent request yields the winner's token.
    pub async fn issue_token(
        &self,
        user: &User,
        election_id: ElectionId,
        sms_code: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<IssueOutcome> {
        let verdict = Assessor::new(self.storage, self.config, self.codec)
            .assess(user, election_id, sms_code, now)
            .await;
        let (location_id, scoped_election_id) = match verdict {
            Verdict::Eligible {
                location_id,
                scoped_election_id,
            } => (location_id, scoped_election_id),
            Verdict::Denied(denial) => return Ok(IssueOutcome::Denied(denial)),
        };

        let token = vote_token(
            self.config.vote_secret(),
            user.id,
            election_id,
            scoped_election_id,
            now,
        );
        let vote = Vote::pending(user.id, election_id, location_id, token, now);
        match self.storage.create_or_fetch_vote(vote).await? {
            VoteSlot::Created(vote) => Ok(IssueOutcome::Issued(vote.token)),
            VoteSlot::Existing(vote) => Ok(existing(vote)),
            VoteSlot::RaceLost => match self.storage.vote(user.id, election_id).await? {
                Some(vote) => Ok(existing(vote)),
                None => Err(TransientError::Unavailable(
                    "vote row missing after a uniqueness conflict".to_string(),
                )
                .into()),
            },
        }
    }
}

/// Answer for a vote row that was already there.
fn existing(vote: Vote) -> IssueOutcome {
    if vote.is_cast() {
        IssueOutcome::Gone
    } else {
        IssueOutcome::Reissued(vote.token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::eligibility::Ineligible;
    use crate::error::Error;
    use crate::model::{
        election::{Election, ElectionLocation},
        vote::VoteStatus,
    };
    use crate::store::MemoryStore;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, hour, minute, 0).unwrap()
    }

    fn setup() -> (MemoryStore, Storage, Config) {
        let store = MemoryStore::default();
        let election = Election::example();
        store.insert_location(ElectionLocation::example(election.id));
        store.insert_election(election);
        store.insert_user(User::example());
        let storage = Storage::new(Arc::new(store.clone()), std::time::Duration::from_secs(1));
        (store, storage, Config::example())
    }

    #[rocket::async_test]
    async fn issuance_is_idempotent_until_close() {
        let (store, storage, config) = setup();
        let codec = TokenCodec::new();
        let service = VoteTokenService::new(&storage, &config, &codec);
        let user = User::example();

        let IssueOutcome::Issued(first) = service.issue_token(&user, 1, None, at(12, 0)).await.unwrap() else {
            panic!("expected a fresh token");
        };
        assert_eq!(
            service.issue_token(&user, 1, None, at(12, 5)).await.unwrap(),
            IssueOutcome::Reissued(first.clone())
        );
        assert_eq!(store.vote_count(), 1);
        assert_eq!(store.get_vote(7, 1).unwrap().status, VoteStatus::Pending);

        let after_close = Utc.with_ymd_and_hms(2025, 1, 2, 0, 1, 0).unwrap();
        assert_eq!(
            service.issue_token(&user, 1, None, after_close).await.unwrap(),
            IssueOutcome::Denied(Denial::Ineligible(Ineligible::ElectionClosed))
        );
        assert_eq!(store.get_vote(7, 1).unwrap().token, first);
    }

    #[rocket::async_test]
    async fn cast_votes_are_gone() {
        let (store, storage, config) = setup();
        store.insert_vote(Vote::paper(7, 1, 10, 1, at(9, 0)));
        let codec = TokenCodec::new();
        let service = VoteTokenService::new(&storage, &config, &codec);

        assert_eq!(
            service
                .issue_token(&User::example(), 1, None, at(12, 0))
                .await
                .unwrap(),
            IssueOutcome::Gone
        );
    }

    #[rocket::async_test]
    async fn losing_a_race_returns_the_winner() {
        let (store, storage, config) = setup();
        let winner = Vote::pending(7, 1, 10, "winner-token".to_string(), at(11, 59));
        store.lose_next_race(winner);
        let codec = TokenCodec::new();
        let service = VoteTokenService::new(&storage, &config, &codec);

        assert_eq!(
            service
                .issue_token(&User::example(), 1, None, at(12, 0))
                .await
                .unwrap(),
            IssueOutcome::Reissued("winner-token".to_string())
        );
        assert_eq!(store.vote_count(), 1);
    }

    #[rocket::async_test]
    async fn losing_a_race_to_a_cast_vote_is_gone() {
        let (store, storage, config) = setup();
        store.lose_next_race(Vote::paper(7, 1, 10, 1, at(11, 59)));
        let codec = TokenCodec::new();
        let service = VoteTokenService::new(&storage, &config, &codec);

        assert_eq!(
            service
                .issue_token(&User::example(), 1, None, at(12, 0))
                .await
                .unwrap(),
            IssueOutcome::Gone
        );
    }

    #[rocket::async_test]
    async fn ineligible_users_get_no_row() {
        let (store, storage, config) = setup();
        let codec = TokenCodec::new();
        let service = VoteTokenService::new(&storage, &config, &codec);
        let late = User {
            created_at: at(0, 0) + Duration::days(400),
            ..User::example()
        };
        store.insert_election(Election {
            user_created_at_max: Some(at(0, 0)),
            ..Election::example()
        });

        assert!(matches!(
            service.issue_token(&late, 1, None, at(12, 0)).await.unwrap(),
            IssueOutcome::Denied(Denial::Ineligible(Ineligible::UserNotEligible(_)))
        ));
        assert_eq!(store.vote_count(), 0);
    }

    #[rocket::async_test]
    async fn storage_failure_after_evaluation_propagates() {
        let (store, storage, config) = setup();
        let codec = TokenCodec::new();
        let service = VoteTokenService::new(&storage, &config, &codec);
        store.lose_next_race(Vote::pending(8, 1, 10, "other".to_string(), at(11, 0)));

        // The winner belongs to someone else, so no row is found for this user.
        let result = service.issue_token(&User::example(), 1, None, at(12, 0)).await;
        assert!(matches!(result, Err(Error::Transient(_))));
    }
}
