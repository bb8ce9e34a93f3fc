//! Whether a user may vote in an election right now.
//!
//! [`evaluate`] is a pure function of loaded state. [`Assessor`] loads that
//! state and turns any collaborator failure into a denial.

use chrono::{DateTime, Utc};

use crate::census::CensusLookup;
use crate::config::Config;
use crate::error::{Error, Result, TransientError};
use crate::logging;
use crate::model::{
    election::{Election, ElectionLocation, Scope, VotingMode},
    id::{ElectionId, LocationId},
    user::User,
};
use crate::sms::SmsChallenge;
use crate::store::Storage;
use crate::token::{Comparator, TokenCodec};

/// What the request carried as SMS confirmation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SmsEvidence {
    NotPresented,
    Valid,
    Invalid,
}

/// Why a user is outside an election's electorate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NotEligible {
    CreatedAfterCutoff,
    LocationMismatch,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Ineligible {
    InvalidElection,
    /// The election is not cast through this channel.
    WrongChannel,
    ElectionClosed,
    UserNotEligible(NotEligible),
    SmsRequired,
    SmsAttemptsExceeded,
    EvaluationError,
}

impl Ineligible {
    pub fn reason(self) -> &'static str {
        match self {
            Self::InvalidElection => "invalid_election",
            Self::WrongChannel => "wrong_channel",
            Self::ElectionClosed => "election_closed",
            Self::UserNotEligible(_) => "user_not_eligible",
            Self::SmsRequired => "sms_required",
            Self::SmsAttemptsExceeded => "sms_attempts_exceeded",
            Self::EvaluationError => "evaluation_error",
        }
    }
}

/// A verdict short of eligibility.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Denial {
    /// The user must go through document verification first.
    DocumentCheckRequired,
    /// The user must request an SMS code first.
    SmsCheckRequired,
    Ineligible(Ineligible),
}

impl Denial {
    pub fn reason(self) -> &'static str {
        match self {
            Self::DocumentCheckRequired => "document_check_required",
            Self::SmsCheckRequired => "sms_check_required",
            Self::Ineligible(ineligible) => ineligible.reason(),
        }
    }

    /// The generic error a caller answers with.
    pub fn into_error(self) -> Error {
        match self {
            Self::Ineligible(Ineligible::InvalidElection) => Error::NotFound(self.reason()),
            Self::Ineligible(Ineligible::EvaluationError) => {
                TransientError::Unavailable(self.reason().to_string()).into()
            }
            _ => Error::Denied(self.reason()),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verdict {
    Eligible {
        location_id: LocationId,
        /// The election ID the tallying backend uses for this location.
        scoped_election_id: u64,
    },
    Denied(Denial),
}

/// Everything a verdict depends on.
#[derive(Debug, Clone)]
pub struct Evaluation<'a> {
    pub election: Option<&'a Election>,
    pub locations: &'a [ElectionLocation],
    pub user: &'a User,
    /// Census membership; only consulted for census-scoped elections.
    pub census_member: bool,
    pub sms: SmsEvidence,
    pub failed_sms_attempts: u32,
    pub max_sms_attempts: u32,
    pub now: DateTime<Utc>,
}

/// Apply the checks in order, stopping at the first that fails.
pub fn evaluate(evaluation: &Evaluation<'_>) -> Verdict {
    let ineligible = |reason| Verdict::Denied(Denial::Ineligible(reason));
    let user = evaluation.user;

    let Some(election) = evaluation.election else {
        return ineligible(Ineligible::InvalidElection);
    };
    if election.mode != VotingMode::Digital {
        return ineligible(Ineligible::WrongChannel);
    }
    if !election.is_active(evaluation.now) {
        return ineligible(Ineligible::ElectionClosed);
    }
    if !election.has_valid_user_created_at(user.created_at) {
        return ineligible(Ineligible::UserNotEligible(NotEligible::CreatedAfterCutoff));
    }
    let Some(location) =
        check_location(election, evaluation.locations, user, evaluation.census_member)
    else {
        return ineligible(Ineligible::UserNotEligible(NotEligible::LocationMismatch));
    };
    if election.requires_document_check && !user.document_verified {
        return Verdict::Denied(Denial::DocumentCheckRequired);
    }
    if election.requires_sms_check {
        if evaluation.failed_sms_attempts >= evaluation.max_sms_attempts {
            return ineligible(Ineligible::SmsAttemptsExceeded);
        }
        match evaluation.sms {
            SmsEvidence::Valid => {}
            SmsEvidence::NotPresented => return Verdict::Denied(Denial::SmsCheckRequired),
            SmsEvidence::Invalid => return ineligible(Ineligible::SmsRequired),
        }
    }

    Verdict::Eligible {
        location_id: location.id,
        scoped_election_id: location.scoped_election_id(election),
    }
}

/// The location among `locations` this user votes at, if any.
///
/// State elections place everyone at their first location; census elections
/// place members there. Other scopes compare territory codes.
pub fn check_location<'l>(
    election: &Election,
    locations: &'l [ElectionLocation],
    user: &User,
    census_member: bool,
) -> Option<&'l ElectionLocation> {
    match election.scope {
        Scope::State => locations.first(),
        Scope::Census => locations.first().filter(|_| census_member),
        scope => {
            let code = scope.territory_code(user.location_code(scope)?);
            locations
                .iter()
                .find(|location| location.vote_location(scope) == code)
        }
    }
}

/// Loads what [`evaluate`] needs for one request.
pub struct Assessor<'a, C> {
    storage: &'a Storage,
    config: &'a Config,
    codec: &'a TokenCodec<C>,
}

impl<'a, C> Assessor<'a, C>
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

    /// Evaluate `user` for `election_id`. A submitted SMS code is verified,
    /// and counted if wrong.
    ///
    /// Collaborator failures deny with [`Ineligible::EvaluationError`] and are
    /// logged here.
    pub async fn assess(
        &self,
        user: &User,
        election_id: ElectionId,
        sms_code: Option<&str>,
        now: DateTime<Utc>,
    ) -> Verdict {
        match self.load_and_evaluate(user, election_id, sms_code, now).await {
            Ok(verdict) => verdict,
            Err(err) => {
                logging::failure(None, "evaluation_error", &err);
                Verdict::Denied(Denial::Ineligible(Ineligible::EvaluationError))
            }
        }
    }

    async fn load_and_evaluate(
        &self,
        user: &User,
        election_id: ElectionId,
        sms_code: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Verdict> {
        let max_sms_attempts = self.config.sms_max_attempts();
        let Some(election) = self.storage.election(election_id).await? else {
            return Ok(evaluate(&Evaluation {
                election: None,
                locations: &[],
                user,
                census_member: false,
                sms: SmsEvidence::NotPresented,
                failed_sms_attempts: user.sms_check.failed_attempts,
                max_sms_attempts,
                now,
            }));
        };
        let locations = self.storage.locations(election_id).await?;
        let census_member = CensusLookup::new(self.storage, self.config)
            .is_member(&election, user)
            .await?;

        let mut evaluation = Evaluation {
            election: Some(&election),
            locations: &locations,
            user,
            census_member,
            sms: SmsEvidence::NotPresented,
            failed_sms_attempts: user.sms_check.failed_attempts,
            max_sms_attempts,
            now,
        };
        let verdict = evaluate(&evaluation);

        // A code is only checked, and a wrong one only counted, once every
        // earlier check has passed.
        let (Verdict::Denied(Denial::SmsCheckRequired), Some(code)) = (verdict, sms_code) else {
            return Ok(verdict);
        };
        let verification = SmsChallenge::new(self.storage, self.config, self.codec)
            .verify(user, code, now)
            .await?;
        evaluation.sms = if verification.valid {
            SmsEvidence::Valid
        } else {
            SmsEvidence::Invalid
        };
        evaluation.failed_sms_attempts = verification.failed_attempts;
        Ok(evaluate(&evaluation))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::model::user::SmsCheckState;
    use crate::sms::sms_code;
    use crate::store::MemoryStore;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    fn evaluation<'a>(
        election: &'a Election,
        locations: &'a [ElectionLocation],
        user: &'a User,
    ) -> Evaluation<'a> {
        Evaluation {
            election: Some(election),
            locations,
            user,
            census_member: false,
            sms: SmsEvidence::NotPresented,
            failed_sms_attempts: 0,
            max_sms_attempts: 5,
            now: noon(),
        }
    }

    fn denied(ineligible: Ineligible) -> Verdict {
        Verdict::Denied(Denial::Ineligible(ineligible))
    }

    #[test]
    fn eligible_inside_the_window_only() {
        let election = Election::example();
        let locations = [ElectionLocation::example(election.id)];
        let user = User::example();
        let mut eval = evaluation(&election, &locations, &user);

        assert_eq!(
            evaluate(&eval),
            Verdict::Eligible {
                location_id: 10,
                scoped_election_id: 100_010
            }
        );
        for now in [
            election.starts_at - Duration::seconds(1),
            election.ends_at,
            Utc.with_ymd_and_hms(2025, 1, 2, 0, 1, 0).unwrap(),
        ] {
            eval.now = now;
            assert_eq!(evaluate(&eval), denied(Ineligible::ElectionClosed));
        }
        eval.now = election.starts_at;
        assert!(matches!(evaluate(&eval), Verdict::Eligible { .. }));
    }

    #[test]
    fn missing_election_is_invalid() {
        let user = User::example();
        let election = Election::example();
        let eval = Evaluation {
            election: None,
            ..evaluation(&election, &[], &user)
        };
        assert_eq!(evaluate(&eval), denied(Ineligible::InvalidElection));
    }

    #[test]
    fn paper_elections_are_not_digital() {
        let election = Election {
            mode: VotingMode::Paper,
            ..Election::example()
        };
        let locations = [ElectionLocation::example(election.id)];
        let user = User::example();
        assert_eq!(
            evaluate(&evaluation(&election, &locations, &user)),
            denied(Ineligible::WrongChannel)
        );
    }

    #[test]
    fn creation_cutoff() {
        let election = Election {
            user_created_at_max: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            ..Election::example()
        };
        let locations = [ElectionLocation::example(election.id)];
        let user = User::example();
        assert_eq!(
            evaluate(&evaluation(&election, &locations, &user)),
            denied(Ineligible::UserNotEligible(NotEligible::CreatedAfterCutoff))
        );
    }

    #[test]
    fn location_must_match_scope() {
        let election = Election {
            scope: Scope::Municipality,
            ..Election::example()
        };
        let mut madrid = ElectionLocation::example(election.id);
        madrid.id = 11;
        madrid.location = "280796".to_string();
        let mut elsewhere = ElectionLocation::example(election.id);
        elsewhere.location = "080193".to_string();
        let user = User::example();

        let locations = [elsewhere.clone(), madrid];
        assert!(matches!(
            evaluate(&evaluation(&election, &locations, &user)),
            Verdict::Eligible { location_id: 11, .. }
        ));

        let locations = [elsewhere];
        assert_eq!(
            evaluate(&evaluation(&election, &locations, &user)),
            denied(Ineligible::UserNotEligible(NotEligible::LocationMismatch))
        );
    }

    #[test]
    fn state_needs_a_location() {
        let election = Election::example();
        let user = User::example();
        assert_eq!(
            evaluate(&evaluation(&election, &[], &user)),
            denied(Ineligible::UserNotEligible(NotEligible::LocationMismatch))
        );
    }

    #[test]
    fn census_scope_uses_membership() {
        let election = Election {
            scope: Scope::Census,
            ..Election::example()
        };
        let locations = [ElectionLocation::example(election.id)];
        let user = User::example();
        let mut eval = evaluation(&election, &locations, &user);
        assert_eq!(
            evaluate(&eval),
            denied(Ineligible::UserNotEligible(NotEligible::LocationMismatch))
        );
        eval.census_member = true;
        assert!(matches!(evaluate(&eval), Verdict::Eligible { .. }));
    }

    #[test]
    fn document_check_branch() {
        let election = Election {
            requires_document_check: true,
            ..Election::example()
        };
        let locations = [ElectionLocation::example(election.id)];
        let unverified = User {
            document_verified: false,
            ..User::example()
        };
        assert_eq!(
            evaluate(&evaluation(&election, &locations, &unverified)),
            Verdict::Denied(Denial::DocumentCheckRequired)
        );
        let verified = User::example();
        assert!(matches!(
            evaluate(&evaluation(&election, &locations, &verified)),
            Verdict::Eligible { .. }
        ));
    }

    #[test]
    fn sms_check_branch() {
        let election = Election {
            requires_sms_check: true,
            ..Election::example()
        };
        let locations = [ElectionLocation::example(election.id)];
        let user = User::example();
        let mut eval = evaluation(&election, &locations, &user);

        assert_eq!(evaluate(&eval), Verdict::Denied(Denial::SmsCheckRequired));
        eval.sms = SmsEvidence::Invalid;
        assert_eq!(evaluate(&eval), denied(Ineligible::SmsRequired));
        eval.sms = SmsEvidence::Valid;
        assert!(matches!(evaluate(&eval), Verdict::Eligible { .. }));
        eval.failed_sms_attempts = 5;
        assert_eq!(evaluate(&eval), denied(Ineligible::SmsAttemptsExceeded));
    }

    #[test]
    fn checks_run_in_order() {
        // Closed, and with every later check failing too.
        let election = Election {
            requires_document_check: true,
            requires_sms_check: true,
            user_created_at_max: Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()),
            ..Election::example()
        };
        let user = User {
            document_verified: false,
            ..User::example()
        };
        let mut eval = evaluation(&election, &[], &user);
        eval.now = election.ends_at;
        assert_eq!(evaluate(&eval), denied(Ineligible::ElectionClosed));
        eval.now = noon();
        assert_eq!(
            evaluate(&eval),
            denied(Ineligible::UserNotEligible(NotEligible::CreatedAfterCutoff))
        );
    }

    fn seeded(election: Election) -> (MemoryStore, Storage) {
        let store = MemoryStore::default();
        store.insert_location(ElectionLocation::example(election.id));
        store.insert_election(election);
        let storage = Storage::new(Arc::new(store.clone()), std::time::Duration::from_secs(1));
        (store, storage)
    }

    #[rocket::async_test]
    async fn assess_loads_and_evaluates() {
        let (_, storage) = seeded(Election::example());
        let config = Config::example();
        let codec = TokenCodec::new();
        let assessor = Assessor::new(&storage, &config, &codec);
        let user = User::example();

        assert!(matches!(
            assessor.assess(&user, 1, None, noon()).await,
            Verdict::Eligible { .. }
        ));
        assert_eq!(
            assessor.assess(&user, 99, None, noon()).await,
            denied(Ineligible::InvalidElection)
        );
    }

    #[rocket::async_test]
    async fn assess_verifies_sms_codes() {
        let (store, storage) = seeded(Election {
            requires_sms_check: true,
            ..Election::example()
        });
        let config = Config::example();
        let codec = TokenCodec::new();
        let assessor = Assessor::new(&storage, &config, &codec);
        let sent_at = noon() - Duration::minutes(1);
        let user = User {
            sms_check: SmsCheckState {
                sent_at: Some(sent_at),
                failed_attempts: 0,
            },
            ..User::example()
        };
        store.insert_user(user.clone());

        assert_eq!(
            assessor.assess(&user, 1, Some("WRONG"), noon()).await,
            denied(Ineligible::SmsRequired)
        );
        assert_eq!(store.get_user(7).unwrap().sms_check.failed_attempts, 1);

        let code = sms_code(config.sms_secret(), user.id, sent_at);
        assert!(matches!(
            assessor.assess(&user, 1, Some(&code), noon()).await,
            Verdict::Eligible { .. }
        ));
    }

    #[rocket::async_test]
    async fn sms_codes_are_not_checked_for_earlier_denials() {
        let (store, storage) = seeded(Election {
            requires_sms_check: true,
            ..Election::example()
        });
        let config = Config::example();
        let codec = TokenCodec::new();
        let assessor = Assessor::new(&storage, &config, &codec);
        let closed = Utc.with_ymd_and_hms(2025, 1, 2, 0, 1, 0).unwrap();
        let user = User {
            sms_check: SmsCheckState {
                sent_at: Some(closed - Duration::minutes(1)),
                failed_attempts: 0,
            },
            ..User::example()
        };
        store.insert_user(user.clone());

        for _ in 0..config.sms_max_attempts() + 1 {
            assert_eq!(
                assessor.assess(&user, 1, Some("WRONG"), closed).await,
                denied(Ineligible::ElectionClosed)
            );
        }
        assert_eq!(store.get_user(7).unwrap().sms_check.failed_attempts, 0);

        // Locked users are denied before any code is looked at.
        let locked = User {
            sms_check: SmsCheckState {
                sent_at: Some(noon() - Duration::minutes(1)),
                failed_attempts: config.sms_max_attempts(),
            },
            ..User::example()
        };
        store.insert_user(locked.clone());
        assert_eq!(
            assessor.assess(&locked, 1, Some("WRONG"), noon()).await,
            denied(Ineligible::SmsAttemptsExceeded)
        );
        assert_eq!(
            store.get_user(7).unwrap().sms_check.failed_attempts,
            config.sms_max_attempts()
        );
    }

    #[rocket::async_test]
    async fn collaborator_failures_deny() {
        let (store, storage) = seeded(Election::example());
        store.set_unavailable(true);
        let config = Config::example();
        let codec = TokenCodec::new();
        let assessor = Assessor::new(&storage, &config, &codec);

        assert_eq!(
            assessor.assess(&User::example(), 1, None, noon()).await,
            denied(Ineligible::EvaluationError)
        );
    }

    #[rocket::async_test]
    async fn timeouts_deny() {
        let (store, _) = seeded(Election::example());
        store.set_delay(Some(std::time::Duration::from_millis(200)));
        let storage = Storage::new(Arc::new(store.clone()), std::time::Duration::from_millis(10));
        let config = Config::example();
        let codec = TokenCodec::new();
        let assessor = Assessor::new(&storage, &config, &codec);

        assert_eq!(
            assessor.assess(&User::example(), 1, None, noon()).await,
            denied(Ineligible::EvaluationError)
        );
    }
}
