//! In-person ballots registered by a paper authority.
//!
//! A session is rebuilt on every request; the typestates only make each
//! step require the previous one.

use std::slice;

use chrono::{DateTime, NaiveDate, Utc};

use crate::census::CensusLookup;
use crate::config::Config;
use crate::eligibility::{check_location, NotEligible};
use crate::error::{Error, Result};
use crate::model::{
    document::DocumentQuery,
    election::{Election, ElectionLocation, VotingMode},
    id::{ElectionId, LocationId, UserId},
    user::User,
    vote::{Vote, VoteCount},
};
use crate::store::{Storage, VoteSlot};
use crate::token::{Comparator, TokenCodec, TokenPayload};

/// Why a paper session stopped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PaperDenial {
    /// Missing capability, wrong paper token, or unknown election/location.
    Unauthorized,
    WrongChannel,
    ElectionClosed,
    VoterNotFound,
    InvalidValidationToken,
    NotEligible(NotEligible),
    DocumentCheckRequired,
    AlreadyVoted,
}

impl PaperDenial {
    pub fn reason(self) -> &'static str {
        match self {
            Self::Unauthorized => "paper_vote_unauthorized",
            Self::WrongChannel => "wrong_channel",
            Self::ElectionClosed => "election_closed",
            Self::VoterNotFound => "voter_not_found",
            Self::InvalidValidationToken => "invalid_validation_token",
            Self::NotEligible(_) => "user_not_eligible",
            Self::DocumentCheckRequired => "document_check_required",
            Self::AlreadyVoted => "already_voted",
        }
    }

    /// Denials the security log must see.
    pub fn is_security_event(self) -> bool {
        matches!(self, Self::Unauthorized | Self::InvalidValidationToken)
    }

    pub fn into_error(self) -> Error {
        match self {
            Self::Unauthorized | Self::InvalidValidationToken => {
                Error::Authorization(self.reason())
            }
            Self::VoterNotFound => Error::NotFound(self.reason()),
            _ => Error::Denied(self.reason()),
        }
    }
}

#[derive(Debug)]
pub enum PaperError {
    Denied(PaperDenial),
    Failed(Error),
}

impl From<Error> for PaperError {
    fn from(err: Error) -> Self {
        Self::Failed(err)
    }
}

impl From<PaperDenial> for PaperError {
    fn from(denial: PaperDenial) -> Self {
        Self::Denied(denial)
    }
}

pub type PaperResult<T> = std::result::Result<T, PaperError>;

/// Collaborators of a paper session.
pub struct PaperDesk<'a, C> {
    storage: &'a Storage,
    census: CensusLookup<'a>,
    codec: &'a TokenCodec<C>,
}

impl<'a, C> PaperDesk<'a, C>
where
    C: Comparator,
{
    pub fn new(storage: &'a Storage, config: &'a Config, codec: &'a TokenCodec<C>) -> Self {
        Self {
            storage,
            census: CensusLookup::new(storage, config),
            codec,
        }
    }
}

/// An operator asking to work the desk of a location.
pub struct Unauthenticated {
    pub authority: User,
    pub election_id: ElectionId,
    pub location_id: LocationId,
}

pub struct AuthorityVerified;

pub struct VoterResolved {
    voter: User,
}

pub struct VoterValidated {
    voter: User,
}

pub struct Recorded {
    vote: Vote,
}

/// A paper session past authentication, in state `S`.
pub struct PaperSession<S> {
    authority: User,
    election: Election,
    location: ElectionLocation,
    state: S,
}

impl<S> PaperSession<S> {
    pub fn authority(&self) -> &User {
        &self.authority
    }

    pub fn election(&self) -> &Election {
        &self.election
    }

    pub fn location(&self) -> &ElectionLocation {
        &self.location
    }

    fn advance<T>(self, state: T) -> PaperSession<T> {
        PaperSession {
            authority: self.authority,
            election: self.election,
            location: self.location,
            state,
        }
    }

    /// Paper ballots this operator has registered in the election.
    pub async fn authority_votes_count<C: Comparator>(&self, desk: &PaperDesk<'_, C>) -> Result<u64> {
        desk.storage
            .count_cast_votes(VoteCount::Authority(self.election.id, self.authority.id))
            .await
    }
}

impl Unauthenticated {
    /// Check capability and paper token, then that the election is an open
    /// paper election.
    ///
    /// The token is compared even when the election or location is unknown,
    /// so the answer does not reveal which identifiers exist.
    pub async fn authenticate<C: Comparator>(
        self,
        desk: &PaperDesk<'_, C>,
        token: Option<&str>,
        now: DateTime<Utc>,
    ) -> PaperResult<PaperSession<AuthorityVerified>> {
        let election = desk.storage.election(self.election_id).await?;
        let location = desk
            .storage
            .location(self.election_id, self.location_id)
            .await?;

        let secret = location
            .as_ref()
            .map(|location| location.token_key.as_str())
            .unwrap_or_default();
        let payload = TokenPayload::Paper(self.election_id, self.location_id);
        let token_ok = desk.codec.verify(secret.as_bytes(), &payload, token);

        let (Some(election), Some(location)) = (election, location) else {
            return Err(PaperDenial::Unauthorized.into());
        };
        if !token_ok || !self.authority.is_paper_authority() {
            return Err(PaperDenial::Unauthorized.into());
        }
        if election.mode != VotingMode::Paper {
            return Err(PaperDenial::WrongChannel.into());
        }
        if !election.is_active(now) {
            return Err(PaperDenial::ElectionClosed.into());
        }

        Ok(PaperSession {
            authority: self.authority,
            election,
            location,
            state: AuthorityVerified,
        })
    }
}

impl PaperSession<AuthorityVerified> {
    /// Find the voter by an already validated document.
    pub async fn resolve<C: Comparator>(
        self,
        desk: &PaperDesk<'_, C>,
        query: &DocumentQuery,
    ) -> PaperResult<PaperSession<VoterResolved>> {
        match desk.census.find(&self.election, query).await? {
            Some(voter) => Ok(self.advance(VoterResolved { voter })),
            None => Err(PaperDenial::VoterNotFound.into()),
        }
    }

    /// Find a voter resolved earlier today, by the validation token handed
    /// out then.
    pub async fn resolve_by_token<C: Comparator>(
        self,
        desk: &PaperDesk<'_, C>,
        user_id: UserId,
        validation_token: Option<&str>,
        today: NaiveDate,
    ) -> PaperResult<PaperSession<VoterResolved>> {
        let payload = TokenPayload::Validation {
            user_id,
            location_id: self.location.id,
            date: today,
        };
        if !desk
            .codec
            .verify(self.location.token_key.as_bytes(), &payload, validation_token)
        {
            return Err(PaperDenial::InvalidValidationToken.into());
        }
        match desk.census.find_by_user_id(&self.election, user_id).await? {
            Some(voter) => Ok(self.advance(VoterResolved { voter })),
            None => Err(PaperDenial::VoterNotFound.into()),
        }
    }
}

impl PaperSession<VoterResolved> {
    pub fn voter(&self) -> &User {
        &self.state.voter
    }

    /// Confirm the voter belongs at this location and has not voted through
    /// any channel.
    pub async fn validate<C: Comparator>(
        self,
        desk: &PaperDesk<'_, C>,
    ) -> PaperResult<PaperSession<VoterValidated>> {
        let voter = &self.state.voter;
        if !self.election.has_valid_user_created_at(voter.created_at) {
            return Err(PaperDenial::NotEligible(NotEligible::CreatedAfterCutoff).into());
        }
        let census_member = desk.census.is_member(&self.election, voter).await?;
        let locations = slice::from_ref(&self.location);
        if check_location(&self.election, locations, voter, census_member).is_none() {
            return Err(PaperDenial::NotEligible(NotEligible::LocationMismatch).into());
        }
        if self.election.requires_document_check && !voter.document_verified {
            return Err(PaperDenial::DocumentCheckRequired.into());
        }
        if desk.storage.vote(voter.id, self.election.id).await?.is_some() {
            return Err(PaperDenial::AlreadyVoted.into());
        }

        let VoterResolved { voter } = self.state;
        Ok(PaperSession {
            authority: self.authority,
            election: self.election,
            location: self.location,
            state: VoterValidated { voter },
        })
    }
}

impl PaperSession<VoterValidated> {
    pub fn voter(&self) -> &User {
        &self.state.voter
    }

    /// The token confirming this voter at this location, valid for `today`.
    pub fn validation_token<C: Comparator>(
        &self,
        desk: &PaperDesk<'_, C>,
        today: NaiveDate,
    ) -> String {
        let payload = TokenPayload::Validation {
            user_id: self.state.voter.id,
            location_id: self.location.id,
            date: today,
        };
        desk.codec.sign(self.location.token_key.as_bytes(), &payload)
    }

    /// Record the ballot through the same create-or-fetch as digital votes.
    pub async fn record<C: Comparator>(
        self,
        desk: &PaperDesk<'_, C>,
        now: DateTime<Utc>,
    ) -> PaperResult<PaperSession<Recorded>> {
        let vote = Vote::paper(
            self.state.voter.id,
            self.election.id,
            self.location.id,
            self.authority.id,
            now,
        );
        match desk.storage.create_or_fetch_vote(vote).await? {
            VoteSlot::Created(vote) => Ok(self.advance(Recorded { vote })),
            VoteSlot::Existing(_) | VoteSlot::RaceLost => Err(PaperDenial::AlreadyVoted.into()),
        }
    }
}

impl PaperSession<Recorded> {
    pub fn vote(&self) -> &Vote {
        &self.state.vote
    }
}
