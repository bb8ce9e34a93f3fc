//! Keyed-hash tokens: vote tokens for the tallying backend, and the short
//! access tokens gating counters and paper voting.
//!
//! Access tokens carry no expiry of their own. Where a token must stop
//! working, the date is part of the signed payload.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, NaiveDate, Utc};
use data_encoding::{BASE64URL_NOPAD, HEXLOWER};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::model::id::{ElectionId, LocationId, UserId};

pub type HmacSha256 = Hmac<Sha256>;

/// Access tokens are the leading characters of the encoded HMAC.
pub const ACCESS_TOKEN_LENGTH: usize = 17;

/// Equality over secret-derived values.
pub trait Comparator: Send + Sync {
    fn equal(&self, expected: &[u8], candidate: &[u8]) -> bool;
}

/// Compares in time independent of where the inputs first differ.
#[derive(Debug, Default, Copy, Clone)]
pub struct ConstantTime;

impl Comparator for ConstantTime {
    fn equal(&self, expected: &[u8], candidate: &[u8]) -> bool {
        expected.ct_eq(candidate).into()
    }
}

/// What an access token grants, rendered as the canonical signed string.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TokenPayload {
    ElectionCounter(ElectionId),
    LocationCounter(ElectionId, LocationId),
    /// Operating the paper desk of a location.
    Paper(ElectionId, LocationId),
    /// Confirming a resolved voter at a location, valid for one UTC day.
    Validation {
        user_id: UserId,
        location_id: LocationId,
        date: NaiveDate,
    },
}

impl Display for TokenPayload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ElectionCounter(election) => write!(f, "counter {election}"),
            Self::LocationCounter(election, location) => {
                write!(f, "counter {election} {location}")
            }
            Self::Paper(election, location) => write!(f, "paper {election} {location}"),
            Self::Validation {
                user_id,
                location_id,
                date,
            } => write!(f, "{user_id} {location_id} {}", date.format("%Y-%m-%d")),
        }
    }
}

/// Signs and verifies access tokens.
#[derive(Debug, Default, Clone)]
pub struct TokenCodec<C = ConstantTime> {
    comparator: C,
}

impl TokenCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C> TokenCodec<C>
where
    C: Comparator,
{
    pub fn with_comparator(comparator: C) -> Self {
        Self { comparator }
    }

    pub fn comparator(&self) -> &C {
        &self.comparator
    }

    pub fn sign(&self, secret: &[u8], payload: &TokenPayload) -> String {
        let mut hmac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
        hmac.update(payload.to_string().as_bytes());
        let mut token = BASE64URL_NOPAD.encode(&hmac.finalize().into_bytes());
        token.truncate(ACCESS_TOKEN_LENGTH);
        token
    }

    /// Does `candidate` grant `payload` under `secret`?
    ///
    /// Never fails: a missing candidate is compared like any wrong one, so
    /// the comparator runs exactly once per call.
    pub fn verify(&self, secret: &[u8], payload: &TokenPayload, candidate: Option<&str>) -> bool {
        let expected = self.sign(secret, payload);
        self.matches(&expected, candidate.unwrap_or_default())
    }

    /// Compare two secret-derived strings with this codec's comparator.
    pub fn matches(&self, expected: &str, candidate: &str) -> bool {
        self.comparator
            .equal(expected.as_bytes(), candidate.as_bytes())
    }
}

/// The pseudonymous voter identifier the tallying backend sees.
pub fn voter_id(vote_secret: &[u8], user_id: UserId, election_id: ElectionId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{user_id}:{election_id}:").as_bytes());
    hasher.update(vote_secret);
    HEXLOWER.encode(&hasher.finalize())
}

/// A vote token: `"{hmac_hex}/{message}"`, where the message binds the voter,
/// the scoped backend election and the issue time.
pub fn vote_token(
    vote_secret: &[u8],
    user_id: UserId,
    election_id: ElectionId,
    scoped_election_id: u64,
    issued_at: DateTime<Utc>,
) -> String {
    let message = format!(
        "{}:AuthEvent:{scoped_election_id}:vote:{}",
        voter_id(vote_secret, user_id, election_id),
        issued_at.timestamp()
    );
    let mut hmac =
        HmacSha256::new_from_slice(vote_secret).expect("HMAC can take key of any size");
    hmac.update(message.as_bytes());
    format!("{}/{message}", HEXLOWER.encode(&hmac.finalize().into_bytes()))
}
