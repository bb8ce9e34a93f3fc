use chrono::{DateTime, Utc};
use mongodb::bson::{to_bson, Bson};
use serde::{Deserialize, Serialize};

use crate::model::id::{ElectionId, LocationId};

/// How ballots for an election are cast.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingMode {
    /// Online, through the external tallying backend.
    Digital,
    /// In person, registered by a paper authority.
    Paper,
}

/// The geographic or organisational partition an election applies to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    State,
    Region,
    Province,
    Municipality,
    Island,
    Circle,
    /// Voters are drawn from a census list rather than from their address.
    Census,
}

impl Scope {
    /// Reduce a territory code to the precision this scope compares at.
    pub fn territory_code(self, code: &str) -> &str {
        match self {
            Self::Municipality => code.get(..MUNICIPALITY_CODE_LENGTH).unwrap_or(code),
            _ => code,
        }
    }
}

impl From<Scope> for Bson {
    fn from(scope: Scope) -> Self {
        to_bson(&scope).expect("Serialisation is infallible")
    }
}

/// Municipal location codes carry a trailing check digit that voters do not.
const MUNICIPALITY_CODE_LENGTH: usize = 5;

/// An election, as configured by election administration. Read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Election {
    #[serde(rename = "_id")]
    pub id: ElectionId,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub scope: Scope,
    pub mode: VotingMode,
    pub requires_document_check: bool,
    pub requires_sms_check: bool,
    /// Accounts created at or after this instant may not vote.
    #[serde(default)]
    pub user_created_at_max: Option<DateTime<Utc>>,
    /// Election ID as known to the external tallying backend.
    pub backend_election_id: u32,
    /// Secret for the election counter token.
    pub counter_key: String,
    /// Census file name inside the configured census directory.
    #[serde(default)]
    pub census_file: Option<String>,
}

impl Election {
    /// Is voting open at `now`? The window is half-open: `[starts_at, ends_at)`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now && now < self.ends_at
    }

    /// Was the account created early enough to take part?
    pub fn has_valid_user_created_at(&self, created_at: DateTime<Utc>) -> bool {
        match self.user_created_at_max {
            Some(max) => created_at < max,
            None => true,
        }
    }

    /// Does this election draw voters from a census file?
    pub fn uses_census_file(&self) -> bool {
        self.scope == Scope::Census && self.census_file.is_some()
    }
}

/// A subdivision of an election, used for paper voting and per-location counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionLocation {
    #[serde(rename = "_id")]
    pub id: LocationId,
    pub election_id: ElectionId,
    /// Territory code, interpreted according to the election scope.
    pub location: String,
    /// Replaces the numeric part of `location` in the scoped backend ID.
    #[serde(default, rename = "override")]
    pub override_code: Option<String>,
    #[serde(default)]
    pub version: u32,
    /// Secret for this location's counter and paper tokens.
    pub token_key: String,
}

impl ElectionLocation {
    /// The territory code a voter's own code is compared against.
    pub fn vote_location(&self, scope: Scope) -> &str {
        scope.territory_code(&self.location)
    }

    /// The election ID the tallying backend uses for ballots from this location.
    pub fn scoped_election_id(&self, election: &Election) -> u64 {
        let code = self.override_code.as_deref().unwrap_or(&self.location);
        let number = code.parse::<u64>().unwrap_or(0);
        u64::from(election.backend_election_id)
            .saturating_mul(1000)
            .saturating_add(number.saturating_mul(10))
            .saturating_add(u64::from(self.version))
    }
}
