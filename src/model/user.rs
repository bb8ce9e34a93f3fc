use std::collections::HashSet;

use chrono::{serde::ts_seconds_option, DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    document::DocumentType,
    election::Scope,
    id::UserId,
};

/// Named privileges a user may hold.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Admin,
    PaperAuthority,
    FinanceAdmin,
    ImpulsaAdmin,
    Verifier,
}

/// Where the user is registered to vote. Codes follow the election scopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CensusLocation {
    pub region: Option<String>,
    pub province: Option<String>,
    pub town: Option<String>,
    pub island: Option<String>,
    pub circle: Option<String>,
}

/// The user's SMS confirmation state, shared by every election.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsCheckState {
    /// When the current code was issued; the code is derived from it.
    #[serde(default, with = "ts_seconds_option")]
    pub sent_at: Option<DateTime<Utc>>,
    /// Failed verifications since the last successful one.
    #[serde(default)]
    pub failed_attempts: u32,
}

/// The parts of a user account the voting core reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub full_name: String,
    pub document_type: DocumentType,
    /// Stored upper-cased.
    pub document_id: String,
    pub created_at: DateTime<Utc>,
    pub confirmed: bool,
    #[serde(default)]
    pub banned: bool,
    /// Identity verified, or verification pending review.
    #[serde(default)]
    pub document_verified: bool,
    #[serde(default)]
    pub location: CensusLocation,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub sms_check: SmsCheckState,
    #[serde(default)]
    pub capabilities: HashSet<Capability>,
}

impl User {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// May this user register in-person ballots?
    pub fn is_paper_authority(&self) -> bool {
        self.has_capability(Capability::Admin) || self.has_capability(Capability::PaperAuthority)
    }

    /// Can this account be resolved as an in-person voter at all?
    pub fn is_active_voter(&self) -> bool {
        self.confirmed && !self.banned
    }

    /// The user's territory code for the given scope, if any.
    pub fn location_code(&self, scope: Scope) -> Option<&str> {
        let location = &self.location;
        match scope {
            Scope::State | Scope::Census => None,
            Scope::Region => location.region.as_deref(),
            Scope::Province => location.province.as_deref(),
            Scope::Municipality => location.town.as_deref(),
            Scope::Island => location.island.as_deref(),
            Scope::Circle => location.circle.as_deref(),
        }
    }
}
