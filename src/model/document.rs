use std::fmt::{Display, Formatter};
use std::sync::OnceLock;

use regex::Regex;
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::error::{Error, Result};

/// Identity document kinds, with the numeric codes used on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum DocumentType {
    Dni = 1,
    Nie = 2,
    Passport = 3,
}

impl DocumentType {
    /// Parse the raw `document_type` parameter: 1-3 digits naming a known type.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw_pattern = pattern(&RAW_TYPE, r"^[0-9]{1,3}$");
        if !raw_pattern.is_match(raw) {
            return Err(Error::Validation("invalid_document_type"));
        }
        match raw.parse::<u16>() {
            Ok(1) => Ok(Self::Dni),
            Ok(2) => Ok(Self::Nie),
            Ok(3) => Ok(Self::Passport),
            _ => Err(Error::Validation("invalid_document_type")),
        }
    }

    /// The format a normalised document ID of this type must match.
    fn id_pattern(self) -> &'static Regex {
        match self {
            Self::Dni => pattern(&DNI, r"^[0-9]{8}[A-Z]$"),
            Self::Nie => pattern(&NIE, r"^[XYZ][0-9]{7}[A-Z]$"),
            Self::Passport => pattern(&PASSPORT, r"^[A-Z0-9]{5,20}$"),
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl Display for DocumentType {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "{}",
            match self {
                Self::Dni => "DNI",
                Self::Nie => "NIE",
                Self::Passport => "Passport",
            }
        )
    }
}

static RAW_TYPE: OnceLock<Regex> = OnceLock::new();
static DNI: OnceLock<Regex> = OnceLock::new();
static NIE: OnceLock<Regex> = OnceLock::new();
static PASSPORT: OnceLock<Regex> = OnceLock::new();

fn pattern(cell: &'static OnceLock<Regex>, source: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(source).expect("document patterns are valid regexes"))
}

/// A document ID that has been normalised and checked against its type's format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId(String);

impl DocumentId {
    /// Trim and upper-case `raw`, then require it to match `doc_type`'s format.
    pub fn parse(doc_type: DocumentType, raw: &str) -> Result<Self> {
        let normalised = raw.trim().to_ascii_uppercase();
        if doc_type.id_pattern().is_match(&normalised) {
            Ok(Self(normalised))
        } else {
            Err(Error::Validation("invalid_document_format"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DocumentId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// A validated document type/ID pair identifying a voter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentQuery {
    pub doc_type: DocumentType,
    pub doc_id: DocumentId,
}

impl DocumentQuery {
    pub fn parse(raw_type: &str, raw_id: &str) -> Result<Self> {
        let doc_type = DocumentType::parse(raw_type)?;
        let doc_id = DocumentId::parse(doc_type, raw_id)?;
        Ok(Self { doc_type, doc_id })
    }
}
