//! Resolving voters from the primary store, optionally restricted by a
//! census file supplied for the election.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use rocket::tokio::{fs::File, io::AsyncReadExt, time::timeout};
use thiserror::Error;

use crate::config::Config;
use crate::error::{Result, TransientError};
use crate::logging;
use crate::model::{
    document::DocumentQuery,
    election::{Election, Scope},
    id::UserId,
    user::User,
};
use crate::store::Storage;

/// Header of the document ID column.
const DOCUMENT_COLUMN: &str = "dni";
/// Header of the user ID column.
const USER_COLUMN: &str = "user_id";

/// Why a census file could not be used.
#[derive(Debug, Error)]
pub enum CensusError {
    #[error("census file name {0:?} is not a plain file name")]
    BadName(String),
    #[error("census file exceeds {0} bytes")]
    TooLarge(u64),
    #[error("census file has neither a `dni` nor a `user_id` column")]
    MissingColumns,
    #[error("census row {0} has a malformed user ID")]
    BadUserId(u64),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("census file read timed out")]
    Timeout,
}

/// The members listed in a census file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CensusFile {
    /// Upper-cased document IDs.
    documents: HashSet<String>,
    user_ids: HashSet<UserId>,
}

impl CensusFile {
    /// Parse a CSV census with a header row. Any structural fault rejects the
    /// whole file.
    pub fn parse<R: Read>(reader: R) -> std::result::Result<Self, CensusError> {
        let mut csv = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = csv.headers()?.clone();
        let column = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
        let document_column = column(DOCUMENT_COLUMN);
        let user_column = column(USER_COLUMN);
        if document_column.is_none() && user_column.is_none() {
            return Err(CensusError::MissingColumns);
        }

        let mut census = Self::default();
        for record in csv.records() {
            let record = record?;
            if let Some(document) = document_column.and_then(|i| record.get(i)) {
                if !document.is_empty() {
                    census.documents.insert(document.to_ascii_uppercase());
                }
            }
            if let Some(user) = user_column.and_then(|i| record.get(i)) {
                if !user.is_empty() {
                    let line = record.position().map_or(0, |p| p.line());
                    let id = user.parse().map_err(|_| CensusError::BadUserId(line))?;
                    census.user_ids.insert(id);
                }
            }
        }
        Ok(census)
    }

    pub fn contains_document(&self, query: &DocumentQuery) -> bool {
        self.documents.contains(query.doc_id.as_str())
    }

    pub fn contains_user(&self, id: UserId) -> bool {
        self.user_ids.contains(&id)
    }

    /// Is this user listed, by account or by document?
    pub fn includes(&self, user: &User) -> bool {
        self.contains_user(user.id)
            || self
                .documents
                .contains(&user.document_id.to_ascii_uppercase())
    }
}

/// Reads census files from the configured directory.
#[derive(Debug, Clone)]
pub struct CensusFiles {
    dir: PathBuf,
    max_bytes: u64,
    timeout: Duration,
}

impl CensusFiles {
    pub fn new(config: &Config) -> Self {
        Self {
            dir: config.census_dir().to_path_buf(),
            max_bytes: config.census_max_bytes(),
            timeout: config.storage_timeout(),
        }
    }

    pub async fn load(&self, name: &str) -> std::result::Result<CensusFile, CensusError> {
        if !is_plain_file_name(name) {
            return Err(CensusError::BadName(name.to_string()));
        }
        let path = self.dir.join(name);
        let bytes = timeout(self.timeout, self.read_bounded(&path))
            .await
            .map_err(|_| CensusError::Timeout)??;
        CensusFile::parse(bytes.as_slice())
    }

    async fn read_bounded(&self, path: &Path) -> std::result::Result<Vec<u8>, CensusError> {
        let file = File::open(path).await?;
        let mut bytes = Vec::new();
        file.take(self.max_bytes + 1).read_to_end(&mut bytes).await?;
        if bytes.len() as u64 > self.max_bytes {
            return Err(CensusError::TooLarge(self.max_bytes));
        }
        Ok(bytes)
    }
}

/// A single normal path component: no separators, no `.` or `..`.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains(['/', '\\', '\0'])
        && !name.contains("..")
        && matches!(
            Path::new(name).components().collect::<Vec<_>>().as_slice(),
            [Component::Normal(_)]
        )
}

/// Voter resolution for an election.
pub struct CensusLookup<'a> {
    storage: &'a Storage,
    files: CensusFiles,
}

impl<'a> CensusLookup<'a> {
    pub fn new(storage: &'a Storage, config: &Config) -> Self {
        Self {
            storage,
            files: CensusFiles::new(config),
        }
    }

    /// Find the active voter holding this document.
    ///
    /// For census-file elections the document must also be listed in the
    /// file. An unusable file matches nobody.
    pub async fn find(&self, election: &Election, query: &DocumentQuery) -> Result<Option<User>> {
        if let Some(census) = self.census_for(election).await? {
            if !census.is_some_and(|census| census.contains_document(query)) {
                return Ok(None);
            }
        }
        let user = self
            .storage
            .user_by_document(query.doc_type, &query.doc_id)
            .await?;
        Ok(user.filter(User::is_active_voter))
    }

    /// Find an active voter by account, subject to the census file if any.
    pub async fn find_by_user_id(&self, election: &Election, id: UserId) -> Result<Option<User>> {
        if let Some(census) = self.census_for(election).await? {
            if !census.is_some_and(|census| census.contains_user(id)) {
                return Ok(None);
            }
        }
        let user = self.storage.user(id).await?;
        Ok(user.filter(User::is_active_voter))
    }

    /// Does a census-scoped election count this user among its voters?
    ///
    /// A census election without a file draws on every account.
    pub async fn is_member(&self, election: &Election, user: &User) -> Result<bool> {
        if election.scope != Scope::Census {
            return Ok(false);
        }
        Ok(match self.census_for(election).await? {
            None => true,
            Some(census) => census.is_some_and(|census| census.includes(user)),
        })
    }

    /// The election's census file: `None` if it has none, `Some(None)` if it
    /// has one that cannot be used. I/O failures are transient errors.
    async fn census_for(&self, election: &Election) -> Result<Option<Option<CensusFile>>> {
        if !election.uses_census_file() {
            return Ok(None);
        }
        let Some(name) = election.census_file.as_deref() else {
            return Ok(None);
        };
        match self.files.load(name).await {
            Ok(census) => Ok(Some(Some(census))),
            Err(CensusError::Io(err)) => Err(err.into()),
            Err(CensusError::Timeout) => {
                Err(TransientError::Timeout(self.files.timeout.as_millis()).into())
            }
            Err(err) => {
                logging::census_failure(name, &err);
                Ok(Some(None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::model::document::DocumentType;
    use crate::store::MemoryStore;

    fn census_dir(files: &[(&str, &str)]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            let mut file = std::fs::File::create(dir.path().join(name)).unwrap();
            file.write_all(content.as_bytes()).unwrap();
        }
        dir
    }

    fn census_election(file: &str) -> Election {
        Election {
            scope: Scope::Census,
            census_file: Some(file.to_string()),
            ..Election::example()
        }
    }

    fn storage(store: &MemoryStore) -> Storage {
        Storage::new(Arc::new(store.clone()), std::time::Duration::from_secs(1))
    }

    fn query(doc_id: &str) -> DocumentQuery {
        DocumentQuery::parse("1", doc_id).unwrap()
    }

    #[test]
    fn parses_documents_case_insensitively() {
        let census = CensusFile::parse("DNI,user_id\n12345678a,7\n87654321B,\n".as_bytes()).unwrap();
        assert!(census.contains_document(&query("12345678A")));
        assert!(census.contains_document(&query("87654321b")));
        assert!(census.contains_user(7));
        assert!(!census.contains_user(8));
    }

    #[test]
    fn structurally_invalid_files_are_rejected() {
        for content in [
            "name,town\nAda,28079\n",
            "dni,user_id\n12345678A,7\n87654321B\n",
            "dni,user_id\n12345678A,seven\n",
            "dni,user_id\n12345678A,-7\n",
        ] {
            assert!(CensusFile::parse(content.as_bytes()).is_err(), "{content:?}");
        }
    }

    #[test]
    fn only_plain_file_names() {
        assert!(is_plain_file_name("census-2025.csv"));
        for name in [
            "",
            ".",
            "..",
            "../../../etc/passwd",
            "dir/census.csv",
            "/etc/passwd",
            "..\\census.csv",
            "census..csv",
        ] {
            assert!(!is_plain_file_name(name), "{name:?}");
        }
    }

    #[rocket::async_test]
    async fn resolves_through_file_then_store() {
        let dir = census_dir(&[("census.csv", "dni\n12345678A\n")]);
        let config = Config::example().with_census_dir(dir.path());
        let store = MemoryStore::default();
        store.insert_user(User::example());
        let storage = storage(&store);
        let lookup = CensusLookup::new(&storage, &config);
        let election = census_election("census.csv");

        let found = lookup.find(&election, &query("12345678a")).await.unwrap();
        assert_eq!(found.map(|u| u.id), Some(User::example().id));
        // Listed in the store but not in the file.
        store.insert_user(User {
            id: 8,
            document_id: "11111111H".to_string(),
            ..User::example()
        });
        assert!(lookup.find(&election, &query("11111111H")).await.unwrap().is_none());
    }

    #[rocket::async_test]
    async fn malformed_file_matches_nobody() {
        let dir = census_dir(&[("census.csv", "nonsense\n\"unterminated\n")]);
        let config = Config::example().with_census_dir(dir.path());
        let store = MemoryStore::default();
        store.insert_user(User::example());
        let storage = storage(&store);
        let lookup = CensusLookup::new(&storage, &config);
        let election = census_election("census.csv");

        assert!(lookup.find(&election, &query("12345678A")).await.unwrap().is_none());
        assert!(lookup.find_by_user_id(&election, 7).await.unwrap().is_none());
        assert!(!lookup.is_member(&election, &User::example()).await.unwrap());
        assert_eq!(store.calls(), 0);
    }

    #[rocket::async_test]
    async fn traversal_names_match_nobody() {
        let dir = census_dir(&[]);
        let config = Config::example().with_census_dir(dir.path());
        let store = MemoryStore::default();
        let storage = storage(&store);
        let lookup = CensusLookup::new(&storage, &config);
        let election = census_election("../../../etc/passwd");

        assert!(lookup.find(&election, &query("12345678A")).await.unwrap().is_none());
        assert_eq!(store.calls(), 0);
    }

    #[rocket::async_test]
    async fn oversized_file_matches_nobody() {
        let big = format!("dni\n{}", "12345678A\n".repeat(1000));
        let dir = census_dir(&[("census.csv", &big)]);
        let config = Config::example().with_census_dir(dir.path());
        let store = MemoryStore::default();
        let storage = storage(&store);
        let lookup = CensusLookup::new(&storage, &config);

        let election = census_election("census.csv");
        assert!(lookup.find(&election, &query("12345678A")).await.unwrap().is_none());
    }

    #[rocket::async_test]
    async fn missing_file_is_transient() {
        let dir = census_dir(&[]);
        let config = Config::example().with_census_dir(dir.path());
        let store = MemoryStore::default();
        let storage = storage(&store);
        let lookup = CensusLookup::new(&storage, &config);

        let result = lookup.find(&census_election("absent.csv"), &query("12345678A")).await;
        assert!(matches!(result, Err(crate::error::Error::Transient(_))));
    }

    #[rocket::async_test]
    async fn inactive_accounts_are_not_voters() {
        let store = MemoryStore::default();
        store.insert_user(User {
            banned: true,
            ..User::example()
        });
        let storage = storage(&store);
        let config = Config::example();
        let lookup = CensusLookup::new(&storage, &config);

        let election = Election::example();
        let query = DocumentQuery {
            doc_type: DocumentType::Dni,
            ..query("12345678A")
        };
        assert!(lookup.find(&election, &query).await.unwrap().is_none());
    }

    #[rocket::async_test]
    async fn census_without_file_admits_everyone() {
        let store = MemoryStore::default();
        let storage = storage(&store);
        let config = Config::example();
        let lookup = CensusLookup::new(&storage, &config);

        let election = Election {
            scope: Scope::Census,
            ..Election::example()
        };
        assert!(lookup.is_member(&election, &User::example()).await.unwrap());
        assert!(!lookup.is_member(&Election::example(), &User::example()).await.unwrap());
    }
}
