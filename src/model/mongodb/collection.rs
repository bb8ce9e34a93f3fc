use std::ops::Deref;

use log::debug;
use mongodb::{
    bson::doc, error::Error as DbError, options::IndexOptions, Collection, Database, IndexModel,
};

use crate::model::{
    election::{Election, ElectionLocation},
    user::User,
    vote::Vote,
};

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `Derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MongoCollection for Election {
    const NAME: &'static str = "elections";
}

impl MongoCollection for ElectionLocation {
    const NAME: &'static str = "election_locations";
}

impl MongoCollection for User {
    const NAME: &'static str = "users";
}

impl MongoCollection for Vote {
    const NAME: &'static str = "votes";
}

/// Ensure that all the required indexes exist on the given database.
///
/// This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    let unique = IndexOptions::builder().unique(true).build();

    // At most one vote per user and election, whatever the channel.
    let vote_index = IndexModel::builder()
        .keys(doc! {"user_id": 1, "election_id": 1})
        .options(unique.clone())
        .build();
    Coll::<Vote>::from_db(db)
        .create_index(vote_index, None)
        .await?;

    // Counting by location and by paper authority.
    let location_index = IndexModel::builder()
        .keys(doc! {"election_id": 1, "election_location_id": 1, "status": 1})
        .build();
    Coll::<Vote>::from_db(db)
        .create_index(location_index, None)
        .await?;
    let authority_index = IndexModel::builder()
        .keys(doc! {"election_id": 1, "paper_authority_id": 1})
        .build();
    Coll::<Vote>::from_db(db)
        .create_index(authority_index, None)
        .await?;

    // Locations are looked up within their election.
    let election_location_index = IndexModel::builder()
        .keys(doc! {"election_id": 1, "_id": 1})
        .options(unique.clone())
        .build();
    Coll::<ElectionLocation>::from_db(db)
        .create_index(election_location_index, None)
        .await?;

    // Document lookups for paper voting.
    let document_index = IndexModel::builder()
        .keys(doc! {"document_type": 1, "document_id": 1})
        .build();
    Coll::<User>::from_db(db)
        .create_index(document_index, None)
        .await?;

    Ok(())
}
