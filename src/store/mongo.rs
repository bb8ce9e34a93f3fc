use chrono::{DateTime, Utc};
use mongodb::{
    bson::{doc, to_document, Document},
    options::{FindOneAndUpdateOptions, ReturnDocument},
    Database,
};
use rocket::futures::TryStreamExt;

use crate::error::Result;
use crate::model::{
    document::{DocumentId, DocumentType},
    election::{Election, ElectionLocation},
    id::{ElectionId, LocationId, UserId},
    mongodb::{is_duplicate_key_error, Coll},
    user::User,
    vote::{Vote, VoteCount, VoteStatus},
};

use super::{VoteSlot, VoteStore};

/// The production store, over the typed MongoDB collections.
#[derive(Clone)]
pub struct MongoStore {
    elections: Coll<Election>,
    locations: Coll<ElectionLocation>,
    users: Coll<User>,
    votes: Coll<Vote>,
}

impl MongoStore {
    pub fn new(db: &Database) -> Self {
        Self {
            elections: Coll::from_db(db),
            locations: Coll::from_db(db),
            users: Coll::from_db(db),
            votes: Coll::from_db(db),
        }
    }
}

fn vote_key(user_id: UserId, election_id: ElectionId) -> Document {
    doc! {
        "user_id": user_id,
        "election_id": election_id,
    }
}

#[rocket::async_trait]
impl VoteStore for MongoStore {
    async fn election(&self, id: ElectionId) -> Result<Option<Election>> {
        Ok(self.elections.find_one(doc! {"_id": id}, None).await?)
    }

    async fn location(
        &self,
        election_id: ElectionId,
        location_id: LocationId,
    ) -> Result<Option<ElectionLocation>> {
        let filter = doc! {
            "_id": location_id,
            "election_id": election_id,
        };
        Ok(self.locations.find_one(filter, None).await?)
    }

    async fn locations(&self, election_id: ElectionId) -> Result<Vec<ElectionLocation>> {
        let locations = self
            .locations
            .find(doc! {"election_id": election_id}, None)
            .await?
            .try_collect()
            .await?;
        Ok(locations)
    }

    async fn user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.users.find_one(doc! {"_id": id}, None).await?)
    }

    async fn user_by_document(
        &self,
        doc_type: DocumentType,
        doc_id: &DocumentId,
    ) -> Result<Option<User>> {
        // Document IDs are stored upper-cased, as `DocumentId` normalises them.
        let filter = doc! {
            "document_type": i32::from(doc_type.code()),
            "document_id": doc_id.as_str(),
        };
        Ok(self.users.find_one(filter, None).await?)
    }

    async fn vote(&self, user_id: UserId, election_id: ElectionId) -> Result<Option<Vote>> {
        Ok(self
            .votes
            .find_one(vote_key(user_id, election_id), None)
            .await?)
    }

    async fn create_or_fetch_vote(&self, vote: Vote) -> Result<VoteSlot> {
        let filter = vote_key(vote.user_id, vote.election_id);
        let insert = doc! {
            "$setOnInsert": to_document(&vote)?,
        };
        // Returning the pre-image tells us whether we inserted.
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::Before)
            .build();

        match self.votes.find_one_and_update(filter, insert, options).await {
            Ok(None) => Ok(VoteSlot::Created(vote)),
            Ok(Some(existing)) => Ok(VoteSlot::Existing(existing)),
            Err(err) if is_duplicate_key_error(&err) => Ok(VoteSlot::RaceLost),
            Err(err) => Err(err.into()),
        }
    }

    async fn count_cast_votes(&self, count: VoteCount) -> Result<u64> {
        let filter = match count {
            VoteCount::Election(election_id) => doc! {
                "election_id": election_id,
                "status": VoteStatus::Cast,
            },
            VoteCount::Location(election_id, location_id) => doc! {
                "election_id": election_id,
                "election_location_id": location_id,
                "status": VoteStatus::Cast,
            },
            VoteCount::Authority(election_id, authority_id) => doc! {
                "election_id": election_id,
                "paper_authority_id": authority_id,
                "status": VoteStatus::Cast,
            },
        };
        Ok(self.votes.count_documents(filter, None).await?)
    }

    async fn claim_sms_slot(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
        not_before: DateTime<Utc>,
    ) -> Result<bool> {
        // `sent_at` is stored as Unix seconds.
        let filter = doc! {
            "_id": user_id,
            "$or": [
                {"sms_check.sent_at": null},
                {"sms_check.sent_at": {"$lte": not_before.timestamp()}},
            ],
        };
        let update = doc! {
            "$set": {"sms_check.sent_at": now.timestamp()},
        };
        let result = self.users.update_one(filter, update, None).await?;
        Ok(result.matched_count == 1)
    }

    async fn record_sms_failure(&self, user_id: UserId) -> Result<u32> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let user = self
            .users
            .find_one_and_update(
                doc! {"_id": user_id},
                doc! {"$inc": {"sms_check.failed_attempts": 1}},
                options,
            )
            .await?;
        Ok(user.map_or(0, |user| user.sms_check.failed_attempts))
    }

    async fn clear_sms_failures(&self, user_id: UserId) -> Result<()> {
        self.users
            .update_one(
                doc! {"_id": user_id},
                doc! {"$set": {"sms_check.failed_attempts": 0}},
                None,
            )
            .await?;
        Ok(())
    }
}
