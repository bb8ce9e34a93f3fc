use std::sync::Arc;

use aws_sdk_sns::Client as SnsClient;
use chrono::{DateTime, Utc};
use data_encoding::HEXUPPER;
use hmac::Mac;
use phonenumber::PhoneNumber;

use crate::config::Config;
use crate::error::{Error, Result, TransientError};
use crate::model::{election::Election, id::UserId, user::User};
use crate::store::Storage;
use crate::token::{Comparator, HmacSha256, TokenCodec};

/// Bytes of the HMAC that make up a code.
const CODE_BYTES: usize = 4;

/// Delivers text messages.
#[rocket::async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, phone: &str, message: &str) -> Result<()>;
}

/// The sender handle kept in managed state.
pub type SharedSender = Arc<dyn SmsSender>;

/// Sends through Amazon SNS.
pub struct SnsSender {
    client: SnsClient,
}

impl SnsSender {
    pub fn new(client: SnsClient) -> Self {
        Self { client }
    }
}

#[rocket::async_trait]
impl SmsSender for SnsSender {
    async fn send(&self, phone: &str, message: &str) -> Result<()> {
        let number: PhoneNumber = phone
            .parse()
            .map_err(|_| Error::Validation("invalid_phone"))?;
        self.client
            .publish()
            .phone_number(number.to_string())
            .message(message)
            .send()
            .await
            .map_err(|e| TransientError::Sms(e.to_string()))?;
        Ok(())
    }
}

/// The code for a check sent at `sent_at`: the leading bytes of an HMAC over
/// the send time and the user, in upper-case hex.
pub fn sms_code(sms_secret: &[u8], user_id: UserId, sent_at: DateTime<Utc>) -> String {
    let mut hmac = HmacSha256::new_from_slice(sms_secret).expect("HMAC can take key of any size");
    hmac.update(format!("{}{user_id}", sent_at.timestamp()).as_bytes());
    HEXUPPER.encode(&hmac.finalize().into_bytes()[..CODE_BYTES])
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// A code was sent too recently; it stays valid and unchanged.
    RateLimited,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SmsVerification {
    pub valid: bool,
    /// Failures since the last successful verification.
    pub failed_attempts: u32,
}

/// The SMS confirmation step of an election.
pub struct SmsChallenge<'a, C> {
    storage: &'a Storage,
    config: &'a Config,
    codec: &'a TokenCodec<C>,
}

impl<'a, C> SmsChallenge<'a, C>
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

    /// Send a fresh code, unless one went out less than the request interval ago.
    ///
    /// The slot is claimed atomically in storage, so concurrent requests send
    /// at most one code.
    pub async fn send(
        &self,
        sender: &dyn SmsSender,
        user: &User,
        election: &Election,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome> {
        let phone = user
            .phone
            .as_deref()
            .ok_or(Error::Denied("missing_phone"))?;
        let not_before = now - self.config.sms_request_interval();
        if !self.storage.claim_sms_slot(user.id, now, not_before).await? {
            return Ok(SendOutcome::RateLimited);
        }
        let code = sms_code(self.config.sms_secret(), user.id, now);
        let message = format!("{}: your confirmation code is {code}", election.title);
        sender.send(phone, &message).await?;
        Ok(SendOutcome::Sent)
    }

    /// Is `candidate` the user's current, unexpired code? Case-insensitive.
    pub fn check(&self, user: &User, candidate: &str, now: DateTime<Utc>) -> bool {
        let sent_at = user.sms_check.sent_at;
        let expected = sent_at
            .map(|sent_at| sms_code(self.config.sms_secret(), user.id, sent_at))
            .unwrap_or_default();
        let fresh = sent_at.is_some_and(|sent_at| now < sent_at + self.config.sms_valid_interval());
        let matched = self
            .codec
            .matches(&expected, &candidate.trim().to_ascii_uppercase());
        matched && fresh
    }

    /// Check `candidate`, counting a failure in storage if it is wrong and
    /// clearing the count if it is right. A user already past the attempt
    /// limit never verifies, however many codes are re-sent.
    pub async fn verify(
        &self,
        user: &User,
        candidate: &str,
        now: DateTime<Utc>,
    ) -> Result<SmsVerification> {
        let failed_attempts = user.sms_check.failed_attempts;
        let locked = failed_attempts >= self.config.sms_max_attempts();
        if self.check(user, candidate, now) && !locked {
            if failed_attempts > 0 {
                self.storage.clear_sms_failures(user.id).await?;
            }
            return Ok(SmsVerification {
                valid: true,
                failed_attempts: 0,
            });
        }
        let failed_attempts = self.storage.record_sms_failure(user.id).await?;
        Ok(SmsVerification {
            valid: false,
            failed_attempts,
        })
    }
}
