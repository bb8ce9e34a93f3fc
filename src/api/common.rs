use rocket::serde::json::json;

use crate::error::{Error, Result};
use crate::logging::{self, RequestMeta};
use crate::model::{auth::AuthToken, id::PositiveId, user::User};
use crate::store::Storage;

/// Longest stretch of a rejected parameter copied into the security log.
const ATTEMPT_LOG_LENGTH: usize = 64;

/// Parse a raw query identifier, denying with `reason` if it is not a
/// positive integer. Nothing is looked up on failure.
pub fn parse_id(meta: &RequestMeta, raw: Option<&str>, reason: &'static str) -> Result<u32> {
    PositiveId::parse(raw.unwrap_or_default())
        .map(PositiveId::get)
        .map_err(|err| {
            rejected(meta, reason, raw, &err.to_string());
            Error::Validation(reason)
        })
}

/// Log a parameter that failed validation.
pub fn rejected(meta: &RequestMeta, reason: &'static str, raw: Option<&str>, detail: &str) {
    let attempted = raw.map(|raw| raw.chars().take(ATTEMPT_LOG_LENGTH).collect::<String>());
    logging::security(meta, reason, json!({ "attempted": attempted, "detail": detail }));
}

/// Load the account behind the session cookie.
pub async fn caller(token: AuthToken, storage: &Storage, meta: &RequestMeta) -> Result<User> {
    token.caller(storage).await.map_err(|err| {
        match err {
            Error::Transient(_) => logging::failure(Some(meta), "caller_lookup", &err),
            _ => logging::security(meta, err.reason(), json!({ "user_id": token.id })),
        }
        err
    })
}

/// Log a failed collaborator call before handing the error on.
pub fn failed(meta: &RequestMeta, name: &str, err: Error) -> Error {
    logging::failure(Some(meta), name, &err);
    err
}
