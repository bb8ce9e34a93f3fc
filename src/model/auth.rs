use chrono::{serde::ts_seconds, DateTime, Utc};
use jsonwebtoken::{errors::Error as JwtError, DecodingKey, TokenData, Validation};
use rocket::{
    http::{Cookie, Status},
    request::{FromRequest, Outcome},
    Request, State,
};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{id::UserId, user::User};
use crate::store::Storage;

pub const AUTH_TOKEN_COOKIE: &str = "auth_token";

/// The session token issued by the account service, identifying the caller.
///
/// Decoding it touches no storage, so request parameters can be validated
/// before the caller's account is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub id: UserId,
}

/// Cookie claims: the token itself plus an expiry datetime.
#[derive(Serialize, Deserialize)]
struct Claims {
    #[serde(flatten)]
    token: AuthToken,
    #[serde(rename = "exp", with = "ts_seconds")]
    expire_at: DateTime<Utc>,
}

impl AuthToken {
    /// Deserialize a token from a cookie.
    pub fn from_cookie(cookie: &Cookie<'_>, config: &Config) -> std::result::Result<Self, JwtError> {
        jsonwebtoken::decode(
            cookie.value(),
            &DecodingKey::from_secret(config.jwt_secret()),
            &Validation::default(),
        )
        .map(|claims: TokenData<Claims>| claims.claims.token)
    }

    /// Load the account behind this token.
    pub async fn caller(self, storage: &Storage) -> Result<User> {
        storage
            .user(self.id)
            .await?
            .ok_or(Error::Authorization("unknown_caller"))
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthToken {
    type Error = Error;

    /// Decode the session cookie. A missing or invalid cookie fails with 401.
    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        // Unwrap is safe as `Config` is always managed.
        let config = req.guard::<&State<Config>>().await.unwrap();

        let Some(cookie) = req.cookies().get(AUTH_TOKEN_COOKIE) else {
            return Outcome::Failure((Status::Unauthorized, Error::Authorization("missing_session")));
        };

        match Self::from_cookie(cookie, config) {
            Ok(token) => Outcome::Success(token),
            Err(_) => Outcome::Failure((Status::Unauthorized, Error::Authorization("invalid_session"))),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_round_trip() {
        let config = Config::example();
        let cookie = AuthToken::cookie_for(7, &config);
        assert_eq!(AuthToken::from_cookie(&cookie, &config).unwrap(), AuthToken { id: 7 });
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let config = Config::example();
        let cookie = AuthToken::cookie_for(7, &config);
        let other = Config::example().with_jwt_secret("someone else");
        assert!(AuthToken::from_cookie(&cookie, &other).is_err());
        assert!(AuthToken::from_cookie(&Cookie::new(AUTH_TOKEN_COOKIE, "garbage"), &config).is_err());
    }
}
