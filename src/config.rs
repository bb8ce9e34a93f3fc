use std::path::{Path, PathBuf};
use std::sync::Arc;

use aws_config::{BehaviorVersion, SdkConfig};
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_sns::{
    config::{Credentials, Region},
    Client as SnsClient,
};
use chrono::Duration;
use log::{error, info};
use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::Deserialize;

use crate::model::mongodb::ensure_indexes_exist;
use crate::sms::{SharedSender, SnsSender};
use crate::store::{MongoStore, SharedStore};

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // non-secrets
    #[serde(default = "defaults::sms_request_interval")]
    sms_request_interval: u32,
    #[serde(default = "defaults::sms_valid_interval")]
    sms_valid_interval: u32,
    #[serde(default = "defaults::sms_max_attempts")]
    sms_max_attempts: u32,
    #[serde(default = "defaults::storage_timeout_ms")]
    storage_timeout_ms: u64,
    census_dir: PathBuf,
    #[serde(default = "defaults::census_max_bytes")]
    census_max_bytes: u64,
    // secrets
    jwt_secret: String,
    vote_secret: String,
    sms_secret: String,
}

mod defaults {
    pub fn sms_request_interval() -> u32 {
        60
    }

    pub fn sms_valid_interval() -> u32 {
        600
    }

    pub fn sms_max_attempts() -> u32 {
        5
    }

    pub fn storage_timeout_ms() -> u64 {
        2000
    }

    pub fn census_max_bytes() -> u64 {
        16 * 1024 * 1024
    }
}

impl Config {
    /// Minimum time between two SMS codes for the same user.
    pub fn sms_request_interval(&self) -> Duration {
        Duration::seconds(self.sms_request_interval.into())
    }

    /// How long an SMS code stays verifiable after it was sent.
    pub fn sms_valid_interval(&self) -> Duration {
        Duration::seconds(self.sms_valid_interval.into())
    }

    /// Failed SMS verifications tolerated before the check is locked.
    pub fn sms_max_attempts(&self) -> u32 {
        self.sms_max_attempts
    }

    /// Upper bound on every storage and census file operation.
    pub fn storage_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.storage_timeout_ms)
    }

    /// Directory census files are read from. Election census file names are
    /// resolved inside it and may not escape it.
    pub fn census_dir(&self) -> &Path {
        &self.census_dir
    }

    pub fn census_max_bytes(&self) -> u64 {
        self.census_max_bytes
    }

    /// Secret key used to verify session JWTs.
    pub fn jwt_secret(&self) -> &[u8] {
        self.jwt_secret.as_bytes()
    }

    /// Secret key shared with the tallying backend, used to sign vote tokens.
    pub fn vote_secret(&self) -> &[u8] {
        self.vote_secret.as_bytes()
    }

    /// Secret key SMS codes are derived from.
    pub fn sms_secret(&self) -> &[u8] {
        self.sms_secret.as_bytes()
    }
}

/// A fairing that loads the application config and puts it in managed state.
/// This could easily be achieved using `AdHoc::config`, but is written out
/// explicitly for symmetry with the other fairings and control over error
/// messages.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        Ok(rocket.manage(config))
    }
}

/// Configuration for the database.
#[derive(Deserialize)]
struct DbConfig {
    // secrets
    db_uri: String,
    // non-secrets
    #[serde(default = "default_db_name")]
    db_name: String,
}

fn default_db_name() -> String {
    "voting".to_string()
}

/// A fairing that loads the MongoDB config, connects to the database,
/// ensures the unique indexes exist, and places the vote store into managed
/// state.
pub struct DatabaseFairing;

#[rocket::async_trait]
impl Fairing for DatabaseFairing {
    fn info(&self) -> Info {
        Info {
            name: "MongoDB",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.figment().extract::<DbConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load database config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        info!("Loaded database config, connecting...");
        let client = match MongoClient::with_uri_str(config.db_uri).await {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to connect to database: {e}");
                return Err(rocket);
            }
        };
        let db = client.database(&config.db_name);

        // The at-most-one-vote guarantee rests on these.
        if let Err(e) = ensure_indexes_exist(&db).await {
            error!("Failed to create database indexes: {e}");
            return Err(rocket);
        }
        info!("...database connection online!");

        let store: SharedStore = Arc::new(MongoStore::new(&db));
        Ok(rocket.manage(store))
    }
}

/// Configuration for the AWS connection.
#[derive(Deserialize)]
struct AwsConfig {
    // non-secrets
    aws_region: String,
    aws_access_key_id: String,
    // secrets
    aws_secret_access_key: String,
}

/// A fairing that loads the AWS config and places an SNS-backed SMS sender
/// into managed state.
pub struct AwsFairing;

#[rocket::async_trait]
impl Fairing for AwsFairing {
    fn info(&self) -> Info {
        Info {
            name: "AWS SNS",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.figment().extract::<AwsConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load AWS config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        let aws_config = SdkConfig::builder()
            .region(Region::new(config.aws_region))
            .credentials_provider(SharedCredentialsProvider::new(Credentials::new(
                config.aws_access_key_id,
                config.aws_secret_access_key,
                None,
                None,
                "rocket config",
            )))
            .behavior_version(BehaviorVersion::latest())
            .build();
        let sender: SharedSender = Arc::new(SnsSender::new(SnsClient::new(&aws_config)));
        info!("Loaded Amazon SNS config");

        Ok(rocket.manage(sender))
    }
}

/// Example data for tests.
#[cfg(test)]
pub(crate) mod examples {
    use super::*;

    impl Config {
        pub fn example() -> Self {
            Self {
                sms_request_interval: defaults::sms_request_interval(),
                sms_valid_interval: defaults::sms_valid_interval(),
                sms_max_attempts: defaults::sms_max_attempts(),
                storage_timeout_ms: 200,
                census_dir: std::env::temp_dir(),
                census_max_bytes: 4096,
                jwt_secret: "test-jwt-secret".to_string(),
                vote_secret: "test-vote-secret".to_string(),
                sms_secret: "test-sms-secret".to_string(),
            }
        }

        pub fn with_census_dir(mut self, dir: &Path) -> Self {
            self.census_dir = dir.to_path_buf();
            self
        }

        pub fn with_jwt_secret(mut self, secret: &str) -> Self {
            self.jwt_secret = secret.to_string();
            self
        }
    }
}
