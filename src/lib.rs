#[macro_use]
extern crate rocket;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use rocket::{Build, Rocket};

use crate::config::{AwsFairing, ConfigFairing, DatabaseFairing};
use crate::logging::LoggerFairing;
use crate::token::TokenCodec;

pub mod api;
pub mod census;
pub mod config;
pub mod counter;
pub mod eligibility;
pub mod error;
pub mod logging;
pub mod model;
pub mod paper;
pub mod sms;
pub mod store;
pub mod token;
pub mod vote_token;

/// Build the server: configuration, database, SMS sender and routes.
pub fn build() -> Rocket<Build> {
    rocket::build()
        .attach(ConfigFairing)
        .attach(DatabaseFairing)
        .attach(AwsFairing)
        .attach(LoggerFairing)
        .manage(TokenCodec::new())
        .mount("/", api::routes())
}

/// A server over in-memory collaborators.
#[cfg(test)]
pub(crate) fn test_rocket(
    store: store::MemoryStore,
    sender: sms::testing::RecordingSender,
) -> Rocket<Build> {
    use std::sync::Arc;

    let store: store::SharedStore = Arc::new(store);
    let sender: sms::SharedSender = Arc::new(sender);
    rocket::build()
        .attach(LoggerFairing)
        .manage(config::Config::example())
        .manage(store)
        .manage(sender)
        .manage(TokenCodec::new())
        .mount("/", api::routes())
}
