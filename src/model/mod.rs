pub mod auth;
pub mod document;
pub mod election;
pub mod id;
pub mod mongodb;
pub mod user;
pub mod vote;
