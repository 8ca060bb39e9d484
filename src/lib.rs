// Docflow client - library root

pub mod auth;
pub mod config;
pub mod documents;
pub mod error;
pub mod http_client;
pub mod poller;
pub mod projects;

#[cfg(test)]
mod testing;
