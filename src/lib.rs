pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod graph;
pub mod output;

pub use client::MailClient;
pub use config::Settings;
pub use error::{Error, Result};
