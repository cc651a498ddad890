pub mod client;
pub mod config;
pub mod database;
pub mod logger;
pub mod manifest;
pub mod portal;
pub mod server;

pub use config::*;
pub use database::*;
pub use logger::*;
pub use server::EdgeApplicationServer;
pub use server::error::{AppResult, Error};
