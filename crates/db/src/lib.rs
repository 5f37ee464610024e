pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;
pub mod session_store;

pub use connection::{connect, connect_with_settings, DbPool};
pub use fixtures::{DemoCatalog, SeedResult};
pub use session_store::{SessionStore, SessionStoreError};
