#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod queue;
pub mod repository;
pub mod server;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working surface at the crate root for convenience
pub use config::Config;
pub use queue::{Item, PersistentQueue};
pub use repository::Repository;
pub use server::Server;
