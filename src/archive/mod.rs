pub mod cold_store;
pub mod worker;

pub use cold_store::{ColdStore, SqliteColdStore};
pub use worker::{ArchivalHandle, ArchivalWorker, ArchiveReport};
