//! Domain models shared by every stage of the dispatch pipeline.

pub mod instance;
pub mod registry;
