// Library interface for reader modules
// This allows tests and the binary to import modules

pub mod breaking;
pub mod cache;
pub mod gate;
pub mod ingestion;
pub mod llm;
pub mod model;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod ticker;
pub mod views;
pub mod worker;
