pub mod codec;
pub mod config;
pub mod convert;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod negotiate;
pub mod orchestrator;
pub mod signaling;
pub mod telemetry;
pub mod writer;
