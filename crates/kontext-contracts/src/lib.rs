//! Wire-level contracts for the Kontext worker: the job input schema and its
//! validator, the aspect ratio table, the response envelope, and the job
//! event log.

pub mod events;
pub mod geometry;
pub mod job;
pub mod schema;
