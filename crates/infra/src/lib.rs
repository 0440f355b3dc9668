//! Infrastructure layer: config, Postgres, stores, external clients, and the
//! job saga that ties them together.

pub mod config;
pub mod credits;
pub mod db;
pub mod external;
pub mod jobs;
pub mod saga;
