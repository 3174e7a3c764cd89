pub mod compactor;
pub mod config;
pub mod counter;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod wal;
pub mod wire;
