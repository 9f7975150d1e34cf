pub mod advisory_lock;
pub mod connection;
pub mod migrate;
