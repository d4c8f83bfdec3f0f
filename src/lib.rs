pub mod config;
pub mod engine;
pub mod form;
pub mod hints;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod permission;
pub mod reaper;
pub mod tenant;
pub mod wal;
