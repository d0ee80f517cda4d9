pub mod admission;
pub mod clock;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod policy;
pub mod relay;
pub mod service;
pub mod wal;
