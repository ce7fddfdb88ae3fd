pub mod calendar;
pub mod config;
pub mod console;
pub mod engine;
pub mod feedback;
pub mod limits;
pub mod model;
pub mod observability;
pub mod storage;
pub mod sync;
