pub mod app;
pub mod bodies;
pub mod common;
pub mod shutdown;
