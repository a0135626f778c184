pub mod cli;
pub mod driver;
pub mod tracing_init;
