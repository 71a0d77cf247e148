pub mod config;
pub mod memory;
pub mod scheduler;
pub mod task_parser;
