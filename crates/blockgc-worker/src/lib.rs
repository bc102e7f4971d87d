pub mod config;
pub mod worker;

pub use config::WorkerConfig;
pub use worker::{BlockDeletionWorker, ContainerHealth, ContainerPass, PassReport};
