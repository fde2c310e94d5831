pub mod config;

pub use config::{Command, Config, DatasetArgs};
