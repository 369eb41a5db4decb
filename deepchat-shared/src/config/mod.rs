pub mod server;

pub use server::{Config, ConfigError, LogFormat, Profile};
