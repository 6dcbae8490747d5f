mod commands;

pub use commands::{BrokerKind, Cli, Commands, LogFormat};
