pub mod cli;
pub mod config;
pub mod proxy;
pub mod ssh;

pub use cli::Cli;
pub use config::Config;
pub use proxy::Dispatcher;
