#![allow(clippy::too_many_arguments)]
#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod cirrus_env;
pub mod client;
pub mod environment;
pub mod errors;
pub mod executor;
pub mod heartbeat;
pub mod http_cache;
pub mod logs;
pub mod network;
pub mod process;
pub mod retry;
pub mod vault_unboxer;

#[cfg(test)]
pub(crate) mod testing;
