//! Shared infrastructure for the `saltline` transport: libsodium wrappers, identity
//! keys, wrap tolerant time and sequence arithmetic, rate limiting and logging.

pub mod crypto;
pub mod encoding;
pub mod identity;
pub mod logging;
pub mod rate;
pub mod seq;
pub mod time;
