//! Session keys and the encrypted wrapper around any [`Transport`](crate::transport::Transport).

pub mod channel;
pub mod cipher;
pub mod kex;

pub use channel::*;
pub use cipher::SessionSecret;
pub use kex::{execute_key_exchange, load_signing_key, load_verifying_key, write_key_pair};
