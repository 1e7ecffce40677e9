//! Podspawn library
//!
//! Hands an incoming sshd session off to a per-user container. sshd's
//! `AuthorizedKeysCommand` runs [`authkeys`] to rewrite stored public keys so
//! every login is forced through `podspawn spawn`, and the `ForceCommand` side
//! runs a [`session::Session`] against a [`runtime::Runtime`].

pub mod authkeys;
pub mod config;
pub mod identity;
pub mod runtime;
pub mod session;
