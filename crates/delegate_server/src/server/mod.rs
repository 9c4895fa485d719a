#![forbid(unsafe_code)]

pub mod broadcast;
pub mod channels;
pub mod connection;
pub mod credentials;
pub mod dispatcher;
pub mod permissions;
pub mod persist;
pub mod session;
pub mod settings;

#[cfg(test)]
mod permissions_tests;
#[cfg(test)]
mod persist_tests;
#[cfg(test)]
mod session_tests;
