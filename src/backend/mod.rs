pub mod client;
pub mod models;
pub mod stream;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{BackendClient, HttpBackendClient};
pub use stream::EventStream;
