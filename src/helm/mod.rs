//! Release client for direct-release mode.

mod client;
mod types;

pub use client::HelmClient;
pub use types::{ReleaseApi, ReleaseError};

#[cfg(test)]
pub use types::MockReleaseApi;
