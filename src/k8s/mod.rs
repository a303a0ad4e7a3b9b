//! Kubernetes access: the client wrapper, the optimistic-retry helper and
//! the projection of chart-repository credentials into the CD controller's
//! configuration surface.

pub mod client;
pub mod creds;
pub mod retry;

pub use client::K8sClient;
pub use creds::{ChartRepoAddRequest, ChartRepoUpdateRequest, RepositoryCreds};
pub use retry::with_conflict_retry;
