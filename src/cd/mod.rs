//! Typed client for the CD controller gRPC surface.

pub mod proto {
    tonic::include_proto!("cdcontroller");
}

mod client;
mod types;

pub use client::CdClient;
pub use types::{
    AppObserved, AppSpecRequest, CdError, ControllerApi, HealthStatus, RefreshType, ResourceRef,
};

#[cfg(test)]
pub use types::MockControllerApi;
