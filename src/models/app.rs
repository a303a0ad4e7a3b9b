use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// What kind of unit an application is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq)]
pub enum AppType {
    #[strum(serialize = "chart-store")]
    #[serde(rename = "chart-store")]
    ChartStore,
    #[strum(serialize = "cluster-component")]
    #[serde(rename = "cluster-component")]
    ClusterComponent,
    #[strum(serialize = "external-helm")]
    #[serde(rename = "external-helm")]
    ExternalHelm,
}

/// Whether the application may use GitOps delivery (full mode) or is
/// restricted to direct release.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq)]
pub enum OfferingMode {
    #[strum(serialize = "FULL")]
    #[serde(rename = "FULL")]
    Full,
    #[strum(serialize = "MANAGED")]
    #[serde(rename = "MANAGED")]
    Managed,
}

/// A named unit owned by a project. `app_name` is immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: i64,
    pub app_name: String,
    pub display_name: Option<String>,
    pub app_type: AppType,
    pub offering_mode: OfferingMode,
    pub team_id: Option<i64>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
