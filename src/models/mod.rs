pub mod app;
pub mod history;
pub mod installed_app;
pub mod requests;

pub use app::{AppType, Application, OfferingMode};
pub use history::{HistoryStatus, InstalledAppVersionHistory, StatusTimeline, TimelineStatus};
pub use installed_app::{
    DeploymentMode, DeploymentStatus, InstalledApp, InstalledAppDetail, InstalledAppVersion,
};
pub use requests::{
    AppExistsEntry, AppExistsRequest, ChartGroupInstallChartRequest, ChartGroupInstallRequest,
    DeployPayload, DeploymentChangeStatus, InstallAppRequest, InstalledAppFilter,
    MigrationRequest, MigrationResponse, MigrationStatus, UpdateAppRequest,
};
