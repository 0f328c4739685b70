mod runbook;
mod snapshot;
mod workspace;

pub use runbook::{RemoteInfo, Runbook, RunbookSource};
pub use snapshot::Snapshot;
pub use workspace::Workspace;
