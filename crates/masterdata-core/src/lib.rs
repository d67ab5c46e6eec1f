//! Master-data consistency kernel for the portal.
//!
//! Keeps locally persisted reference data (countries, currencies, entity
//! types and friends), the storage mode flag, the one-shot migration into the
//! canonical store and the user session consistent with each other. Every
//! component works against the [`kv::KeyValueStore`] boundary and the async
//! [`remote::CanonicalStore`] boundary, so the same code runs over memory,
//! a file or a real backend.

pub mod catalog;
pub mod category;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod health;
pub mod kv;
pub mod migration;
pub mod mode;
pub mod remote;
pub mod schedule;
pub mod session;

pub use catalog::{Catalog, CategoryDef, CustomFallback};
pub use category::CategoryStore;
pub use cleanup::CleanupReport;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{KeyNamespace, PortalConfig};
pub use envelope::{normalize, ItemShape};
pub use error::{AppError, ErrorCategory, ErrorCode, Healed, HealthIssue, IssueKind};
pub use health::{HealthCheckResult, HealthMonitor, HealthRun, MonitorState};
pub use kv::{FileKvStore, KeyValueStore, KvError, MemoryKvStore};
pub use migration::{MigrationEngine, MigrationGate, MigrationReport};
pub use mode::{ModeResolver, StorageMode};
pub use remote::{CanonicalStore, Filter, MemoryCanonicalStore, Order, RemoteError, Row};
pub use schedule::{ScheduledTask, ScheduleError};
pub use session::{
    Authenticator, Credentials, Navigator, SessionError, SessionManager, SessionRecord,
    SessionStatus, SessionVault,
};
