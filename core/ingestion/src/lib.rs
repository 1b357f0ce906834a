pub mod actions;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod guard;
pub mod routes;
pub mod state;
pub mod sweeper;
pub mod vault;
pub mod wake_word;

pub use actions::ActionError;
pub use buffer::{BufferConfig, BufferManager, BufferPhase, SessionBuffer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{GuardConfig, ServiceConfig, SweepConfig};
pub use database::Database;
pub use error::{ApiError, ApiResult};
pub use guard::KeyGuard;
pub use routes::build_router;
pub use state::AppState;
pub use sweeper::{SessionSweeper, SweepReport};
pub use vault::{KeyVault, VaultError};
pub use wake_word::WakeWordDetector;
