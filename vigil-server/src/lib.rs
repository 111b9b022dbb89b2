pub mod arbitration;
pub mod heartbeat;
pub mod settings;
pub mod simulation;
pub mod supervisor;

pub use settings::{load as load_settings, Settings};
pub use supervisor::{Supervisor, SupervisorConfig};
