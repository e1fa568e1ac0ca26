/// Builder wiring every armada service into an [`ArmadaRuntime`].
pub mod builder;
/// Shutdown signalling and tracked background tasks.
pub mod shutdown;
/// The caller-facing runtime facade.
pub mod supervisor;

pub use builder::ArmadaRuntimeBuilder;
pub use shutdown::{BackgroundTasks, ShutdownToken};
pub use supervisor::ArmadaRuntime;
