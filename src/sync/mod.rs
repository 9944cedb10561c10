//! Replay of queued mutations and the machinery that decides when to run it.

mod connectivity;
mod engine;
mod orchestrator;

pub use connectivity::{spawn_probe, Connectivity, ConnectivityProbe};
pub use engine::{SyncEngine, SyncReport, MAX_RETRIES};
pub use orchestrator::{OrchestratorHandle, OrchestratorSettings, SyncOrchestrator, SyncStatus};
