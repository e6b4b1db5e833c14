//! orthos-core: Machine fleet orchestration and task execution engine
//!
//! Holds the authoritative machine state, the task queue, and the two kameo
//! actors that act on them: the `SchedulerActor` drains the queue through the
//! remote control adapters with per-machine serialization and bounded
//! retries, and the `ReconcilerActor` periodically probes the fleet and
//! corrects drift. [`Engine`] is the narrow surface collaborators use.

pub mod actor;
pub mod admission;
pub mod busy;
pub mod compat;
pub mod config;
pub mod engine;
pub mod error;
pub mod machine;
pub mod message;
pub mod persist;
pub mod queue;
pub mod retry;
pub mod runner;
pub mod store;
pub mod task;

pub use actor::reconciler::{ReconcilerActor, ReconcilerArgs};
pub use actor::scheduler::{SchedulerActor, SchedulerArgs};
pub use busy::{BusyMachines, MachineClaim};
pub use compat::{Architecture, SystemClass, allowed_systems, is_compatible};
pub use config::EngineConfig;
pub use engine::{Engine, EngineArgs};
pub use error::CoreError;
pub use machine::{
    Machine, MachineFilter, MachineStatus, ProbeResult, Reservation, ReservationRecord,
};
pub use message::{CancelOutcome, SweepReport};
pub use persist::EngineSnapshot;
pub use store::{ArchitectureCounts, FleetStatistics, MachineStore};
pub use task::{SYSTEM_REQUESTER, Task, TaskAction, TaskFilter, TaskId, TaskState};
