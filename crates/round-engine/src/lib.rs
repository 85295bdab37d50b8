//! Speed-friending Round Engine
//!
//! Runs timed rounds for a group: pairs the pool (via `matchmaking`), puts
//! each pair in its own temporary channel, warns before time is up, and
//! brings everyone back to the lobby.
//!
//! # Components
//!
//! - **supervisor**: at most one round per group; `start_round` / `stop_round`
//! - **round**: one round's lifecycle, PREPARING → ACTIVE → WINDING_DOWN → DONE
//! - **state_machine**: phase guards and transition log
//! - **bulk**: concurrent member relocation with per-member outcomes
//! - **collaborators**: store / provisioner / announcer contracts
//! - **memory**: in-process implementations of those contracts
//! - **events**: broadcast bus of `RoundEvent`s
//! - **config**: `EngineConfig` (env or TOML)
//!
//! # Usage
//!
//! ```bash
//! # Simulate one 2-minute round with 7 members, stopping it after 45s
//! speed-friending simulate --participants 7 --duration-minutes 2 --stop-after-secs 45
//!
//! # Print the optimal pairing for a pool and its history
//! speed-friending pair --input pool.json
//! ```

pub mod bulk;
pub mod collaborators;
pub mod config;
pub mod errors;
pub mod events;
pub mod memory;
pub mod round;
pub mod state_machine;
pub mod supervisor;

pub use bulk::{BulkOutcome, BulkSummary, MoveOutcome};
pub use collaborators::{
    ChannelBatch, ChannelHandle, ChannelProvisioner, Collaborators, GroupId, MeetingRecord,
    RoundAnnouncer, RoundId, RoundStatus, RoundStore, WarningNotice,
};
pub use config::{EngineConfig, SitOutPolicy};
pub use errors::{CollaboratorError, EngineError, ProvisionFailure, StartRejection, StopRejection};
pub use events::{EventBus, RoundEvent, SharedEventBus};
pub use memory::{simulated_collaborators, InMemoryStore, SimulatedProvisioner};
pub use round::{RoundPlan, RoundReport, RoundRunner, SignalRun};
pub use supervisor::{
    PoolMember, RoundStarted, SharedSupervisor, StartRequest, StopAck, Supervisor,
};
