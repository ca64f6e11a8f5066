//! The page coherence engine, its action table, replica pool, hotness
//! sampler, and background daemons (spec §4.1, §4.4, §4.5).

pub mod action_table;
pub mod daemon;
pub mod fault_engine;
pub mod handle;
pub mod hotness;
pub mod replica;

pub use action_table::ActionMask;
pub use daemon::{AsyncCompletionDaemon, NodeRuntime};
pub use fault_engine::{Counters, FaultEngine, FaultOutcome};
pub use handle::{HandleFlags, PageState, PageTable};
pub use hotness::{Histogram, Sampler};
pub use replica::{Replica, ReplicaPool};
