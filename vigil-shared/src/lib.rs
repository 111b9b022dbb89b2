pub mod arbitration;
pub mod cluster;
pub mod config;
pub mod driver;
pub mod election;
pub mod events;
pub mod exception;
pub mod failover;
pub mod gtid;
pub mod metrics;
pub mod monitor;
pub mod node;
pub mod proxy;
pub mod rejoin;
pub mod topology;

pub use exception::*;
pub use gtid::{BinlogPos, Gtid, GtidSet, ReplicationCoord};
pub use node::{Node, NodeId, NodeRole, ProbeReport};

// Re-export the cluster control surface
pub use cluster::{ClusterState, ClusterStatus};
pub use config::{ClusterConfig, ConfigLayers, FailoverMode, KeyOrigin};
pub use monitor::{ClusterMonitor, ClusterView, MonitorCommand, MonitorHandle};
pub use topology::{Anomaly, TopologySnapshot};

// Re-export the action engines
pub use election::{ElectionKind, ElectionOutcome, ExclusionReason};
pub use failover::{Executor, FailoverChecks, FailoverReport};
pub use rejoin::{RejoinOutcome, RejoinStrategy};

// Re-export observation types
pub use arbitration::{
    ArbitrationVerdict, Arbitrator, ControllerStatus, Heartbeat, PeerView, SharedArbitrationState,
};
pub use events::{Event, EventOrigin, EventRing, Severity};
pub use metrics::{MetricsSnapshot, MonitorMetrics};
