//! Peer liveness: persisted reachability state and the probe cycle that
//! keeps it current.

pub mod persistence;
pub mod probe;
pub mod tracker;

pub use persistence::{Liveness, LivenessEntry, LivenessStore, PeerStatus, ProbeStatus};
pub use probe::{PingProbe, ReachabilityProbe};
pub use tracker::{CycleReport, LivenessTracker};
