//! meshplane-services — the supernode's moving parts.
//!
//! The [`Supernode`] value owns all process-wide shared state: the edge
//! registry behind one readers-writer lock, the latency graph, the cached
//! artifacts the convergence hashes are computed over, and the ordered pair
//! of address-family control devices. The [`Dispatcher`] is the single
//! consumer of the two event channels; the ticker fabric feeds the same
//! channels with sentinel events so every sweep goes through the same
//! serialisation boundary.

pub mod device;
pub mod dispatcher;
pub mod graph;
pub mod push;
pub mod registry;
pub mod supernode;
pub mod tickers;

pub use device::{AddrFamily, DeviceError, EdgeDevice};
pub use dispatcher::{event_channels, Dispatcher, EventChannels, EVENT_QUEUE_DEPTH};
pub use graph::LatencyGraph;
pub use registry::{EdgeRecord, Registry, RosterPeer};
pub use supernode::{AdmissionError, SuperParams, Supernode};
