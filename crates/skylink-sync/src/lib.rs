//! Phone ↔ watch weather synchronisation.
//!
//! The phone side (`PrimaryOrchestrator`) answers sync requests from its
//! cache and then with fresh data. The watch side (`SecondaryOrchestrator`)
//! asks the phone first and falls back to fetching directly after a timeout.
//! Both are driven by `TransportEvent`s pumped through an `EventDispatcher`.

pub mod dispatch;
pub mod memory;
pub mod peer;
pub mod primary;
pub mod secondary;
pub mod state;
pub mod transport;
pub mod wire;

pub use dispatch::{DropReason, EventDispatcher, EventHandler};
pub use memory::{MemoryEndpoint, MemoryTransport, SentMessage};
pub use peer::{PeerDescriptor, PeerId, PeerRegistry};
pub use primary::{
    PipelineReport, PipelineTrigger, PrimaryConfig, PrimaryOrchestrator, PrimaryPhase,
    PrimaryReaction,
};
pub use secondary::{
    RefreshOutcome, SecondaryConfig, SecondaryOrchestrator, SecondaryPhase, SecondaryReaction,
    WearableView, CITY_REQUIRED,
};
pub use state::{DataSource, SyncStateTracker, SyncStateView, SyncStatus};
pub use transport::{
    event_channel, send_to_all_peers, DataEventKind, DataMap, DataValue, DeliveryReport,
    EventReceiver, EventSender, Transport, TransportEvent,
};
