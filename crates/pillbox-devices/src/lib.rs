//! Pillbox device connectivity.
//!
//! ## Architecture
//!
//! - **DiscoveryService**: UDP broadcast query, JSON identification reply, retries
//! - **DeviceSession**: one TCP connection, background receive loop, correlated commands
//! - **LineFramer**: newline framing of the byte stream into JSON lines
//! - **MessageRouter**: FIFO hand-off from the receive loop to the foreground consumer
//! - **ScheduleCommandBuilder**: active schedules to a `SET_SCHEDULE` command
//! - **PillboxMonitor**: feeds box events from the router into the status engine
//!
//! Data flows discovery → session → router → monitor → engine; schedule edits
//! flow builder → session.

pub mod discovery;
pub mod framing;
pub mod monitor;
pub mod protocol;
pub mod router;
pub mod schedule_command;
pub mod session;

pub use discovery::{
    BroadcastProbe, DiscoveryError, DiscoveryReply, DiscoveryService, UdpBroadcastProbe,
};
pub use framing::LineFramer;
pub use monitor::{MonitorEvent, PillboxMonitor};
pub use protocol::{
    decode_line, BoxEvent, BoxState, CommandResponse, CommandStatus, CompartmentAssignment,
    CompartmentStatus, DeviceCommand, DeviceMessage, Frame, MessageKind, OutboundMessage,
    StatusReport, WelcomeInfo,
};
pub use router::{channel, Envelope, MessageReceiver, MessageRouter};
pub use schedule_command::{
    CommandBuildError, MedicationEntry, ScheduleCommand, ScheduleCommandBuilder,
    SCHEDULE_RESPONSE_TIMEOUT,
};
pub use session::{ConnectionState, DeviceSession, SessionError};
