//! Channel multiplexer core.
//!
//! Multiplexes many logical, flow-controlled channels over the physical
//! transports of `linkmux-transport`. The [`Multiplexer`] owns a channel
//! table per link and runs two engines: [`Multiplexer::tx`] services caller
//! threads (lifecycle, credit-based flow control, blocking semantics) and
//! [`Multiplexer::rx`] services inbound traffic (buffering, wakeups,
//! completions). Channels in the shared-memory range are additionally routed
//! through to the coprocessor domain.

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod multiplexer;
pub mod notifier;
pub mod packet;
mod passthrough;
pub mod remote_alloc;
pub mod signal;
pub mod table;

pub use channel::{Channel, ChannelStatus, OpMode, OpenChannel};
pub use error::{MuxError, Result};
pub use event::{Direction, Event, EventKind, EventSink};
pub use multiplexer::{Multiplexer, ReadPayload, TxReply};
pub use notifier::{CallbackTarget, ChannelNotice, NoticeKind};
pub use packet::{Packet, PacketQueue};
pub use signal::{Signal, WaitError};
