//! Sequenced binary-protocol channel to the external compaction manager
//! (`mccouch`). See `protocol` for wire framing, `handlers` for the FIFO
//! response-matching list, and `channel` for the connection itself.

mod channel;
mod handlers;
mod protocol;

pub use channel::{CouchNotifier, NoopStatsSink, NotifierStatsSink, NotifyOutcome};
pub use handlers::{HandlerOutcome, PendingHandler, ResponseHandlerList};
