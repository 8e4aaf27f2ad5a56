//! Domain layer public interface.
//!
//! Abstractions that are independent of any wire protocol or broker.
//! Consumers import through this module, never from individual files.

mod transport;

// --- Transport domain re-exports ---

pub use transport::{
    //
    PersistentSubscription,
    PrepMessage,
    PrepOptions,
    PsubOptions,
    PublishCmd,
    Publisher,
    Transport,
    TransportPtr,
};
