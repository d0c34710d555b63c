//! Wire frames, outgoing envelopes and the cross-type chat policy shared by
//! every relay instance.

pub mod envelope;
pub mod error;
pub mod frame;
pub mod policy;

pub use envelope::{
    Event, MessagePayload, OutgoingEnvelope, SYSTEM_SENDER, TEXT_MESSAGE, WelcomePayload,
};
pub use error::ProtocolError;
pub use frame::{Action, Command, InboundFrame, KEEPALIVE_FRAME};
pub use policy::{ChatPolicy, DEFAULT_RESTRICTED_INITIATOR, participants_key};
