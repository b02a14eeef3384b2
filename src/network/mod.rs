//! Network Layer
//!
//! Purchase channel, wire protocol and the session state machine that runs
//! over them. Everything cryptographic is delegated to `proof/`, `ot/` and
//! `retrieval`; this layer sequences it.

pub mod channel;
pub mod client;
pub mod credential;
pub mod protocol;
pub mod session;

pub use channel::{
    Channel, ChannelError, Inbound, MemoryChannel, MemoryPeer, Outbound, WsChannel, CLOSE_NORMAL,
};
pub use client::{run_session, ClientError, PurchaseClient};
pub use credential::{precheck_credential, CredentialClaims, CredentialError};
pub use protocol::{ClientMessage, ServerMessage};
pub use session::{
    FailureReason, ProgressEvent, PurchaseSession, RoundStep, SessionConfig, SessionContext,
    SessionError, SessionFailure, SessionPhase,
};
