pub mod command;
pub mod deferred;
pub mod events;
pub mod ids;
pub mod ports;

pub use command::{Channel, Command, MessageRecord, OutboundCommand, ProtocolError};
pub use deferred::{Completion, DeferredIterable, IterError};
pub use events::{ClientEvent, EventBus};
pub use ports::{AuthPrompt, Authenticator, CredentialStore};
