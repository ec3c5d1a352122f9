pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod session;

pub use connection::{
    frame_channel, ConnState, ConnectionConfig, ConnectionHooks, ConnectionManager, FrameReceiver,
    FrameSender,
};
pub use dispatcher::Dispatcher;
pub use error::TransportError;
pub use session::Session;
