use thiserror::Error;

/// Errors produced by the protocol stack.
///
/// Inbound protocol and codec failures are logged and dropped at the point
/// where they occur; transport failures tear down the affected connection;
/// adapter failures propagate to the caller.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed packet framing on either protocol layer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Read/write failure on the byte connection.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A user-supplied event handler returned a failure.
    #[error("handler error: {0}")]
    Handler(String),

    /// Publishing or subscribing through the cluster adapter failed.
    #[error("adapter error: {0}")]
    Adapter(String),

    /// JSON encode/decode failure.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for handler failures built from plain messages.
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
