/// Errors arising inside the broker's core routing and transport logic.
///
/// Transport-level variants close only the offending connection. Protocol
/// variants produced while handling a peer's message are turned into a
/// single `error` reply to that peer; the connection is otherwise unaffected.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] broker_protocol::CodecError),
    #[error("unknown role for path '{0}'")]
    UnknownRole(String),
    #[error("streamer at capacity")]
    CapacityExceeded,
    #[error("no active streamer")]
    NoActiveStreamer,
    #[error("target connection unknown")]
    TargetUnknown,
    #[error("outbound queue full")]
    QueueFull,
    #[error("socket already closed")]
    SocketClosed,
    #[error("connection idle past timeout")]
    IdleTimeout,
}
