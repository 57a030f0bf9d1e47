use thiserror::Error;

/// Errors that can occur while running the proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// A configuration variable was missing or unparseable.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// TLS material could not be loaded or was rejected by rustls.
    #[error("tls setup failed: {0}")]
    Tls(String),
    /// WebSocket transport error on the gateway link.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// A gateway frame could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// IRC framing error on a client connection.
    #[error("codec error: {0}")]
    Codec(#[from] crate::irc::codec::CodecError),
    /// The gateway closed the link and it could not be re-established.
    #[error("gateway link closed")]
    GatewayClosed,
}
