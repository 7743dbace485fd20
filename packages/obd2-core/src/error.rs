use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors shared by the transport, ISO-TP, UDS, and controller layers.
///
/// Callers match on the variant to tell connection problems apart from
/// protocol problems; the attached strings carry the raw context for
/// diagnostics.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to open transport: {0}")]
    TransportOpen(String),

    #[error("transport read error: {0}")]
    TransportRead(String),

    #[error("transport write error: {0}")]
    TransportWrite(String),

    #[error("transport timeout: {0}")]
    TransportTimeout(String),

    #[error("failed to initialize adapter: {0}")]
    AdapterInit(#[source] Box<Error>),

    #[error("adapter not initialized")]
    NotReady,

    #[error("no response from ECU or adapter: {0}")]
    NoResponse(String),

    #[error("invalid adapter response: {0}")]
    ResponseMalformed(String),

    #[error("ISO-TP protocol violation: {0}")]
    IsoTpProtocol(String),

    #[error("malformed UDS payload: {0}")]
    UdsMalformed(String),
}
