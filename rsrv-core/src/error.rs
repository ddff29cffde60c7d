use thiserror::Error;

/// Errors surfaced while setting up or running the server.
///
/// Per-connection protocol failures are reported on the wire (see
/// [`crate::wire::WireError`]) rather than through this type; `RsrvError`
/// covers listener bring-up and configuration failures that abort startup.
#[derive(Error, Debug)]
pub enum RsrvError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("endian self-test failed")]
    EndianSelfTest,
}

pub type Result<T> = std::result::Result<T, RsrvError>;
