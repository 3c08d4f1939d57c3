use std::net::AddrParseError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid listen address `{addr}`: {source}")]
    InvalidListenAddr {
        addr: String,
        #[source]
        source: AddrParseError,
    },
    #[error("{0} must be greater than zero")]
    ZeroSetting(&'static str),
    #[error("relay server failed: {0}")]
    Serve(#[from] std::io::Error),
}
