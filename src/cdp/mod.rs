mod client;
mod error;
mod transport;
mod types;

pub use client::{CdpConfig, CdpConnection};
pub use error::CdpError;
pub use types::{CdpEvent, CdpResponse};
