//! Configuration passthrough for AM32 ESCs.
//!
//! The ESC listens for a short pulse train on its signal wire, after which
//! the same wire carries a half-duplex UART. Requests are XOR-checksummed,
//! responses are length prefixed.
pub mod channel;
pub mod protocol;
pub mod settings;

pub use channel::{EscConfigChannel, EscLinkConfig, LinkState};
pub use settings::{EscInfo, EscSettings};
