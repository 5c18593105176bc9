//! DShot for the ThumbsUp ESCs.
//!
//! `frame` and `telemetry` are pure bit manipulation, `engine` owns the
//! transmitter resources behind a [`DshotHal`](thumbsup_core::hw::DshotHal).
pub mod engine;
pub mod frame;
pub mod speed;
pub mod telemetry;

pub use engine::{erpm_to_rpm, DshotEngine};
pub use frame::{
    crc4, decode_packet, encode_packet, throttle_from_percent, throttle_from_unsigned_percent,
    DshotCommand,
};
pub use speed::{DshotConfig, DshotSpeed};
pub use telemetry::{decode_edt, EdtValue, TelemetryFrame};
