//! Resumable block-level log transfer over a half-duplex serial link.
//!
//! The controller keeps its log in flash as fixed-size blocks. On request it
//! streams the current session to a capture device, one CRC-protected packet
//! at a time, each one acknowledged before the next is sent.

pub mod capture;
pub mod error;
pub mod link;
pub mod log;
pub mod options;
pub mod protocol;
pub mod storage;
pub mod utils;

pub use capture::{CaptureDir, Destination, Sink};
pub use error::{Error, Result};
pub use link::SerialLink;
pub use options::{Options, OptionsBuilder};
pub use protocol::{receiver::Receiver, sender::Sender, EndReason, TransferReport};
pub use storage::{LogStorage, LogStorageMut};

/// Send the current session of the log in `storage`.
pub fn send_log<L, S>(link: L, storage: S, options: &Options) -> Result<TransferReport>
where
    L: SerialLink,
    S: LogStorage,
{
    Sender::new(link, storage, options).run()
}

/// Receive one session into a destination opened from `sink`.
pub fn receive_log<L, K>(link: L, sink: K, options: &Options) -> Result<(TransferReport, K::Dest)>
where
    L: SerialLink,
    K: Sink,
{
    Receiver::new(link, sink, options).run()
}

#[cfg(test)]
#[ctor::ctor]
fn init() {
    color_backtrace::install();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_target(true)
        .with_file(true)
        .with_level(true)
        .without_time()
        .with_thread_ids(true)
        .try_init();
}
