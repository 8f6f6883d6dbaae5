//! Exact-count fan-in over a channel.

use crossbeam_channel::Receiver;

use crate::error::SyncError;

/// Read exactly `count` values from `rx`. If the channel disconnects early,
/// the values received so far are returned together with a `ChannelClosed`
/// error. The receiver is left open for the caller.
pub fn collect_exact<T>(rx: &Receiver<T>, count: usize) -> (Vec<T>, Option<SyncError>) {
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        match rx.recv() {
            Ok(value) => values.push(value),
            Err(_) => return (values, Some(SyncError::ChannelClosed)),
        }
    }
    (values, None)
}
