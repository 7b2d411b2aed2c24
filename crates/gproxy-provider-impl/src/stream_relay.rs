//! Every streaming adapter drives its upstream parser loop on a spawned
//! task and relays already-encoded Protocol-A frames back through an mpsc
//! channel; this turns that channel into the `BodyStream` the `Provider`
//! trait expects.

use bytes::Bytes;
use gproxy_provider_core::BodyStream;

pub fn channel_to_body_stream(rx: tokio::sync::mpsc::Receiver<Bytes>) -> BodyStream {
    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|bytes| (bytes, rx))
    }))
}
