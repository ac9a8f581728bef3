//! Multiplexed connection I/O.
//!
//! Each dialed address gets one connection, a reader task, and a writer task.
//! Callers queue requests on a channel; the writer sends frames out and
//! matches messages forwarded by the reader back to callers by request id, so
//! many requests share a connection concurrently.

use crate::wire::{ManagerMessage, RequestId, RunnerMessage, MAX_MESSAGE_SIZE};
use commonware_codec::{DecodeExt, Encode, Error as CodecError};
use commonware_macros::select;
use commonware_runtime::{Handle, Sink, Spawner, Stream};
use commonware_stream::utils::codec::{recv_frame, send_frame};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt, StreamExt,
};
use std::collections::HashMap;

const REQUEST_BUFFER: usize = 64;

/// A correlatable wire message.
pub(super) trait Wire: Sized + Send + 'static {
    fn request_id(&self) -> RequestId;
    fn encode_frame(&self) -> Vec<u8>;
    fn decode_frame(data: &[u8]) -> Result<Self, CodecError>;
}

impl Wire for ManagerMessage {
    fn request_id(&self) -> RequestId {
        ManagerMessage::request_id(self)
    }

    fn encode_frame(&self) -> Vec<u8> {
        self.encode().to_vec()
    }

    fn decode_frame(data: &[u8]) -> Result<Self, CodecError> {
        Self::decode(data)
    }
}

impl Wire for RunnerMessage {
    fn request_id(&self) -> RequestId {
        RunnerMessage::request_id(self)
    }

    fn encode_frame(&self) -> Vec<u8> {
        self.encode().to_vec()
    }

    fn decode_frame(data: &[u8]) -> Result<Self, CodecError> {
        Self::decode(data)
    }
}

/// A request and the callback for its response.
///
/// The responder is dropped (cancelling the receiver) if the connection dies
/// before a response arrives.
pub(super) struct Request<M: Wire> {
    pub message: M,
    pub responder: oneshot::Sender<M>,
}

/// Receive frames and forward decoded messages until the connection dies.
///
/// Receiving lives on its own task so a frame read is never abandoned
/// mid-wait while the write side makes progress.
async fn read_loop<St, M>(mut stream: St, mut messages: mpsc::Sender<M>)
where
    St: Stream,
    M: Wire,
{
    loop {
        let Ok(data) = recv_frame(&mut stream, MAX_MESSAGE_SIZE).await else { return };
        let Ok(message) = M::decode_frame(&data[..]) else { return };
        if messages.send(message).await.is_err() {
            return;
        }
    }
}

async fn run_loop<Si, M>(
    mut sink: Si,
    mut incoming: mpsc::Receiver<M>,
    mut requests: mpsc::Receiver<Request<M>>,
) where
    Si: Sink,
    M: Wire,
{
    let mut pending: HashMap<RequestId, oneshot::Sender<M>> = HashMap::new();
    loop {
        select! {
            outgoing = requests.next() => {
                let Some(Request { message, responder }) = outgoing else { return };
                let request_id = message.request_id();
                let data = message.encode_frame();
                pending.insert(request_id, responder);
                if send_frame(&mut sink, &data, MAX_MESSAGE_SIZE).await.is_err() {
                    // Dropping pending responders signals failure to callers.
                    return;
                }
            },
            message = incoming.next() => {
                // None means the reader hit a transport or decode failure.
                let Some(message) = message else { return };
                if let Some(responder) = pending.remove(&message.request_id()) {
                    let _ = responder.send(message);
                }
            },
        }
    }
}

/// Start the I/O tasks for an established connection.
pub(super) fn start<E, Si, St, M>(context: E, sink: Si, stream: St) -> (mpsc::Sender<Request<M>>, Handle<()>)
where
    E: Spawner,
    Si: Sink,
    St: Stream,
    M: Wire,
{
    let (sender, receiver) = mpsc::channel(REQUEST_BUFFER);
    let (incoming_sender, incoming) = mpsc::channel(REQUEST_BUFFER);
    context
        .clone()
        .spawn(move |_| read_loop(stream, incoming_sender));
    let handle = context.spawn(move |_| run_loop(sink, incoming, receiver));
    (sender, handle)
}
