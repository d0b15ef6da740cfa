use std::sync::Arc;

use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use log::trace;

use crate::buffer::Buffer;
use crate::error::{Error, Result};

use super::stream::Inner;

/// A queued write, or the close sentinel that ends the writer.
pub(crate) enum Request {
    Write {
        buffer: Buffer,
        done: oneshot::Sender<(Buffer, Result<()>)>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

pub(crate) type RequestSender = mpsc::UnboundedSender<Request>;
pub(crate) type RequestReceiver = mpsc::UnboundedReceiver<Request>;

pub(crate) fn request_queue() -> (RequestSender, RequestReceiver) {
    mpsc::unbounded()
}

/// The per-connection write serializer.
///
/// Sole consumer of the request queue and sole owner of the socket's write
/// path; that exclusivity is what orders concurrent `write` callers. Requests
/// are executed to completion one at a time, so the bytes of one buffer are
/// never interleaved with another's. The task exits on the close sentinel,
/// when the connection breaks, or when the queue closes empty.
pub(crate) async fn write_loop(stream: Arc<Inner>, mut requests: RequestReceiver) {
    while let Some(request) = requests.next().await {
        match request {
            Request::Close { done } => {
                trace!("writer: queue drained up to the close sentinel");
                let _ = done.send(());
                break;
            }
            Request::Write { mut buffer, done } => {
                if stream.is_terminated() {
                    // Force close or peer failure beat this request.
                    let _ = done.send((buffer, Err(Error::SocketClosed)));
                    continue;
                }
                match stream.clone().write_buffer(&mut buffer).await {
                    Ok(()) => {
                        let _ = done.send((buffer, Ok(())));
                    }
                    Err(err) => {
                        let err = stream.fail(err);
                        let _ = done.send((buffer, Err(err)));
                        drain(&mut requests);
                        break;
                    }
                }
            }
        }
    }
}

/// Fails everything still queued after the connection broke.
fn drain(requests: &mut RequestReceiver) {
    requests.close();
    while let Ok(Some(request)) = requests.try_next() {
        match request {
            Request::Write { buffer, done } => {
                let _ = done.send((buffer, Err(Error::SocketClosed)));
            }
            Request::Close { done } => {
                let _ = done.send(());
            }
        }
    }
}
