use std::collections::HashMap;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use eyre::{Context, Result};
use retry::{delay::Exponential, retry};
use tokio_util::codec::Encoder;

use crate::codec::FrameCodec;
use crate::events;
use crate::io::{TcpTransport, Transport};
use crate::message::{Message, Request, Response, Seq};
use crate::reader::{FrameReader, PollResult};
use crate::requests::RequestBody;

/// How long [`Client::send`] waits for a response by default
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type RequestStore = Arc<Mutex<HashMap<Seq, oneshot::Sender<Response>>>>;

struct ClientInternals {
    output: Box<dyn Write + Send>,
    codec: FrameCodec<Message>,

    // Option because of drop and take
    exit: Option<oneshot::Sender<()>>,
}

/// DAP client
///
/// Requests are written in program order; responses are matched back to their
/// callers by `request_seq` on a background thread, so they may arrive in any
/// order. Events are forwarded to the channel given at construction.
#[derive(Clone)]
pub struct Client {
    internals: Arc<Mutex<ClientInternals>>,
    sequence_number: Arc<AtomicI64>,
    store: RequestStore,
    timeout: Duration,
}

impl Client {
    /// Create a new DAP client with a custom transport
    ///
    /// ```
    /// use transport::{Client, io::InMemoryTransport};
    ///
    /// let (client_transport, _adapter_transport) = InMemoryTransport::pair();
    /// let (tx, _rx) = crossbeam_channel::unbounded();
    /// let client = Client::with_transport(client_transport, tx)?;
    /// # Ok::<(), eyre::Error>(())
    /// ```
    pub fn with_transport<T>(
        transport: T,
        events: crossbeam_channel::Sender<events::Event>,
    ) -> Result<Self>
    where
        T: Transport,
    {
        let (input, output) = transport.split()?;

        let store = RequestStore::default();
        let store_clone = Arc::clone(&store);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        // Background poller to route responses and events
        thread::spawn(move || {
            let mut reader = FrameReader::<_, Message>::new(input);

            loop {
                match shutdown_rx.try_recv() {
                    Ok(_) => return,
                    Err(oneshot::TryRecvError::Empty) => {}
                    Err(oneshot::TryRecvError::Disconnected) => {
                        tracing::debug!("client dropped, stopping reader");
                        return;
                    }
                }

                match reader.poll_message() {
                    Ok(PollResult::Message(Message::Event(evt))) => {
                        tracing::trace!(event = %evt.event, "received event");
                        let _ = events.send(events::Event::from(evt));
                    }
                    Ok(PollResult::Message(Message::Response(r))) => {
                        with_lock("Reader.store", store_clone.as_ref(), |mut store| {
                            match store.remove(&r.request_seq) {
                                Some(tx) => {
                                    let _ = tx.send(r);
                                }
                                None => {
                                    tracing::warn!(response = ?r, "no request waiting for response")
                                }
                            }
                        });
                    }
                    Ok(PollResult::Message(Message::Request(r))) => {
                        tracing::warn!(command = %r.command, "ignoring reverse request");
                    }
                    Ok(PollResult::Timeout) => {}
                    Ok(PollResult::Closed) => {
                        tracing::debug!("debug adapter closed the connection");
                        // wake every waiting caller with a disconnect
                        with_lock("Reader.store", store_clone.as_ref(), |mut store| {
                            store.clear()
                        });
                        let _ = events.send(events::Event::Terminated);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "reader error");
                        with_lock("Reader.store", store_clone.as_ref(), |mut store| {
                            store.clear()
                        });
                        let _ = events.send(events::Event::Terminated);
                        return;
                    }
                }
            }
        });

        let internals = ClientInternals {
            output: Box::new(output),
            codec: FrameCodec::new(),
            exit: Some(shutdown_tx),
        };

        Ok(Self {
            internals: Arc::new(Mutex::new(internals)),
            sequence_number: Arc::new(AtomicI64::new(0)),
            store,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Connect to a debug adapter over TCP, retrying while it starts up
    ///
    /// Uses exponential backoff (200ms, 400ms, 800ms, 1600ms, 3200ms).
    pub fn connect<A>(addr: A, events: crossbeam_channel::Sender<events::Event>) -> Result<Self>
    where
        A: ToSocketAddrs + Clone,
    {
        let stream = retry(Exponential::from_millis(200).take(5), || {
            tracing::debug!("trying to make connection");
            match TcpStream::connect(addr.clone()) {
                Ok(stream) => {
                    tracing::debug!("connection made");
                    Ok(stream)
                }
                Err(e) => {
                    tracing::debug!(error = %e, "error making connection");
                    Err(e)
                }
            }
        })
        .map_err(|e| eyre::eyre!("failed to connect to debug adapter: {e}"))?;

        let transport = TcpTransport::new(stream)?;
        Self::with_transport(transport, events)
    }

    /// Change how long [`Client::send`] waits for a response.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a request and block until its response arrives or the timeout
    /// expires. An expired request is forgotten; a late response is dropped.
    #[tracing::instrument(skip(self, body), level = "debug")]
    pub fn send(&self, body: RequestBody) -> Result<Response> {
        let (seq, command, rx) = self.submit(body)?;
        match rx.recv_timeout(self.timeout) {
            Ok(response) => Ok(response),
            Err(oneshot::RecvTimeoutError::Timeout) => {
                with_lock("Client.store", self.store.as_ref(), |mut store| {
                    store.remove(&seq)
                });
                eyre::bail!("{command} request timed out after {:?}", self.timeout)
            }
            Err(oneshot::RecvTimeoutError::Disconnected) => {
                eyre::bail!("connection closed before {command} response")
            }
        }
    }

    /// Send a request and hand back the receiver its response will arrive on.
    ///
    /// The receiver is disconnected if the adapter closes the connection
    /// first.
    #[tracing::instrument(skip(self, body), level = "debug")]
    pub fn send_async(&self, body: RequestBody) -> Result<oneshot::Receiver<Response>> {
        self.submit(body).map(|(_, _, rx)| rx)
    }

    fn submit(&self, body: RequestBody) -> Result<(Seq, String, oneshot::Receiver<Response>)> {
        let seq = self.next_seq();
        let request = body.into_request(seq)?;
        let command = request.command.clone();

        let (tx, rx) = oneshot::channel();
        with_lock("Client.store", self.store.as_ref(), |mut store| {
            store.insert(seq, tx);
        });

        if let Err(e) = self.write(request) {
            with_lock("Client.store", self.store.as_ref(), |mut store| {
                store.remove(&seq)
            });
            return Err(e);
        }
        Ok((seq, command, rx))
    }

    /// Send a request without waiting for its response
    #[tracing::instrument(skip(self, body), level = "debug")]
    pub fn execute(&self, body: RequestBody) -> Result<()> {
        let seq = self.next_seq();
        self.write(body.into_request(seq)?)
    }

    fn next_seq(&self) -> Seq {
        self.sequence_number.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn write(&self, request: Request) -> Result<()> {
        tracing::debug!(seq = request.seq, command = %request.command, "sending message");
        with_lock("Client.internals", self.internals.as_ref(), |mut internals| {
            let mut buffer = BytesMut::new();
            internals
                .codec
                .encode(Message::Request(request), &mut buffer)
                .wrap_err("encoding request")?;
            internals
                .output
                .write_all(&buffer)
                .wrap_err("writing message to output buffer")?;
            internals.output.flush().wrap_err("flushing output buffer")
        })
    }
}

pub(crate) fn with_lock<T, F, R>(name: &str, lock: &Mutex<T>, f: F) -> R
where
    F: FnOnce(MutexGuard<'_, T>) -> R,
{
    tracing::trace!(%name, "taking lock");
    let inner = match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(%name, "lock poisoned, continuing");
            poisoned.into_inner()
        }
    };
    let res = f(inner);
    tracing::trace!(%name, "releasing lock");
    res
}

impl Drop for ClientInternals {
    fn drop(&mut self) {
        tracing::debug!("shutting down client");
        if let Some(exit) = self.exit.take() {
            let _ = exit.send(());
        }
    }
}
