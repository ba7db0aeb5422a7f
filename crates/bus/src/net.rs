//! The bus across a process boundary
//!
//! A [`BusServer`] exposes a [`LocalBus`] on a TCP socket. Signals from a
//! connected [`BusClient`] are published on the local bus and forwarded to
//! every other client; signals published locally reach every client.
use std::{
    io::Write,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{Arc, Mutex},
    thread,
};

use bytes::BytesMut;
use eyre::WrapErr;
use retry::{delay::Exponential, retry};
use tokio_util::codec::Encoder;
use transport::{FrameCodec, FrameReader};

use crate::{LocalBus, Signal};

fn write_signal(output: &mut impl Write, signal: &Signal) -> eyre::Result<()> {
    let mut buffer = BytesMut::new();
    FrameCodec::<Signal>::new()
        .encode(signal, &mut buffer)
        .wrap_err("encoding signal")?;
    output.write_all(&buffer).wrap_err("writing signal")?;
    output.flush().wrap_err("flushing signal")
}

pub struct BusServer {
    local_addr: SocketAddr,
}

impl BusServer {
    /// Accept bus clients on `addr` in the background.
    pub fn bind(addr: impl ToSocketAddrs, bus: LocalBus) -> eyre::Result<Self> {
        let listener = TcpListener::bind(addr).wrap_err("binding bus address")?;
        let local_addr = listener.local_addr().wrap_err("reading bus address")?;
        tracing::info!(%local_addr, "bus listening");

        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        if let Err(e) = serve_peer(stream, bus.clone()) {
                            tracing::warn!(error = %e, "setting up bus client");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "accepting bus client"),
                }
            }
        });

        Ok(Self { local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn serve_peer(stream: TcpStream, bus: LocalBus) -> eyre::Result<()> {
    let peer = stream.peer_addr().wrap_err("reading peer address")?;
    stream.set_nodelay(true).wrap_err("disabling Nagle")?;
    let mut writer = stream.try_clone().wrap_err("cloning bus stream")?;
    let control = stream.try_clone().wrap_err("cloning bus stream")?;
    let (id, outgoing) = bus.subscribe_peer();
    tracing::debug!(%peer, %id, "bus client connected");

    thread::spawn(move || {
        for signal in outgoing.iter() {
            if let Err(e) = write_signal(&mut writer, &signal) {
                tracing::debug!(%peer, error = %e, "bus client went away");
                break;
            }
        }
    });

    thread::spawn(move || {
        let mut reader = FrameReader::<_, Signal>::new(stream);
        loop {
            match reader.next_message() {
                Ok(Some(signal)) => bus.publish_from(Some(id), signal),
                Ok(None) => {
                    tracing::debug!(%peer, "bus client disconnected");
                    break;
                }
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "reading from bus client");
                    break;
                }
            }
        }
        let _ = control.shutdown(Shutdown::Both);
    });
    Ok(())
}

/// A connection to a [`BusServer`] in another process
pub struct BusClient {
    stream: Arc<Mutex<TcpStream>>,
    signals: crossbeam_channel::Receiver<Signal>,
}

impl BusClient {
    /// Connect, retrying while the server starts up.
    pub fn connect<A>(addr: A) -> eyre::Result<Self>
    where
        A: ToSocketAddrs + Clone,
    {
        let stream = retry(Exponential::from_millis(100).take(5), || {
            TcpStream::connect(addr.clone())
        })
        .map_err(|e| eyre::eyre!("failed to connect to bus: {e}"))?;
        stream.set_nodelay(true).wrap_err("disabling Nagle")?;

        let input = stream.try_clone().wrap_err("cloning bus stream")?;
        let (tx, signals) = crossbeam_channel::unbounded();
        thread::spawn(move || {
            let mut reader = FrameReader::<_, Signal>::new(input);
            while let Ok(Some(signal)) = reader.next_message() {
                if tx.send(signal).is_err() {
                    break;
                }
            }
            tracing::debug!("bus connection closed");
        });

        Ok(Self {
            stream: Arc::new(Mutex::new(stream)),
            signals,
        })
    }

    #[tracing::instrument(skip(self, signal), fields(signal = signal.name()))]
    pub fn publish(&self, signal: &Signal) -> eyre::Result<()> {
        let mut stream = self
            .stream
            .lock()
            .map_err(|e| eyre::eyre!("bus stream mutex poisoned: {e}"))?;
        write_signal(&mut *stream, signal)
    }

    /// Signals published by the server and by other clients
    pub fn signals(&self) -> crossbeam_channel::Receiver<Signal> {
        self.signals.clone()
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        if let Ok(stream) = self.stream.lock() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}
