// Copyright 2020 Joyent, Inc.

//! TCP transport. The gate listens on the address and the plugin connects
//! to it; packets are framed on the stream with [`HapiCodec`]. The gate
//! binds when the connection is opened and accepts one peer in
//! `establish`.
//!
//! [`HapiCodec`]: ../../protocol/struct.HapiCodec.html

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{Mutex, Notify};
use tokio_util::codec::Framed;

use crate::error::{HapiError, Result};
use crate::protocol::HapiCodec;
use crate::transport::{Connection, Role, Transport};

type FramedStream = Framed<TcpStream, HapiCodec>;

#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn open(&self, address: &str, role: Role) -> Result<Arc<dyn Connection>> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("hapi-tcp")
            .enable_all()
            .build()?;
        let listener = match role {
            Role::Gate => Some(runtime.block_on(TcpListener::bind(address))?),
            Role::Plugin => None,
        };
        Ok(Arc::new(TcpConnection {
            address: address.to_string(),
            role,
            runtime,
            listener: Mutex::new(listener),
            sink: Mutex::new(None),
            stream: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }))
    }
}

struct TcpConnection {
    address: String,
    role: Role,
    runtime: Runtime,
    listener: Mutex<Option<TcpListener>>,
    sink: Mutex<Option<SplitSink<FramedStream, Bytes>>>,
    stream: Mutex<Option<SplitStream<FramedStream>>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl TcpConnection {
    async fn connect(&self) -> Result<TcpStream> {
        match self.role {
            Role::Gate => {
                let listener = self.listener.lock().await.take();
                match listener {
                    Some(listener) => {
                        let (stream, _peer) = listener.accept().await?;
                        Ok(stream)
                    }
                    None => Err(HapiError::ConnectionLost(
                        "listener already used".to_string(),
                    )),
                }
            }
            Role::Plugin => Ok(TcpStream::connect(&self.address).await?),
        }
    }
}

impl Connection for TcpConnection {
    fn establish(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HapiError::Closed);
        }
        let stream = self.runtime.block_on(async {
            tokio::select! {
                _ = self.shutdown.notified() => Err(HapiError::Closed),
                res = self.connect() => res,
            }
        })?;
        stream.set_nodelay(true)?;
        let (sink, stream) = Framed::new(stream, HapiCodec).split();
        *self.sink.blocking_lock() = Some(sink);
        *self.stream.blocking_lock() = Some(stream);
        Ok(())
    }

    fn send(&self, packet: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HapiError::Closed);
        }
        self.runtime.block_on(async {
            let mut guard = self.sink.lock().await;
            match guard.as_mut() {
                Some(sink) => sink
                    .send(packet)
                    .await
                    .map_err(|e| HapiError::ConnectionLost(e.to_string())),
                None => Err(HapiError::ConnectionLost("not connected".to_string())),
            }
        })
    }

    fn receive(&self) -> Result<Option<Bytes>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.runtime.block_on(async {
            let mut guard = self.stream.lock().await;
            let stream = match guard.as_mut() {
                Some(stream) => stream,
                None => return Err(HapiError::ConnectionLost("not connected".to_string())),
            };
            tokio::select! {
                _ = self.shutdown.notified() => Ok(None),
                frame = stream.next() => match frame {
                    Some(Ok(packet)) => Ok(Some(packet)),
                    Some(Err(e)) => Err(HapiError::ConnectionLost(e.to_string())),
                    None => Err(HapiError::ConnectionLost(
                        "peer closed the connection".to_string(),
                    )),
                },
            }
        })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.notify_one();
        }
    }
}
