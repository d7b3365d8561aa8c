// Copyright 2020 Joyent, Inc.

//! In-process message bus.
//!
//! Queues are created on first use and outlive the connections reading
//! them, like queues on a broker: packets sent before the peer attaches
//! wait in the queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::error::{HapiError, Result};
use crate::transport::{Connection, Role, Transport};

enum Delivery {
    Packet(Bytes),
    /// Wakes the reader of the given connection after a local close.
    Closed(u64),
    /// Tells the reader of the given connection that its link broke.
    Broken(u64),
}

struct Queue {
    tx: UnboundedSender<Delivery>,
    rx: Mutex<UnboundedReceiver<Delivery>>,
    reader: Mutex<Option<u64>>,
}

impl Queue {
    fn new() -> Queue {
        let (tx, rx) = unbounded_channel();
        Queue {
            tx,
            rx: Mutex::new(rx),
            reader: Mutex::new(None),
        }
    }

    fn reader(&self) -> MutexGuard<'_, Option<u64>> {
        self.reader.lock()
    }
}

#[derive(Default)]
struct BusInner {
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    next_generation: AtomicU64,
}

/// A broker holding named queues. Clones share the same queues.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> MemoryBus {
        MemoryBus::default()
    }

    fn queue(&self, name: &str) -> Arc<Queue> {
        let mut queues = self.inner.queues.lock();
        Arc::clone(
            queues
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Queue::new())),
        )
    }

    /// Breaks every connection attached to `address`, as if the broker
    /// dropped them. Queued packets are kept.
    pub fn sever(&self, address: &str) {
        for role in &[Role::Gate, Role::Plugin] {
            let queue = self.queue(&role.inbox(address));
            let reader = queue.reader().take();
            if let Some(generation) = reader {
                let _ = queue.tx.send(Delivery::Broken(generation));
            }
        }
    }

    /// Connects a raw endpoint without any protocol on top. Useful for
    /// driving one side of a conversation by hand.
    pub fn connect(&self, address: &str, role: Role) -> Result<Arc<dyn Connection>> {
        let conn = self.open(address, role)?;
        conn.establish()?;
        Ok(conn)
    }
}

impl Transport for MemoryBus {
    fn open(&self, address: &str, role: Role) -> Result<Arc<dyn Connection>> {
        Ok(Arc::new(MemoryConnection {
            generation: self.inner.next_generation.fetch_add(1, Ordering::Relaxed),
            inbox: self.queue(&role.inbox(address)),
            outbox: self.queue(&role.outbox(address)),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    generation: u64,
    inbox: Arc<Queue>,
    outbox: Arc<Queue>,
    closed: AtomicBool,
}

impl Connection for MemoryConnection {
    fn establish(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HapiError::Closed);
        }
        *self.inbox.reader() = Some(self.generation);
        Ok(())
    }

    fn send(&self, packet: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HapiError::Closed);
        }
        self.outbox
            .tx
            .send(Delivery::Packet(packet))
            .map_err(|_| HapiError::ConnectionLost("queue is gone".to_string()))
    }

    fn receive(&self) -> Result<Option<Bytes>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut rx = self.inbox.rx.lock();
        loop {
            match rx.blocking_recv() {
                Some(Delivery::Packet(packet)) => return Ok(Some(packet)),
                Some(Delivery::Closed(g)) if g == self.generation => return Ok(None),
                Some(Delivery::Broken(g)) if g == self.generation => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(HapiError::ConnectionLost("severed by the bus".to_string()));
                }
                // markers left behind by earlier connections
                Some(_) => continue,
                None => return Err(HapiError::ConnectionLost("queue is gone".to_string())),
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut reader = self.inbox.reader();
            if *reader == Some(self.generation) {
                *reader = None;
            }
        }
        let _ = self.inbox.tx.send(Delivery::Closed(self.generation));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::thread;

    #[test]
    fn packets_cross_between_roles() {
        let bus = MemoryBus::new();
        let gate = bus.connect("q", Role::Gate).unwrap();
        let plugin = bus.connect("q", Role::Plugin).unwrap();

        plugin.send(Bytes::from_static(b"to gate")).unwrap();
        gate.send(Bytes::from_static(b"to plugin")).unwrap();
        assert_eq!(gate.receive().unwrap().unwrap(), Bytes::from_static(b"to gate"));
        assert_eq!(plugin.receive().unwrap().unwrap(), Bytes::from_static(b"to plugin"));
    }

    #[test]
    fn queued_packets_wait_for_reader() {
        let bus = MemoryBus::new();
        let plugin = bus.connect("q", Role::Plugin).unwrap();
        plugin.send(Bytes::from_static(b"early")).unwrap();

        let gate = bus.connect("q", Role::Gate).unwrap();
        assert_eq!(gate.receive().unwrap().unwrap(), Bytes::from_static(b"early"));
    }

    #[test]
    fn close_wakes_blocked_receive() {
        let bus = MemoryBus::new();
        let gate = bus.connect("q", Role::Gate).unwrap();
        let reader = Arc::clone(&gate);
        let handle = thread::spawn(move || reader.receive());
        gate.close();
        assert!(handle.join().unwrap().unwrap().is_none());
        assert!(gate.send(Bytes::new()).is_err());
    }

    #[test]
    fn sever_breaks_current_reader_only() {
        let bus = MemoryBus::new();
        let old = bus.connect("q", Role::Gate).unwrap();
        old.close();
        assert!(old.receive().unwrap().is_none());

        let gate = bus.connect("q", Role::Gate).unwrap();
        bus.sever("q");
        match gate.receive() {
            Err(HapiError::ConnectionLost(_)) => (),
            other => panic!("unexpected: {:?}", other),
        }

        // a fresh connection is not affected by the old markers
        let fresh = bus.connect("q", Role::Gate).unwrap();
        let plugin = bus.connect("q", Role::Plugin).unwrap();
        plugin.send(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(fresh.receive().unwrap().unwrap(), Bytes::from_static(b"hello"));
    }
}
