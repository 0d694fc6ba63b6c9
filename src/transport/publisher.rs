use std::{
    io,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use super::{Endpoint, TransportError, write_message};

/// Messages queued per subscriber before new ones are dropped for it.
pub const DEFAULT_HIGH_WATER_MARK: usize = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    /// Per-subscriber enqueues, so one message to three subscribers counts three.
    pub delivered: u64,
    pub dropped: u64,
}

struct SubscriberLink {
    peer: SocketAddr,
    queue: Option<Sender<Arc<[u8]>>>,
    stream: TcpStream,
    writer: Option<JoinHandle<()>>,
}

impl Drop for SubscriberLink {
    fn drop(&mut self) {
        // Closing the queue ends the writer once it finishes its current
        // message; shutting the socket unblocks a write to a stalled peer.
        self.queue.take();
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                log::warn!("writer thread for {} panicked", self.peer);
            }
        }
    }
}

/// Broadcasting end of the transport.
///
/// [`Publisher::publish`] never blocks on a subscriber: it accepts any
/// pending connections and offers the message to every subscriber queue.
pub struct Publisher {
    listener: TcpListener,
    links: Vec<SubscriberLink>,
    high_water_mark: usize,
    stats: PublishStats,
}

impl Publisher {
    pub fn bind(endpoint: &Endpoint, high_water_mark: usize) -> Result<Self, TransportError> {
        let addr = endpoint.socket_addr();
        let listener =
            TcpListener::bind(&addr).map_err(|source| TransportError::Bind { addr, source })?;
        listener.set_nonblocking(true)?;
        log::info!("publishing on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            links: Vec::new(),
            high_water_mark: high_water_mark.max(1),
            stats: PublishStats::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn subscriber_count(&self) -> usize {
        self.links.len()
    }

    pub fn stats(&self) -> PublishStats {
        self.stats
    }

    /// Offers `payload` to every connected subscriber and returns how many
    /// accepted it. Zero subscribers is not an error.
    pub fn publish(&mut self, payload: &[u8]) -> usize {
        self.accept_pending();

        let message: Arc<[u8]> = Arc::from(payload);
        let mut delivered = 0u64;
        let mut dropped = 0u64;
        self.links.retain(|link| {
            let Some(queue) = link.queue.as_ref() else {
                return false;
            };
            match queue.try_send(Arc::clone(&message)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    log::trace!("subscriber {} is behind, message dropped", link.peer);
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    log::info!("subscriber {} disconnected", link.peer);
                    false
                }
            }
        });

        self.stats.published += 1;
        self.stats.delivered += delivered;
        self.stats.dropped += dropped;
        delivered as usize
    }

    /// Accepts every connection waiting on the listener.
    pub fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.attach(stream, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("failed to accept subscriber: {err:?}");
                    break;
                }
            }
        }
    }

    fn attach(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = stream.set_nonblocking(false) {
            log::warn!("dropping subscriber {peer}: {err:?}");
            return;
        }
        let _ = stream.set_nodelay(true);
        let handle = match stream.try_clone() {
            Ok(handle) => handle,
            Err(err) => {
                log::warn!("dropping subscriber {peer}: {err:?}");
                return;
            }
        };

        let (queue, pending) = bounded(self.high_water_mark);
        let writer = thread::Builder::new()
            .name(format!("publisher-{peer}"))
            .spawn(move || write_loop(stream, pending, peer));
        let writer = match writer {
            Ok(writer) => writer,
            Err(err) => {
                log::warn!("failed to spawn writer for {peer}: {err:?}");
                return;
            }
        };

        log::info!("subscriber connected: {peer}");
        self.links.push(SubscriberLink {
            peer,
            queue: Some(queue),
            stream: handle,
            writer: Some(writer),
        });
    }

    /// Disconnects every subscriber and releases the port.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        let count = self.links.len();
        self.links.clear();
        log::info!(
            "publisher closed ({count} subscribers, {} published, {} dropped)",
            self.stats.published, self.stats.dropped
        );
    }
}

fn write_loop(mut stream: TcpStream, pending: Receiver<Arc<[u8]>>, peer: SocketAddr) {
    while let Ok(message) = pending.recv() {
        if let Err(err) = write_message(&mut stream, &message) {
            log::debug!("write to {peer} failed: {err}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::TcpStream,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::transport::read_message;

    fn loopback() -> Publisher {
        Publisher::bind(&Endpoint::remote("127.0.0.1", 0), 2).unwrap()
    }

    fn wait_for_subscribers(publisher: &mut Publisher, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while publisher.subscriber_count() < count && Instant::now() < deadline {
            publisher.accept_pending();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(publisher.subscriber_count(), count);
    }

    #[test]
    fn publishing_without_subscribers_is_a_no_op() {
        let mut publisher = loopback();
        assert_eq!(publisher.publish(b"nobody listening"), 0);
        assert_eq!(publisher.stats().published, 1);
        assert_eq!(publisher.stats().delivered, 0);
    }

    #[test]
    fn delivers_payload_unchanged() {
        let mut publisher = loopback();
        let mut client = TcpStream::connect(publisher.local_addr().unwrap()).unwrap();
        wait_for_subscribers(&mut publisher, 1);

        assert_eq!(publisher.publish(b"\xff\xd8jpeg bytes"), 1);
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(read_message(&mut client).unwrap(), b"\xff\xd8jpeg bytes");
    }

    #[test]
    fn stalled_subscriber_loses_messages_without_blocking() {
        let mut publisher = loopback();
        let _client = TcpStream::connect(publisher.local_addr().unwrap()).unwrap();
        wait_for_subscribers(&mut publisher, 1);

        // Large enough to fill the socket buffers of a reader that never reads.
        let payload = vec![7u8; 4 * 1024 * 1024];
        let started = Instant::now();
        for _ in 0..16 {
            publisher.publish(&payload);
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(publisher.stats().dropped > 0);
    }

    #[test]
    fn departed_subscriber_is_removed() {
        let mut publisher = loopback();
        let client = TcpStream::connect(publisher.local_addr().unwrap()).unwrap();
        wait_for_subscribers(&mut publisher, 1);
        drop(client);

        let deadline = Instant::now() + Duration::from_secs(5);
        while publisher.subscriber_count() > 0 && Instant::now() < deadline {
            publisher.publish(b"ping");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
