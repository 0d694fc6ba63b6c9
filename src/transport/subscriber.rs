use std::{
    net::{Shutdown, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use super::{Endpoint, TransportError, read_message};

/// Messages buffered on the receiving side; when full, the oldest is discarded.
pub const DEFAULT_QUEUE_DEPTH: usize = 4;

const RECONNECT_MIN: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(2);

/// Receiving end of the transport.
///
/// A background reader pulls messages off the socket into a bounded queue
/// that keeps the newest messages, and transparently reconnects if the publisher goes away. Only the first
/// connection attempt is reported to the caller.
pub struct Subscriber {
    endpoint: Endpoint,
    messages: Receiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
    socket: Arc<Mutex<Option<TcpStream>>>,
    reader: Option<JoinHandle<()>>,
}

impl Subscriber {
    pub fn connect(endpoint: &Endpoint, queue_depth: usize) -> Result<Self, TransportError> {
        let addr = endpoint.socket_addr();
        let stream =
            TcpStream::connect(&addr).map_err(|source| TransportError::Connect { addr, source })?;
        let _ = stream.set_nodelay(true);
        log::info!("subscribed to {endpoint}");

        let socket = Arc::new(Mutex::new(Some(stream.try_clone()?)));
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, messages) = bounded(queue_depth.max(1));

        let reader = {
            let endpoint = endpoint.clone();
            let stop = Arc::clone(&stop);
            let socket = Arc::clone(&socket);
            let overflow = messages.clone();
            thread::Builder::new()
                .name("subscriber".into())
                .spawn(move || read_loop(stream, endpoint, tx, overflow, stop, socket))?
        };

        Ok(Self {
            endpoint: endpoint.clone(),
            messages,
            stop,
            socket,
            reader: Some(reader),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.messages.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => TransportError::Timeout,
            RecvTimeoutError::Disconnected => TransportError::Closed,
        })
    }

    /// Waits for a message, then skips ahead to the newest one already queued.
    pub fn recv_latest(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut latest = self.recv_timeout(timeout)?;
        while let Ok(newer) = self.messages.try_recv() {
            latest = newer;
        }
        Ok(latest)
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Ok(mut socket) = self.socket.lock() {
            if let Some(stream) = socket.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                log::warn!("subscriber reader thread panicked");
            }
        }
        log::info!("unsubscribed from {}", self.endpoint);
    }
}

fn read_loop(
    mut stream: TcpStream,
    endpoint: Endpoint,
    tx: Sender<Vec<u8>>,
    overflow: Receiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
    socket: Arc<Mutex<Option<TcpStream>>>,
) {
    loop {
        match read_message(&mut stream) {
            Ok(message) => match tx.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => {
                    let _ = overflow.try_recv();
                    let _ = tx.try_send(message);
                }
                Err(TrySendError::Disconnected(_)) => return,
            },
            Err(err) => {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                log::warn!("lost connection to {endpoint}: {err}");
                let Some(fresh) = reconnect(&endpoint, &stop) else {
                    return;
                };
                if let Ok(mut guard) = socket.lock() {
                    *guard = fresh.try_clone().ok();
                }
                // Drop may have run between the reconnect and the swap above.
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                stream = fresh;
            }
        }
    }
}

fn reconnect(endpoint: &Endpoint, stop: &AtomicBool) -> Option<TcpStream> {
    let addr = endpoint.socket_addr();
    let mut delay = RECONNECT_MIN;
    while !stop.load(Ordering::SeqCst) {
        thread::sleep(delay);
        match TcpStream::connect(&addr) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                log::info!("reconnected to {endpoint}");
                return Some(stream);
            }
            Err(err) => {
                log::debug!("reconnect to {endpoint} failed: {err}");
                delay = (delay * 2).min(RECONNECT_MAX);
            }
        }
    }
    None
}
