use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

/// Serves one accepted connection.
#[async_trait::async_trait]
pub trait ConnHandler: Send + Sync + 'static {
    async fn handle(&self, conn: TcpStream, peer: SocketAddr) -> anyhow::Result<()>;
}

/// The set of active forwarder listeners, keyed by local port.
///
/// Each listener runs its own accept loop and each accepted connection runs
/// in its own task, so a failing connection never affects the listener or
/// its siblings.
#[derive(Debug)]
pub struct ListenerSet {
    addr: IpAddr,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    listeners: HashMap<u16, Listener>,

    /// Accept loops that have been told to stop but may still hold their
    /// socket.
    closing: HashMap<u16, JoinHandle<()>>,
}

type HandlerSlot = Arc<RwLock<Arc<dyn ConnHandler>>>;

struct Listener {
    stop: CancellationToken,
    handler: HandlerSlot,
    task: JoinHandle<()>,
}

// === impl ListenerSet ===

impl ListenerSet {
    pub fn new(addr: IpAddr) -> Self {
        Self {
            addr,
            state: Mutex::new(State::default()),
        }
    }

    /// Starts accepting connections on `port` with `handler`. If the port is
    /// already being served, its handler is replaced and new connections use
    /// it.
    ///
    /// If the port was closed recently, the new listener binds once the old
    /// accept loop has released the socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen(&self, port: u16, handler: Arc<dyn ConnHandler>) -> std::io::Result<()> {
        let mut state = self.state.lock();
        if let Some(listener) = state.listeners.get(&port) {
            *listener.handler.write() = handler;
            return Ok(());
        }
        state.closing.retain(|_, task| !task.is_finished());

        let addr = SocketAddr::new(self.addr, port);
        let slot: HandlerSlot = Arc::new(RwLock::new(handler));
        let stop = CancellationToken::new();
        let span = info_span!("listener", port);
        // Binding while holding the lock makes concurrent listens on the same
        // port race-free.
        let task = match bind(addr) {
            Ok(listener) => {
                state.closing.remove(&port);
                tokio::spawn(accept(listener, slot.clone(), stop.clone()).instrument(span))
            }
            Err(error) => {
                let Some(closing) = state.closing.remove(&port) else {
                    return Err(error);
                };
                let (slot, stop) = (slot.clone(), stop.clone());
                tokio::spawn(
                    async move {
                        let _ = closing.await;
                        match bind(addr) {
                            Ok(listener) => accept(listener, slot, stop).await,
                            Err(error) => tracing::warn!(%error, "Failed to listen"),
                        }
                    }
                    .instrument(span),
                )
            }
        };
        state.listeners.insert(
            port,
            Listener {
                stop,
                handler: slot,
                task,
            },
        );
        tracing::info!(port, "Listening");
        Ok(())
    }

    /// Stops the listener on `port`, if any. Returns whether a listener was
    /// running. Connections already accepted are left to finish.
    pub fn close(&self, port: u16) -> bool {
        let mut state = self.state.lock();
        match state.listeners.remove(&port) {
            Some(Listener { stop, task, .. }) => {
                stop.cancel();
                state.closing.insert(port, task);
                tracing::info!(port, "Closed listener");
                true
            }
            None => false,
        }
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.state.lock().listeners.contains_key(&port)
    }

    pub fn ports(&self) -> Vec<u16> {
        let mut ports = self
            .state
            .lock()
            .listeners
            .keys()
            .copied()
            .collect::<Vec<_>>();
        ports.sort_unstable();
        ports
    }
}

impl Drop for ListenerSet {
    fn drop(&mut self) {
        for (_, listener) in self.state.get_mut().listeners.drain() {
            listener.stop.cancel();
        }
    }
}

// === impl Listener ===

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("stopped", &self.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

async fn accept(listener: TcpListener, handler: HandlerSlot, stop: CancellationToken) {
    loop {
        let (conn, peer) = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(error) => {
                    // Usually fd exhaustion; back off rather than spin.
                    tracing::warn!(%error, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let handler = handler.read().clone();
        tokio::spawn(
            async move {
                tracing::debug!("Accepted");
                match handler.handle(conn, peer).await {
                    Ok(()) => tracing::debug!("Connection closed"),
                    Err(error) => tracing::info!(error = %format_args!("{error:#}"), "Connection failed"),
                }
            }
            .instrument(info_span!("conn", %peer)),
        );
    }
    tracing::debug!("Stopped accepting");
}
