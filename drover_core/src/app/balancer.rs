//! Accept load balancer.
//!
//! With a single worker, the accept loop lives in the worker itself. With
//! several workers all parked on one listening socket, every connection
//! would wake all of them and bursts would land unevenly; so in that
//! deployment this balancer is the sole owner of the listening socket and
//! deals accepted connections to the workers round robin.

use std::io;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, trace, warn};

use futures::FutureExt;

/// Upper bound on accepts processed per wakeup, so one burst cannot
/// monopolize the loop.
const ACCEPT_BURST_COUNT: usize = 16;
/// How long to pause accepting after an unexpected accept error.
const ACCEPT_ERROR_BACKOFF: std::time::Duration = std::time::Duration::from_secs(3);

/// Binds a listening socket with the options the core wants everywhere:
/// address reuse, non-blocking, a deep backlog.
pub fn bind_listener(address: &str) -> io::Result<TcpListener> {
    let addr: std::net::SocketAddr = address
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{}: {}", address, e)))?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Runs the balancer until the shutdown signal flips. Accepted connections
/// are configured (non-blocking is inherited, Nagle disabled) and fed to
/// workers in strict round-robin order.
pub async fn run_accept_balancer(
    listener: TcpListener,
    workers: Vec<mpsc::UnboundedSender<TcpStream>>,
    mut shutdown: watch::Receiver<bool>,
) {
    assert!(!workers.is_empty());
    let mut next_worker = 0usize;
    info!(workers = workers.len(), "accept load balancer running");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        dispatch(stream, &workers, &mut next_worker);
                        // Drain the burst without going back through the
                        // reactor, bounded so we cannot starve shutdown.
                        for _ in 1..ACCEPT_BURST_COUNT {
                            match listener.accept().now_or_never() {
                                Some(Ok((stream, _addr))) => {
                                    dispatch(stream, &workers, &mut next_worker);
                                }
                                Some(Err(err)) => {
                                    if !is_transient_accept_error(&err) {
                                        error!("cannot accept client: {}; stopping burst", err);
                                    }
                                    break;
                                }
                                None => break,
                            }
                        }
                    }
                    Err(err) if is_transient_accept_error(&err) => continue,
                    Err(err) => {
                        error!(
                            "cannot accept client: {}; pausing accepts for {:?}",
                            err, ACCEPT_ERROR_BACKOFF
                        );
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {
                                info!("resuming accepting new clients");
                            }
                        }
                    }
                }
            }
        }
    }
    info!("accept load balancer shut down");
}

fn dispatch(
    stream: TcpStream,
    workers: &[mpsc::UnboundedSender<TcpStream>],
    next_worker: &mut usize,
) {
    if let Err(err) = stream.set_nodelay(true) {
        warn!("cannot disable Nagle on accepted socket: {}", err);
    }
    trace!(worker = *next_worker, "feeding client to worker");
    if workers[*next_worker].send(stream).is_err() {
        warn!(worker = *next_worker, "worker is gone; dropping client");
    }
    *next_worker = (*next_worker + 1) % workers.len();
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
    )
}
