//! Bidirectional byte pump between two stream endpoints (§4.1).
//!
//! Generic over any `AsyncRead + AsyncWrite` pair, so the same implementation serves
//! both the SOCKS5 listener (local socket ↔ SSH `direct-tcpip` channel, the channel
//! wrapped as a plain stream via `russh::Channel::into_stream`) and the HTTP proxy
//! listener (local socket ↔ local socket dialed into the SOCKS5 listener). A native
//! accelerator, if ever added, would implement the same entry point and counter
//! contract (§9) — this is the pure-Rust strategy.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::debug;

use crate::stats::Stats;

const BUF_SIZE: usize = 64 * 1024;
const IDLE_POLL: Duration = Duration::from_secs(2);

/// Run the relay until either direction hits EOF/error, or `shutdown` fires.
///
/// Exits quietly on any I/O error (§4.1) — a proxied session failing is normal and is
/// never propagated to the caller. Accounts `a → b` bytes into `bytes_up` and `b → a`
/// bytes into `bytes_down`, and brackets the run with `Stats::connection_started`/
/// `connection_ended`.
pub async fn run<A, B>(a: A, b: B, stats: Arc<Stats>, mut shutdown: broadcast::Receiver<()>)
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (close_tx, _) = broadcast::channel::<()>(1);

    stats.connection_started();

    let up_stats = stats.clone();
    let mut up = tokio::spawn(pump(a_read, b_write, close_tx.subscribe(), move |n| up_stats.add_up(n)));
    let down_stats = stats.clone();
    let mut down = tokio::spawn(pump(b_read, a_write, close_tx.subscribe(), move |n| down_stats.add_down(n)));

    tokio::select! {
        _ = &mut up => {}
        _ = &mut down => {}
        _ = shutdown.recv() => {
            debug!("relay: shutdown signal received");
        }
    }

    let _ = close_tx.send(());
    let _ = up.await;
    let _ = down.await;

    stats.connection_ended();
}

async fn pump<R, W>(
    mut read: R,
    mut write: W,
    mut close_rx: broadcast::Receiver<()>,
    account: impl Fn(u64),
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        tokio::select! {
            biased;

            _ = close_rx.recv() => {
                debug!("relay: pump received close signal");
                break;
            }

            result = tokio::time::timeout(IDLE_POLL, read.read(&mut buf)) => {
                match result {
                    Ok(Ok(0)) => {
                        debug!("relay: EOF");
                        break;
                    }
                    Ok(Ok(n)) => {
                        account(n as u64);
                        if write.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(_)) => break,
                    // Transient idle timeout — not an exit condition, just a chance
                    // to notice the close signal promptly (§4.1).
                    Err(_) => continue,
                }
            }
        }
    }
    let _ = write.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client, (server, _)) = tokio::join!(connect, accept);
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn relays_bytes_both_directions_and_counts_them() {
        let (a_client, a_server) = loopback_pair().await;
        let (b_client, b_server) = loopback_pair().await;
        let stats = Stats::new();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let relay_stats = stats.clone();
        let relay = tokio::spawn(run(a_server, b_server, relay_stats, shutdown_rx));

        let mut a = a_client;
        let mut b = b_client;
        a.write_all(b"hello from a").await.unwrap();
        let mut buf = [0u8; 32];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from a");

        b.write_all(b"hi from b").await.unwrap();
        let n = a.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi from b");

        drop(a);
        drop(b);
        let _ = shutdown_tx.send(());
        relay.await.unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_up, "hello from a".len() as u64);
        assert_eq!(snapshot.bytes_down, "hi from b".len() as u64);
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.total, 1);
    }

    #[tokio::test]
    async fn shutdown_signal_stops_relay_promptly() {
        let (_a_client, a_server) = loopback_pair().await;
        let (_b_client, b_server) = loopback_pair().await;
        let stats = Stats::new();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let relay = tokio::spawn(run(a_server, b_server, stats, shutdown_rx));
        let _ = shutdown_tx.send(());

        tokio::time::timeout(Duration::from_secs(1), relay).await.expect("relay should exit promptly on shutdown").unwrap();
    }
}
