//! Local SOCKS5 proxy (§4.3): accepts CONNECT-only, no-auth SOCKS5 clients per RFC 1928
//! and relays each accepted connection through the SSH session's `direct-tcpip` channel.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::TunnelError;
use crate::relay;
use crate::ssh::SshSession;
use crate::stats::Stats;

const VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_CONN_REFUSED: u8 = 0x05;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_POLL: Duration = Duration::from_secs(1);

pub struct Socks5Listener {
    local_addr: std::net::SocketAddr,
    running: Arc<AtomicBool>,
}

impl Socks5Listener {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Bind and start accepting. The returned listener's accept loop runs until `stop()`
    /// is called or `shutdown` fires; both are observed within one 1 s accept poll.
    pub async fn bind(
        port: u16,
        session: Arc<SshSession>,
        stats: Arc<Stats>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<Self, TunnelError> {
        let addr = format!("127.0.0.1:{port}");
        let listener = TcpListener::bind(&addr).await.map_err(|e| bind_error(&addr, e))?;
        let local_addr = listener.local_addr().map_err(|e| TunnelError::BindFailed { addr, reason: e.to_string() })?;

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        tokio::spawn(async move {
            loop {
                if !running_clone.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("socks5 listener on {} received shutdown", local_addr);
                        break;
                    }
                    accepted = tokio::time::timeout(ACCEPT_POLL, listener.accept()) => {
                        match accepted {
                            Ok(Ok((stream, peer))) => {
                                let _ = stream.set_nodelay(true);
                                debug!("socks5: accepted connection from {}", peer);
                                let session = session.clone();
                                let stats = stats.clone();
                                let conn_shutdown = shutdown.resubscribe();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, session, stats, conn_shutdown).await {
                                        debug!("socks5 connection error: {}", e);
                                    }
                                });
                            }
                            Ok(Err(e)) => {
                                if running_clone.load(Ordering::SeqCst) {
                                    warn!("socks5 accept error: {}", e);
                                }
                            }
                            Err(_) => continue,
                        }
                    }
                }
            }
            debug!("socks5 listener on {} stopped", local_addr);
        });

        Ok(Self { local_addr, running })
    }
}

fn bind_error(addr: &str, e: std::io::Error) -> TunnelError {
    let reason = match e.kind() {
        std::io::ErrorKind::AddrInUse => format!("port already in use: {addr}"),
        std::io::ErrorKind::PermissionDenied => {
            format!("permission denied binding {addr} (ports below 1024 require elevated privileges)")
        }
        std::io::ErrorKind::AddrNotAvailable => format!("address not available: {addr}"),
        _ => e.to_string(),
    };
    TunnelError::BindFailed { addr: addr.to_string(), reason }
}

async fn handle_connection(
    mut stream: TcpStream,
    session: Arc<SshSession>,
    stats: Arc<Stats>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), TunnelError> {
    negotiate_auth(&mut stream).await?;
    let (dest_host, dest_port) = match read_request(&mut stream).await {
        Ok(dest) => dest,
        Err(RequestError::UnsupportedCommand) => {
            send_reply(&mut stream, REP_CMD_NOT_SUPPORTED).await?;
            return Ok(());
        }
        Err(RequestError::UnsupportedAddressType) => {
            send_reply(&mut stream, REP_ADDR_NOT_SUPPORTED).await?;
            return Ok(());
        }
        Err(RequestError::Io(e)) => return Err(e.into()),
    };

    debug!("socks5: connecting to {}:{}", dest_host, dest_port);

    let channel = match session.open_channel(&dest_host, dest_port, CHANNEL_OPEN_TIMEOUT).await {
        Ok(ch) => ch,
        Err(e) => {
            debug!("socks5: channel open to {}:{} failed: {}", dest_host, dest_port, e);
            send_reply(&mut stream, REP_CONN_REFUSED).await?;
            return Ok(());
        }
    };

    send_reply(&mut stream, REP_SUCCESS).await?;

    relay::run(stream, channel.into_stream(), stats, shutdown).await;
    Ok(())
}

async fn negotiate_auth(stream: &mut TcpStream) -> Result<(), TunnelError> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(io_err("unsupported socks version"));
    }
    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[VERSION, 0xFF]).await.ok();
        return Err(io_err("client does not offer no-auth method"));
    }
    stream.write_all(&[VERSION, AUTH_NONE]).await?;
    Ok(())
}

enum RequestError {
    UnsupportedCommand,
    UnsupportedAddressType,
    Io(std::io::Error),
}

impl From<std::io::Error> for RequestError {
    fn from(e: std::io::Error) -> Self {
        RequestError::Io(e)
    }
}

async fn read_request(stream: &mut TcpStream) -> Result<(String, u16), RequestError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(io_err("invalid socks5 version in request").into());
    }
    if header[1] != CMD_CONNECT {
        return Err(RequestError::UnsupportedCommand);
    }

    match header[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok((ip.to_string(), port))
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await?;
            let mut buf = vec![0u8; len_buf[0] as usize + 2];
            stream.read_exact(&mut buf).await?;
            let domain_len = len_buf[0] as usize;
            let domain = String::from_utf8_lossy(&buf[..domain_len]).into_owned();
            let port = u16::from_be_bytes([buf[domain_len], buf[domain_len + 1]]);
            Ok((domain, port))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok((ip.to_string(), port))
        }
        _ => Err(RequestError::UnsupportedAddressType),
    }
}

async fn send_reply(stream: &mut TcpStream, status: u8) -> Result<(), TunnelError> {
    let reply = [VERSION, status, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await?;
    Ok(())
}

fn io_err(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client, (server, _)) = tokio::join!(connect, accept);
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn negotiates_no_auth() {
        let (mut client, mut server) = loopback_pair().await;
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        negotiate_auth(&mut server).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [VERSION, AUTH_NONE]);
    }

    #[tokio::test]
    async fn rejects_client_without_no_auth_method() {
        let (mut client, mut server) = loopback_pair().await;
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        assert!(negotiate_auth(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn parses_ipv4_connect_request() {
        let (mut client, mut server) = loopback_pair().await;
        client.write_all(&[0x05, CMD_CONNECT, 0x00, ATYP_IPV4, 93, 184, 216, 34, 0x00, 0x50]).await.unwrap();
        let (host, port) = read_request(&mut server).await.ok().unwrap();
        assert_eq!(host, "93.184.216.34");
        assert_eq!(port, 80);
    }

    #[tokio::test]
    async fn parses_domain_connect_request() {
        let (mut client, mut server) = loopback_pair().await;
        let domain = b"example.com";
        let mut req = vec![0x05, CMD_CONNECT, 0x00, ATYP_DOMAIN, domain.len() as u8];
        req.extend_from_slice(domain);
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();
        let (host, port) = read_request(&mut server).await.ok().unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);
    }

    #[tokio::test]
    async fn parses_ipv6_connect_request() {
        let (mut client, mut server) = loopback_pair().await;
        let mut req = vec![0x05, CMD_CONNECT, 0x00, ATYP_IPV6];
        req.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();
        let (host, port) = read_request(&mut server).await.ok().unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 443);
    }

    #[tokio::test]
    async fn rejects_unsupported_command() {
        let (mut client, mut server) = loopback_pair().await;
        client.write_all(&[0x05, 0x02, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]).await.unwrap();
        let result = read_request(&mut server).await;
        assert!(matches!(result, Err(RequestError::UnsupportedCommand)));
    }

    #[tokio::test]
    async fn rejects_unknown_address_type() {
        let (mut client, mut server) = loopback_pair().await;
        client.write_all(&[0x05, CMD_CONNECT, 0x00, 0x7F]).await.unwrap();
        let result = read_request(&mut server).await;
        assert!(matches!(result, Err(RequestError::UnsupportedAddressType)));
    }

    #[tokio::test]
    async fn send_reply_writes_canonical_success_reply() {
        let (mut client, mut server) = loopback_pair().await;
        send_reply(&mut server, REP_SUCCESS).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [VERSION, REP_SUCCESS, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]);
    }
}
