//! Local HTTP/HTTPS forward proxy (§4.4). Dials every upstream exclusively through the
//! local SOCKS5 listener, never directly over SSH — that keeps this listener ignorant
//! of SSH entirely and the SOCKS5 service the single chokepoint for traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::TunnelError;
use crate::relay;
use crate::stats::Stats;

const PREFACE_CAP: usize = 64 * 1024;
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_POLL: Duration = Duration::from_secs(1);
const SOCKS_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_AUTH_NONE: u8 = 0x00;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_IPV4: u8 = 0x01;
const SOCKS_ATYP_IPV6: u8 = 0x04;

pub struct HttpProxyListener {
    local_addr: std::net::SocketAddr,
    running: Arc<AtomicBool>,
}

impl HttpProxyListener {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn bind(
        port: u16,
        socks_port: u16,
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
                        debug!("http proxy listener on {} received shutdown", local_addr);
                        break;
                    }
                    accepted = tokio::time::timeout(ACCEPT_POLL, listener.accept()) => {
                        match accepted {
                            Ok(Ok((stream, peer))) => {
                                let _ = stream.set_nodelay(true);
                                debug!("http proxy: accepted connection from {}", peer);
                                let conn_shutdown = shutdown.resubscribe();
                                tokio::spawn(async move {
                                    if let Err(e) =
                                        tokio::time::timeout(CLIENT_TIMEOUT, handle_connection(stream, socks_port, conn_shutdown)).await
                                    {
                                        debug!("http proxy connection timed out: {:?}", e);
                                    }
                                });
                            }
                            Ok(Err(e)) => {
                                if running_clone.load(Ordering::SeqCst) {
                                    warn!("http proxy accept error: {}", e);
                                }
                            }
                            Err(_) => continue,
                        }
                    }
                }
            }
            debug!("http proxy listener on {} stopped", local_addr);
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
    mut client: TcpStream,
    socks_port: u16,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let preface = match read_until_headers_end(&mut client).await {
        Ok(p) => p,
        Err(_) => {
            let _ = client.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            return Ok(());
        }
    };

    let first_line_end = match preface.iter().position(|&b| b == b'\n') {
        Some(idx) => idx,
        None => {
            let _ = client.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            return Ok(());
        }
    };
    let first_line = String::from_utf8_lossy(&preface[..first_line_end]).trim_end().to_string();
    let mut parts = first_line.splitn(3, ' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
        _ => {
            let _ = client.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            return Ok(());
        }
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(client, &target, socks_port, shutdown).await
    } else {
        handle_plain(client, &method, &target, &version, &preface, socks_port, shutdown).await
    }
}

async fn handle_connect(
    mut client: TcpStream,
    target: &str,
    socks_port: u16,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let (host, port) = match parse_host_port(target, 443) {
        Some(hp) => hp,
        None => {
            client.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
            return Ok(());
        }
    };

    let upstream = match dial_via_socks5(socks_port, &host, port).await {
        Ok(s) => s,
        Err(e) => {
            debug!("http proxy: socks5 dial to {}:{} failed: {}", host, port, e);
            client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            return Ok(());
        }
    };

    client.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
    // The bytes relayed here are dialed back through the local SOCKS5 listener, which
    // is the single chokepoint for traffic accounting (§4.4) — this relay's own counter
    // is a throwaway sink so HTTP-proxied bytes aren't counted twice.
    relay::run(client, upstream, Stats::new(), shutdown).await;
    Ok(())
}

async fn handle_plain(
    mut client: TcpStream,
    method: &str,
    target: &str,
    version: &str,
    preface: &[u8],
    socks_port: u16,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let (host, port, path) = if let Some(rest) = target.strip_prefix("http://") {
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        match parse_host_port(authority, 80) {
            Some((h, p)) => (h, p, path.to_string()),
            None => {
                client.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
                return Ok(());
            }
        }
    } else {
        let header_str = String::from_utf8_lossy(preface);
        let host_header = header_str
            .split("\r\n")
            .find(|line| line.to_ascii_lowercase().starts_with("host:"))
            .and_then(|line| line.splitn(2, ':').nth(1))
            .map(|v| v.trim().to_string());

        match host_header.and_then(|h| parse_host_port(&h, 80)) {
            Some((h, p)) => (h, p, target.to_string()),
            None => {
                client.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
                return Ok(());
            }
        }
    };

    let mut upstream = match dial_via_socks5(socks_port, &host, port).await {
        Ok(s) => s,
        Err(e) => {
            debug!("http proxy: socks5 dial to {}:{} failed: {}", host, port, e);
            client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            return Ok(());
        }
    };

    let first_line_end = preface.iter().position(|&b| b == b'\n').unwrap_or(0) + 1;
    let mut rewritten = format!("{method} {path} {version}\r\n").into_bytes();
    rewritten.extend_from_slice(&preface[first_line_end..]);

    upstream.write_all(&rewritten).await?;

    // Not fed into the manager's shared Stats — see handle_connect.
    relay::run(client, upstream, Stats::new(), shutdown).await;
    Ok(())
}

/// Read into `buf` until the header terminator `\r\n\r\n`, capped at `PREFACE_CAP`.
async fn read_until_headers_end(stream: &mut TcpStream) -> Result<Vec<u8>, std::io::Error> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(buf);
        }
        if buf.len() >= PREFACE_CAP {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "request preface too large"));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed before headers"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Dial `host:port` through the local SOCKS5 listener using domain atyp, so DNS
/// resolution happens on the remote SSH host rather than locally. The reply is parsed
/// incrementally by `atyp` rather than guessing a fixed over-read size.
async fn dial_via_socks5(socks_port: u16, host: &str, port: u16) -> Result<TcpStream, std::io::Error> {
    tokio::time::timeout(SOCKS_DIAL_TIMEOUT, dial_via_socks5_inner(socks_port, host, port))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "socks5 dial timed out"))?
}

async fn dial_via_socks5_inner(socks_port: u16, host: &str, port: u16) -> Result<TcpStream, std::io::Error> {
    let mut sock = TcpStream::connect(("127.0.0.1", socks_port)).await?;

    sock.write_all(&[SOCKS_VERSION, 0x01, SOCKS_AUTH_NONE]).await?;
    let mut resp = [0u8; 2];
    sock.read_exact(&mut resp).await?;
    if resp != [SOCKS_VERSION, SOCKS_AUTH_NONE] {
        return Err(std::io::Error::new(std::io::ErrorKind::Other, "socks5 auth negotiation failed"));
    }

    let host_bytes = host.as_bytes();
    let mut req = vec![SOCKS_VERSION, SOCKS_CMD_CONNECT, 0x00, SOCKS_ATYP_DOMAIN, host_bytes.len() as u8];
    req.extend_from_slice(host_bytes);
    req.extend_from_slice(&port.to_be_bytes());
    sock.write_all(&req).await?;

    let mut header = [0u8; 4];
    sock.read_exact(&mut header).await?;
    if header[1] != 0x00 {
        return Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "socks5 connect rejected"));
    }

    let remaining = match header[3] {
        SOCKS_ATYP_IPV4 => 4 + 2,
        SOCKS_ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            sock.read_exact(&mut len_buf).await?;
            len_buf[0] as usize + 2
        }
        SOCKS_ATYP_IPV6 => 16 + 2,
        _ => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "unsupported socks5 reply atyp")),
    };
    let mut trailer = vec![0u8; remaining];
    sock.read_exact(&mut trailer).await?;

    Ok(sock)
}

/// Parse `host`, `host:port`, or bracketed `[ipv6]:port` into `(host, port)`. An empty
/// host is rejected; a malformed port component falls back to `default_port`.
fn parse_host_port(addr: &str, default_port: u16) -> Option<(String, u16)> {
    if addr.is_empty() {
        return None;
    }

    if let Some(rest) = addr.strip_prefix('[') {
        let bracket_end = rest.find(']')?;
        let host = rest[..bracket_end].to_string();
        if host.is_empty() {
            return None;
        }
        let after = &rest[bracket_end + 1..];
        let port = after.strip_prefix(':').and_then(|p| p.parse().ok()).unwrap_or(default_port);
        return Some((host, port));
    }

    match addr.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => {
            let port = port_str.parse().unwrap_or(default_port);
            Some((host.to_string(), port))
        }
        Some(_) => None,
        None => Some((addr.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_host() {
        assert_eq!(parse_host_port("example.com", 80), Some(("example.com".to_string(), 80)));
    }

    #[test]
    fn parses_host_with_port() {
        assert_eq!(parse_host_port("example.com:8080", 80), Some(("example.com".to_string(), 8080)));
    }

    #[test]
    fn parses_bracketed_ipv6() {
        assert_eq!(parse_host_port("[::1]:443", 80), Some(("::1".to_string(), 443)));
        assert_eq!(parse_host_port("[::1]", 80), Some(("::1".to_string(), 80)));
    }

    #[test]
    fn falls_back_to_default_port_on_malformed_port() {
        assert_eq!(parse_host_port("example.com:notaport", 80), Some(("example.com".to_string(), 80)));
    }

    #[test]
    fn rejects_empty_host() {
        assert_eq!(parse_host_port("", 80), None);
        assert_eq!(parse_host_port(":8080", 80), None);
    }
}
