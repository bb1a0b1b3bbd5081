//! HTTP `CONNECT` tunnelling through a forward proxy.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::error::HandshakeError;
use crate::session::decorator::ProxySettings;

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Open a TCP stream to `host:port` through `proxy`.
pub async fn connect_via_proxy(
    proxy: &ProxySettings,
    host: &str,
    port: u16,
) -> Result<TcpStream, HandshakeError> {
    let mut stream = TcpStream::connect((proxy.host(), proxy.port()))
        .await
        .map_err(|err| HandshakeError::Proxy(format!("connect to {}: {err}", proxy.host())))?;

    let request = connect_request(proxy, host, port);
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|err| HandshakeError::Proxy(err.to_string()))?;

    let head = read_response_head(&mut stream).await?;
    let status = parse_status(&head)?;
    if status != 200 {
        return Err(HandshakeError::Proxy(format!("tunnel refused with status {status}")));
    }

    log::debug!("tunnel to {host}:{port} established via {}", proxy.host());
    Ok(stream)
}

fn connect_request(proxy: &ProxySettings, host: &str, port: u16) -> String {
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some(authorization) = proxy.authorization() {
        request.push_str("Proxy-Authorization: ");
        request.push_str(&authorization);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

// The peer stays silent after the response head until we speak, so reading in
// chunks cannot swallow tunnelled bytes.
async fn read_response_head(stream: &mut TcpStream) -> Result<String, HandshakeError> {
    let mut head = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| HandshakeError::Proxy(err.to_string()))?;
        if read == 0 {
            return Err(HandshakeError::Proxy("proxy closed the connection".into()));
        }
        head.extend_from_slice(&chunk[..read]);

        if let Some(end) = find_head_end(&head) {
            if end != head.len() {
                return Err(HandshakeError::Proxy("unexpected data after tunnel response".into()));
            }
            return String::from_utf8(head)
                .map_err(|_| HandshakeError::Proxy("tunnel response is not utf-8".into()));
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(HandshakeError::Proxy("tunnel response head too large".into()));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n").map(|pos| pos + 4)
}

fn parse_status(head: &str) -> Result<u16, HandshakeError> {
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/1.") => code
            .parse()
            .map_err(|_| HandshakeError::Proxy(format!("bad status line '{status_line}'"))),
        _ => Err(HandshakeError::Proxy(format!("bad status line '{status_line}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn request_carries_basic_auth() {
        let proxy = ProxySettings::parse("http://proxy.local:3128")
            .unwrap()
            .with_credentials("user", "secret");
        let request = connect_request(&proxy, "socket.example.com", 443);
        assert!(request.starts_with("CONNECT socket.example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpzZWNyZXQ=\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn status_parsing() {
        assert_eq!(parse_status("HTTP/1.1 200 Connection established\r\n\r\n").unwrap(), 200);
        assert_eq!(parse_status("HTTP/1.0 407 Proxy Authentication Required\r\n\r\n").unwrap(), 407);
        assert!(parse_status("SSH-2.0-OpenSSH\r\n\r\n").is_err());
    }

    async fn fake_proxy(reply: &'static [u8]) -> (ProxySettings, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let read = socket.read(&mut buf).await.unwrap();
            socket.write_all(reply).await.unwrap();
            String::from_utf8_lossy(&buf[..read]).into_owned()
        });
        let proxy = ProxySettings::parse(&format!("http://{addr}")).unwrap();
        (proxy, server)
    }

    #[tokio::test]
    async fn establishes_tunnel() {
        let (proxy, server) = fake_proxy(b"HTTP/1.1 200 Connection established\r\n\r\n").await;
        connect_via_proxy(&proxy, "socket.example.com", 443).await.unwrap();
        let seen = server.await.unwrap();
        assert!(seen.starts_with("CONNECT socket.example.com:443"));
    }

    #[tokio::test]
    async fn refused_tunnel_is_a_proxy_error() {
        let (proxy, _server) = fake_proxy(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await;
        let err = connect_via_proxy(&proxy, "socket.example.com", 443)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Proxy(_)));
    }
}
