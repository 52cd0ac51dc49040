//! Network transport for 3270 host connections
//!
//! A connection is a plain TCP stream that may be wrapped in TLS, either
//! from the start (`L:` host prefix) or in place after a telnet STARTTLS
//! exchange. Reads take a timeout so the controller can run its timers
//! between them.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, info, warn};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};

use crate::error::{NetworkError, NetworkResult};

/// Largest CA bundle we are willing to read
const MAX_CA_BUNDLE_BYTES: u64 = 10_000_000;

/// TLS settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// Extra trusted CAs (PEM or DER)
    pub ca_bundle_path: Option<PathBuf>,
}

impl TlsSettings {
    /// Build a client configuration trusting the bundled web roots, the
    /// platform store and any configured CA bundle. Certificate and host
    /// name verification always apply.
    pub fn client_config(&self) -> NetworkResult<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        match rustls_native_certs::load_native_certs() {
            Ok(certs) => {
                let (added, ignored) = roots.add_parsable_certificates(certs);
                debug!("TLS: {added} platform certificates loaded, {ignored} ignored");
            }
            Err(e) => debug!("TLS: platform certificate store unavailable: {e}"),
        }

        if let Some(path) = &self.ca_bundle_path {
            let certs = load_ca_bundle(path).map_err(|e| NetworkError::TlsError {
                message: format!("Failed to load CA bundle {}: {e}", path.display()),
            })?;
            let (added, _) = roots.add_parsable_certificates(certs);
            if added == 0 {
                return Err(NetworkError::TlsError {
                    message: format!("No valid certificates in CA bundle: {}", path.display()),
                });
            }
            info!("TLS: added {added} trusted CA certificates from {}", path.display());
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

/// Read certificates from a DER file or a PEM bundle
pub fn load_ca_bundle(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    if fs::metadata(path)?.len() > MAX_CA_BUNDLE_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Certificate bundle too large"));
    }
    let bytes = fs::read(path)?;

    let Ok(text) = std::str::from_utf8(&bytes) else {
        // Not text: a single DER certificate
        return Ok(vec![CertificateDer::from(bytes)]);
    };
    parse_pem_certificates(text)
}

/// Decode every `CERTIFICATE` block of a PEM text
pub fn parse_pem_certificates(text: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";

    let mut certs = Vec::new();
    let mut rest = text;
    while let Some(b) = rest.find(BEGIN) {
        let body = &rest[b + BEGIN.len()..];
        let Some(e) = body.find(END) else {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Unterminated PEM certificate"));
        };
        let b64: String = body[..e].lines().map(str::trim).collect();
        match BASE64.decode(b64.as_bytes()) {
            Ok(der) => certs.push(CertificateDer::from(der)),
            Err(err) => warn!("TLS: skipping undecodable certificate: {err}"),
        }
        rest = &body[e + END.len()..];
    }
    if certs.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "No certificates found in PEM bundle"));
    }
    Ok(certs)
}

/// The byte stream under the telnet framer
#[derive(Debug)]
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Transport {
    fn tcp(&self) -> &TcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::Tls(s) => &s.sock,
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

/// An open host connection
#[derive(Debug)]
pub struct HostConnection {
    transport: Option<Transport>,
    host: String,
    port: u16,
    tls: TlsSettings,
}

impl HostConnection {
    /// Resolve `host` and connect, starting TLS at once when `secure`
    pub fn connect(host: &str, port: u16, timeout: Duration, secure: bool, tls: TlsSettings) -> NetworkResult<Self> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|_| NetworkError::DnsResolution { host: host.to_string() })?
            .collect();
        if addrs.is_empty() {
            return Err(NetworkError::DnsResolution { host: host.to_string() });
        }

        let mut last_err = None;
        let mut tcp = None;
        for addr in &addrs {
            debug!("Trying {addr}");
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(s) => {
                    tcp = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let tcp = match (tcp, last_err) {
            (Some(s), _) => s,
            (None, Some(e)) => return Err(Self::connect_error(host, port, timeout, e)),
            (None, None) => return Err(NetworkError::InvalidAddress { address: format!("{host}:{port}") }),
        };
        tcp.set_nodelay(true)?;
        info!("Connected to {host}, port {port}");

        let mut conn = Self {
            transport: Some(Transport::Plain(tcp)),
            host: host.to_string(),
            port,
            tls,
        };
        if secure {
            conn.start_tls()?;
        }
        Ok(conn)
    }

    fn connect_error(host: &str, port: u16, timeout: Duration, e: io::Error) -> NetworkError {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => NetworkError::ConnectionRefused { host: host.to_string(), port },
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => NetworkError::Timeout {
                host: host.to_string(),
                port,
                timeout_seconds: timeout.as_secs(),
            },
            _ => NetworkError::ConnectionLost { reason: format!("{host}, port {port}: {e}") },
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.transport, Some(Transport::Tls(_)))
    }

    fn transport(&mut self) -> NetworkResult<&mut Transport> {
        self.transport.as_mut().ok_or_else(|| NetworkError::ConnectionLost {
            reason: "not connected".to_string(),
        })
    }

    /// Run the TLS handshake over the current TCP stream and switch to it
    pub fn start_tls(&mut self) -> NetworkResult<()> {
        let tcp = match self.transport.take() {
            Some(Transport::Plain(tcp)) => tcp,
            Some(tls @ Transport::Tls(_)) => {
                self.transport = Some(tls);
                return Ok(());
            }
            None => {
                return Err(NetworkError::ConnectionLost { reason: "not connected".to_string() });
            }
        };

        let config = self.tls.client_config()?;
        let name = ServerName::try_from(self.host.as_str())
            .map_err(|e| NetworkError::TlsError { message: format!("{}: {e}", self.host) })?
            .to_owned();
        let conn = ClientConnection::new(config, name).map_err(|e| NetworkError::TlsError { message: e.to_string() })?;
        let mut stream = StreamOwned::new(conn, tcp);
        while stream.conn.is_handshaking() {
            stream.conn.complete_io(&mut stream.sock).map_err(|e| NetworkError::TlsError {
                message: format!("handshake with {}: {e}", self.host),
            })?;
        }
        info!("TLS established with {}", self.host);
        self.transport = Some(Transport::Tls(Box::new(stream)));
        Ok(())
    }

    /// Read what is available, waiting at most `timeout`. `Ok(None)` means
    /// nothing arrived; `Ok(Some(0))` means the host closed the connection.
    pub fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> NetworkResult<Option<usize>> {
        let transport = self.transport()?;
        // A zero timeout would mean "block forever"
        transport.tcp().set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match transport.read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(NetworkError::ConnectionLost { reason: e.to_string() }),
        }
    }

    /// Send bytes
    pub fn send(&mut self, data: &[u8]) -> NetworkResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let transport = self.transport()?;
        transport.write_all(data)?;
        transport.flush()?;
        Ok(())
    }

    /// Close the connection
    pub fn disconnect(&mut self) {
        if let Some(transport) = self.transport.take() {
            if let Transport::Tls(mut s) = transport {
                s.conn.send_close_notify();
                let _ = s.conn.complete_io(&mut s.sock);
                let _ = s.sock.shutdown(Shutdown::Both);
            } else if let Transport::Plain(s) = transport {
                let _ = s.shutdown(Shutdown::Both);
            }
            debug!("Disconnected from {}", self.host);
        }
    }
}

impl Drop for HostConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use tempfile::NamedTempFile;

    #[test]
    fn test_plain_connect_send_and_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut conn =
            HostConnection::connect("127.0.0.1", port, Duration::from_secs(5), false, TlsSettings::default()).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        assert!(conn.is_open());
        assert!(!conn.is_secure());

        conn.send(&[0xFF, 0xFD, 0x18]).unwrap();
        let mut got = [0u8; 3];
        server.read_exact(&mut got).unwrap();
        assert_eq!(got, [0xFF, 0xFD, 0x18]);

        let mut buf = [0u8; 16];
        assert_eq!(conn.read_timeout(&mut buf, Duration::from_millis(20)).unwrap(), None);

        server.write_all(b"hi").unwrap();
        let n = conn.read_timeout(&mut buf, Duration::from_secs(5)).unwrap();
        assert_eq!(n, Some(2));

        drop(server);
        assert_eq!(conn.read_timeout(&mut buf, Duration::from_secs(5)).unwrap(), Some(0));
    }

    #[test]
    fn test_connection_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = HostConnection::connect("127.0.0.1", port, Duration::from_secs(5), false, TlsSettings::default())
            .unwrap_err();
        assert!(matches!(err, NetworkError::ConnectionRefused { .. }), "{err:?}");
    }

    #[test]
    fn test_send_after_disconnect_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut conn =
            HostConnection::connect("127.0.0.1", port, Duration::from_secs(5), false, TlsSettings::default()).unwrap();
        conn.disconnect();
        assert!(!conn.is_open());
        assert!(conn.send(b"x").is_err());
    }

    #[test]
    fn test_pem_parsing() {
        let pem = "junk\n-----BEGIN CERTIFICATE-----\nAAEC\nAw==\n-----END CERTIFICATE-----\n";
        let certs = parse_pem_certificates(pem).unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].as_ref(), &[0, 1, 2, 3]);

        assert!(parse_pem_certificates("no certificates here").is_err());
        assert!(parse_pem_certificates("-----BEGIN CERTIFICATE-----\nAAEC").is_err());
    }

    #[test]
    fn test_bad_ca_bundle_is_a_tls_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let settings = TlsSettings {
            ca_bundle_path: Some(file.path().to_path_buf()),
        };
        assert!(matches!(settings.client_config(), Err(NetworkError::TlsError { .. })));
    }
}
