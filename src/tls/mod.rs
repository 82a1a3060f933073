//! TLS configuration and handshake plumbing
//!
//! Thin builders over an openssl `SslContext`, covering what the engine
//! needs: certificate/key loading, peer verification toggles and ALPN.
//! Handshakes run while the socket is still blocking; the session switches
//! it to non-blocking afterwards.

use std::fs::File;
use std::io::Read;
use std::net::TcpStream;
use std::path::Path;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslStream, SslVerifyMode};
use openssl::x509::{X509NameBuilder, X509};

use crate::{Error, Result};

/// The ALPN protocol id for HTTP/2 over TLS.
pub const ALPN_H2: &str = "h2";

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    is_server: bool,
}

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> ClientTlsBuilder {
        ClientTlsBuilder::new()
    }

    /// Create a new server configuration builder
    pub fn server() -> ServerTlsBuilder {
        ServerTlsBuilder::new()
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Run the client handshake on a connected stream.
    pub(crate) fn connect(
        &self,
        stream: TcpStream,
        servername: Option<&str>,
    ) -> Result<SslStream<TcpStream>> {
        if self.is_server {
            return Err(Error::Handshake(
                "cannot use a server config for a client connection".to_string(),
            ));
        }
        let mut ssl = Ssl::new(&self.ctx)?;
        if let Some(name) = servername {
            ssl.set_hostname(name)?;
        }
        ssl.connect(stream)
            .map_err(|e| Error::Handshake(format!("connect failed: {}", e)))
    }

    /// Run the server handshake on an accepted stream.
    pub(crate) fn accept(&self, stream: TcpStream) -> Result<SslStream<TcpStream>> {
        if !self.is_server {
            return Err(Error::Handshake(
                "cannot use a client config for a server accept".to_string(),
            ));
        }
        let ssl = Ssl::new(&self.ctx)?;
        ssl.accept(stream)
            .map_err(|e| Error::Handshake(format!("accept failed: {}", e)))
    }
}

/// Whether the handshake negotiated `h2` via ALPN.
pub(crate) fn alpn_h2_selected(stream: &SslStream<TcpStream>) -> bool {
    stream.ssl().selected_alpn_protocol() == Some(ALPN_H2.as_bytes())
}

fn encode_alpn(protocols: &[&str]) -> Vec<u8> {
    let mut wire = Vec::new();
    for proto in protocols {
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    wire
}

/// Client configuration builder
pub struct ClientTlsBuilder {
    ctx_builder: SslContextBuilder,
}

impl ClientTlsBuilder {
    fn new() -> Self {
        let mut ctx_builder =
            SslContextBuilder::new(SslMethod::tls_client()).expect("Failed to create SSL context");
        // peer verification is off by default
        ctx_builder.set_verify(SslVerifyMode::NONE);
        ClientTlsBuilder { ctx_builder }
    }

    /// Enable/disable peer certificate verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.ctx_builder.set_verify(if verify {
            SslVerifyMode::PEER
        } else {
            SslVerifyMode::NONE
        });
        self
    }

    /// Trust anchors for peer verification, as a PEM file
    pub fn ca_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.ctx_builder.set_ca_file(path.as_ref())?;
        Ok(self)
    }

    /// Advertise ALPN protocols, most preferred first
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self> {
        self.ctx_builder.set_alpn_protos(&encode_alpn(protocols))?;
        Ok(self)
    }

    /// Advertise `h2`
    pub fn alpn_h2(self) -> Result<Self> {
        self.alpn(&[ALPN_H2])
    }

    /// Build the TLS configuration
    pub fn build(self) -> TlsConfig {
        TlsConfig {
            ctx: self.ctx_builder.build(),
            is_server: false,
        }
    }
}

/// Server configuration builder
pub struct ServerTlsBuilder {
    ctx_builder: SslContextBuilder,
    has_cert: bool,
}

impl ServerTlsBuilder {
    fn new() -> Self {
        let ctx_builder =
            SslContextBuilder::new(SslMethod::tls_server()).expect("Failed to create SSL context");
        ServerTlsBuilder {
            ctx_builder,
            has_cert: false,
        }
    }

    /// Load the certificate chain and private key from one PEM bundle
    pub fn cert_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let mut pem = Vec::new();
        File::open(path.as_ref())?.read_to_end(&mut pem)?;
        let cert = X509::from_pem(&pem)
            .map_err(|e| Error::Handshake(format!("failed to load certificate: {}", e)))?;
        let key = PKey::private_key_from_pem(&pem)
            .map_err(|e| Error::Handshake(format!("failed to load private key: {}", e)))?;
        self.ctx_builder.set_certificate(&cert)?;
        self.ctx_builder.set_private_key(&key)?;
        self.has_cert = true;
        Ok(self)
    }

    /// Use an in-memory certificate and key
    pub fn cert(mut self, cert: &X509, key: &PKey<Private>) -> Result<Self> {
        self.ctx_builder.set_certificate(cert)?;
        self.ctx_builder.set_private_key(key)?;
        self.has_cert = true;
        Ok(self)
    }

    /// Offer ALPN protocols; the first client match wins
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self> {
        let offered: Vec<Vec<u8>> = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
        self.ctx_builder
            .set_alpn_select_callback(move |_ssl, client_protos| {
                let mut pos = 0;
                while pos < client_protos.len() {
                    let len = client_protos[pos] as usize;
                    pos += 1;
                    if pos + len > client_protos.len() {
                        break;
                    }
                    let client_proto = &client_protos[pos..pos + len];
                    if offered.iter().any(|p| p.as_slice() == client_proto) {
                        return Ok(client_proto);
                    }
                    pos += len;
                }
                Err(openssl::ssl::AlpnError::NOACK)
            });
        Ok(self)
    }

    /// Offer `h2`
    pub fn alpn_h2(self) -> Result<Self> {
        self.alpn(&[ALPN_H2])
    }

    /// Build the TLS configuration; without a loaded certificate a
    /// self-signed one is generated so test servers need no key material
    pub fn build(mut self) -> Result<TlsConfig> {
        if !self.has_cert {
            let (cert, key) = self_signed_cert("localhost")?;
            self.ctx_builder.set_certificate(&cert)?;
            self.ctx_builder.set_private_key(&key)?;
        }
        Ok(TlsConfig {
            ctx: self.ctx_builder.build(),
            is_server: true,
        })
    }
}

/// Generate a throwaway self-signed certificate for the given common name.
pub fn self_signed_cert(common_name: &str) -> Result<(X509, PKey<Private>)> {
    let rsa = Rsa::generate(2048)?;
    let key = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(365)?;
    builder.set_not_after(&not_after)?;
    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.sign(&key, MessageDigest::sha256())?;
    Ok((builder.build(), key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::listen_stream;
    use std::io::{Read, Write};
    use std::thread;

    #[test]
    fn test_handshake_and_data() {
        let listener = listen_stream("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_cfg = TlsConfig::server().build().unwrap();
        let client_cfg = TlsConfig::client().build();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut tls = server_cfg.accept(stream).unwrap();
            let mut buf = [0u8; 5];
            tls.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hello");
            tls.write_all(b"world").unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut tls = client_cfg.connect(stream, Some("localhost")).unwrap();
        tls.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        tls.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
        handle.join().unwrap();
    }

    #[test]
    fn test_alpn_h2_negotiated() {
        let listener = listen_stream("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_cfg = TlsConfig::server().alpn_h2().unwrap().build().unwrap();
        let client_cfg = TlsConfig::client().alpn_h2().unwrap().build();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let tls = server_cfg.accept(stream).unwrap();
            assert!(alpn_h2_selected(&tls));
        });

        let stream = TcpStream::connect(addr).unwrap();
        let tls = client_cfg.connect(stream, None).unwrap();
        assert!(alpn_h2_selected(&tls));
        handle.join().unwrap();
    }

    #[test]
    fn test_alpn_no_h2_offer_leaves_it_unselected() {
        let listener = listen_stream("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // server only offers http/1.1
        let server_cfg = TlsConfig::server()
            .alpn(&["http/1.1"])
            .unwrap()
            .build()
            .unwrap();
        let client_cfg = TlsConfig::client()
            .alpn(&[ALPN_H2, "http/1.1"])
            .unwrap()
            .build();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let tls = server_cfg.accept(stream).unwrap();
            assert!(!alpn_h2_selected(&tls));
        });

        let stream = TcpStream::connect(addr).unwrap();
        let tls = client_cfg.connect(stream, None).unwrap();
        assert!(!alpn_h2_selected(&tls));
        assert_eq!(
            tls.ssl().selected_alpn_protocol(),
            Some("http/1.1".as_bytes())
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_config_direction_mismatch_rejected() {
        let server_cfg = TlsConfig::server().build().unwrap();
        let client_cfg = TlsConfig::client().build();
        let listener = listen_stream("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        assert!(server_cfg.connect(stream, None).is_err());
        let stream2 = TcpStream::connect(addr).unwrap();
        assert!(client_cfg.accept(stream2).is_err());
    }
}
