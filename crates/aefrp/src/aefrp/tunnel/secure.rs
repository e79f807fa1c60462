//! Mutually authenticated TLS 1.3 between peers.
//!
//! Certificates are self-signed and never chained to a CA: rustls only checks that the
//! peer proves possession of the key, and identity decisions are made on the
//! fingerprint by [`HandshakeHooks`]. The target room travels in SNI. Right after the
//! handshake the accepting side writes a verdict record so a rejected peer learns why.

use std::{
    borrow::Cow,
    net::SocketAddr,
    sync::{Arc, LazyLock},
    time::Duration,
};

use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
    server::{
        Acceptor,
        danger::{ClientCertVerified, ClientCertVerifier},
    },
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{LazyConfigAcceptor, TlsConnector, client, server};

use crate::aefrp::{
    identity::{Fingerprint, FingerprintError, Identity},
    tunnel::protocol::{ProtocolError, Verdict, read_verdict, write_verdict},
};

pub const ALPN: &[u8] = b"aefrp";
pub const SNI_SUFFIX: &str = "aefrp";
pub const RELAY_SNI: &str = "relay.aefrp";
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

static CRYPTO_PROVIDER: LazyLock<Arc<CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// Rejection reasons reported in the verdict record.
pub mod reason {
    pub const ROOM_ALREADY_EXIST: &str = "room:already_exist";
    pub const ROOM_NOT_FOUND: &str = "room:not_found";
    pub const ROOM_NOT_READY: &str = "room:not_ready";
    pub const ROOM_BLOCKED: &str = "room:blocked";
    pub const ROOM_NOT_ALLOWED: &str = "room:not_allowed";
    pub const SYSTEM_NOT_ALLOWED: &str = "system:not_allowed";
    pub const SYSTEM_BAD_EXTENSION: &str = "system:bad_extension";
    pub const SYSTEM_INTERNAL: &str = "system:internal";
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct Reject {
    reason: Cow<'static, str>,
}

impl Reject {
    pub fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[derive(Debug, Error)]
pub enum SecureError {
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake timed out")]
    Timeout,
    #[error("peer presented no certificate")]
    NoCertificate,
    #[error("certificate: {0}")]
    Certificate(#[from] FingerprintError),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("peer rejected: {0}")]
    Rejected(Reject),
    #[error("peer mismatch: expected {expected}, got {actual}")]
    PeerMismatch {
        expected: Fingerprint,
        actual: Fingerprint,
    },
    #[error("verdict: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("invalid server name {0:?}")]
    BadServerName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// ClientHello read; extensions known, peer not yet authenticated.
    Hello,
    /// Peer certificate verified.
    Certificate,
    /// Handshake complete; the hook must decide.
    Finished,
}

/// Handshake extensions the accepting side saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    pub server_name: Option<String>,
    pub target_room: Option<Fingerprint>,
}

#[derive(Debug, Clone)]
pub struct HandshakeContext {
    pub remote: SocketAddr,
    pub peer: Option<Fingerprint>,
}

/// Admission policy plugged into [`accept`].
pub trait HandshakeHooks: Send + Sync {
    type Admission: Send;

    /// Vets the certificate the dialing peer presented.
    fn verify_certificate(
        &self,
        ctx: &HandshakeContext,
        fingerprint: &Fingerprint,
    ) -> Result<(), Reject>;

    /// Called once per stage. Only `Stage::Finished` has to return an admission;
    /// earlier stages may only veto.
    fn negotiate(
        &self,
        ctx: &HandshakeContext,
        extensions: &Extensions,
        stage: Stage,
    ) -> Result<Option<Self::Admission>, Reject>;
}

pub fn room_sni(room: &Fingerprint) -> String {
    let hex = room.to_string();
    format!("{}.{}.{SNI_SUFFIX}", &hex[..32], &hex[32..])
}

/// Target room encoded in `sni`. `relay.aefrp` and a missing name mean no target.
pub fn parse_sni(sni: Option<&str>) -> Result<Option<Fingerprint>, Reject> {
    let Some(sni) = sni else {
        return Ok(None);
    };
    if sni.eq_ignore_ascii_case(RELAY_SNI) {
        return Ok(None);
    }
    let mut labels = sni.split('.');
    match (labels.next(), labels.next(), labels.next(), labels.next()) {
        (Some(a), Some(b), Some(suffix), None)
            if suffix.eq_ignore_ascii_case(SNI_SUFFIX) && a.len() == 32 && b.len() == 32 =>
        {
            Fingerprint::parse_hex(&format!("{a}{b}"))
                .map(Some)
                .map_err(|_| Reject::new(reason::SYSTEM_BAD_EXTENSION))
        }
        _ => Err(Reject::new(reason::SYSTEM_BAD_EXTENSION)),
    }
}

/// rustls configs for both directions built from one identity.
#[derive(Clone)]
pub struct SecureConfig {
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
    local: Fingerprint,
}

impl std::fmt::Debug for SecureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureConfig")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl SecureConfig {
    pub fn new(identity: &Identity) -> Result<Self, SecureError> {
        let mut server = ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(Arc::new(AnyPeerCert))
            .with_single_cert(identity.cert_chain(), identity.private_key())?;
        server.alpn_protocols = vec![ALPN.to_vec()];

        let mut client = ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AnyPeerCert))
            .with_client_auth_cert(identity.cert_chain(), identity.private_key())?;
        client.alpn_protocols = vec![ALPN.to_vec()];

        Ok(Self {
            server: Arc::new(server),
            client: Arc::new(client),
            local: identity.fingerprint(),
        })
    }

    pub fn local_fingerprint(&self) -> Fingerprint {
        self.local
    }
}

pub struct Accepted<S, A> {
    pub stream: server::TlsStream<S>,
    pub peer: Fingerprint,
    pub extensions: Extensions,
    pub admission: A,
}

pub struct Connected<S> {
    pub stream: client::TlsStream<S>,
    pub peer: Fingerprint,
}

/// Server side of the handshake, hooks and verdict, bounded by `timeout`.
///
/// A hook rejection does not abort the TLS exchange itself: the handshake is completed
/// so the reason can be delivered in the verdict, then the stream is shut down.
pub async fn accept<S, H>(
    io: S,
    remote: SocketAddr,
    tls: &SecureConfig,
    hooks: &H,
    timeout: Duration,
) -> Result<Accepted<S, H::Admission>, SecureError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: HandshakeHooks + ?Sized,
{
    tokio::time::timeout(timeout, accept_inner(io, remote, tls, hooks))
        .await
        .map_err(|_| SecureError::Timeout)?
}

async fn accept_inner<S, H>(
    io: S,
    remote: SocketAddr,
    tls: &SecureConfig,
    hooks: &H,
) -> Result<Accepted<S, H::Admission>, SecureError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: HandshakeHooks + ?Sized,
{
    let start = LazyConfigAcceptor::new(Acceptor::default(), io).await?;
    let server_name = start.client_hello().server_name().map(str::to_string);

    let mut ctx = HandshakeContext { remote, peer: None };
    let target = parse_sni(server_name.as_deref());
    let extensions = Extensions {
        target_room: target.clone().ok().flatten(),
        server_name,
    };
    let hello = target.and_then(|_| hooks.negotiate(&ctx, &extensions, Stage::Hello));

    let mut stream = start.into_stream(tls.server.clone()).await?;
    let peer = peer_fingerprint(stream.get_ref().1.peer_certificates())?;
    ctx.peer = Some(peer);

    let admission = hello
        .and_then(|_| hooks.verify_certificate(&ctx, &peer))
        .and_then(|_| hooks.negotiate(&ctx, &extensions, Stage::Certificate))
        .and_then(|_| hooks.negotiate(&ctx, &extensions, Stage::Finished))
        .and_then(|a| a.ok_or_else(|| Reject::new(reason::SYSTEM_INTERNAL)));

    match admission {
        Ok(admission) => {
            write_verdict(&mut stream, &Verdict::Accepted).await?;
            Ok(Accepted {
                stream,
                peer,
                extensions,
                admission,
            })
        }
        Err(reject) => {
            write_verdict(&mut stream, &Verdict::Rejected(reject.reason().to_string())).await?;
            let _ = stream.shutdown().await;
            Err(SecureError::Rejected(reject))
        }
    }
}

/// Client side: handshake with the target room in SNI, then read the verdict.
/// When `expect` is set the server must present exactly that fingerprint.
pub async fn connect<S>(
    io: S,
    tls: &SecureConfig,
    target: Option<Fingerprint>,
    expect: Option<Fingerprint>,
) -> Result<Connected<S>, SecureError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = match target {
        Some(room) => room_sni(&room),
        None => RELAY_SNI.to_string(),
    };
    let server_name =
        ServerName::try_from(name.clone()).map_err(|_| SecureError::BadServerName(name))?;

    let mut stream = TlsConnector::from(tls.client.clone())
        .connect(server_name, io)
        .await?;
    let peer = peer_fingerprint(stream.get_ref().1.peer_certificates())?;
    if let Some(expected) = expect
        && expected != peer
    {
        return Err(SecureError::PeerMismatch {
            expected,
            actual: peer,
        });
    }

    match read_verdict(&mut stream).await? {
        Verdict::Accepted => Ok(Connected { stream, peer }),
        Verdict::Rejected(reason) => Err(SecureError::HandshakeRejected(reason)),
    }
}

fn peer_fingerprint(certs: Option<&[CertificateDer<'_>]>) -> Result<Fingerprint, SecureError> {
    let cert = certs
        .and_then(|c| c.first())
        .ok_or(SecureError::NoCertificate)?;
    Ok(Fingerprint::from_cert_der(cert)?)
}

/// Accepts any well-formed certificate; signatures are still checked by rustls.
#[derive(Debug)]
struct AnyPeerCert;

fn check_cert(end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
    Fingerprint::from_cert_der(end_entity)
        .map(|_| ())
        .map_err(|_| rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding))
}

impl ServerCertVerifier for AnyPeerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        check_cert(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl ClientCertVerifier for AnyPeerCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        check_cert(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    /// Admits everyone except `deny`; records the target room as the admission.
    struct TestHooks {
        deny: Option<Fingerprint>,
    }

    impl HandshakeHooks for TestHooks {
        type Admission = Option<Fingerprint>;

        fn verify_certificate(
            &self,
            _ctx: &HandshakeContext,
            fingerprint: &Fingerprint,
        ) -> Result<(), Reject> {
            if Some(*fingerprint) == self.deny {
                return Err(Reject::new(reason::SYSTEM_NOT_ALLOWED));
            }
            Ok(())
        }

        fn negotiate(
            &self,
            _ctx: &HandshakeContext,
            extensions: &Extensions,
            stage: Stage,
        ) -> Result<Option<Self::Admission>, Reject> {
            match stage {
                Stage::Finished => Ok(Some(extensions.target_room)),
                _ => Ok(None),
            }
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn sni_carries_target_room() {
        let fp = Fingerprint::from_bytes([0x5a; 32]);
        let sni = room_sni(&fp);
        assert!(sni.ends_with(".aefrp"));
        assert!(ServerName::try_from(sni.clone()).is_ok());
        assert_eq!(parse_sni(Some(&sni)).unwrap(), Some(fp));
        assert_eq!(parse_sni(Some(RELAY_SNI)).unwrap(), None);
        assert_eq!(parse_sni(None).unwrap(), None);
        assert_eq!(
            parse_sni(Some("example.com")).unwrap_err().reason(),
            reason::SYSTEM_BAD_EXTENSION
        );
    }

    #[tokio::test]
    async fn handshake_exchanges_fingerprints_and_target() {
        let srv_id = Identity::generate().unwrap();
        let cli_id = Identity::generate().unwrap();
        let srv = SecureConfig::new(&srv_id).unwrap();
        let cli = SecureConfig::new(&cli_id).unwrap();
        let room = Fingerprint::from_bytes([9; 32]);

        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let hooks = TestHooks { deny: None };
            let mut acc = accept(b, addr(), &srv, &hooks, HANDSHAKE_TIMEOUT)
                .await
                .unwrap();
            let mut buf = [0u8; 4];
            acc.stream.read_exact(&mut buf).await.unwrap();
            (acc.peer, acc.admission, buf)
        });

        let mut conn = connect(a, &cli, Some(room), Some(srv_id.fingerprint()))
            .await
            .unwrap();
        assert_eq!(conn.peer, srv_id.fingerprint());
        conn.stream.write_all(b"ping").await.unwrap();
        conn.stream.flush().await.unwrap();

        let (peer, target, buf) = server.await.unwrap();
        assert_eq!(peer, cli_id.fingerprint());
        assert_eq!(target, Some(room));
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn rejection_reason_reaches_the_client() {
        let srv = SecureConfig::new(&Identity::generate().unwrap()).unwrap();
        let cli_id = Identity::generate().unwrap();
        let cli = SecureConfig::new(&cli_id).unwrap();
        let deny = Some(cli_id.fingerprint());

        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let hooks = TestHooks { deny };
            accept(b, addr(), &srv, &hooks, HANDSHAKE_TIMEOUT).await
        });

        let err = connect(a, &cli, None, None).await.err().unwrap();
        match err {
            SecureError::HandshakeRejected(r) => assert_eq!(r, reason::SYSTEM_NOT_ALLOWED),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            server.await.unwrap(),
            Err(SecureError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn unexpected_server_is_a_peer_mismatch() {
        let srv = SecureConfig::new(&Identity::generate().unwrap()).unwrap();
        let cli = SecureConfig::new(&Identity::generate().unwrap()).unwrap();
        let wanted = Fingerprint::from_bytes([1; 32]);

        let (a, b) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let hooks = TestHooks { deny: None };
            let _ = accept(b, addr(), &srv, &hooks, HANDSHAKE_TIMEOUT).await;
        });
        let err = connect(a, &cli, Some(wanted), Some(wanted)).await.err().unwrap();
        assert!(matches!(err, SecureError::PeerMismatch { expected, .. } if expected == wanted));
    }
}
