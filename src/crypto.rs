use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::net::SocketAddrV6;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::BytesMut;
use constant_time_eq::constant_time_eq;
use rand::RngCore;
use ring::aead;
use ring::hkdf;
use ring::hmac;
use rustls;
use rustls::quic;

use packet::{ConnectionId, AEAD_TAG_SIZE};
use transport_parameters::TransportParameters;
use {Side, TransportError};

pub use rustls::Error as TLSError;

/// The three packet-protection contexts, in the order they become available.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EncryptionLevel {
    Initial,
    Handshake,
    OneRtt,
}

impl EncryptionLevel {
    pub fn index(self) -> usize {
        match self {
            EncryptionLevel::Initial => 0,
            EncryptionLevel::Handshake => 1,
            EncryptionLevel::OneRtt => 2,
        }
    }
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            EncryptionLevel::Initial => "initial",
            EncryptionLevel::Handshake => "handshake",
            EncryptionLevel::OneRtt => "1-rtt",
        };
        f.write_str(s)
    }
}

/// Packet protection keys for one encryption level: a payload AEAD and a
/// header-protection key for each direction.
pub struct Crypto {
    local: Keys,
    remote: Keys,
}

enum Keys {
    Ring {
        key: aead::LessSafeKey,
        iv: [u8; 12],
        header: aead::quic::HeaderProtectionKey,
    },
    Tls {
        packet: quic::PacketKey,
        header: quic::HeaderProtectionKey,
    },
}

const INITIAL_SALT: [u8; 20] = [
    0xef, 0x4f, 0xb0, 0xab, 0xb4, 0x74, 0x70, 0xc4, 0x1b, 0xef, 0xcf, 0x80, 0x31, 0x33, 0x4f,
    0xae, 0x48, 0x5e, 0x09, 0xa0,
];

impl Crypto {
    /// Derive Initial keys from the client's destination connection ID.
    pub fn new_initial(id: &ConnectionId, side: Side) -> Self {
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT);
        let initial_secret = salt.extract(id);
        let mut client_secret = [0; 32];
        expand_label(&initial_secret, b"client in", &mut client_secret);
        let mut server_secret = [0; 32];
        expand_label(&initial_secret, b"server in", &mut server_secret);
        let (local, remote) = match side {
            Side::Client => (&client_secret, &server_secret),
            Side::Server => (&server_secret, &client_secret),
        };
        Crypto {
            local: Keys::new_initial(local),
            remote: Keys::new_initial(remote),
        }
    }

    /// Wrap keys negotiated by the TLS session.
    pub fn from_tls(keys: quic::Keys) -> Self {
        Crypto {
            local: Keys::Tls {
                packet: keys.local.packet,
                header: keys.local.header,
            },
            remote: Keys::Tls {
                packet: keys.remote.packet,
                header: keys.remote.header,
            },
        }
    }

    /// Encrypt the payload of an outgoing packet in place, appending the tag.
    pub fn encrypt(&self, number: u64, buf: &mut Vec<u8>, header_len: usize) {
        let tag = {
            let (header, payload) = buf.split_at_mut(header_len);
            match self.local {
                Keys::Ring {
                    ref key, ref iv, ..
                } => {
                    let nonce = make_nonce(iv, number);
                    let tag = key
                        .seal_in_place_separate_tag(nonce, aead::Aad::from(&header[..]), payload)
                        .unwrap();
                    tag.as_ref().to_vec()
                }
                Keys::Tls { ref packet, .. } => packet
                    .encrypt_in_place(number, &header[..], payload)
                    .unwrap()
                    .as_ref()
                    .to_vec(),
            }
        };
        buf.extend_from_slice(&tag);
    }

    /// Authenticate and decrypt an incoming payload in place, stripping the tag.
    pub fn decrypt(&self, number: u64, header: &[u8], payload: &mut BytesMut) -> Result<(), ()> {
        if payload.len() < AEAD_TAG_SIZE {
            return Err(());
        }
        let plain_len = match self.remote {
            Keys::Ring {
                ref key, ref iv, ..
            } => {
                let nonce = make_nonce(iv, number);
                key.open_in_place(nonce, aead::Aad::from(header), &mut payload[..])
                    .map_err(|_| ())?
                    .len()
            }
            Keys::Tls { ref packet, .. } => packet
                .decrypt_in_place(number, header, &mut payload[..])
                .map_err(|_| ())?
                .len(),
        };
        payload.truncate(plain_len);
        Ok(())
    }

    /// Apply header protection to an encrypted outgoing packet.
    pub fn encrypt_header(&self, pn_offset: usize, packet: &mut [u8]) {
        let sample_off = pn_offset + 4;
        match self.local {
            Keys::Ring { ref header, .. } => {
                let sample_len = 16;
                debug_assert!(packet.len() >= sample_off + sample_len);
                let mask = header
                    .new_mask(&packet[sample_off..sample_off + sample_len])
                    .unwrap();
                apply_mask(packet, pn_offset, &mask, false);
            }
            Keys::Tls { ref header, .. } => {
                let sample_len = header.sample_len();
                debug_assert!(packet.len() >= sample_off + sample_len);
                let (pre, rest) = packet.split_at_mut(pn_offset);
                let (pn_bytes, sampled) = rest.split_at_mut(4);
                header
                    .encrypt_in_place(&sampled[..sample_len], &mut pre[0], pn_bytes)
                    .unwrap();
            }
        }
    }

    /// Remove header protection from an incoming packet, returning the
    /// packet number length.
    pub fn decrypt_header(&self, pn_offset: usize, packet: &mut [u8]) -> Result<usize, ()> {
        let sample_off = pn_offset + 4;
        match self.remote {
            Keys::Ring { ref header, .. } => {
                let sample_len = 16;
                if packet.len() < sample_off + sample_len {
                    return Err(());
                }
                let mask = header
                    .new_mask(&packet[sample_off..sample_off + sample_len])
                    .map_err(|_| ())?;
                Ok(apply_mask(packet, pn_offset, &mask, true))
            }
            Keys::Tls { ref header, .. } => {
                let sample_len = header.sample_len();
                if packet.len() < sample_off + sample_len {
                    return Err(());
                }
                let (pre, rest) = packet.split_at_mut(pn_offset);
                let (pn_bytes, sampled) = rest.split_at_mut(4);
                header
                    .decrypt_in_place(&sampled[..sample_len], &mut pre[0], pn_bytes)
                    .map_err(|_| ())?;
                Ok((pre[0] & 0x03) as usize + 1)
            }
        }
    }
}

impl Keys {
    fn new_initial(secret: &[u8; 32]) -> Self {
        let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, secret);
        let mut key = [0; 16];
        expand_label(&prk, b"quic key", &mut key);
        let mut iv = [0; 12];
        expand_label(&prk, b"quic iv", &mut iv);
        let mut hp = [0; 16];
        expand_label(&prk, b"quic hp", &mut hp);
        Keys::Ring {
            key: aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_128_GCM, &key).unwrap()),
            iv,
            header: aead::quic::HeaderProtectionKey::new(&aead::quic::AES_128, &hp).unwrap(),
        }
    }
}

/// XOR the header-protection mask over the first byte and packet number.
///
/// `masked` selects whether the packet number length is read before or after
/// unmasking the first byte. Returns the packet number length.
fn apply_mask(packet: &mut [u8], pn_offset: usize, mask: &[u8; 5], masked: bool) -> usize {
    let bits = if packet[0] & 0x80 != 0 { 0x0f } else { 0x1f };
    let first_plain = if masked {
        packet[0] ^ (mask[0] & bits)
    } else {
        packet[0]
    };
    let pn_len = (first_plain & 0x03) as usize + 1;
    packet[0] ^= mask[0] & bits;
    for i in 0..pn_len {
        packet[pn_offset + i] ^= mask[1 + i];
    }
    pn_len
}

fn make_nonce(iv: &[u8; 12], number: u64) -> aead::Nonce {
    let mut buf = *iv;
    let bytes = number.to_be_bytes();
    for i in 0..8 {
        buf[4 + i] ^= bytes[i];
    }
    aead::Nonce::assume_unique_for_key(buf)
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-Expand-Label from the TLS 1.3 key schedule.
fn expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) {
    const PREFIX: &[u8] = b"tls13 ";
    let out_len = (out.len() as u16).to_be_bytes();
    let label_len = [(PREFIX.len() + label.len()) as u8];
    let info = [&out_len[..], &label_len[..], PREFIX, label, &[0][..]];
    prk.expand(&info, OkmLen(out.len()))
        .unwrap()
        .fill(out)
        .unwrap();
}

/// Newly negotiated packet-protection keys, reported by the TLS session as
/// the handshake advances.
pub enum NewKeys {
    Handshake(Crypto),
    OneRtt(Crypto),
}

/// A TLS 1.3 session speaking through CRYPTO-frame byte streams.
pub struct TlsSession {
    inner: Session,
}

enum Session {
    Client(quic::ClientConnection),
    Server(quic::ServerConnection),
}

impl TlsSession {
    pub fn new_client(
        config: &Arc<rustls::ClientConfig>,
        server_name: &str,
        params: &TransportParameters,
    ) -> Result<Self, ConnectError> {
        let name = rustls::ServerName::try_from(server_name)
            .map_err(|_| ConnectError::InvalidDnsName(server_name.into()))?;
        let mut param_bytes = Vec::new();
        params.write(&mut param_bytes);
        let inner =
            quic::ClientConnection::new(config.clone(), quic::Version::V1Draft, name, param_bytes)
                .map_err(ConnectError::Tls)?;
        Ok(TlsSession {
            inner: Session::Client(inner),
        })
    }

    pub fn new_server(
        config: &Arc<rustls::ServerConfig>,
        params: &TransportParameters,
    ) -> Result<Self, TLSError> {
        let mut param_bytes = Vec::new();
        params.write(&mut param_bytes);
        let inner =
            quic::ServerConnection::new(config.clone(), quic::Version::V1Draft, param_bytes)?;
        Ok(TlsSession {
            inner: Session::Server(inner),
        })
    }

    pub fn side(&self) -> Side {
        match self.inner {
            Session::Client(_) => Side::Client,
            Session::Server(_) => Side::Server,
        }
    }

    /// Feed reassembled CRYPTO-stream bytes to the session.
    pub fn read_handshake(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let res = match self.inner {
            Session::Client(ref mut c) => c.read_hs(data),
            Session::Server(ref mut s) => s.read_hs(data),
        };
        res.map_err(|_| match self.alert() {
            Some(alert) => TransportError::crypto(alert.get_u8()),
            None => TransportError::PROTOCOL_VIOLATION,
        })
    }

    /// Drain pending handshake output, reporting any keys that become
    /// available once the written bytes have been emitted.
    pub fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<NewKeys> {
        let change = match self.inner {
            Session::Client(ref mut c) => c.write_hs(buf),
            Session::Server(ref mut s) => s.write_hs(buf),
        }?;
        Some(match change {
            quic::KeyChange::Handshake { keys } => NewKeys::Handshake(Crypto::from_tls(keys)),
            quic::KeyChange::OneRtt { keys, .. } => NewKeys::OneRtt(Crypto::from_tls(keys)),
        })
    }

    pub fn is_handshaking(&self) -> bool {
        match self.inner {
            Session::Client(ref c) => c.is_handshaking(),
            Session::Server(ref s) => s.is_handshaking(),
        }
    }

    /// The peer's transport parameters, once its first flight has been read.
    pub fn transport_parameters(&self) -> Result<Option<TransportParameters>, TransportError> {
        let raw = match self.inner {
            Session::Client(ref c) => c.quic_transport_parameters(),
            Session::Server(ref s) => s.quic_transport_parameters(),
        };
        match raw {
            None => Ok(None),
            Some(bytes) => TransportParameters::read(self.side(), &mut io::Cursor::new(bytes))
                .map(Some)
                .map_err(|_| TransportError::TRANSPORT_PARAMETER_ERROR),
        }
    }

    fn alert(&self) -> Option<rustls::AlertDescription> {
        match self.inner {
            Session::Client(ref c) => c.alert(),
            Session::Server(ref s) => s.alert(),
        }
    }
}

#[derive(Debug, Fail)]
pub enum ConnectError {
    #[fail(display = "failed to configure TLS: {}", _0)]
    Tls(TLSError),
    #[fail(display = "invalid DNS name: {}", _0)]
    InvalidDnsName(String),
}

/// Judges certificate chains presented by servers.
pub trait CertificateValidator: Send + Sync {
    /// `chain` holds DER certificates, leaf first.
    fn validate(&self, chain: &[&[u8]]) -> Result<(), InvalidCertificate>;
}

#[derive(Debug, Clone, Copy, Fail)]
#[fail(display = "invalid certificate chain")]
pub struct InvalidCertificate;

/// Accepts any certificate. For testing only.
pub struct NoopCertificateValidator;

impl CertificateValidator for NoopCertificateValidator {
    fn validate(&self, _: &[&[u8]]) -> Result<(), InvalidCertificate> {
        Ok(())
    }
}

struct ValidatorAdapter(Arc<dyn CertificateValidator>);

impl rustls::client::ServerCertVerifier for ValidatorAdapter {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::Certificate,
        intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, TLSError> {
        let mut chain = Vec::with_capacity(1 + intermediates.len());
        chain.push(&end_entity.0[..]);
        for cert in intermediates {
            chain.push(&cert.0[..]);
        }
        self.0.validate(&chain).map_err(|_| {
            TLSError::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure)
        })?;
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Build a TLS client configuration deferring chain validation to `validator`.
pub fn build_client_config(
    validator: Arc<dyn CertificateValidator>,
) -> Result<rustls::ClientConfig, TLSError> {
    let mut config = rustls::ClientConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(ValidatorAdapter(validator)));
    Ok(config)
}

/// Build a TLS server configuration from a DER certificate chain (leaf
/// first) and a DER private key.
pub fn build_server_config(
    cert_chain: Vec<Vec<u8>>,
    private_key: Vec<u8>,
) -> Result<rustls::ServerConfig, TLSError> {
    let chain = cert_chain.into_iter().map(rustls::Certificate).collect();
    rustls::ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(chain, rustls::PrivateKey(private_key))
}

const TOKEN_MAC_SIZE: usize = 32;
const TOKEN_SIZE: usize = TOKEN_MAC_SIZE + 8;

/// Key with which a server signs address-validation tokens.
pub struct TokenKey(hmac::Key);

impl TokenKey {
    pub fn new(master: &[u8]) -> Self {
        TokenKey(hmac::Key::new(hmac::HMAC_SHA256, master))
    }

    pub fn random<R: RngCore>(rng: &mut R) -> Self {
        let mut master = [0; 64];
        rng.fill_bytes(&mut master);
        TokenKey::new(&master)
    }

    /// Mint a token binding the peer's address to the issue time.
    pub fn generate(&self, remote: &SocketAddrV6, issued: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TOKEN_SIZE);
        let tag = hmac::sign(&self.0, &token_material(remote, issued));
        buf.extend_from_slice(tag.as_ref());
        buf.extend_from_slice(&issued.to_be_bytes());
        buf
    }

    /// Check a token against the peer's address and the validity window.
    /// Malformed, forged, expired, and future-dated tokens are all invalid.
    pub fn validate(
        &self,
        remote: &SocketAddrV6,
        token: &[u8],
        now: u64,
        lifetime: u64,
    ) -> bool {
        if token.len() != TOKEN_SIZE {
            return false;
        }
        let mut issued_bytes = [0; 8];
        issued_bytes.copy_from_slice(&token[TOKEN_MAC_SIZE..]);
        let issued = u64::from_be_bytes(issued_bytes);
        let tag = hmac::sign(&self.0, &token_material(remote, issued));
        if !constant_time_eq(tag.as_ref(), &token[..TOKEN_MAC_SIZE]) {
            return false;
        }
        issued <= now && now - issued <= lifetime
    }
}

fn token_material(remote: &SocketAddrV6, issued: u64) -> [u8; 26] {
    let mut buf = [0; 26];
    buf[..16].copy_from_slice(&remote.ip().octets());
    buf[16..18].copy_from_slice(&remote.port().to_be_bytes());
    buf[18..].copy_from_slice(&issued.to_be_bytes());
    buf
}
