use std::fmt;
use std::slice;

use log::{debug, warn};
use rustls::crypto::ring;
use rustls::pki_types::{
    CertificateDer, ServerName, SignatureVerificationAlgorithm, TrustAnchor, UnixTime,
};
use thiserror::Error;
use webpki::{EndEntityCert, KeyUsage};

use crate::certificate;

/// Why a presented chain is not trusted
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum VerifyError {
    /// Leaf or issuer is past its validity window
    #[error("certificate has expired")]
    Expired,
    /// Leaf or issuer is before its validity window
    #[error("certificate is not yet valid")]
    NotYetValid,
    /// Names in the leaf do not cover the hostname
    #[error("certificate is not valid for {0}")]
    NameMismatch(String),
    /// No path to a trusted root could be built
    #[error("certificate signed by unknown authority")]
    UnknownIssuer,
    /// Certificate was revoked
    #[error("certificate has been revoked")]
    Revoked,
    /// Any other reason, described by [`webpki`]
    #[error("{0}")]
    Other(String),
}

impl VerifyError {
    fn from_webpki(e: webpki::Error, hostname: &str) -> Self {
        match e {
            webpki::Error::CertExpired { .. } => VerifyError::Expired,
            webpki::Error::CertNotValidYet { .. } => VerifyError::NotYetValid,
            webpki::Error::CertNotValidForName { .. } => {
                VerifyError::NameMismatch(hostname.to_string())
            }
            webpki::Error::UnknownIssuer { .. } => VerifyError::UnknownIssuer,
            webpki::Error::CertRevoked { .. } => VerifyError::Revoked,
            e => VerifyError::Other(format!("certificate verification failed: {e}")),
        }
    }
}

/// Verifies presented chains against a set of trusted roots
pub struct ChainVerifier {
    anchors: Vec<TrustAnchor<'static>>,
    /// DER of each anchor when known, used to finish verified chains
    roots: Vec<Option<CertificateDer<'static>>>,
    algorithms: &'static [&'static dyn SignatureVerificationAlgorithm],
}

impl fmt::Debug for ChainVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainVerifier")
            .field("anchors", &self.anchors.len())
            .finish()
    }
}

impl Default for ChainVerifier {
    fn default() -> Self {
        ChainVerifier::system()
    }
}

impl ChainVerifier {
    /// Trust the roots of the operating system, or the bundled Mozilla roots
    /// when the operating system provides none
    pub fn system() -> Self {
        let loaded = rustls_native_certs::load_native_certs();
        for e in &loaded.errors {
            warn!("failed to load system root certificates: {e}");
        }

        let verifier = ChainVerifier::with_roots(loaded.certs);
        if verifier.is_empty() {
            warn!("no system root certificates found, fall back to bundled roots");
            return ChainVerifier::bundled();
        }
        debug!("loaded {} system root certificates", verifier.len());
        verifier
    }

    /// Trust the Mozilla roots bundled with [`webpki_roots`]
    pub fn bundled() -> Self {
        let anchors = webpki_roots::TLS_SERVER_ROOTS.to_vec();
        ChainVerifier {
            roots: vec![None; anchors.len()],
            anchors,
            algorithms: ring::default_provider().signature_verification_algorithms.all,
        }
    }

    /// Trust exactly the given root certificates, skipping unusable ones
    pub fn with_roots(certificates: Vec<CertificateDer<'static>>) -> Self {
        let mut anchors = Vec::with_capacity(certificates.len());
        let mut roots = Vec::with_capacity(certificates.len());
        for der in certificates {
            let anchor = match webpki::anchor_from_trusted_cert(&der) {
                Ok(anchor) => anchor.to_owned(),
                Err(e) => {
                    debug!("skip root certificate: {e}");
                    continue;
                }
            };
            anchors.push(anchor);
            roots.push(Some(der));
        }
        ChainVerifier {
            anchors,
            roots,
            algorithms: ring::default_provider().signature_verification_algorithms.all,
        }
    }

    /// Number of trusted roots
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// No root is trusted
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Verify `presented` (leaf first) for `hostname` at `now`.
    ///
    /// The validity window of the leaf is checked first, then its names, then
    /// the path to a root. Intermediates are taken only from the presented
    /// certificates. An empty hostname skips the name check. On success every distinct path to a
    /// trusted root is returned, leaf first and ending with the root when its
    /// certificate is known.
    pub fn verify(
        &self,
        presented: &[CertificateDer<'_>],
        hostname: &str,
        now: UnixTime,
    ) -> Result<Vec<Vec<CertificateDer<'static>>>, VerifyError> {
        let (leaf, intermediates) = presented
            .split_first()
            .ok_or_else(|| VerifyError::Other("no certificate presented".to_string()))?;
        let end_entity =
            EndEntityCert::try_from(leaf).map_err(|e| VerifyError::from_webpki(e, hostname))?;

        check_validity(leaf, now)?;
        if !hostname.is_empty() {
            let server_name = ServerName::try_from(hostname)
                .map_err(|_| VerifyError::NameMismatch(hostname.to_string()))?;
            end_entity
                .verify_is_valid_for_subject_name(&server_name)
                .map_err(|e| VerifyError::from_webpki(e, hostname))?;
        }

        self.verify_with(&end_entity, &self.anchors, intermediates, now)
            .map_err(|e| VerifyError::from_webpki(e, hostname))?;

        let mut chains: Vec<Vec<CertificateDer<'static>>> = vec![];
        for (anchor, root) in self.anchors.iter().zip(&self.roots) {
            let trusted = slice::from_ref(anchor);
            if self.verify_with(&end_entity, trusted, intermediates, now).is_err() {
                continue;
            }
            let chain = build_chain(presented, anchor, root.as_ref());
            if !chains.contains(&chain) {
                chains.push(chain);
            }
        }
        debug!("{hostname} verified with {} path(s)", chains.len());
        Ok(chains)
    }

    fn verify_with(
        &self,
        end_entity: &EndEntityCert<'_>,
        anchors: &[TrustAnchor<'_>],
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), webpki::Error> {
        end_entity
            .verify_for_usage(
                self.algorithms,
                anchors,
                intermediates,
                now,
                KeyUsage::server_auth(),
                None,
                None,
            )
            .map(|_| ())
    }
}

fn check_validity(leaf: &[u8], now: UnixTime) -> Result<(), VerifyError> {
    // unparseable leaves are reported by path building
    let Ok(cert) = certificate::parse(leaf) else {
        return Ok(());
    };
    let now = i64::try_from(now.as_secs()).unwrap_or(i64::MAX);
    let validity = cert.validity();
    if now < validity.not_before.timestamp() {
        return Err(VerifyError::NotYetValid);
    }
    if now > validity.not_after.timestamp() {
        return Err(VerifyError::Expired);
    }
    Ok(())
}

/// Follow issuer names from the leaf through the presented certificates
/// until the anchor is reached.
fn build_chain(
    presented: &[CertificateDer<'_>],
    anchor: &TrustAnchor<'_>,
    root: Option<&CertificateDer<'static>>,
) -> Vec<CertificateDer<'static>> {
    let anchor_subject: &[u8] = anchor.subject.as_ref();
    let mut chain = vec![];
    let mut used = vec![false; presented.len()];
    let mut next = Some(0);

    while let Some(index) = next.take() {
        used[index] = true;
        chain.push(presented[index].clone().into_owned());

        let Ok(current) = certificate::parse(&presented[index]) else {
            break;
        };
        let issuer = name_contents(current.issuer().as_raw());
        if issuer == anchor_subject {
            break;
        }
        next = presented.iter().enumerate().position(|(i, der)| {
            !used[i]
                && certificate::parse(der)
                    .map(|c| name_contents(c.subject().as_raw()) == issuer)
                    .unwrap_or(false)
        });
    }

    if let Some(root) = root {
        if chain.last() != Some(root) {
            chain.push(root.clone());
        }
    }
    chain
}

/// Strip the SEQUENCE header of a DER encoded name
fn name_contents(raw: &[u8]) -> &[u8] {
    let header = match raw.get(1) {
        Some(&len) if len & 0x80 == 0 => 2,
        Some(&len) => 2 + usize::from(len & 0x7f),
        None => return raw,
    };
    raw.get(header..).unwrap_or(raw)
}
