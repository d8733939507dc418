use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info};
use rustls::pki_types::{CertificateDer, UnixTime};

use crate::certificate::{extract_chain, CertificateRecord, Chain};
use crate::connector::{ConfigError, Connector, ProtocolRange};
use crate::outcome::{classify_connect_error, classify_verification, ProbeError};
use crate::request::ProbeRequest;
use crate::result::ProbeResult;
use crate::verifier::ChainVerifier;

/// Timeout used when a request carries none
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Probes TLS endpoints and reports their certificate chains
pub struct Prober {
    connector: Connector,
    verifier: ChainVerifier,
    default_timeout: Duration,
}

impl fmt::Debug for Prober {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prober")
            .field("connector", &self.connector)
            .field("verifier", &self.verifier)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl Prober {
    /// Create a prober trusting the system roots with default settings
    ///
    /// ```
    /// # use certprobe::Prober;
    /// let prober = Prober::new().unwrap();
    /// ```
    pub fn new() -> Result<Self, ConfigError> {
        ProberBuilder::default().build()
    }

    /// Create a prober with builder
    ///
    /// ```
    /// # use certprobe::{Prober, ProtocolRange, TlsVersion};
    /// use std::time::Duration;
    /// let prober = Prober::builder()
    ///     .default_timeout(Duration::from_secs(5))
    ///     .protocols(ProtocolRange { min: TlsVersion::Tls12, max: TlsVersion::Tls12 })
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(Duration::from_secs(5), prober.default_timeout());
    /// ```
    pub fn builder() -> ProberBuilder {
        ProberBuilder::default()
    }

    /// Timeout used when a request carries none
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Probe one endpoint. Every failure is reported inside the result.
    pub async fn probe(&self, request: &ProbeRequest) -> ProbeResult {
        let origin = Instant::now();
        let timeout = request.timeout_or(self.default_timeout);

        let result = ProbeResult::new(request);
        let result = match self
            .connector
            .fetch_certificates(&request.hostname, &request.host, request.port, timeout)
            .await
        {
            Ok(presented) => self.assess(result, &presented, UnixTime::now()),
            Err(e) => result.failed(classify_connect_error(&e)),
        };
        let result = result.finish(origin.elapsed());

        match &result.error {
            Some(e) => info!(
                "{}:{} ({}) error: {} ({})",
                request.hostname,
                request.port,
                request.host,
                e,
                e.code()
            ),
            None => debug!("{result}"),
        }
        result
    }

    /// Judge the certificates `presented` for the hostname of `result` at `now`
    pub fn assess(
        &self,
        result: ProbeResult,
        presented: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> ProbeResult {
        if presented.is_empty() {
            return result.failed(ProbeError::NoCertificate);
        }
        let chain = match extract_chain(presented) {
            Ok(chain) => chain,
            Err(e) => {
                return result.failed(ProbeError::Certificate(format!(
                    "failed to parse certificate: {e}"
                )))
            }
        };

        match self.verifier.verify(presented, &result.hostname, now) {
            Ok(paths) => {
                let chains = paths.iter().map(|path| verified_chain(path)).collect();
                result.with_chains(chains)
            }
            Err(e) => {
                let error = classify_verification(&chain, &e);
                result.with_chains(vec![chain]).failed(error)
            }
        }
    }
}

/// Roots from the system store are not required to parse, drop those that don't
fn verified_chain(path: &[CertificateDer<'_>]) -> Chain {
    path.iter()
        .filter_map(|der| CertificateRecord::from_der(der).ok())
        .collect()
}

/// Builder of [`Prober`]
#[derive(Debug, Default)]
pub struct ProberBuilder {
    default_timeout: Option<Duration>,
    protocols: ProtocolRange,
    roots: Option<Vec<CertificateDer<'static>>>,
}

impl ProberBuilder {
    /// Timeout used when a request carries none
    pub fn default_timeout(&mut self, default_timeout: Duration) -> &mut Self {
        self.default_timeout = Some(default_timeout);
        self
    }

    /// Protocol versions offered in the handshake
    pub fn protocols(&mut self, protocols: ProtocolRange) -> &mut Self {
        self.protocols = protocols;
        self
    }

    /// Trust only these roots instead of the system ones
    pub fn roots(&mut self, roots: Vec<CertificateDer<'static>>) -> &mut Self {
        self.roots = Some(roots);
        self
    }

    /// Build the prober
    pub fn build(&self) -> Result<Prober, ConfigError> {
        let verifier = match &self.roots {
            Some(roots) => ChainVerifier::with_roots(roots.clone()),
            None => ChainVerifier::system(),
        };
        Ok(Prober {
            connector: Connector::new(self.protocols)?,
            verifier,
            default_timeout: self
                .default_timeout
                .filter(|t| !t.is_zero())
                .unwrap_or(DEFAULT_TIMEOUT),
        })
    }
}

#[cfg(test)]
mod test {
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    };

    use super::*;
    use crate::connector::TlsVersion;

    struct Pki {
        root: CertificateDer<'static>,
        intermediate: CertificateDer<'static>,
        leaf: CertificateDer<'static>,
    }

    fn named(names: Vec<String>, common_name: &str) -> CertificateParams {
        let mut params = CertificateParams::new(names).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params
    }

    fn pki() -> Pki {
        let mut root_params = named(Vec::default(), "Probe Root");
        root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let root_key = KeyPair::generate().unwrap();
        let root = root_params.clone().self_signed(&root_key).unwrap();
        let root_issuer = Issuer::new(root_params, root_key);

        let mut intermediate_params = named(Vec::default(), "Probe Intermediate");
        intermediate_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let intermediate_key = KeyPair::generate().unwrap();
        let intermediate = intermediate_params
            .clone()
            .signed_by(&intermediate_key, &root_issuer)
            .unwrap();
        let intermediate_issuer = Issuer::new(intermediate_params, intermediate_key);

        let leaf_key = KeyPair::generate().unwrap();
        let leaf = named(vec!["probe.test".to_string()], "probe.test")
            .signed_by(&leaf_key, &intermediate_issuer)
            .unwrap();

        Pki {
            root: root.der().clone(),
            intermediate: intermediate.der().clone(),
            leaf: leaf.der().clone(),
        }
    }

    fn prober(roots: Vec<CertificateDer<'static>>) -> Prober {
        Prober::builder().roots(roots).build().unwrap()
    }

    fn result(hostname: &str) -> ProbeResult {
        ProbeResult::new(&ProbeRequest::new(hostname, "127.0.0.1", 443))
    }

    #[test]
    fn t_builder_defaults() {
        let prober = Prober::builder()
            .roots(vec![])
            .default_timeout(Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(DEFAULT_TIMEOUT, prober.default_timeout());
    }

    #[test]
    fn t_builder_inverted_protocols() {
        let built = Prober::builder()
            .roots(vec![])
            .protocols(ProtocolRange {
                min: TlsVersion::Tls13,
                max: TlsVersion::Tls12,
            })
            .build();
        assert!(matches!(built, Err(ConfigError::ProtocolRange { .. })));
    }

    #[test]
    fn t_assess_success() {
        let pki = pki();
        let prober = prober(vec![pki.root.clone()]);
        let presented = [pki.leaf.clone(), pki.intermediate.clone()];

        let assessed = prober.assess(result("probe.test"), &presented, UnixTime::now());
        assert!(assessed.is_success());
        assert_eq!(1, assessed.chains.len());
        let subjects: Vec<_> = assessed.chains[0].iter().map(|c| c.subject.as_str()).collect();
        assert_eq!(
            vec!["probe.test", "Probe Intermediate", "Probe Root"],
            subjects
        );
    }

    #[test]
    fn t_assess_no_certificate() {
        let prober = prober(vec![]);
        let assessed = prober.assess(result("probe.test"), &[], UnixTime::now());
        assert_eq!(Some("NOCERT"), assessed.code());
        assert!(assessed.chains.is_empty());
    }

    #[test]
    fn t_assess_incomplete_chain() {
        let pki = pki();
        let prober = prober(vec![pki.root.clone()]);

        let assessed = prober.assess(result("probe.test"), &[pki.leaf.clone()], UnixTime::now());
        assert_eq!(Some("INCOMPLETECERTCHAIN"), assessed.code());
        assert_eq!(1, assessed.chains.len());
        assert_eq!(1, assessed.chains[0].len());
    }

    #[test]
    fn t_assess_invalid_hostname() {
        let pki = pki();
        let prober = prober(vec![pki.root.clone()]);
        let presented = [pki.leaf.clone(), pki.intermediate.clone()];

        let assessed = prober.assess(result("other.test"), &presented, UnixTime::now());
        assert_eq!(Some("INVALIDHOSTNAME"), assessed.code());
        assert_eq!(2, assessed.chains[0].len());
    }

    #[test]
    fn t_assess_expired_and_invalid_hostname() {
        let pki = pki();
        let prober = prober(vec![pki.root.clone()]);
        let presented = [pki.leaf.clone(), pki.intermediate.clone()];

        // year 5000
        let later = UnixTime::since_unix_epoch(Duration::from_secs(95_617_584_000));
        let assessed = prober.assess(result("other.test"), &presented, later);
        assert_eq!(Some("CERTERROR"), assessed.code());
        assert_eq!(
            Some("certificate has expired".to_string()),
            assessed.error.map(|e| e.to_string())
        );
    }

    #[test]
    fn t_assess_untrusted_and_invalid_hostname() {
        let pki = pki();
        let prober = prober(vec![]);
        let presented = [pki.leaf.clone(), pki.intermediate.clone()];

        let assessed = prober.assess(result("other.test"), &presented, UnixTime::now());
        assert_eq!(Some("INVALIDHOSTNAME"), assessed.code());
    }

    #[test]
    fn t_assess_unknown_authority() {
        let pki = pki();
        let prober = prober(vec![]);
        let presented = [pki.leaf.clone(), pki.intermediate.clone()];

        let assessed = prober.assess(result("probe.test"), &presented, UnixTime::now());
        assert_eq!(Some("CERTERROR"), assessed.code());
        assert_eq!(
            Some("certificate signed by unknown authority".to_string()),
            assessed.error.map(|e| e.to_string())
        );
    }

    #[test]
    fn t_assess_garbage() {
        let prober = prober(vec![]);
        let presented = [CertificateDer::from(b"garbage".to_vec())];
        let assessed = prober.assess(result("probe.test"), &presented, UnixTime::now());
        assert_eq!(Some("CERTERROR"), assessed.code());
        assert!(assessed.chains.is_empty());
    }

    #[test]
    fn t_assess_is_idempotent() {
        let pki = pki();
        let prober = prober(vec![pki.root.clone()]);
        let presented = [pki.leaf.clone(), pki.intermediate.clone()];
        let now = UnixTime::now();

        let left = prober.assess(result("probe.test"), &presented, now);
        let right = prober.assess(result("probe.test"), &presented, now);
        assert_eq!(left, right);
    }
}
