use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::certificate::Chain;
use crate::outcome::ProbeError;
use crate::request::ProbeRequest;

/// Outcome of one probe
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ProbeResult {
    /// Echo of the requested hostname
    pub hostname: String,
    /// Echo of the requested host
    pub host: String,
    /// Echo of the requested port
    pub port: u16,
    /// Verified chains, or the presented chain when verification failed
    #[serde(rename = "cert")]
    pub chains: Vec<Chain>,
    /// Classified failure, absent on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProbeError>,
    /// Wall clock time spent on the probe
    #[serde(serialize_with = "serialize_seconds")]
    pub duration: Duration,
}

impl ProbeResult {
    /// Empty successful result echoing the request
    ///
    /// ```
    /// # use certprobe::{ProbeRequest, ProbeResult};
    /// let request = ProbeRequest::new("sslping.com", "195.154.227.44", 443);
    /// let result = ProbeResult::new(&request);
    /// assert_eq!("sslping.com", result.hostname);
    /// assert!(result.is_success());
    /// ```
    pub fn new(request: &ProbeRequest) -> Self {
        ProbeResult {
            hostname: request.hostname.clone(),
            host: request.host.clone(),
            port: request.port,
            ..Default::default()
        }
    }

    /// Same result marked as failed
    pub fn failed(mut self, error: ProbeError) -> Self {
        self.error = Some(error);
        self
    }

    /// Same result carrying `chains`
    pub fn with_chains(mut self, chains: Vec<Chain>) -> Self {
        self.chains = chains;
        self
    }

    /// Same result with the time it took
    pub fn finish(mut self, elapsed: Duration) -> Self {
        self.duration = elapsed;
        self
    }

    /// No error was classified
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Stable code of the failure, if any
    ///
    /// ```
    /// # use certprobe::{ProbeError, ProbeRequest, ProbeResult};
    /// let result = ProbeResult::new(&ProbeRequest::default()).failed(ProbeError::Timeout);
    /// assert_eq!(Some("ETIMEOUT"), result.code());
    /// ```
    pub fn code(&self) -> Option<&'static str> {
        self.error.as_ref().map(ProbeError::code)
    }

    /// Encode as JSON
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.hostname, self.port, self.host)?;
        match &self.error {
            Some(e) => write!(f, " error: {} ({})", e, e.code())?,
            None => write!(f, " ok, {} chain(s)", self.chains.len())?,
        }
        write!(f, ", {}ms elapsed", self.duration.as_millis())
    }
}

fn serialize_seconds<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}
