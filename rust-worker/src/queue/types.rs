//! Mail job payload carried on the primary, delayed and failure queues.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::tier::Tier;

/// Error reported by the remote mail server for a failed send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// SMTP reply code
    pub code: i64,
    /// Reply text
    #[serde(default)]
    pub message: String,
}

impl JobError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Outbound mail job.
///
/// Fields this service does not understand are kept in `extra` and written
/// back unchanged when the job is republished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier assigned by the producer
    pub id: u64,
    /// Envelope sender address
    #[serde(default)]
    pub envelope: String,
    /// Recipient address
    #[serde(default)]
    pub recipient: String,
    /// Destination mail domain; derived from the recipient when absent
    #[serde(default)]
    pub hostname: String,
    /// Raw message body
    #[serde(default)]
    pub body: String,
    /// Tier the job was last placed into
    #[serde(default)]
    pub tier: Tier,
    /// Whether the last failure was a rate limit
    #[serde(default)]
    pub overlimit: bool,
    /// Remote error from the last failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    /// Decode a delivery body and fill in derived fields.
    pub fn from_slice(data: &[u8]) -> serde_json::Result<Self> {
        let mut job: Job = serde_json::from_slice(data)?;
        if job.hostname.is_empty() {
            job.hostname = recipient_domain(&job.recipient).unwrap_or_default().to_string();
        }
        Ok(job)
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Domain part of an address.
fn recipient_domain(address: &str) -> Option<&str> {
    let address = address.trim().trim_start_matches('<').trim_end_matches('>');
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
}
