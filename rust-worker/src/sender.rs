//! Hand-off to the external sender service.
//!
//! A worker dispatches a job together with a single-use completion channel
//! and then waits on the receiving half. The sender must complete the channel
//! exactly once; a dropped channel counts as a transient failure.

use std::time::Duration;

use reqwest::{header::CONTENT_TYPE, Client};
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::queue::{Job, JobError};

/// Outcome of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Delivered,
    Failed {
        /// Remote reply, if the remote answered
        error: Option<JobError>,
        /// Per-destination rate limit was hit
        overlimit: bool,
    },
}

impl Verdict {
    /// Failure where the remote never answered.
    pub fn transient() -> Self {
        Verdict::Failed {
            error: None,
            overlimit: false,
        }
    }
}

/// Sending half of the completion channel handed to a [`Sender`].
pub type Completion = oneshot::Sender<Verdict>;

/// External mail sender.
pub trait Sender: Send + Sync {
    /// Start sending `job`; report the outcome on `done`.
    fn dispatch(&self, job: &Job, done: Completion);
}

/// Dispatch a job and wait for its verdict.
pub async fn send(sender: &dyn Sender, job: &Job) -> Verdict {
    let (done, verdict) = oneshot::channel();
    sender.dispatch(job, done);
    match verdict.await {
        Ok(verdict) => verdict,
        Err(_) => {
            warn!(job_id = job.id, "sender_dropped_completion");
            Verdict::transient()
        }
    }
}

/// Reply body of the sender service.
#[derive(Debug, Deserialize)]
struct SenderReply {
    status: ReplyStatus,
    #[serde(default)]
    error: Option<JobError>,
    #[serde(default)]
    overlimit: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ReplyStatus {
    Sent,
    Failed,
}

impl From<SenderReply> for Verdict {
    fn from(reply: SenderReply) -> Self {
        match reply.status {
            ReplyStatus::Sent => Verdict::Delivered,
            ReplyStatus::Failed => Verdict::Failed {
                error: reply.error,
                overlimit: reply.overlimit,
            },
        }
    }
}

/// Sender that POSTs each job to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpSender {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpSender {
    pub fn new(client: Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    async fn post(&self, job_id: u64, body: Vec<u8>) -> Verdict {
        let request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .body(body);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                if e.is_timeout() {
                    error!(
                        job_id,
                        timeout_seconds = self.timeout.as_secs_f64(),
                        error = %e,
                        "sender_request_timeout"
                    );
                } else {
                    error!(job_id, error = %e, "sender_request_error");
                }
                return Verdict::transient();
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(job_id, status_code = status.as_u16(), "sender_request_rejected");
            return Verdict::transient();
        }

        match response.bytes().await {
            Ok(bytes) => parse_reply(job_id, &bytes),
            Err(e) => {
                error!(job_id, error = %e, "sender_reply_read_error");
                Verdict::transient()
            }
        }
    }
}

fn parse_reply(job_id: u64, bytes: &[u8]) -> Verdict {
    match serde_json::from_slice::<SenderReply>(bytes) {
        Ok(reply) => reply.into(),
        Err(e) => {
            warn!(
                job_id,
                error = %e,
                body_preview = %String::from_utf8_lossy(&bytes[..bytes.len().min(200)]),
                "sender_reply_parse_failed"
            );
            Verdict::transient()
        }
    }
}

impl Sender for HttpSender {
    fn dispatch(&self, job: &Job, done: Completion) {
        let body = match job.to_vec() {
            Ok(body) => body,
            Err(e) => {
                error!(job_id = job.id, error = %e, "sender_job_encode_failed");
                let _ = done.send(Verdict::transient());
                return;
            }
        };

        let sender = self.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            let verdict = sender.post(job_id, body).await;
            info!(job_id, verdict = ?verdict, "sender_verdict");
            // The worker may have gone away; nothing to do then.
            let _ = done.send(verdict);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Immediate(Verdict);

    impl Sender for Immediate {
        fn dispatch(&self, _job: &Job, done: Completion) {
            let _ = done.send(self.0.clone());
        }
    }

    struct Forgetful;

    impl Sender for Forgetful {
        fn dispatch(&self, _job: &Job, _done: Completion) {}
    }

    fn job() -> Job {
        Job::from_slice(br#"{"id": 11, "recipient": "a@b.c"}"#).unwrap()
    }

    #[tokio::test]
    async fn test_send_returns_verdict() {
        let verdict = send(&Immediate(Verdict::Delivered), &job()).await;
        assert_eq!(verdict, Verdict::Delivered);
    }

    #[tokio::test]
    async fn test_dropped_completion_is_transient_failure() {
        let verdict = send(&Forgetful, &job()).await;
        assert_eq!(verdict, Verdict::transient());
    }

    #[test]
    fn test_parse_reply_sent() {
        assert_eq!(parse_reply(1, br#"{"status": "sent"}"#), Verdict::Delivered);
    }

    #[test]
    fn test_parse_reply_failed_with_error() {
        let verdict = parse_reply(
            1,
            br#"{"status": "failed", "error": {"code": 550, "message": "no such user"}}"#,
        );
        assert_eq!(
            verdict,
            Verdict::Failed {
                error: Some(JobError::new(550, "no such user")),
                overlimit: false,
            }
        );
    }

    #[test]
    fn test_parse_reply_keeps_code_outside_smtp_range() {
        let verdict = parse_reply(1, br#"{"status": "failed", "error": {"code": 100000}}"#);
        assert_eq!(
            verdict,
            Verdict::Failed {
                error: Some(JobError::new(100000, "")),
                overlimit: false,
            }
        );
    }

    #[test]
    fn test_parse_reply_overlimit() {
        let verdict = parse_reply(1, br#"{"status": "failed", "overlimit": true}"#);
        assert_eq!(
            verdict,
            Verdict::Failed {
                error: None,
                overlimit: true,
            }
        );
    }

    #[test]
    fn test_parse_reply_garbage_is_transient() {
        assert_eq!(parse_reply(1, b"<html>502</html>"), Verdict::transient());
        assert_eq!(parse_reply(1, br#"{"status": "queued"}"#), Verdict::transient());
    }
}
