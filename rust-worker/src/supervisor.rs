//! Broker connection supervision.
//!
//! The supervisor dials every configured endpoint once at startup and owns
//! the resulting connections. Each connection is published on a
//! [`tokio::sync::watch`] channel; worker pools only ever hold a
//! [`ConnectionHandle`] (the receiving side) and the supervisor's listener task
//! is the single writer.
//!
//! When a connection reports an error, or a worker finds its consumer ended
//! on a connection that is no longer up, the listener redials once. Success
//! replaces the connection for every handle of that endpoint and re-arms the
//! listener; failure is a [`ConfigurationError`] that ends the process.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use lapin::{Connection, ConnectionProperties};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use url::Url;

use crate::error::ConfigurationError;

/// Strip credentials from a broker URI before it is logged or reported.
pub fn redact_uri(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<invalid uri>".to_string(),
    }
}

/// Read side of one endpoint's current connection.
pub struct ConnectionHandle<T = Connection> {
    endpoint: Arc<str>,
    current: watch::Receiver<Arc<T>>,
    lost: mpsc::UnboundedSender<Arc<T>>,
}

impl<T> Clone for ConnectionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            endpoint: Arc::clone(&self.endpoint),
            current: self.current.clone(),
            lost: self.lost.clone(),
        }
    }
}

impl<T> ConnectionHandle<T> {
    pub(crate) fn new(
        endpoint: Arc<str>,
        current: watch::Receiver<Arc<T>>,
        lost: mpsc::UnboundedSender<Arc<T>>,
    ) -> Self {
        Self {
            endpoint,
            current,
            lost,
        }
    }

    /// Redacted endpoint URI.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The connection workers should open channels on right now.
    pub fn current(&self) -> Arc<T> {
        Arc::clone(&*self.current.borrow())
    }

    /// Tell the supervisor `stale` is gone.
    ///
    /// Reports about a connection that has already been replaced are ignored.
    pub fn report_lost(&self, stale: &Arc<T>) {
        let _ = self.lost.send(Arc::clone(stale));
    }

    /// Wait until the supervisor has replaced `stale`.
    ///
    /// Returns `None` once the supervisor is gone.
    pub async fn replacement(&mut self, stale: &Arc<T>) -> Option<Arc<T>> {
        self.current
            .wait_for(|conn| !Arc::ptr_eq(conn, stale))
            .await
            .ok()
            .map(|conn| Arc::clone(&*conn))
    }
}

impl ConnectionHandle<Connection> {
    pub fn is_connected(&self) -> bool {
        self.current.borrow().status().connected()
    }
}

/// Connection state of one endpoint, as reported by the health server.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub endpoint: String,
    pub connected: bool,
}

impl From<&ConnectionHandle> for EndpointStatus {
    fn from(handle: &ConnectionHandle) -> Self {
        Self {
            endpoint: handle.endpoint().to_string(),
            connected: handle.is_connected(),
        }
    }
}

/// Owns one connection per endpoint URI and keeps it alive.
pub struct ConnectionSupervisor {
    handles: HashMap<String, ConnectionHandle>,
    listeners: JoinSet<Result<(), ConfigurationError>>,
}

impl ConnectionSupervisor {
    /// Dial every endpoint once and start listening for closures.
    pub async fn start<'a>(uris: impl IntoIterator<Item = &'a str>) -> Result<Self, ConfigurationError> {
        let mut handles = HashMap::new();
        let mut listeners = JoinSet::new();

        for uri in uris {
            if handles.contains_key(uri) {
                continue;
            }

            let endpoint: Arc<str> = redact_uri(uri).into();
            let connection = dial(uri, &endpoint)
                .await
                .map_err(|source| ConfigurationError::Connect {
                    endpoint: endpoint.to_string(),
                    source,
                })?;

            let closed = watch_close(&connection);
            let (publish, current) = watch::channel(Arc::new(connection));
            let (lost, reported) = mpsc::unbounded_channel();

            listeners.spawn(supervise(
                Arc::clone(&endpoint),
                publish,
                closed,
                reported,
                redialer(uri, &endpoint),
            ));
            handles.insert(uri.to_string(), ConnectionHandle::new(endpoint, current, lost));
        }

        Ok(Self { handles, listeners })
    }

    /// Handle for a configured endpoint URI.
    pub fn handle(&self, uri: &str) -> Result<ConnectionHandle, ConfigurationError> {
        self.handles
            .get(uri)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownEndpoint {
                endpoint: redact_uri(uri),
            })
    }

    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.handles.values().cloned().collect()
    }

    /// Resolve when a listener fails. Pending forever while all are healthy.
    pub async fn failed(&mut self) -> ConfigurationError {
        while let Some(joined) = self.listeners.join_next().await {
            match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => return e,
                Err(join) => {
                    return ConfigurationError::TaskFailed {
                        task: "connection supervisor",
                        message: join.to_string(),
                    }
                }
            }
        }
        std::future::pending().await
    }

    /// Stop supervising and close every connection.
    pub async fn close(mut self) {
        self.listeners.abort_all();

        for handle in self.handles.values() {
            let connection = handle.current();
            if let Err(e) = connection.close(200, "Normal shutdown").await {
                warn!(endpoint = %handle.endpoint(), error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_connections_closed");
    }
}

async fn dial(uri: &str, endpoint: &str) -> Result<Connection, lapin::Error> {
    info!(endpoint = %endpoint, "rabbitmq_connecting");
    let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
    info!(endpoint = %endpoint, "rabbitmq_connected");
    Ok(connection)
}

/// Forward the connection's error notification into a channel.
///
/// lapin only calls the error handler for error closes; a clean server-side
/// close reaches the supervisor through [`ConnectionHandle::report_lost`].
fn watch_close(connection: &Connection) -> mpsc::UnboundedReceiver<lapin::Error> {
    let (notify, closed) = mpsc::unbounded_channel();
    connection.on_error(move |e| {
        let _ = notify.send(e);
    });
    closed
}

type Redialed<T> = Result<(T, mpsc::UnboundedReceiver<lapin::Error>), lapin::Error>;

/// Dial `uri` again and arm the close listener of the new connection.
fn redialer(
    uri: &str,
    endpoint: &Arc<str>,
) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Redialed<Connection>> + Send>> {
    let uri = uri.to_string();
    let endpoint = Arc::clone(endpoint);
    move || {
        let uri = uri.clone();
        let endpoint = Arc::clone(&endpoint);
        Box::pin(async move {
            let connection = dial(&uri, &endpoint).await?;
            let closed = watch_close(&connection);
            Ok((connection, closed))
        })
    }
}

fn is_current<T>(publish: &watch::Sender<Arc<T>>, candidate: &Arc<T>) -> bool {
    Arc::ptr_eq(&*publish.borrow(), candidate)
}

/// Listener loop for one endpoint.
///
/// Ends cleanly when the close notifications stop, which only happens once
/// the connection itself has been dropped.
async fn supervise<T, D, F>(
    endpoint: Arc<str>,
    publish: watch::Sender<Arc<T>>,
    mut closed: mpsc::UnboundedReceiver<lapin::Error>,
    mut lost: mpsc::UnboundedReceiver<Arc<T>>,
    mut redial: D,
) -> Result<(), ConfigurationError>
where
    D: FnMut() -> F,
    F: Future<Output = Redialed<T>>,
{
    loop {
        let reason = tokio::select! {
            notice = closed.recv() => match notice {
                Some(e) => Some(e.to_string()),
                None => return Ok(()),
            },
            report = lost.recv() => match report {
                Some(stale) if is_current(&publish, &stale) => {
                    Some("consumer ended on a closed connection".to_string())
                }
                Some(_) => None,
                None => return Ok(()),
            },
        };
        let Some(reason) = reason else {
            continue;
        };

        warn!(endpoint = %endpoint, error = %reason, "rabbitmq_connection_lost");

        let (connection, rearmed) = match redial().await {
            Ok(redialed) => redialed,
            Err(source) => {
                error!(endpoint = %endpoint, error = %source, "rabbitmq_reconnect_failed");
                return Err(ConfigurationError::Reconnect {
                    endpoint: endpoint.to_string(),
                    source,
                });
            }
        };

        closed = rearmed;
        publish.send_replace(Arc::new(connection));
        info!(
            endpoint = %endpoint,
            handles = publish.receiver_count(),
            "rabbitmq_reconnected"
        );
    }
}
