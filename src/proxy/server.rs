//! Listener lifecycle: socket setup, accept loops, and shutdown handles.

use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ListenerConfig, ProxyConfig};
use crate::error::{CertificateError, StartupError};
use crate::filter::{FilterEngine, FilterRule};
use crate::logging::{LogSink, TracingSink};
use crate::models::LogEvent;
use crate::proxy::connection::ConnectionHandler;
use crate::proxy::upstream::{Forwarder, LocalResponder, TcpForwarder};
use crate::tls::{server_config, CertificateAuthority};

/// Owns the pieces shared by every connection and brings listeners up.
///
/// `start` and `start_tls` each spawn an independent accept loop; a single
/// server can run both side by side over the same filter and forwarder.
pub struct ProxyServer {
    config: ProxyConfig,
    filter: Arc<FilterEngine>,
    forwarder: Arc<dyn Forwarder>,
    sink: Arc<dyn LogSink>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        let filter = Arc::new(FilterEngine::new(FilterRule {
            mode: config.filter.mode,
            patterns: config.filter.patterns.clone(),
        }));
        let forwarder: Arc<dyn Forwarder> = if config.forwarding_enabled {
            Arc::new(TcpForwarder::from_config(&config))
        } else {
            Arc::new(LocalResponder)
        };
        Self {
            config,
            filter,
            forwarder,
            sink: Arc::new(TracingSink),
        }
    }

    /// Replaces the log sink. Embedders use this to observe traffic.
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the upstream forwarder.
    pub fn with_forwarder(mut self, forwarder: Arc<dyn Forwarder>) -> Self {
        self.forwarder = forwarder;
        self
    }

    pub fn filter(&self) -> &FilterEngine {
        &self.filter
    }

    /// Starts the plaintext listener.
    pub async fn start(&self) -> Result<ServerHandle, StartupError> {
        self.start_listener(&self.config.listener).await
    }

    /// Starts the TLS listener.
    pub async fn start_tls(&self) -> Result<ServerHandle, StartupError> {
        self.start_listener(&self.config.tls.listener).await
    }

    /// Brings one configured listener up; its `tls_enabled` flag decides
    /// whether accepted connections are TLS-terminated. The serving identity
    /// is resolved before the socket is bound, so a missing or broken
    /// identity fails startup instead of every handshake.
    async fn start_listener(
        &self,
        listener: &ListenerConfig,
    ) -> Result<ServerHandle, StartupError> {
        let acceptor = if listener.tls_enabled {
            Some(self.tls_acceptor().await?)
        } else {
            None
        };
        let addr = listener.socket_addr()?;
        let socket = bind_listener(addr, listener.backlog)?;
        self.spawn_listener(addr, socket, acceptor)
    }

    async fn tls_acceptor(&self) -> Result<TlsAcceptor, StartupError> {
        let authority = CertificateAuthority::from_settings(&self.config.tls);
        let identity = if self.config.tls.auto_generate {
            authority.load_or_issue().await?
        } else {
            authority.load().await.map_err(|err| match err {
                CertificateError::NotFound {
                    cert_path,
                    key_path,
                } => StartupError::MissingTlsIdentity {
                    cert_path,
                    key_path,
                },
                other => StartupError::Identity(other),
            })?
        };
        Ok(TlsAcceptor::from(server_config(&identity)?))
    }

    fn spawn_listener(
        &self,
        addr: SocketAddr,
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<ServerHandle, StartupError> {
        let local_addr = listener
            .local_addr()
            .map_err(|source| StartupError::Bind { addr, source })?;
        info!(
            "🚀 Proxy listening on {} ({})",
            local_addr,
            if acceptor.is_some() { "tls" } else { "plaintext" }
        );

        let handler = Arc::new(ConnectionHandler::new(
            self.filter.clone(),
            self.forwarder.clone(),
            self.sink.clone(),
            self.config.limits.clone(),
            acceptor.is_some(),
        ));
        let sink = self.sink.clone();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let handler = handler.clone();
                            let acceptor = acceptor.clone();
                            let sink = sink.clone();
                            let conn_token = token.child_token();
                            tokio::spawn(async move {
                                tokio::select! {
                                    () = conn_token.cancelled() => {}
                                    () = serve_connection(handler, acceptor, sink, stream, peer) => {}
                                }
                            });
                        }
                        Err(err) => warn!("accept on {} failed: {}", local_addr, err),
                    },
                }
            }
            info!("listener on {} stopped", local_addr);
        });

        Ok(ServerHandle {
            local_addr,
            shutdown,
            task: Some(task),
        })
    }
}

/// Runs the optional TLS handshake, then hands the stream to the handler.
async fn serve_connection(
    handler: Arc<ConnectionHandler>,
    acceptor: Option<TlsAcceptor>,
    sink: Arc<dyn LogSink>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => handler.run(tls_stream, peer).await,
            Err(err) => sink.publish(LogEvent::error(format!(
                "TLS handshake with {} failed: {}",
                peer, err
            ))),
        },
        None => handler.run(stream, peer).await,
    }
}

/// Binds a reusable nonblocking socket and registers it with the runtime.
fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, StartupError> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let bind_err = |source: std::io::Error| StartupError::Bind { addr, source };

    let socket = Socket::new(domain, Type::STREAM, None).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket
        .listen(backlog.min(i32::MAX as u32) as i32)
        .map_err(bind_err)?;
    TcpListener::from_std(socket.into()).map_err(bind_err)
}

/// Handle for one running listener. Stopping cancels the accept loop and
/// every connection task it spawned.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// The address actually bound, with any ephemeral port resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancels the accept loop and in-flight connections, then waits for
    /// the accept task to exit. Idempotent.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
