//! Proxy lifecycle.
//!
//! `start`, `stop` and `update` serialize on one async mutex per proxy. The
//! listener task runs outside that lock: `stop` flips the supervision token
//! and awaits the task's `JoinHandle`, so once it returns no new peer can be
//! admitted and the listening socket is gone.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use faultline_toxics::ToxicCollection;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

use super::{tcp, udp, ConnectionRegistry, ListenerContext};
use crate::config::{Protocol, ProxyConfig, UdpSessionPolicy};
use crate::error::ProxyError;

/// Handle on a running listener task.
struct Supervision {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Fields guarded by the control lock.
struct ControlState {
    listen: String,
    upstream: String,
    enabled: bool,
    supervision: Option<Supervision>,
}

/// One listen/upstream pair and the traffic relayed between them.
///
/// A new proxy is disabled; `start` binds the listen address and admits
/// peers until `stop`. The toxic collection belongs to the proxy and
/// survives restarts.
pub struct Proxy {
    name: String,
    protocol: Protocol,
    control: Mutex<ControlState>,
    snapshot: ArcSwap<ProxyConfig>,
    connections: Arc<ConnectionRegistry>,
    toxics: Arc<ToxicCollection>,
    udp_policy: UdpSessionPolicy,
}

impl Proxy {
    /// A disabled TCP proxy.
    pub fn tcp(
        name: impl Into<String>,
        listen: impl Into<String>,
        upstream: impl Into<String>,
    ) -> Self {
        Self::build(Protocol::Tcp, name.into(), listen.into(), upstream.into())
    }

    /// A disabled UDP proxy.
    pub fn udp(
        name: impl Into<String>,
        listen: impl Into<String>,
        upstream: impl Into<String>,
    ) -> Self {
        Self::build(Protocol::Udp, name.into(), listen.into(), upstream.into())
    }

    /// A disabled proxy for `config`. `config.enabled` is not applied; the
    /// caller decides whether to start it.
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::build(
            config.protocol,
            config.name.clone(),
            config.listen.clone(),
            config.upstream.clone(),
        )
    }

    fn build(protocol: Protocol, name: String, listen: String, upstream: String) -> Self {
        let snapshot = ProxyConfig {
            name: name.clone(),
            listen: listen.clone(),
            upstream: upstream.clone(),
            enabled: false,
            protocol,
        };

        Self {
            toxics: Arc::new(ToxicCollection::new(name.clone())),
            name,
            protocol,
            control: Mutex::new(ControlState {
                listen,
                upstream,
                enabled: false,
                supervision: None,
            }),
            snapshot: ArcSwap::from_pointee(snapshot),
            connections: Arc::new(ConnectionRegistry::new()),
            udp_policy: UdpSessionPolicy::default(),
        }
    }

    /// Idle eviction for UDP virtual connections. Applies from the next
    /// start.
    pub fn with_udp_policy(mut self, policy: UdpSessionPolicy) -> Self {
        self.udp_policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Current configuration. While running, `listen` is the bound address.
    pub fn config(&self) -> ProxyConfig {
        self.snapshot.load().as_ref().clone()
    }

    pub fn listen(&self) -> String {
        self.snapshot.load().listen.clone()
    }

    pub fn upstream(&self) -> String {
        self.snapshot.load().upstream.clone()
    }

    pub fn enabled(&self) -> bool {
        self.snapshot.load().enabled
    }

    pub fn toxics(&self) -> &Arc<ToxicCollection> {
        &self.toxics
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Number of live links (two per relayed peer).
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Bind the listen address and start admitting peers.
    ///
    /// Returns once the listener is bound, so `listen()` reports the
    /// concrete address even when port 0 was configured. On failure the
    /// proxy stays disabled and can be started again.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let mut state = self.control.lock().await;
        self.start_locked(&mut state).await
    }

    /// Stop admitting peers and close every live link.
    ///
    /// Stopping a stopped proxy does nothing.
    pub async fn stop(&self) {
        let mut state = self.control.lock().await;
        self.stop_locked(&mut state).await;
    }

    /// Apply `config`.
    ///
    /// A changed listen or upstream address stops the proxy before the new
    /// addresses are set. The proxy is then started or stopped to match
    /// `config.enabled`.
    pub async fn update(&self, config: &ProxyConfig) -> Result<(), ProxyError> {
        config.validate()?;
        if config.protocol != self.protocol {
            return Err(ProxyError::InvalidConfig(format!(
                "cannot change protocol of {} from {} to {}",
                self.name, self.protocol, config.protocol
            )));
        }

        let mut state = self.control.lock().await;

        if state.listen != config.listen || state.upstream != config.upstream {
            self.stop_locked(&mut state).await;
            state.listen = config.listen.clone();
            state.upstream = config.upstream.clone();
            self.publish(&state);
        }

        if state.enabled != config.enabled {
            if config.enabled {
                self.start_locked(&mut state).await?;
            } else {
                self.stop_locked(&mut state).await;
            }
        }

        Ok(())
    }

    async fn start_locked(&self, state: &mut ControlState) -> Result<(), ProxyError> {
        if state.enabled {
            return Err(ProxyError::AlreadyStarted(self.name.clone()));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let ctx = Arc::new(ListenerContext {
            name: self.name.clone(),
            listen: state.listen.clone(),
            upstream: state.upstream.clone(),
            connections: Arc::clone(&self.connections),
            toxics: Arc::clone(&self.toxics),
            udp_policy: self.udp_policy,
        });

        let span = info_span!(
            "proxy",
            name = %self.name,
            protocol = %self.protocol,
            upstream = %state.upstream
        );
        let task = match self.protocol {
            Protocol::Tcp => tokio::spawn(tcp::serve(ctx, stop_rx, ready_tx).instrument(span)),
            Protocol::Udp => tokio::spawn(udp::serve(ctx, stop_rx, ready_tx).instrument(span)),
        };

        match ready_rx.await {
            Ok(Ok(addr)) => {
                state.listen = addr.to_string();
                state.enabled = true;
                state.supervision = Some(Supervision {
                    stop: stop_tx,
                    task,
                });
                self.publish(state);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = task.await;
                Err(e)
            }
            Err(_) => {
                let _ = task.await;
                Err(ProxyError::ListenerExited)
            }
        }
    }

    async fn stop_locked(&self, state: &mut ControlState) {
        if !state.enabled {
            return;
        }
        state.enabled = false;

        match state.supervision.take() {
            Some(supervision) => {
                supervision.stop.send_replace(true);
                if let Err(e) = supervision.task.await {
                    warn!(name = %self.name, error = %e, "Proxy listener task failed");
                }
            }
            None => warn!(
                name = %self.name,
                "Attempted to close an already closed proxy server"
            ),
        }

        let closed = self.connections.close_all().await;
        self.publish(state);

        info!(
            name = %self.name,
            listen = %state.listen,
            upstream = %state.upstream,
            closed,
            "Terminated proxy"
        );
    }

    fn publish(&self, state: &ControlState) {
        self.snapshot.store(Arc::new(ProxyConfig {
            name: self.name.clone(),
            listen: state.listen.clone(),
            upstream: state.upstream.clone(),
            enabled: state.enabled,
            protocol: self.protocol,
        }));
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = self.snapshot.load();
        f.debug_struct("Proxy")
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("listen", &config.listen)
            .field("upstream", &config.upstream)
            .field("enabled", &config.enabled)
            .field("connections", &self.connections.len())
            .finish()
    }
}
