use k8s_openapi::api::core::v1::{Pod, PodSpec};
use kube::{Api, Client};
use parking_lot::Mutex;
use porthole_forward_core::StopSignal;
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    io::copy_bidirectional,
    net::{TcpListener, TcpStream},
    sync::watch,
};

#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid local port {port:?}: {source}")]
    LocalPort {
        port: String,
        source: std::num::ParseIntError,
    },

    #[error("failed to look up pod {pod}: {source}")]
    PodLookup {
        pod: String,
        #[source]
        source: kube::Error,
    },

    #[error("pod {pod} has no container port named {port:?}")]
    UnknownPortName { pod: String, port: String },
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to listen on 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to the portforward subresource: {0}")]
    Connect(#[source] kube::Error),

    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),
}

/// Append-only diagnostics buffer. The readiness arbiter reads it once at
/// the ready transition; afterwards it is write-only.
#[derive(Clone, Debug, Default)]
pub struct OutputBuffer(Arc<Mutex<String>>);

impl OutputBuffer {
    pub fn append(&self, line: &str) {
        let mut buffer = self.0.lock();
        if !buffer.is_empty() {
            buffer.push('\n');
        }
        buffer.push_str(line);
    }

    pub fn contents(&self) -> String {
        self.0.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Forwards one local TCP port to one container port through the pod's
/// portforward subresource.
///
/// Each accepted connection gets its own upgraded stream; the listener loop
/// runs until the session's stop signal fires.
pub struct PortForwarder {
    api: Api<Pod>,
    pod: String,
    local_port: u16,
    target_port: u16,
    ready: watch::Sender<bool>,
    stop: StopSignal,
    stderr: OutputBuffer,
}

impl PortForwarder {
    /// Builds the forwarder plus the handles its owner needs: the ready
    /// signal, the session's stop signal, and the stderr buffer.
    pub async fn init(
        client: Client,
        namespace: &str,
        pod: &str,
        local_port: &str,
        target_port: &str,
    ) -> Result<(Self, watch::Receiver<bool>, StopSignal, OutputBuffer), InitError> {
        let api = Api::<Pod>::namespaced(client, namespace);

        let local_port = local_port
            .parse::<u16>()
            .map_err(|source| InitError::LocalPort {
                port: local_port.to_string(),
                source,
            })?;
        let target_port = resolve_target_port(&api, pod, target_port).await?;

        let (ready_tx, ready_rx) = watch::channel(false);
        let stop = StopSignal::new();
        let stderr = OutputBuffer::default();

        let forwarder = Self {
            api,
            pod: pod.to_string(),
            local_port,
            target_port,
            ready: ready_tx,
            stop: stop.clone(),
            stderr: stderr.clone(),
        };
        Ok((forwarder, ready_rx, stop, stderr))
    }

    /// Runs the listener loop: binds the local port, dials the subresource
    /// once so a bad pod or port fails the start instead of the first client
    /// connection, then marks ready and relays each accepted connection.
    /// Returns `Ok(())` when the stop signal fires.
    pub async fn forward(self) -> Result<(), ForwardError> {
        let listener = TcpListener::bind(("127.0.0.1", self.local_port))
            .await
            .map_err(|source| ForwardError::Bind {
                port: self.local_port,
                source,
            })?;

        let target_ports = [self.target_port];
        tokio::select! {
            probe = self.api.portforward(&self.pod, &target_ports) => {
                drop(probe.map_err(ForwardError::Connect)?);
            }
            _ = self.stop.stopped() => return Ok(()),
        }

        let _ = self.ready.send(true);
        tracing::debug!(
            pod = %self.pod,
            local_port = self.local_port,
            target_port = self.target_port,
            "listening",
        );

        loop {
            tokio::select! {
                _ = self.stop.stopped() => return Ok(()),
                accepted = listener.accept() => {
                    let (conn, client_addr) = accepted.map_err(ForwardError::Accept)?;
                    tracing::debug!(pod = %self.pod, %client_addr, "accepted connection");

                    let api = self.api.clone();
                    let pod = self.pod.clone();
                    let target_port = self.target_port;
                    let stop = self.stop.clone();
                    let stderr = self.stderr.clone();
                    tokio::spawn(async move {
                        if let Err(error) = relay(api, &pod, target_port, conn, stop).await {
                            tracing::warn!(%pod, %error, "connection relay failed");
                            stderr.append(&error.to_string());
                        }
                    });
                }
            }
        }
    }
}

/// Resolves the target port: numeric ports pass through, named ports are
/// looked up against the pod spec.
async fn resolve_target_port(
    api: &Api<Pod>,
    pod: &str,
    target_port: &str,
) -> Result<u16, InitError> {
    if let Ok(port) = target_port.parse::<u16>() {
        return Ok(port);
    }

    let spec = api
        .get(pod)
        .await
        .map_err(|source| InitError::PodLookup {
            pod: pod.to_string(),
            source,
        })?
        .spec
        .unwrap_or_default();

    named_port_from_spec(&spec, target_port).ok_or_else(|| InitError::UnknownPortName {
        pod: pod.to_string(),
        port: target_port.to_string(),
    })
}

fn named_port_from_spec(spec: &PodSpec, name: &str) -> Option<u16> {
    spec.containers
        .iter()
        .flat_map(|container| container.ports.iter().flatten())
        .find(|port| port.name.as_deref() == Some(name))
        .and_then(|port| u16::try_from(port.container_port).ok())
}

async fn relay(
    api: Api<Pod>,
    pod: &str,
    target_port: u16,
    mut conn: TcpStream,
    stop: StopSignal,
) -> anyhow::Result<()> {
    let mut forwarder = api.portforward(pod, &[target_port]).await?;
    let mut upstream = forwarder
        .take_stream(target_port)
        .ok_or_else(|| anyhow::anyhow!("no stream for port {target_port}"))?;

    tokio::select! {
        res = copy_bidirectional(&mut conn, &mut upstream) => { res?; }
        _ = stop.stopped() => {}
    }
    Ok(())
}
