use crate::core::{NotFound, PortForwardRequest, Session, SessionStatus, SessionStore};
use crate::k8s::{
    check_port_forward_access, monitor_pod, ContextError, ContextStore, InitError, OutputBuffer,
    PermissionError, PortForwarder,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    time::{self, Duration},
};
use tracing::{error, info};

/// How long a session may take to become ready before the start is
/// abandoned.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to set up Kubernetes client: {0}")]
    Context(#[from] ContextError),

    #[error("permission check failed: {0}")]
    Permission(#[from] PermissionError),

    #[error("failed to initialize port forwarder: {0}")]
    Init(#[from] InitError),

    #[error("{0}")]
    Readiness(String),
}

/// Owns every live session: starts them, arbitrates readiness, spawns the
/// per-session forwarder and pod-monitor tasks, and answers
/// stop/delete/list/get against the registry.
#[derive(Clone)]
pub struct PortForwardManager {
    store: SessionStore,
    contexts: Arc<ContextStore>,
}

impl PortForwardManager {
    pub fn new(store: SessionStore, contexts: Arc<ContextStore>) -> Self {
        Self { store, contexts }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Starts one port-forward session for an already-validated request (id
    /// and local port filled in by the caller).
    pub async fn start(
        &self,
        scoped_cluster: &str,
        request: &PortForwardRequest,
        token: Option<&str>,
    ) -> Result<Session, StartError> {
        let context = self.contexts.get_context(scoped_cluster).await?;
        let client = context.client_with_token(token)?;

        check_port_forward_access(&client, &request.namespace, &request.pod).await?;

        let (forwarder, ready, stop, stderr) = PortForwarder::init(
            client.clone(),
            &request.namespace,
            &request.pod,
            &request.port,
            &request.target_port,
        )
        .await?;

        let session = Session {
            id: request.id.clone(),
            pod: request.pod.clone(),
            service: request.service.clone(),
            service_namespace: request.service_namespace.clone(),
            namespace: request.namespace.clone(),
            cluster: scoped_cluster.to_string(),
            port: request.port.clone(),
            target_port: request.target_port.clone(),
            status: SessionStatus::Running,
            error: String::new(),
            stop,
        };

        let (error_tx, error_rx) = mpsc::channel(1);
        spawn_forwarder(self.store.clone(), session.clone(), forwarder, error_tx);

        await_ready(
            &self.store,
            &session,
            ready,
            error_rx,
            stderr,
            READINESS_TIMEOUT,
        )
        .await
        .map_err(StartError::Readiness)?;

        tokio::spawn(monitor_pod(client, self.store.clone(), session.clone()));

        Ok(session)
    }

    /// Stops the session and, with delete semantics, removes its record.
    /// The terminal state is persisted before the stop signal is closed so
    /// list/get observers never see a live record for a stopped session.
    pub fn stop_or_delete(
        &self,
        scoped_cluster: &str,
        id: &str,
        delete: bool,
    ) -> Result<(), NotFound> {
        let mut session = self.store.get(scoped_cluster, id)?;

        if session.status == SessionStatus::Running {
            session.status = SessionStatus::Stopped;
            self.store.store(&session);
        }
        session.stop.stop();

        if delete {
            self.store.delete(scoped_cluster, id);
        }

        info!(id, cluster = scoped_cluster, delete, "port forward stopped");
        Ok(())
    }

    pub fn list(&self, scoped_cluster: &str) -> Vec<Session> {
        self.store.list(scoped_cluster)
    }

    pub fn get(&self, scoped_cluster: &str, id: &str) -> Result<Session, NotFound> {
        self.store.get(scoped_cluster, id)
    }
}

/// Runs the forwarder until it exits, then converges the record: an error
/// exit stamps the error and reports it on the error channel; a clean exit
/// while the record is still `Running` stamps a plain stop.
fn spawn_forwarder(
    store: SessionStore,
    mut session: Session,
    forwarder: PortForwarder,
    error_tx: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        match forwarder.forward().await {
            Err(forward_error) => {
                error!(id = %session.id, pod = %session.pod, %forward_error, "port forward failed");
                session.status = SessionStatus::Stopped;
                session.error = forward_error.to_string();
                store.store(&session);
                let _ = error_tx.try_send(forward_error.to_string());
                session.stop.stop();
            }
            Ok(()) => {
                info!(id = %session.id, pod = %session.pod, "port forward exited");
                stamp_clean_exit(&store, &session);
            }
        }
    });
}

/// A clean forwarder exit observed while the record is still `Running`
/// becomes a terminal stop. Re-reading the registry picks up any state
/// another task converged to in the meantime.
fn stamp_clean_exit(store: &SessionStore, session: &Session) {
    if let Ok(mut current) = store.get(&session.cluster, &session.id) {
        if current.status == SessionStatus::Running {
            current.status = SessionStatus::Stopped;
            if current.error.is_empty() {
                current.error = "Port forward stopped.".to_string();
            }
            store.store(&current);
        }
    }
}

/// Waits for the first of: ready, forwarder error, timeout, or premature
/// stop, and converges the session record accordingly.
async fn await_ready(
    store: &SessionStore,
    session: &Session,
    mut ready: watch::Receiver<bool>,
    mut forward_errors: mpsc::Receiver<String>,
    stderr: OutputBuffer,
    timeout: Duration,
) -> Result<(), String> {
    tokio::select! {
        res = ready.wait_for(|ready| *ready) => match res {
            Ok(_) if !stderr.is_empty() => Err(converge_failed(
                store,
                session,
                format!("portforward failed to start, stderr: {}", stderr.contents()),
            )),
            Ok(_) => {
                let mut session = session.clone();
                session.status = SessionStatus::Running;
                session.error = String::new();
                store.store(&session);
                info!(
                    id = %session.id,
                    pod = %session.pod,
                    port = %session.port,
                    "port forward ready and running",
                );
                Ok(())
            }
            // The forwarder exited before signalling ready; surface its
            // error if one was sent.
            Err(_) => {
                let message = forward_errors
                    .try_recv()
                    .unwrap_or_else(|_| "portforward exited before becoming ready".to_string());
                Err(converge_failed(store, session, message))
            }
        },
        Some(message) = forward_errors.recv() => {
            Err(converge_failed(store, session, message))
        }
        _ = time::sleep(timeout) => Err(converge_failed(
            store,
            session,
            "timeout waiting for portforward to become ready".to_string(),
        )),
        _ = session.stop.stopped() => {
            let message = "portforward stopped before becoming ready".to_string();
            // Another task may already have converged the record; preserve
            // its state and error.
            let mut current = store
                .get(&session.cluster, &session.id)
                .unwrap_or_else(|_| session.clone());
            if current.status == SessionStatus::Running {
                current.status = SessionStatus::Stopped;
            }
            if current.error.is_empty() {
                current.error = message.clone();
            }
            store.store(&current);
            info!(id = %session.id, "{message}");
            Err(message)
        }
    }
}

/// Terminal convergence for a failed start: persist, then close the stop
/// signal, then hand the message back to the caller.
fn converge_failed(store: &SessionStore, session: &Session, message: String) -> String {
    error!(id = %session.id, pod = %session.pod, %message, "portforward error");
    let mut session = session.clone();
    session.status = SessionStatus::Stopped;
    session.error = message.clone();
    store.store(&session);
    session.stop.stop();
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StopSignal;
    use kube::config::Kubeconfig;

    fn session(store: &SessionStore, cluster: &str, id: &str) -> Session {
        let session = Session {
            id: id.to_string(),
            pod: "web-0".to_string(),
            service: String::new(),
            service_namespace: String::new(),
            namespace: "demo".to_string(),
            cluster: cluster.to_string(),
            port: "8080".to_string(),
            target_port: "80".to_string(),
            status: SessionStatus::Running,
            error: String::new(),
            stop: StopSignal::new(),
        };
        store.store(&session);
        session
    }

    fn manager(store: SessionStore) -> PortForwardManager {
        PortForwardManager::new(store, Arc::new(ContextStore::new(Kubeconfig::default())))
    }

    fn channels() -> (
        watch::Sender<bool>,
        watch::Receiver<bool>,
        mpsc::Sender<String>,
        mpsc::Receiver<String>,
    ) {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (error_tx, error_rx) = mpsc::channel(1);
        (ready_tx, ready_rx, error_tx, error_rx)
    }

    #[tokio::test]
    async fn ready_converges_to_running() {
        let store = SessionStore::new();
        let session = session(&store, "c1", "s1");
        let (ready_tx, ready_rx, _error_tx, error_rx) = channels();

        ready_tx.send(true).unwrap();
        await_ready(
            &store,
            &session,
            ready_rx,
            error_rx,
            OutputBuffer::default(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let stored = store.get("c1", "s1").unwrap();
        assert_eq!(stored.status, SessionStatus::Running);
        assert_eq!(stored.error, "");
        assert!(!stored.stop.is_stopped());
    }

    #[tokio::test]
    async fn ready_with_stderr_converges_to_stopped() {
        let store = SessionStore::new();
        let session = session(&store, "c1", "s1");
        let (ready_tx, ready_rx, _error_tx, error_rx) = channels();

        let stderr = OutputBuffer::default();
        stderr.append("bind: address already in use");
        ready_tx.send(true).unwrap();

        let message = await_ready(
            &store,
            &session,
            ready_rx,
            error_rx,
            stderr,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(message.starts_with("portforward failed to start, stderr:"));

        let stored = store.get("c1", "s1").unwrap();
        assert_eq!(stored.status, SessionStatus::Stopped);
        assert!(stored.error.contains("address already in use"));
        assert!(stored.stop.is_stopped());
    }

    #[tokio::test]
    async fn forwarder_error_converges_to_stopped() {
        let store = SessionStore::new();
        let session = session(&store, "c1", "s1");
        let (_ready_tx, ready_rx, error_tx, error_rx) = channels();

        error_tx.try_send("connection reset".to_string()).unwrap();
        let message = await_ready(
            &store,
            &session,
            ready_rx,
            error_rx,
            OutputBuffer::default(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert_eq!(message, "connection reset");

        let stored = store.get("c1", "s1").unwrap();
        assert_eq!(stored.status, SessionStatus::Stopped);
        assert_eq!(stored.error, "connection reset");
        assert!(stored.stop.is_stopped());
    }

    #[tokio::test]
    async fn timeout_converges_to_stopped() {
        let store = SessionStore::new();
        let session = session(&store, "c1", "s1");
        let (_ready_tx, ready_rx, _error_tx, error_rx) = channels();

        let message = await_ready(
            &store,
            &session,
            ready_rx,
            error_rx,
            OutputBuffer::default(),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert_eq!(message, "timeout waiting for portforward to become ready");

        let stored = store.get("c1", "s1").unwrap();
        assert_eq!(stored.status, SessionStatus::Stopped);
        assert_eq!(stored.error, message);
    }

    #[tokio::test]
    async fn premature_stop_preserves_existing_error() {
        let store = SessionStore::new();
        let mut stopped = session(&store, "c1", "s1");
        stopped.status = SessionStatus::Stopped;
        stopped.error = "pod went away".to_string();
        store.store(&stopped);
        stopped.stop.stop();

        let (_ready_tx, ready_rx, _error_tx, error_rx) = channels();
        let message = await_ready(
            &store,
            &stopped,
            ready_rx,
            error_rx,
            OutputBuffer::default(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert_eq!(message, "portforward stopped before becoming ready");

        let stored = store.get("c1", "s1").unwrap();
        assert_eq!(stored.status, SessionStatus::Stopped);
        assert_eq!(stored.error, "pod went away");
    }

    #[tokio::test]
    async fn ready_channel_closed_drains_forwarder_error() {
        let store = SessionStore::new();
        let session = session(&store, "c1", "s1");
        let (ready_tx, ready_rx, error_tx, error_rx) = channels();

        error_tx.try_send("bind failed".to_string()).unwrap();
        drop(ready_tx);
        drop(error_tx);

        // Whichever branch wins the select, the queued forwarder error is
        // the one surfaced.
        let message = await_ready(
            &store,
            &session,
            ready_rx,
            error_rx,
            OutputBuffer::default(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert_eq!(message, "bind failed");

        let stored = store.get("c1", "s1").unwrap();
        assert_eq!(stored.status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_keeps_the_record_and_fires_the_signal() {
        let store = SessionStore::new();
        let session = session(&store, "c1", "s1");
        let manager = manager(store.clone());

        manager.stop_or_delete("c1", "s1", false).unwrap();

        let stored = store.get("c1", "s1").unwrap();
        assert_eq!(stored.status, SessionStatus::Stopped);
        assert_eq!(stored.error, "");
        assert!(session.stop.is_stopped());
    }

    #[tokio::test]
    async fn delete_removes_the_record() {
        let store = SessionStore::new();
        let session = session(&store, "c1", "s1");
        let manager = manager(store.clone());

        manager.stop_or_delete("c1", "s1", true).unwrap();

        assert!(store.get("c1", "s1").is_err());
        assert!(session.stop.is_stopped());
    }

    #[tokio::test]
    async fn stop_of_unknown_id_is_not_found() {
        let manager = manager(SessionStore::new());
        let error = manager.stop_or_delete("c1", "missing", false).unwrap_err();
        assert_eq!(error.id, "missing");
    }

    #[tokio::test]
    async fn clean_exit_stamps_a_running_record() {
        let store = SessionStore::new();
        let session = session(&store, "c1", "s1");

        stamp_clean_exit(&store, &session);

        let stored = store.get("c1", "s1").unwrap();
        assert_eq!(stored.status, SessionStatus::Stopped);
        assert_eq!(stored.error, "Port forward stopped.");
    }

    #[tokio::test]
    async fn clean_exit_preserves_a_stopped_record() {
        let store = SessionStore::new();
        let manager = manager(store.clone());
        session(&store, "c1", "s1");

        manager.stop_or_delete("c1", "s1", false).unwrap();
        let session = store.get("c1", "s1").unwrap();
        stamp_clean_exit(&store, &session);

        let stored = store.get("c1", "s1").unwrap();
        assert_eq!(stored.status, SessionStatus::Stopped);
        assert_eq!(stored.error, "");
    }
}
