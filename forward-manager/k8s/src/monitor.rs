use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use porthole_forward_core::{Session, SessionStatus, SessionStore};
use thiserror::Error;
use tokio::time::{self, Duration, MissedTickBehavior};

/// Cadence of the per-session pod liveness check.
pub const POD_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
enum CheckError {
    #[error(transparent)]
    Api(#[from] kube::Error),

    #[error("pod is not running")]
    NotRunning,
}

/// Periodically verifies the session's pod is still `Running`. On loss, the
/// terminal state is persisted before the session's stop signal is closed.
/// Runs until the stop signal fires; started only after a successful
/// readiness transition.
pub async fn monitor_pod(client: Client, store: SessionStore, mut session: Session) {
    let api = Api::<Pod>::namespaced(client, &session.namespace);
    let mut ticker = time::interval(POD_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first interval tick completes immediately; the readiness handshake
    // just proved the pod reachable, so skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = session.stop.stopped() => {
                tracing::info!(
                    id = %session.id,
                    pod = %session.pod,
                    "pod monitor stopping: session stop signal fired",
                );
                return;
            }
            _ = ticker.tick() => {
                match check_pod_running(&api, &session.pod).await {
                    Ok(()) => {}
                    Err(CheckError::Api(error)) if is_connection_refused(&error) => {
                        tracing::info!(
                            id = %session.id,
                            pod = %session.pod,
                            %error,
                            "transient apiserver error checking pod, continuing",
                        );
                    }
                    Err(error) => {
                        let message = format!(
                            "Pod {}/{} check failed: {}",
                            session.namespace, session.pod, error,
                        );
                        tracing::error!(id = %session.id, %message, "stopping port forward");

                        session.status = SessionStatus::Stopped;
                        session.error = message;
                        store.store(&session);
                        session.stop.stop();
                        return;
                    }
                }
            }
        }
    }
}

async fn check_pod_running(api: &Api<Pod>, pod: &str) -> Result<(), CheckError> {
    let pod = api.get(pod).await?;
    let phase = pod.status.and_then(|status| status.phase);
    if phase.as_deref() != Some("Running") {
        return Err(CheckError::NotRunning);
    }
    Ok(())
}

/// Walks the error source chain looking for a refused TCP connection, which
/// indicates transient control-plane unavailability rather than a pod
/// failure.
fn is_connection_refused(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = error.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = cause.source();
    }
    false
}
