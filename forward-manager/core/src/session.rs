use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Wire status of a session. `Running` from first readiness until any
/// terminal cause; `Stopped` is final.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Running,
    Stopped,
}

/// Single-shot broadcast handle owned by a session.
///
/// Every task belonging to the session selects on [`StopSignal::stopped`]
/// and exits when the signal fires. Closing is idempotent: any task may call
/// [`StopSignal::stop`] any number of times.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(CancellationToken);

impl StopSignal {
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    /// Signals every task of the session to exit.
    pub fn stop(&self) {
        self.0.cancel();
    }

    /// Completes once the signal has fired.
    pub async fn stopped(&self) {
        self.0.cancelled().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("namespace is required")]
    MissingNamespace,
    #[error("pod name is required")]
    MissingPod,
    #[error("targetPort is required")]
    MissingTargetPort,
    #[error("invalid request, id is required")]
    MissingId,
}

/// Start-request payload. Absent fields decode as empty strings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortForwardRequest {
    pub id: String,
    pub namespace: String,
    pub pod: String,
    /// Carried through for UI linkage; never used to resolve the tunnel.
    pub service: String,
    pub service_namespace: String,
    /// Numeric container port or named port, passed through verbatim.
    pub target_port: String,
    /// Local port; empty means the allocator picks one.
    pub port: String,
}

impl PortForwardRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.namespace.is_empty() {
            return Err(ValidationError::MissingNamespace);
        }
        if self.pod.is_empty() {
            return Err(ValidationError::MissingPod);
        }
        if self.target_port.is_empty() {
            return Err(ValidationError::MissingTargetPort);
        }
        Ok(())
    }
}

/// Stop-or-delete payload: `stopOrDelete == true` removes the registry
/// entry after the stop, `false` retains the stopped record.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StopOrDeleteRequest {
    pub id: String,
    pub stop_or_delete: bool,
}

impl StopOrDeleteRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingId);
        }
        Ok(())
    }
}

/// One port-forward session, live or terminal.
///
/// `cluster` is the scoped cluster name the session is registered under.
/// The stop signal is shared by every clone of the record and is never
/// serialized.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub pod: String,
    pub service: String,
    pub service_namespace: String,
    pub namespace: String,
    pub cluster: String,
    pub port: String,
    pub target_port: String,
    pub status: SessionStatus,
    pub error: String,
    #[serde(skip)]
    pub stop: StopSignal,
}

/// Projection returned by the get-by-id endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub pod: String,
    pub service: String,
    pub cluster: String,
    pub namespace: String,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            pod: session.pod.clone(),
            service: session.service.clone(),
            cluster: session.cluster.clone(),
            namespace: session.namespace.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session {
            id: "s1".to_string(),
            pod: "web-0".to_string(),
            service: "web".to_string(),
            service_namespace: "demo".to_string(),
            namespace: "demo".to_string(),
            cluster: "c1".to_string(),
            port: "8080".to_string(),
            target_port: "80".to_string(),
            status: SessionStatus::Running,
            error: String::new(),
            stop: StopSignal::new(),
        }
    }

    #[test]
    fn status_wire_literals() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Running).unwrap(),
            "\"Running\""
        );
        assert_eq!(
            serde_json::to_string(&SessionStatus::Stopped).unwrap(),
            "\"Stopped\""
        );
    }

    #[test]
    fn session_serializes_camel_case_without_stop() {
        let json = serde_json::to_value(session()).unwrap();
        let object = json.as_object().unwrap();
        assert!(object.contains_key("serviceNamespace"));
        assert!(object.contains_key("targetPort"));
        assert_eq!(object["status"], "Running");
        assert!(!object.contains_key("stop"));
        assert!(!object.contains_key("stopSignal"));
    }

    #[test]
    fn request_decodes_with_absent_fields() {
        let request: PortForwardRequest =
            serde_json::from_str(r#"{"namespace":"demo","pod":"web-0","targetPort":"80"}"#)
                .unwrap();
        assert_eq!(request.namespace, "demo");
        assert_eq!(request.target_port, "80");
        assert_eq!(request.id, "");
        assert_eq!(request.port, "");
        assert!(request.validate().is_ok());
    }

    #[test]
    fn validation_messages() {
        let mut request = PortForwardRequest {
            namespace: "demo".to_string(),
            pod: "web-0".to_string(),
            target_port: "80".to_string(),
            ..Default::default()
        };
        assert!(request.validate().is_ok());

        request.pod.clear();
        assert_eq!(
            request.validate().unwrap_err().to_string(),
            "pod name is required"
        );

        request.namespace.clear();
        assert_eq!(
            request.validate().unwrap_err().to_string(),
            "namespace is required"
        );

        let stop = StopOrDeleteRequest::default();
        assert_eq!(
            stop.validate().unwrap_err().to_string(),
            "invalid request, id is required"
        );
    }

    #[tokio::test]
    async fn stop_signal_is_idempotent_across_tasks() {
        let signal = StopSignal::new();
        assert!(!signal.is_stopped());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let signal = signal.clone();
            tasks.push(tokio::spawn(async move { signal.stop() }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        signal.stop();

        assert!(signal.is_stopped());
        signal.stopped().await;
    }

    #[tokio::test]
    async fn stop_signal_broadcasts_to_all_clones() {
        let signal = StopSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.stopped().await });

        signal.stop();
        task.await.unwrap();
    }
}
