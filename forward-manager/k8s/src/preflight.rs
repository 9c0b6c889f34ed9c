use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::{api::PostParams, Api, Client};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("failed to check permissions: {0}")]
    Check(#[source] kube::Error),

    #[error("access denied: {0}")]
    Denied(String),
}

/// Issues a self-subject access review for `pods/portforward:create` on the
/// target pod. No tunnel is dialed unless this passes.
pub async fn check_port_forward_access(
    client: &Client,
    namespace: &str,
    pod: &str,
) -> Result<(), PermissionError> {
    let review = SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                namespace: Some(namespace.to_string()),
                verb: Some("create".to_string()),
                // Pods live in the core API group.
                group: Some(String::new()),
                resource: Some("pods".to_string()),
                subresource: Some("portforward".to_string()),
                name: Some(pod.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    };

    let api = Api::<SelfSubjectAccessReview>::all(client.clone());
    let review = api
        .create(&PostParams::default(), &review)
        .await
        .map_err(PermissionError::Check)?;

    let status = review.status.unwrap_or_default();
    if !status.allowed {
        let reason = status
            .reason
            .filter(|reason| !reason.is_empty())
            .unwrap_or_else(|| "insufficient permissions".to_string());
        return Err(PermissionError::Denied(reason));
    }

    Ok(())
}
