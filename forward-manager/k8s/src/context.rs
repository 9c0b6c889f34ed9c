use kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::{Client, Config};
use secrecy::SecretString;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("failed to read kubeconfig: {0}")]
    Read(#[source] KubeconfigError),

    #[error("failed to resolve context {context}: {source}")]
    Resolve {
        context: String,
        #[source]
        source: KubeconfigError,
    },

    #[error("failed to create client: {0}")]
    Client(#[from] kube::Error),
}

/// Named cluster contexts loaded from a kubeconfig.
///
/// Resolution is per-call; nothing is cached beyond the parsed file, so a
/// caller-supplied bearer token never leaks across requests.
#[derive(Clone, Debug)]
pub struct ContextStore {
    kubeconfig: Kubeconfig,
}

impl ContextStore {
    pub fn new(kubeconfig: Kubeconfig) -> Self {
        Self { kubeconfig }
    }

    /// Loads from an explicit path, or from the ambient `KUBECONFIG`/default
    /// chain when none is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ContextError> {
        let kubeconfig = match path {
            Some(path) => Kubeconfig::read_from(path),
            None => Kubeconfig::read(),
        }
        .map_err(ContextError::Read)?;
        Ok(Self::new(kubeconfig))
    }

    /// Resolves a named context into everything needed to build clients
    /// against its cluster.
    pub async fn get_context(&self, name: &str) -> Result<ClusterContext, ContextError> {
        let options = KubeConfigOptions {
            context: Some(name.to_string()),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(self.kubeconfig.clone(), &options)
            .await
            .map_err(|source| ContextError::Resolve {
                context: name.to_string(),
                source,
            })?;
        Ok(ClusterContext { config })
    }
}

/// One resolved kubeconfig context.
#[derive(Clone, Debug)]
pub struct ClusterContext {
    config: Config,
}

impl ClusterContext {
    /// Builds an API client for the context, overriding the bearer token
    /// when the caller supplied one.
    pub fn client_with_token(&self, token: Option<&str>) -> Result<Client, ContextError> {
        let mut config = self.config.clone();
        if let Some(token) = token.filter(|token| !token.is_empty()) {
            config.auth_info.token = Some(SecretString::from(token.to_string()));
        }
        Client::try_from(config).map_err(ContextError::Client)
    }
}
