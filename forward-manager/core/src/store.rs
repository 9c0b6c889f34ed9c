use crate::{cache::Cache, session::Session};
use thiserror::Error;

/// Registry scope identifier: the cluster name with the caller's user id
/// appended when one was supplied. Isolates concurrent users of the same
/// cluster.
pub fn scoped_cluster_name(cluster: &str, user_id: Option<&str>) -> String {
    match user_id {
        Some(user_id) if !user_id.is_empty() => format!("{cluster}{user_id}"),
        _ => cluster.to_string(),
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("no port forward with id {id}")]
pub struct NotFound {
    pub id: String,
}

/// Session registry: a thin adapter keying the cache by
/// `scopedCluster + "/" + id`.
#[derive(Clone, Debug, Default)]
pub struct SessionStore {
    cache: Cache<Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            cache: Cache::new(),
        }
    }

    fn key(scoped_cluster: &str, id: &str) -> String {
        format!("{scoped_cluster}/{id}")
    }

    /// Upserts the session under its scoped cluster and id.
    pub fn store(&self, session: &Session) {
        self.cache
            .set(Self::key(&session.cluster, &session.id), session.clone());
    }

    pub fn get(&self, scoped_cluster: &str, id: &str) -> Result<Session, NotFound> {
        self.cache
            .get(&Self::key(scoped_cluster, id))
            .ok_or_else(|| NotFound { id: id.to_string() })
    }

    pub fn list(&self, scoped_cluster: &str) -> Vec<Session> {
        self.cache
            .list(&format!("{scoped_cluster}/"))
            .into_iter()
            .map(|(_, session)| session)
            .collect()
    }

    pub fn delete(&self, scoped_cluster: &str, id: &str) {
        self.cache.delete(&Self::key(scoped_cluster, id));
    }
}
