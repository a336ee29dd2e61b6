//! Maps client connections to the task keys issued to them.

use std::{collections::HashMap, sync::Arc};

use shared_types::TaskKey;
use tokio::sync::Mutex;

use crate::connection::{Connection, ConnectionId};
use crate::error::TaskError;

#[derive(Default)]
pub struct SessionCoordinator {
    bindings: Mutex<HashMap<TaskKey, Arc<dyn Connection>>>,
}

impl SessionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh key bound to `connection`.
    pub async fn bind(&self, connection: Arc<dyn Connection>) -> TaskKey {
        let mut bindings = self.bindings.lock().await;
        let mut key = TaskKey::new();
        while bindings.contains_key(&key) {
            key = TaskKey::new();
        }
        bindings.insert(key.clone(), connection);
        key
    }

    pub async fn connection_for(&self, key: &TaskKey) -> Option<Arc<dyn Connection>> {
        self.bindings.lock().await.get(key).cloned()
    }

    /// The connection bound to `key`, provided it is `expected`.
    pub async fn verify(
        &self,
        key: &TaskKey,
        expected: ConnectionId,
    ) -> Result<Arc<dyn Connection>, TaskError> {
        match self.bindings.lock().await.get(key) {
            Some(conn) if conn.id() == expected => Ok(Arc::clone(conn)),
            Some(_) => Err(TaskError::ConnectionMismatch(key.clone())),
            None => Err(TaskError::UnknownSession(key.clone())),
        }
    }

    pub async fn unbind(&self, key: &TaskKey) -> Option<Arc<dyn Connection>> {
        self.bindings.lock().await.remove(key)
    }

    /// Remove every key bound to `connection`, returning them.
    pub async fn unbind_connection(&self, connection: ConnectionId) -> Vec<TaskKey> {
        let mut bindings = self.bindings.lock().await;
        let keys: Vec<TaskKey> = bindings
            .iter()
            .filter(|(_, conn)| conn.id() == connection)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            bindings.remove(key);
        }
        keys
    }

    pub async fn len(&self) -> usize {
        self.bindings.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bindings.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelConnection;

    #[tokio::test]
    async fn unbinding_a_connection_returns_only_its_keys() {
        let sessions = SessionCoordinator::new();
        let (a, _rx_a) = ChannelConnection::new();
        let (b, _rx_b) = ChannelConnection::new();

        let k1 = sessions.bind(a.clone()).await;
        let k2 = sessions.bind(a.clone()).await;
        let k3 = sessions.bind(b.clone()).await;

        let mut removed = sessions.unbind_connection(a.id()).await;
        removed.sort();
        let mut expected = vec![k1, k2];
        expected.sort();
        assert_eq!(removed, expected);
        assert!(sessions.connection_for(&k3).await.is_some());
        assert!(sessions.unbind_connection(a.id()).await.is_empty());
    }

    #[tokio::test]
    async fn verify_rejects_foreign_connections() {
        let sessions = SessionCoordinator::new();
        let (a, _rx_a) = ChannelConnection::new();
        let (b, _rx_b) = ChannelConnection::new();
        let key = sessions.bind(a.clone()).await;

        assert!(sessions.verify(&key, a.id()).await.is_ok());
        assert!(matches!(
            sessions.verify(&key, b.id()).await,
            Err(TaskError::ConnectionMismatch(_))
        ));
        assert!(matches!(
            sessions.verify(&TaskKey::from("nope"), a.id()).await,
            Err(TaskError::UnknownSession(_))
        ));
    }
}
