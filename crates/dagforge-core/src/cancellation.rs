use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Tracks one `CancellationToken` per execution so `cancel_execution` (an
/// endpoint, not a spec.md concept — see SPEC_FULL §C.3) can reach the
/// token threaded through every suspension point inside the Executor.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, execution_id: impl Into<String>) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .write()
            .await
            .insert(execution_id.into(), token.clone());
        token
    }

    pub async fn cancel(&self, execution_id: &str) -> bool {
        match self.tokens.read().await.get(execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, execution_id: &str) {
        self.tokens.write().await.remove(execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_signals_the_token_created_for_an_execution() {
        let registry = CancellationRegistry::new();
        let token = registry.create("exec-1").await;
        assert!(!token.is_cancelled());

        let found = registry.cancel("exec-1").await;
        assert!(found);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_is_a_no_op_for_an_unknown_execution() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel("missing").await);
    }

    #[tokio::test]
    async fn remove_forgets_the_token() {
        let registry = CancellationRegistry::new();
        registry.create("exec-2").await;
        registry.remove("exec-2").await;
        assert!(!registry.cancel("exec-2").await);
    }
}
