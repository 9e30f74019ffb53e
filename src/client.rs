use std::sync::Arc;

use futures::TryStreamExt;
use tracing::debug;

use crate::action::SoapAction;
use crate::delegate::ResponseDelegate;
use crate::engine::SoapEngine;
use crate::error::{Result, SoapError};
use crate::node::NodeTree;
use crate::pool::{ActivityPool, EngineId, RunListener};
use crate::transport::{ResponseMetadata, Transport, TransportExchange};
use crate::tree_builder::node_tree_from_data;

/// Facade creating engines that share one transport and one activity pool
#[derive(Clone)]
pub struct SoapClient {
    transport: Arc<dyn Transport>,
    pool: Arc<ActivityPool>,
}

impl SoapClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_pool(transport, Arc::new(ActivityPool::new()))
    }

    pub fn with_pool(transport: Arc<dyn Transport>, pool: Arc<ActivityPool>) -> Self {
        Self { transport, pool }
    }

    /// New engine reporting its runs to this client's pool
    pub fn engine(&self, delegate: Arc<dyn ResponseDelegate>) -> SoapEngine {
        SoapEngine::new(Arc::clone(&self.transport), delegate)
            .with_listener(Arc::clone(&self.pool) as Arc<dyn RunListener>)
    }

    /// Start a streaming run of `action` on a new engine
    pub fn load(&self, action: &SoapAction, delegate: Arc<dyn ResponseDelegate>) -> Result<SoapEngine> {
        let engine = self.engine(delegate);
        engine.load(action)?;
        Ok(engine)
    }

    /// Send `action` once and decode the whole response
    ///
    /// No retries and no answer to authentication challenges; the returned
    /// tree keeps the raw response bytes.
    pub async fn load_entire(&self, action: &SoapAction) -> Result<(ResponseMetadata, NodeTree)> {
        let request = action.build_request()?;
        let activity = ActivityGuard::start(&self.pool, action.network_activity_indicator);

        let TransportExchange { metadata, body } = self.transport.exchange(&request, None).await?;
        let data = body
            .try_fold(Vec::new(), |mut data, fragment| async move {
                data.extend_from_slice(&fragment);
                Ok(data)
            })
            .await
            .map_err(SoapError::Transport)?;
        drop(activity);

        debug!(
            url = %metadata.url,
            status = metadata.status,
            bytes = data.len(),
            "whole response received"
        );
        let tree = node_tree_from_data(&data)?;
        Ok((metadata, tree))
    }

    pub fn pool(&self) -> &Arc<ActivityPool> {
        &self.pool
    }

    /// Runs currently in flight across this client's engines
    pub fn in_progress(&self) -> usize {
        self.pool.in_progress()
    }

    pub fn is_active(&self) -> bool {
        self.pool.is_active()
    }
}

impl std::fmt::Debug for SoapClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoapClient")
            .field("in_progress", &self.in_progress())
            .finish_non_exhaustive()
    }
}

/// Counts a one-shot exchange in the pool while it is in flight
struct ActivityGuard<'a> {
    pool: Option<&'a ActivityPool>,
    id: EngineId,
}

impl<'a> ActivityGuard<'a> {
    fn start(pool: &'a ActivityPool, enabled: bool) -> Self {
        let id = EngineId::new();
        if enabled {
            pool.run_started(id);
        }
        Self {
            pool: enabled.then_some(pool),
            id,
        }
    }
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool {
            pool.run_finished(self.id);
        }
    }
}
