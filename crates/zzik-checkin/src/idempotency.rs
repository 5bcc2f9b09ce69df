//! Idempotent submission boundary in front of [`CheckInService`].
//!
//! A request carrying an idempotency key is answered from the cache when the
//! same user sent the same key within the TTL. Only successful responses are
//! cached, so a rejected attempt can be retried with the same key. Two
//! concurrent first attempts with one key are not coalesced.

use std::sync::Arc;

use tracing::{debug, info, warn};
use zzik_store::KvCache;

use crate::error::CheckInError;
use crate::orchestrator::{CheckInRequest, CheckInResponse, CheckInService};

pub fn cache_key(user_id: &str, idempotency_key: &str) -> String {
    format!("idem:checkin:{user_id}:{idempotency_key}")
}

pub struct IdempotentCheckIn {
    service: Arc<CheckInService>,
    cache: Arc<dyn KvCache>,
    ttl_secs: u64,
}

impl IdempotentCheckIn {
    pub fn new(service: Arc<CheckInService>, cache: Arc<dyn KvCache>) -> Self {
        let ttl_secs = service.config().idempotency_ttl_secs;
        Self {
            service,
            cache,
            ttl_secs,
        }
    }

    pub fn service(&self) -> &CheckInService {
        &self.service
    }

    pub async fn submit(&self, req: &CheckInRequest) -> Result<CheckInResponse, CheckInError> {
        let Some(key) = req.idempotency_key.as_deref().filter(|k| !k.is_empty()) else {
            return self.service.check_in(req).await;
        };
        let entry = cache_key(&req.user_id, key);

        match self.cache.get(&entry).await {
            Ok(Some(cached)) => match serde_json::from_value::<CheckInResponse>(cached) {
                Ok(resp) => {
                    info!(user_id = %req.user_id, idempotency_key = key, "idempotent replay");
                    return Ok(resp);
                }
                Err(e) => warn!(cache_key = %entry, error = %e, "discarding unreadable cached response"),
            },
            Ok(None) => debug!(user_id = %req.user_id, idempotency_key = key, "idempotency miss"),
            Err(e) => warn!(cache_key = %entry, error = %e, "idempotency cache unavailable"),
        }

        let resp = self.service.check_in(req).await?;
        match serde_json::to_value(&resp) {
            Ok(value) => {
                if let Err(e) = self.cache.set(&entry, value, self.ttl_secs).await {
                    warn!(cache_key = %entry, error = %e, "failed to cache check-in response");
                }
            }
            Err(e) => warn!(cache_key = %entry, error = %e, "failed to encode check-in response"),
        }
        Ok(resp)
    }
}
