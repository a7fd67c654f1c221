//! Status write-buffer: coalesces per-resource status writes into a single
//! rate-limited flush per slice, so a reconcile that touches N resources in
//! the same slice doesn't issue N separate API writes.

use crate::util::Error;
use eno_types::{ResourceSlice, ResourceSliceStatus, ResourceState};
use json_patch::{PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use kube::{
    Api, Client,
    api::{Patch, PatchParams},
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SliceKey {
    pub namespace: String,
    pub name: String,
}

/// A simple token bucket: `rate` tokens/sec, burstable up to `rate` tokens.
struct TokenBucket {
    rate: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(rate: f64) -> Self {
        Self {
            rate,
            tokens: rate,
            last: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate.max(1.0));
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct WriteBuffer {
    client: Client,
    pending: Mutex<HashMap<SliceKey, HashMap<usize, ResourceState>>>,
    limiter: Mutex<TokenBucket>,
}

impl WriteBuffer {
    pub fn new(client: Client, qps: f64) -> Self {
        Self {
            client,
            pending: Mutex::new(HashMap::new()),
            limiter: Mutex::new(TokenBucket::new(qps)),
        }
    }

    /// Buffers a status write for `(slice, index)`, replacing any
    /// not-yet-flushed write for the same index (last write wins).
    pub fn buffer(&self, key: SliceKey, index: usize, state: ResourceState) {
        let mut pending = self.pending.lock().unwrap();
        pending.entry(key).or_default().insert(index, state);
    }

    /// Flushes every slice with buffered writes that the rate limiter
    /// currently has budget for. Slices it can't get to this tick keep
    /// their buffered writes for the next call.
    pub async fn flush(&self) -> Result<(), Error> {
        let keys: Vec<SliceKey> = {
            let pending = self.pending.lock().unwrap();
            pending.keys().cloned().collect()
        };

        for key in keys {
            if !self.limiter.lock().unwrap().try_acquire() {
                continue;
            }
            let writes = {
                let mut pending = self.pending.lock().unwrap();
                pending.remove(&key)
            };
            let Some(writes) = writes else { continue };
            if let Err(err) = self.flush_one(&key, writes.clone()).await {
                match err {
                    // Slice is gone; drop the buffered updates for it.
                    Error::Kube {
                        source: kube::Error::Api(e),
                    } if e.code == 404 => {}
                    // Transient failure: put the writes back so the next tick
                    // retries them, merging in any updates that arrived in
                    // the meantime rather than clobbering them.
                    other => {
                        let mut pending = self.pending.lock().unwrap();
                        let slot = pending.entry(key).or_default();
                        for (index, state) in writes {
                            slot.entry(index).or_insert(state);
                        }
                        return Err(other);
                    }
                }
            }
        }
        Ok(())
    }

    async fn flush_one(
        &self,
        key: &SliceKey,
        writes: HashMap<usize, ResourceState>,
    ) -> Result<(), Error> {
        let api: Api<ResourceSlice> = Api::namespaced(self.client.clone(), &key.namespace);
        let slice = api.get(&key.name).await?;
        let spec_len = slice.spec.resources.len();
        let status_len = slice.status.as_ref().map(|s| s.resources.len()).unwrap_or(0);

        if status_len < spec_len {
            let allocated = ResourceSliceStatus {
                resources: vec![ResourceState::default(); spec_len],
            };
            api.patch_status(
                &key.name,
                &PatchParams::apply(super::super::util::MANAGER_NAME),
                &Patch::Merge(serde_json::json!({ "status": allocated })),
            )
            .await?;
        }

        let ops = writes
            .into_iter()
            .map(|(index, state)| {
                PatchOperation::Replace(ReplaceOperation {
                    path: PointerBuf::parse(&format!("/status/resources/{index}")).unwrap(),
                    value: serde_json::to_value(state).unwrap(),
                })
            })
            .collect();
        api.patch_status(
            &key.name,
            &PatchParams::apply(super::super::util::MANAGER_NAME),
            &Patch::Json::<ResourceSlice>(json_patch::Patch(ops)),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1.0);
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        std::thread::sleep(Duration::from_millis(1100));
        assert!(bucket.try_acquire());
    }
}
