//! Status logger: a periodic background task (not a watch-driven controller)
//! that summarizes composition status cluster-wide, rate-limited so a large
//! cluster can't flood stdout.

use crate::config::OperatorConfig;
use crate::util::{Error, colors::{FG2, FG3}};
use eno_common::backoff::jittered;
use eno_types::Composition;
use kube::{Api, Client, api::ListParams};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Token bucket gating individual log lines, mirroring the one the
/// status-write-buffer uses for slice writes.
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

pub async fn run(client: Client, config: Arc<OperatorConfig>) -> Result<(), Error> {
    println!("{}", "starting status logger".green());
    let compositions: Api<Composition> = Api::all(client);
    let mut limiter = TokenBucket::new(config.status_logger_frequency);

    loop {
        tokio::time::sleep(jittered(Duration::from_secs(1), 0.2)).await;

        let list = match compositions.list(&ListParams::default()).await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("{}", format!("status logger list error: {e}").color(FG2));
                continue;
            }
        };

        for summary in list.items.iter().filter_map(summarize) {
            if !limiter.try_acquire() {
                break;
            }
            println!("{}", summary.color(FG3));
        }
    }
}

/// One human-readable line per composition, or `None` for a composition
/// whose status hasn't been populated yet (nothing useful to say).
fn summarize(composition: &Composition) -> Option<String> {
    let status = composition.status.as_ref()?;
    let name = composition.metadata.name.as_deref().unwrap_or("<unknown>");
    let namespace = composition.metadata.namespace.as_deref().unwrap_or("<unknown>");
    Some(format!(
        "composition {namespace}/{name}: {}",
        status.simplified.status
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eno_types::{CompositionStatus, Simplified};
    use kube::api::ObjectMeta;

    #[test]
    fn summarize_skips_compositions_with_no_status() {
        let composition = Composition::new("c1", Default::default());
        assert!(summarize(&composition).is_none());
    }

    #[test]
    fn summarize_reports_simplified_status() {
        let mut composition = Composition::new("c1", Default::default());
        composition.metadata = ObjectMeta {
            name: Some("c1".into()),
            namespace: Some("default".into()),
            ..Default::default()
        };
        composition.status = Some(CompositionStatus {
            simplified: Simplified { status: "Ready".into(), ..Default::default() },
            ..Default::default()
        });
        let line = summarize(&composition).unwrap();
        assert_eq!(line, "composition default/c1: Ready");
    }

    #[test]
    fn token_bucket_caps_burst_then_refills() {
        let mut bucket = TokenBucket::new(1.0);
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        std::thread::sleep(Duration::from_millis(1100));
        assert!(bucket.try_acquire());
    }
}
