//! Process-wide, read-only configuration snapshot (spec.md §3
//! "ProxyContext", §9 "Global mutable state").

use url::Url;

use crate::ca::CertMinter;
use crate::queue::QueueClient;
use crate::rules::RuleStore;

/// Built once at startup from parsed CLI flags; passed by reference (or
/// `Arc`) to every component instead of living in library globals.
pub struct ProxyContext {
    pub bind_addr: String,
    pub upstream_proxy: Option<Url>,
    pub rule_store: RuleStore,
    pub log_level: u8,
    pub cert_minter: CertMinter,
    queue_client: Option<QueueClient>,
}

impl ProxyContext {
    pub fn new(
        bind_addr: String,
        upstream_proxy: Option<Url>,
        rule_store: RuleStore,
        log_level: u8,
        queue_client: Option<QueueClient>,
    ) -> Self {
        ProxyContext {
            bind_addr,
            upstream_proxy,
            rule_store,
            log_level,
            cert_minter: CertMinter::new(),
            queue_client,
        }
    }

    pub fn redis_client(&self) -> Option<&QueueClient> {
        self.queue_client.as_ref()
    }
}
