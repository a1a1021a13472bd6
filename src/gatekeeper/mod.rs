// src/gatekeeper/mod.rs
//! Per-request admission decisions.
//!
//! A [`Gatekeeper`] owns the compiled rules, the whitelist, the counter store
//! and a cache of limiters. [`Gatekeeper::evaluate`] walks one request through
//! whitelist, rule lookup, skip hook, key generation and the limiter, and
//! returns a [`Decision`] that the axum adapter in [`middleware`] turns into
//! headers or a 429.

pub mod middleware;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use dashmap::DashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::algorithms::{self, sliding_window, RateLimitAlgorithm, RateLimitStatus};
use crate::clock::{self, Clock};
use crate::config::{AlgorithmConfig, FailurePolicy, GatekeeperConfig};
use crate::error::{RateLimiterError, Result};
use crate::rate_limit_event;
use crate::resilience::{CircuitBreaker, CircuitState};
use crate::rules::{EndpointRule, RequestInfo, RuleSet, Whitelist};
use crate::storage::{self, CounterStore, MemoryStore};

/// Seconds a fail-closed rejection asks the client to wait
const FAIL_CLOSED_RETRY_AFTER: u64 = 1;

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Values for the `X-RateLimit-*` and `Retry-After` headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Epoch seconds
    pub reset: u64,
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    pub fn from_status(status: &RateLimitStatus) -> Self {
        Self {
            limit: status.limit,
            remaining: status.remaining,
            reset: status.reset_at_secs(),
            retry_after: if status.allowed {
                None
            } else {
                Some(retry_after_secs(status))
            },
        }
    }

    /// Writes the headers into `headers`, replacing existing values
    pub fn apply(&self, headers: &mut HeaderMap) {
        let mut put = |name: HeaderName, value: u64| {
            headers.insert(name, HeaderValue::from(value));
        };

        put(HeaderName::from_static(LIMIT_HEADER), self.limit);
        put(HeaderName::from_static(REMAINING_HEADER), self.remaining);
        put(HeaderName::from_static(RESET_HEADER), self.reset);
        if let Some(retry_after) = self.retry_after {
            put(axum::http::header::RETRY_AFTER, retry_after);
        }
    }
}

fn retry_after_secs(status: &RateLimitStatus) -> u64 {
    status.retry_after.unwrap_or(FAIL_CLOSED_RETRY_AFTER).max(1)
}

/// Outcome of evaluating one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Pass the request on. Headers are absent when no limiter ran.
    Allow { headers: Option<RateLimitHeaders> },
    /// Answer with 429
    Reject {
        headers: Option<RateLimitHeaders>,
        message: String,
        retry_after: u64,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    pub fn headers(&self) -> Option<&RateLimitHeaders> {
        match self {
            Decision::Allow { headers } | Decision::Reject { headers, .. } => headers.as_ref(),
        }
    }

    fn pass() -> Self {
        Decision::Allow { headers: None }
    }
}

/// Rate limiting front door: rules, whitelist, store and limiter cache
pub struct Gatekeeper {
    enabled: bool,
    trust_proxy: bool,
    rules: RuleSet,
    whitelist: Whitelist,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    limiters: DashMap<String, Arc<dyn RateLimitAlgorithm>>,
    failure_policy: FailurePolicy,
    store_timeout: Duration,
    breaker: CircuitBreaker,
}

impl fmt::Debug for Gatekeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gatekeeper")
            .field("enabled", &self.enabled)
            .field("trust_proxy", &self.trust_proxy)
            .field("rules", &self.rules.len())
            .field("backend", &self.store.backend_name())
            .field("failure_policy", &self.failure_policy)
            .field("store_timeout", &self.store_timeout)
            .field("breaker", &self.breaker.state())
            .finish()
    }
}

impl Gatekeeper {
    pub fn builder() -> GatekeeperBuilder {
        GatekeeperBuilder::default()
    }

    /// Builds a gatekeeper with the store selected by `config`.
    ///
    /// Fails only on invalid configuration; an unreachable Redis falls back to
    /// the in-process store.
    pub async fn from_config(config: GatekeeperConfig) -> Result<Self> {
        config.validate()?;

        let clock = clock::system();
        let store = storage::connect(&config.store_settings(), clock.clone()).await;

        Self::builder()
            .config(config)
            .store(store)
            .clock(clock)
            .build()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether client addresses may be taken from forwarding headers
    pub fn trusts_proxy(&self) -> bool {
        self.trust_proxy
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Number of distinct limiters built so far
    pub fn cached_limiters(&self) -> usize {
        self.limiters.len()
    }

    /// Decides whether `request` may proceed, recording it against its limit.
    ///
    /// Never fails: store errors and timeouts resolve through the failure policy.
    pub async fn evaluate(&self, request: &RequestInfo) -> Decision {
        if !self.enabled {
            return Decision::pass();
        }

        if self.whitelist.contains(request) {
            debug!(
                user_id = ?request.user_id,
                ip = ?request.ip,
                "Whitelisted caller, skipping rate limit"
            );
            return Decision::pass();
        }

        let rule = match self.rules.resolve(&request.method, &request.path) {
            Some(rule) => rule,
            None => return Decision::pass(),
        };

        if rule.should_skip(request) {
            debug!(rule = %rule.pattern(), "Skip hook exempted request");
            return Decision::pass();
        }

        let key = rule.key_for(request);

        if !self.breaker.allow_request() {
            debug!(key = %key, "Circuit open, not calling the store");
            return self.on_failure(rule);
        }

        let limiter = self.limiter_for(rule.algorithm());
        match self.bounded(limiter.consume(&key, 1)).await {
            Ok(status) => {
                self.breaker.record_success();
                rate_limit_event!(
                    key.as_str(),
                    rule.pattern().as_str(),
                    status.allowed,
                    status.remaining,
                    status.limit
                );
                self.decide(rule, &key, &status)
            }
            Err(e) => {
                if e.is_outage() {
                    self.breaker.record_failure();
                }
                error!(
                    key = %key,
                    rule = %rule.pattern(),
                    backend = self.store.backend_name(),
                    policy = ?self.failure_policy,
                    error = %e,
                    "Rate limit check failed"
                );
                self.on_failure(rule)
            }
        }
    }

    /// Sliding-window check of `key` against `max_requests` per `window`,
    /// for callers outside the HTTP path. Consumes one unit when admitted.
    pub async fn rate_limit_check(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
    ) -> Result<RateLimitStatus> {
        self.bounded(sliding_window::rate_limit_check(
            self.store.clone(),
            self.clock.clone(),
            key,
            max_requests,
            window,
        ))
        .await
    }

    fn limiter_for(&self, config: &AlgorithmConfig) -> Arc<dyn RateLimitAlgorithm> {
        self.limiters
            .entry(config.cache_key())
            .or_insert_with(|| {
                debug!(algorithm = ?config, "Building limiter");
                algorithms::build(config, self.store.clone(), self.clock.clone())
            })
            .value()
            .clone()
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RateLimiterError::Timeout(self.store_timeout)),
        }
    }

    fn decide(&self, rule: &EndpointRule, key: &str, status: &RateLimitStatus) -> Decision {
        let headers = RateLimitHeaders::from_status(status);

        if status.allowed {
            return Decision::Allow {
                headers: Some(headers),
            };
        }

        let retry_after = retry_after_secs(status);
        info!(
            key = %key,
            rule = %rule.pattern(),
            retry_after = retry_after,
            "Rate limit exceeded"
        );
        Decision::Reject {
            headers: Some(headers),
            message: rule.message().to_string(),
            retry_after,
        }
    }

    fn on_failure(&self, rule: &EndpointRule) -> Decision {
        match self.failure_policy {
            FailurePolicy::Open => Decision::pass(),
            FailurePolicy::Closed => Decision::Reject {
                headers: None,
                message: rule.message().to_string(),
                retry_after: FAIL_CLOSED_RETRY_AFTER,
            },
        }
    }
}

type RuleEdit = Box<dyn FnOnce(EndpointRule) -> EndpointRule + Send>;

/// Assembles a [`Gatekeeper`] from configuration plus explicit collaborators
#[derive(Default)]
pub struct GatekeeperBuilder {
    config: GatekeeperConfig,
    store: Option<Arc<dyn CounterStore>>,
    clock: Option<Arc<dyn Clock>>,
    leading_rules: Vec<EndpointRule>,
    trailing_rules: Vec<EndpointRule>,
    rule_edits: Vec<(String, RuleEdit)>,
    whitelisted_ips: Vec<IpAddr>,
    whitelisted_users: Vec<String>,
}

impl fmt::Debug for GatekeeperBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatekeeperBuilder")
            .field("config", &self.config)
            .field("leading_rules", &self.leading_rules)
            .field("trailing_rules", &self.trailing_rules)
            .field("rule_edits", &self.rule_edits.len())
            .field("whitelisted_ips", &self.whitelisted_ips)
            .field("whitelisted_users", &self.whitelisted_users)
            .finish()
    }
}

impl GatekeeperBuilder {
    pub fn config(mut self, config: GatekeeperConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Adds a rule after the configured endpoints. It only sees requests no
    /// configured pattern matches.
    pub fn rule(mut self, rule: EndpointRule) -> Self {
        self.trailing_rules.push(rule);
        self
    }

    /// Adds a rule ahead of the configured endpoints. Later calls go after
    /// earlier ones.
    pub fn rule_first(mut self, rule: EndpointRule) -> Self {
        self.leading_rules.push(rule);
        self
    }

    /// Adjusts the configured rule for `pattern`, typically to attach a skip
    /// hook or key generator that JSON cannot express:
    ///
    /// ```ignore
    /// Gatekeeper::builder()
    ///     .config(config)
    ///     .configure_rule("* /api/*", |rule| rule.with_key_generator(per_tenant))
    /// ```
    ///
    /// [`build`](Self::build) fails when no configured endpoint has `pattern`.
    pub fn configure_rule<F>(mut self, pattern: &str, edit: F) -> Self
    where
        F: FnOnce(EndpointRule) -> EndpointRule + Send + 'static,
    {
        self.rule_edits.push((pattern.to_string(), Box::new(edit)));
        self
    }

    /// Exempts `ip` in addition to the configured whitelist
    pub fn whitelist_ip(mut self, ip: IpAddr) -> Self {
        self.whitelisted_ips.push(ip);
        self
    }

    /// Exempts `user_id` in addition to the configured whitelist
    pub fn whitelist_user(mut self, user_id: impl Into<String>) -> Self {
        self.whitelisted_users.push(user_id.into());
        self
    }

    /// Compiles rules and whitelist. Without an explicit store an in-process
    /// one is created from the memory settings.
    pub fn build(self) -> Result<Gatekeeper> {
        let config = self.config;
        config.validate()?;

        let mut rules = RuleSet::from_config(&config.endpoints)?;
        for (pattern, edit) in self.rule_edits {
            rules.update(&pattern, edit)?;
        }
        for rule in self.leading_rules.into_iter().rev() {
            rules.push_front(rule);
        }
        for rule in self.trailing_rules {
            rules.push(rule);
        }

        let mut whitelist = Whitelist::from_config(&config.whitelist)?;
        for ip in self.whitelisted_ips {
            whitelist.add_ip(ip);
        }
        for user_id in self.whitelisted_users {
            whitelist.add_user(user_id);
        }

        let clock = self.clock.unwrap_or_else(clock::system);
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new(config.memory.clone(), clock.clone())),
        };

        info!(
            enabled = config.enabled,
            rules = rules.len(),
            backend = store.backend_name(),
            policy = ?config.failure_policy,
            "Gatekeeper ready"
        );

        Ok(Gatekeeper {
            enabled: config.enabled,
            trust_proxy: config.trust_proxy,
            rules,
            whitelist,
            breaker: CircuitBreaker::new(config.circuit_breaker, clock.clone()),
            store,
            clock,
            limiters: DashMap::new(),
            failure_policy: config.failure_policy,
            store_timeout: config.store_timeout,
        })
    }
}
