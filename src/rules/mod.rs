// src/rules/mod.rs
//! Endpoint rules and the whitelist.
//!
//! Rules are compiled once when the gatekeeper is built and are read-only
//! afterwards. Resolution walks them in configuration order and the first
//! match wins; a request that matches nothing is not limited.

mod pattern;

#[cfg(test)]
mod tests;

pub use pattern::EndpointPattern;

use indexmap::IndexMap;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::config::{default_message, AlgorithmConfig, EndpointRuleConfig, WhitelistConfig};
use crate::error::{RateLimiterError, Result};

/// Caller identity and endpoint descriptor for one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub ip: Option<IpAddr>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// `user:<id>` for authenticated callers, otherwise `ip:<addr>`
    pub fn default_key(&self) -> String {
        match (&self.user_id, &self.ip) {
            (Some(user_id), _) => format!("user:{}", user_id),
            (None, Some(ip)) => format!("ip:{}", ip),
            (None, None) => "ip:unknown".to_string(),
        }
    }
}

/// Predicate that exempts a request from its rule
pub type SkipFn = Arc<dyn Fn(&RequestInfo) -> bool + Send + Sync>;

/// Custom limiting key for a rule
pub type KeyGenerator = Arc<dyn Fn(&RequestInfo) -> String + Send + Sync>;

/// A compiled endpoint pattern with the limit that applies to it
#[derive(Clone)]
pub struct EndpointRule {
    pattern: EndpointPattern,
    algorithm: AlgorithmConfig,
    message: String,
    skip: Option<SkipFn>,
    key_generator: Option<KeyGenerator>,
}

impl fmt::Debug for EndpointRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRule")
            .field("pattern", &self.pattern.as_str())
            .field("algorithm", &self.algorithm)
            .field("message", &self.message)
            .field("skip", &self.skip.is_some())
            .field("key_generator", &self.key_generator.is_some())
            .finish()
    }
}

impl EndpointRule {
    /// Compiles `pattern` and validates `algorithm`
    pub fn new(pattern: &str, algorithm: AlgorithmConfig) -> Result<Self> {
        algorithm
            .validate()
            .map_err(|e| RateLimiterError::Config(format!("endpoint '{}': {}", pattern, e)))?;

        Ok(Self {
            pattern: EndpointPattern::compile(pattern)?,
            algorithm,
            message: default_message(),
            skip: None,
            key_generator: None,
        })
    }

    pub fn from_config(pattern: &str, config: &EndpointRuleConfig) -> Result<Self> {
        Ok(Self::new(pattern, config.algorithm.clone())?.with_message(config.message.clone()))
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_skip<F>(mut self, skip: F) -> Self
    where
        F: Fn(&RequestInfo) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(skip));
        self
    }

    pub fn with_key_generator<F>(mut self, key_generator: F) -> Self
    where
        F: Fn(&RequestInfo) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(key_generator));
        self
    }

    pub fn pattern(&self) -> &EndpointPattern {
        &self.pattern
    }

    pub fn algorithm(&self) -> &AlgorithmConfig {
        &self.algorithm
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn should_skip(&self, request: &RequestInfo) -> bool {
        self.skip.as_ref().is_some_and(|skip| skip(request))
    }

    /// The limiting key for `request` under this rule
    pub fn key_for(&self, request: &RequestInfo) -> String {
        match &self.key_generator {
            Some(generate) => generate(request),
            None => request.default_key(),
        }
    }
}

/// Ordered endpoint rules
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<EndpointRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<EndpointRule>) -> Self {
        Self { rules }
    }

    /// Compiles every configured endpoint, failing on the first bad pattern
    pub fn from_config(endpoints: &IndexMap<String, EndpointRuleConfig>) -> Result<Self> {
        let rules = endpoints
            .iter()
            .map(|(pattern, config)| EndpointRule::from_config(pattern, config))
            .collect::<Result<Vec<_>>>()?;

        debug!(rules = rules.len(), "Compiled endpoint rules");
        Ok(Self { rules })
    }

    /// Appends a rule with the lowest priority
    pub fn push(&mut self, rule: EndpointRule) {
        self.rules.push(rule);
    }

    /// Inserts a rule ahead of every existing one
    pub fn push_front(&mut self, rule: EndpointRule) {
        self.rules.insert(0, rule);
    }

    /// Rewrites the rule registered under `pattern` in place, keeping its
    /// position. Fails when no rule has that pattern.
    pub fn update<F>(&mut self, pattern: &str, f: F) -> Result<()>
    where
        F: FnOnce(EndpointRule) -> EndpointRule,
    {
        let pattern = pattern.trim();
        let slot = self
            .rules
            .iter_mut()
            .find(|rule| rule.pattern.as_str().trim() == pattern)
            .ok_or_else(|| {
                RateLimiterError::Config(format!("no endpoint rule with pattern '{}'", pattern))
            })?;

        *slot = f(slot.clone());
        Ok(())
    }

    /// First rule whose pattern matches
    pub fn resolve(&self, method: &str, path: &str) -> Option<&EndpointRule> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.matches(method, path))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Callers exempt from every limit
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    ips: HashSet<IpAddr>,
    user_ids: HashSet<String>,
}

impl Whitelist {
    pub fn from_config(config: &WhitelistConfig) -> Result<Self> {
        let ips = config
            .ips
            .iter()
            .map(|raw| {
                raw.trim().parse::<IpAddr>().map_err(|e| {
                    RateLimiterError::Config(format!("invalid whitelist IP '{}': {}", raw, e))
                })
            })
            .collect::<Result<HashSet<_>>>()?;

        Ok(Self {
            ips,
            user_ids: config.user_ids.iter().cloned().collect(),
        })
    }

    pub fn add_ip(&mut self, ip: IpAddr) {
        self.ips.insert(ip);
    }

    pub fn add_user(&mut self, user_id: impl Into<String>) {
        self.user_ids.insert(user_id.into());
    }

    pub fn contains(&self, request: &RequestInfo) -> bool {
        request
            .user_id
            .as_ref()
            .is_some_and(|user_id| self.user_ids.contains(user_id))
            || request.ip.is_some_and(|ip| self.ips.contains(&ip))
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.user_ids.is_empty()
    }
}
