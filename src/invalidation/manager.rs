//! Invalidation Manager
//!
//! Holds the rule registry, executes rules against the remote tier and the
//! memory tiers of every registered cache, and drives scheduled rules.
//!
//! Scheduled rules sleep for their interval *after* each run completes, so a
//! slow run delays the next one instead of overlapping it. Stopping cancels
//! the sleep; a run already in progress finishes first.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::rule::{default_rules, InvalidationResult, InvalidationRule, InvalidationStrategy};
use crate::cache::pattern::is_pattern;
use crate::cache::{CacheKey, CacheRegistry, KeyCodec, KeyTtl, WorkloadClass};
use crate::error::{Error, Result};

/// Invalidation configuration
#[derive(Debug, Clone)]
pub struct InvalidationConfig {
    /// Keys per delete batch for rules without a schedule
    pub default_batch_size: usize,
    /// TTL given to keys by lazy rules
    pub lazy_expiry_seconds: u64,
    /// Results kept in history
    pub history_limit: usize,
    /// Results reported by `stats()`
    pub recent_results: usize,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 50,
            lazy_expiry_seconds: 1,
            history_limit: 100,
            recent_results: 10,
        }
    }
}

/// Registry and execution statistics
#[derive(Debug, Clone, Serialize)]
pub struct InvalidationStats {
    pub total_rules: usize,
    pub enabled_rules: usize,
    pub scheduled_rules: usize,
    pub history_count: usize,
    /// Newest first
    pub recent: Vec<InvalidationResult>,
}

/// Executes invalidation rules
pub struct InvalidationManager {
    config: InvalidationConfig,
    registry: Arc<CacheRegistry>,
    rules: RwLock<BTreeMap<String, InvalidationRule>>,
    history: Mutex<VecDeque<InvalidationResult>>,
    schedules: Mutex<HashMap<String, (CancellationToken, JoinHandle<()>)>>,
    running: Mutex<Option<CancellationToken>>,
}

impl InvalidationManager {
    /// Create a manager with the built-in rules
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self::with_rules(registry, InvalidationConfig::default(), default_rules())
    }

    /// Create a manager with an explicit rule set
    pub fn with_rules(
        registry: Arc<CacheRegistry>,
        config: InvalidationConfig,
        rules: Vec<InvalidationRule>,
    ) -> Self {
        let rules = rules.into_iter().map(|r| (r.id.clone(), r)).collect();
        Self {
            config,
            registry,
            rules: RwLock::new(rules),
            history: Mutex::new(VecDeque::new()),
            schedules: Mutex::new(HashMap::new()),
            running: Mutex::new(None),
        }
    }

    // =========================================================================
    // Rule Registry
    // =========================================================================

    /// Register a rule, starting its timer if the manager is running
    pub fn add_rule(self: &Arc<Self>, rule: InvalidationRule) -> Result<()> {
        {
            let mut rules = self.rules.write();
            if rules.contains_key(&rule.id) {
                return Err(Error::DuplicateRule(rule.id));
            }
            rules.insert(rule.id.clone(), rule.clone());
        }
        info!("Added invalidation rule {} ({})", rule.id, rule.strategy);

        let parent = self.running.lock().clone();
        if let Some(parent) = parent {
            if rule.is_scheduled() && rule.enabled {
                self.schedule(&rule, &parent);
            }
        }
        Ok(())
    }

    /// Unregister a rule and cancel its timer
    pub fn remove_rule(&self, id: &str) -> Result<InvalidationRule> {
        let rule = self
            .rules
            .write()
            .remove(id)
            .ok_or_else(|| Error::RuleNotFound(id.to_string()))?;
        if let Some((token, _)) = self.schedules.lock().remove(id) {
            token.cancel();
        }
        info!("Removed invalidation rule {}", id);
        Ok(rule)
    }

    pub fn rule(&self, id: &str) -> Option<InvalidationRule> {
        self.rules.read().get(id).cloned()
    }

    /// Every rule, ordered by id
    pub fn rules(&self) -> Vec<InvalidationRule> {
        self.rules.read().values().cloned().collect()
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Start the timers of every enabled scheduled rule
    pub fn start(self: &Arc<Self>) {
        let token = {
            let mut running = self.running.lock();
            if running.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *running = Some(token.clone());
            token
        };

        let scheduled: Vec<_> = self
            .rules()
            .into_iter()
            .filter(|r| r.enabled && r.is_scheduled())
            .collect();
        for rule in &scheduled {
            self.schedule(rule, &token);
        }
        info!("Invalidation manager started with {} scheduled rules", scheduled.len());
    }

    /// Cancel every timer and wait for in-flight runs to finish
    pub async fn stop(&self) {
        let Some(token) = self.running.lock().take() else {
            return;
        };
        token.cancel();

        let handles: Vec<_> = self
            .schedules
            .lock()
            .drain()
            .map(|(_, (_, handle))| handle)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Invalidation manager stopped");
    }

    fn schedule(self: &Arc<Self>, rule: &InvalidationRule, parent: &CancellationToken) {
        let Some(schedule) = rule.schedule else {
            return;
        };
        let interval = schedule.interval().max(Duration::from_millis(1));
        let token = parent.child_token();
        let manager = Arc::clone(self);
        let id = rule.id.clone();
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(rule) = manager.rule(&id) else {
                    break;
                };
                if !rule.enabled {
                    continue;
                }
                manager.execute(&rule).await;
            }
            debug!("Scheduled invalidation {} stopped", id);
        });

        if let Some((old, _)) = self
            .schedules
            .lock()
            .insert(rule.id.clone(), (token, handle))
        {
            old.cancel();
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run a registered rule now
    pub async fn execute_rule(&self, id: &str) -> Result<InvalidationResult> {
        let rule = self
            .rule(id)
            .ok_or_else(|| Error::RuleNotFound(id.to_string()))?;
        Ok(self.execute(&rule).await)
    }

    /// Run a rule and record the result
    pub async fn execute(&self, rule: &InvalidationRule) -> InvalidationResult {
        self.run(rule, false).await
    }

    /// Remove every result of a workload class
    pub async fn invalidate_by_class(&self, class: WorkloadClass) -> InvalidationResult {
        let rule = InvalidationRule::new(
            format!("manual-class-{}", class),
            format!("Manual invalidation of {}", class),
            InvalidationStrategy::Immediate,
            KeyCodec::class_pattern(class),
        );
        self.run(&rule, true).await
    }

    /// Remove every result of one operation
    pub async fn invalidate_by_operation(
        &self,
        class: WorkloadClass,
        operation: &str,
    ) -> InvalidationResult {
        let rule = InvalidationRule::new(
            format!("manual-op-{}-{}", class, operation),
            format!("Manual invalidation of {}:{}", class, operation),
            InvalidationStrategy::Immediate,
            KeyCodec::operation_pattern(class, operation),
        );
        self.run(&rule, true).await
    }

    /// Remove every result derived from a subject, plus its related records
    pub async fn invalidate_by_subject(&self, subject: &str) -> InvalidationResult {
        let rule = InvalidationRule::new(
            format!("manual-subject-{}", subject),
            format!("Manual invalidation of subject {}", subject),
            InvalidationStrategy::Cascade,
            format!("*:*:{}:*", subject),
        );
        self.run(&rule, true).await
    }

    /// Generic pattern invalidation across every cache
    pub async fn invalidate_pattern(&self, pattern: &str) -> InvalidationResult {
        let rule = InvalidationRule::new(
            "manual-pattern",
            format!("Manual invalidation of {}", pattern),
            InvalidationStrategy::Pattern,
            pattern,
        );
        self.run(&rule, true).await
    }

    #[instrument(skip(self, rule), fields(rule_id = %rule.id, strategy = %rule.strategy))]
    async fn run(&self, rule: &InvalidationRule, ad_hoc: bool) -> InvalidationResult {
        let start = Instant::now();
        let mut result = InvalidationResult::started(rule, ad_hoc);
        let batch_size = rule
            .schedule
            .map(|s| s.max_batch_size)
            .unwrap_or(self.config.default_batch_size)
            .max(1);

        if rule.strategy == InvalidationStrategy::Pattern && rule.conditions.is_none() {
            match self.registry.invalidate(&rule.key_pattern).await {
                Ok(removed) => {
                    result.entries_found = removed;
                    result.entries_invalidated = removed;
                }
                Err(e) => {
                    warn!("Pattern invalidation of {} failed: {}", rule.key_pattern, e);
                    result.errors += 1;
                }
            }
        } else {
            match self.candidates(rule).await {
                Ok(candidates) => {
                    let selected = self.filter(rule, candidates).await;
                    result.entries_found = selected.len();
                    let (invalidated, errors) = match rule.strategy {
                        InvalidationStrategy::Lazy => self.expire_soon(&selected, batch_size).await,
                        _ => self.delete(&selected, batch_size).await,
                    };
                    result.entries_invalidated = invalidated;
                    result.errors += errors;

                    if rule.strategy == InvalidationStrategy::Pattern {
                        self.registry.clear_memory();
                    } else {
                        self.registry.evict_from_memory(&selected);
                    }
                }
                Err(e) => {
                    warn!("Key scan for {} failed: {}", rule.key_pattern, e);
                    result.errors += 1;
                }
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Invalidation {} ({}): {} found, {} invalidated, {} errors in {}ms",
            rule.id,
            rule.strategy,
            result.entries_found,
            result.entries_invalidated,
            result.errors,
            result.duration_ms
        );
        self.record(result.clone());
        result
    }

    /// Keys a rule applies to, before conditions
    async fn candidates(&self, rule: &InvalidationRule) -> Result<Vec<String>> {
        let remote = self.registry.remote();
        let keys = remote.keys_matching(&rule.key_pattern).await?;
        if rule.strategy != InvalidationStrategy::Cascade {
            return Ok(keys);
        }

        let mut subjects: BTreeSet<String> = keys
            .iter()
            .filter_map(|k| CacheKey::from_raw(k.as_str()).subject().map(str::to_string))
            .filter(|s| !is_pattern(s))
            .collect();
        if let Some(subject) = CacheKey::from_raw(rule.key_pattern.as_str()).subject() {
            if !is_pattern(subject) {
                subjects.insert(subject.to_string());
            }
        }

        let mut all: BTreeSet<String> = keys.into_iter().collect();
        for subject in &subjects {
            for pattern in KeyCodec::related_patterns(subject) {
                all.extend(remote.keys_matching(&pattern).await?);
            }
        }
        debug!(
            "Cascade over {} subjects expanded to {} keys",
            subjects.len(),
            all.len()
        );
        Ok(all.into_iter().collect())
    }

    async fn filter(&self, rule: &InvalidationRule, keys: Vec<String>) -> Vec<String> {
        let Some(conditions) = &rule.conditions else {
            return keys;
        };
        let max_age = conditions.max_age();

        let mut selected = Vec::with_capacity(keys.len());
        for key in keys {
            if !conditions.matches_key(&key) {
                continue;
            }
            if let Some(max_age) = max_age {
                if !self.is_older_than(&key, max_age).await {
                    continue;
                }
            }
            selected.push(key);
        }
        selected
    }

    /// Age from the envelope timestamp, falling back to the remaining TTL.
    ///
    /// Keys whose age cannot be determined are included.
    async fn is_older_than(&self, key: &str, max_age: Duration) -> bool {
        let remote = self.registry.remote();
        match remote.stored_at(key).await {
            Ok(Some(stored_at)) => Utc::now()
                .signed_duration_since(stored_at)
                .to_std()
                .map(|age| age >= max_age)
                .unwrap_or(false),
            Ok(None) => match remote.ttl(key).await {
                Ok(KeyTtl::Expires(secs)) => Duration::from_secs(secs) < max_age,
                Ok(KeyTtl::Missing) => false,
                Ok(KeyTtl::Persistent) | Err(_) => true,
            },
            Err(_) => true,
        }
    }

    async fn delete(&self, keys: &[String], batch_size: usize) -> (usize, usize) {
        let remote = self.registry.remote();
        let mut removed = 0;
        let mut errors = 0;
        for batch in keys.chunks(batch_size) {
            match remote.del(batch).await {
                Ok(n) => removed += n as usize,
                Err(e) => {
                    warn!("Invalidation batch of {} keys failed: {}", batch.len(), e);
                    errors += 1;
                }
            }
        }
        (removed, errors)
    }

    async fn expire_soon(&self, keys: &[String], batch_size: usize) -> (usize, usize) {
        let remote = self.registry.remote();
        let mut expired = 0;
        let mut errors = 0;
        for batch in keys.chunks(batch_size) {
            for key in batch {
                match remote.expire(key, self.config.lazy_expiry_seconds).await {
                    Ok(true) => expired += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Lazy expiry of {} failed: {}", key, e);
                        errors += 1;
                    }
                }
            }
        }
        (expired, errors)
    }

    fn record(&self, result: InvalidationResult) {
        let mut history = self.history.lock();
        history.push_back(result);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Past results, oldest first
    pub fn history(&self) -> Vec<InvalidationResult> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> InvalidationStats {
        let (total_rules, enabled_rules, scheduled_rules) = {
            let rules = self.rules.read();
            (
                rules.len(),
                rules.values().filter(|r| r.enabled).count(),
                rules.values().filter(|r| r.is_scheduled()).count(),
            )
        };
        let history = self.history.lock();
        InvalidationStats {
            total_rules,
            enabled_rules,
            scheduled_rules,
            history_count: history.len(),
            recent: history
                .iter()
                .rev()
                .take(self.config.recent_results)
                .cloned()
                .collect(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
