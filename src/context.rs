//! Per-user state kept between requests: UI preferences and subscription usage.
//!
//! Both live in one schema-free key/value store (last write wins) and are
//! reached only through the context objects below, each of which documents who
//! may write what.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::SubscriptionConfig;
use crate::tools::ToolKind;

/// JSON key/value store, optionally mirrored to a file after every write.
pub struct KeyValueStore {
    path: Option<PathBuf>,
    entries: RwLock<BTreeMap<String, Value>>,
}

impl KeyValueStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open a file-backed store, loading existing entries if the file exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read state file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse state file {}", path.display()))?
        } else {
            BTreeMap::new()
        };

        log::info!("KeyValueStore: {} entries loaded from {}", entries.len(), path.display());
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().await.get(key).cloned()
    }

    /// Typed read. Entries that no longer decode are treated as absent.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                log::warn!("KeyValueStore: ignoring undecodable entry {}: {}", key, e);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.update(key, |_| (Some(value), ())).await
    }

    pub async fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).context("Failed to encode entry")?;
        self.set(key, value).await
    }

    /// Read-modify-write of one entry under the store's write lock.
    ///
    /// `f` returns the new value (`None` leaves the entry untouched) and a
    /// result passed back to the caller. Nothing changes if persisting fails.
    pub async fn update<F, R>(&self, key: &str, f: F) -> Result<R>
    where
        F: FnOnce(Option<&Value>) -> (Option<Value>, R),
    {
        let mut entries = self.entries.write().await;
        let (new_value, result) = f(entries.get(key));

        if let Some(value) = new_value {
            if let Some(path) = &self.path {
                let mut next = entries.clone();
                next.insert(key.to_string(), value.clone());
                persist(path, &next).await?;
            }
            entries.insert(key.to_string(), value);
        }

        Ok(result)
    }

    pub async fn entries_with_prefix(&self, prefix: &str) -> Vec<(String, Value)> {
        self.entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

async fn persist(path: &Path, entries: &BTreeMap<String, Value>) -> Result<()> {
    let content = serde_json::to_string_pretty(entries).context("Failed to encode state")?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content)
        .await
        .with_context(|| format!("Failed to write state file {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace state file {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    En,
    Fr,
    Es,
    De,
    Ar,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub locale: Locale,
    pub sidebar_collapsed: bool,
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreferencesUpdate {
    pub locale: Option<Locale>,
    pub sidebar_collapsed: Option<bool>,
}

/// Locale and sidebar state per user. Written only by the preferences handlers.
#[derive(Clone)]
pub struct PreferencesContext {
    store: Arc<KeyValueStore>,
}

impl PreferencesContext {
    pub fn new(store: Arc<KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(user_id: &str) -> String {
        format!("preferences:{}", user_id)
    }

    pub async fn load(&self, user_id: &str) -> Preferences {
        self.store.get_as(&Self::key(user_id)).await.unwrap_or_default()
    }

    pub async fn update(&self, user_id: &str, update: PreferencesUpdate) -> Result<Preferences> {
        self.store
            .update(&Self::key(user_id), |current| {
                let mut prefs: Preferences = current
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                if let Some(locale) = update.locale {
                    prefs.locale = locale;
                }
                if let Some(collapsed) = update.sidebar_collapsed {
                    prefs.sidebar_collapsed = collapsed;
                }
                (serde_json::to_value(&prefs).ok(), prefs)
            })
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Pro,
    Premium,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subscription {
    pub tier: Tier,
    /// Day (`YYYY-MM-DD`, UTC) the usage counters belong to.
    pub period: String,
    /// Calls per tool slug in `period`.
    pub usage: BTreeMap<String, u32>,
}

impl Subscription {
    fn roll_over(&mut self, today: &str) {
        if self.period != today {
            self.period = today.to_string();
            self.usage.clear();
        }
    }
}

/// Outcome of reserving one tool call against the daily quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed { used: u32, limit: Option<u32> },
    Exceeded { limit: u32 },
}

/// Subscription tier and usage per user.
///
/// The tier is written only by the subscription handler; usage counters only
/// by the subscription guard in front of the tool routes.
#[derive(Clone)]
pub struct SubscriptionContext {
    store: Arc<KeyValueStore>,
    limits: SubscriptionConfig,
}

impl SubscriptionContext {
    pub fn new(store: Arc<KeyValueStore>, limits: SubscriptionConfig) -> Self {
        Self { store, limits }
    }

    fn key(user_id: &str) -> String {
        format!("subscription:{}", user_id)
    }

    fn today() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    pub fn limit(&self, tier: Tier) -> Option<u32> {
        match tier {
            Tier::Free => self.limits.free_limit,
            Tier::Pro => self.limits.pro_limit,
            Tier::Premium => self.limits.premium_limit,
        }
    }

    pub async fn load(&self, user_id: &str) -> Subscription {
        let mut sub: Subscription = self.store.get_as(&Self::key(user_id)).await.unwrap_or_default();
        sub.roll_over(&Self::today());
        sub
    }

    pub async fn set_tier(&self, user_id: &str, tier: Tier) -> Result<Subscription> {
        let today = Self::today();
        self.store
            .update(&Self::key(user_id), |current| {
                let mut sub = decode_subscription(current);
                sub.roll_over(&today);
                sub.tier = tier;
                (serde_json::to_value(&sub).ok(), sub)
            })
            .await
    }

    /// Count one call to `tool` unless the tier's limit is already reached.
    pub async fn try_consume(&self, user_id: &str, tool: ToolKind) -> Result<QuotaDecision> {
        let today = Self::today();
        self.store
            .update(&Self::key(user_id), |current| {
                let mut sub = decode_subscription(current);
                sub.roll_over(&today);
                let limit = self.limit(sub.tier);
                let used = sub.usage.get(tool.slug()).copied().unwrap_or(0);

                if let Some(limit) = limit {
                    if used >= limit {
                        return (None, QuotaDecision::Exceeded { limit });
                    }
                }

                sub.usage.insert(tool.slug().to_string(), used + 1);
                (
                    serde_json::to_value(&sub).ok(),
                    QuotaDecision::Allowed {
                        used: used + 1,
                        limit,
                    },
                )
            })
            .await
    }

    /// Give back a call reserved by [`Self::try_consume`] that did not succeed.
    pub async fn refund(&self, user_id: &str, tool: ToolKind) -> Result<()> {
        self.store
            .update(&Self::key(user_id), |current| {
                let mut sub = decode_subscription(current);
                match sub.usage.get_mut(tool.slug()) {
                    Some(used) if *used > 0 => {
                        *used -= 1;
                        (serde_json::to_value(&sub).ok(), ())
                    }
                    _ => (None, ()),
                }
            })
            .await
    }
}

fn decode_subscription(value: Option<&Value>) -> Subscription {
    value
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}
