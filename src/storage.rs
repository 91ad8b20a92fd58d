//! Storage collaborator contract. The engine only ever talks to this
//! trait; concrete relational/analytical backends live elsewhere. Writes
//! are upserts — replaying the same profile or decision never duplicates.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, Utc};

use crate::decision::Decision;
use crate::profile::CustomerProfile;
use crate::record::RawInteraction;

#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Raw records, optionally narrowed to one customer and/or a cutoff.
    async fn read_records(
        &self,
        customer_id: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<RawInteraction>>;

    /// Distinct customer ids present in the record set, sorted.
    async fn list_customers(&self, limit: Option<usize>) -> anyhow::Result<Vec<String>>;

    /// Latest stored profile for the customer, if any.
    async fn read_profile(&self, customer_id: &str) -> anyhow::Result<Option<CustomerProfile>>;

    /// Upsert keyed by `(customer_id, version)`.
    async fn write_profile(&self, profile: &CustomerProfile) -> anyhow::Result<()>;

    async fn read_decision(&self, customer_id: &str) -> anyhow::Result<Option<Decision>>;

    /// Upsert keyed by `customer_id`; a fresh decision supersedes.
    async fn write_decision(&self, decision: &Decision) -> anyhow::Result<()>;
}

// ------------------------------------------------------------
// In-memory store (tests, default server)
// ------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    records: Vec<RawInteraction>,
    profiles: HashMap<String, BTreeMap<u64, CustomerProfile>>,
    decisions: HashMap<String, Decision>,
}

/// Mutexed maps; plenty for tests and single-process serving.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<RawInteraction>) -> Self {
        let store = Self::new();
        store.push_records(records);
        store
    }

    pub fn push_records(&self, mut records: Vec<RawInteraction>) {
        let mut g = self.inner.lock().expect("store mutex poisoned");
        g.records.append(&mut records);
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStore {
    async fn read_records(
        &self,
        customer_id: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<RawInteraction>> {
        let g = self.inner.lock().expect("store mutex poisoned");
        Ok(g.records
            .iter()
            .filter(|r| customer_id.map_or(true, |id| r.customer_id == id))
            .filter(|r| match since {
                // Unparsable timestamps stay in: the gate owns that verdict.
                Some(cutoff) => DateTime::parse_from_rfc3339(r.timestamp.trim())
                    .map(|t| t.with_timezone(&Utc) >= cutoff)
                    .unwrap_or(true),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn list_customers(&self, limit: Option<usize>) -> anyhow::Result<Vec<String>> {
        let g = self.inner.lock().expect("store mutex poisoned");
        let mut ids: Vec<String> = g.records.iter().map(|r| r.customer_id.clone()).collect();
        ids.sort();
        ids.dedup();
        if let Some(n) = limit {
            ids.truncate(n);
        }
        Ok(ids)
    }

    async fn read_profile(&self, customer_id: &str) -> anyhow::Result<Option<CustomerProfile>> {
        let g = self.inner.lock().expect("store mutex poisoned");
        Ok(g.profiles
            .get(customer_id)
            .and_then(|versions| versions.values().next_back().cloned()))
    }

    async fn write_profile(&self, profile: &CustomerProfile) -> anyhow::Result<()> {
        let mut g = self.inner.lock().expect("store mutex poisoned");
        g.profiles
            .entry(profile.customer_id.clone())
            .or_default()
            .insert(profile.version, profile.clone());
        Ok(())
    }

    async fn read_decision(&self, customer_id: &str) -> anyhow::Result<Option<Decision>> {
        let g = self.inner.lock().expect("store mutex poisoned");
        Ok(g.decisions.get(customer_id).cloned())
    }

    async fn write_decision(&self, decision: &Decision) -> anyhow::Result<()> {
        let mut g = self.inner.lock().expect("store mutex poisoned");
        g.decisions
            .insert(decision.customer_id.clone(), decision.clone());
        Ok(())
    }
}

// ------------------------------------------------------------
// JSON directory store (CLI batch runs, demos)
// ------------------------------------------------------------

/// File layout: `records.json` (array of raw interactions, loaded once),
/// `profiles/<id>.json`, `decisions/<id>.json`. Writes are atomic via
/// tmp-file + rename.
pub struct JsonStore {
    dir: PathBuf,
    records: Vec<RawInteraction>,
}

impl JsonStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let records_path = dir.join("records.json");
        let records = if records_path.exists() {
            let data = std::fs::read_to_string(&records_path)
                .with_context(|| format!("reading {}", records_path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("parsing {}", records_path.display()))?
        } else {
            Vec::new()
        };
        std::fs::create_dir_all(dir.join("profiles"))?;
        std::fs::create_dir_all(dir.join("decisions"))?;
        Ok(Self { dir, records })
    }

    fn profile_path(&self, customer_id: &str) -> PathBuf {
        self.dir.join("profiles").join(format!("{customer_id}.json"))
    }

    fn decision_path(&self, customer_id: &str) -> PathBuf {
        self.dir.join("decisions").join(format!("{customer_id}.json"))
    }
}

fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp, json.as_bytes())
        .with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

fn read_json_opt<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Some(serde_json::from_str(&data)?))
}

#[async_trait::async_trait]
impl Storage for JsonStore {
    async fn read_records(
        &self,
        customer_id: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<RawInteraction>> {
        Ok(self
            .records
            .iter()
            .filter(|r| customer_id.map_or(true, |id| r.customer_id == id))
            .filter(|r| match since {
                Some(cutoff) => DateTime::parse_from_rfc3339(r.timestamp.trim())
                    .map(|t| t.with_timezone(&Utc) >= cutoff)
                    .unwrap_or(true),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn list_customers(&self, limit: Option<usize>) -> anyhow::Result<Vec<String>> {
        let mut ids: Vec<String> = self.records.iter().map(|r| r.customer_id.clone()).collect();
        ids.sort();
        ids.dedup();
        if let Some(n) = limit {
            ids.truncate(n);
        }
        Ok(ids)
    }

    async fn read_profile(&self, customer_id: &str) -> anyhow::Result<Option<CustomerProfile>> {
        read_json_opt(&self.profile_path(customer_id))
    }

    async fn write_profile(&self, profile: &CustomerProfile) -> anyhow::Result<()> {
        write_json_atomic(&self.profile_path(&profile.customer_id), profile)
    }

    async fn read_decision(&self, customer_id: &str) -> anyhow::Result<Option<Decision>> {
        read_json_opt(&self.decision_path(customer_id))
    }

    async fn write_decision(&self, decision: &Decision) -> anyhow::Result<()> {
        write_json_atomic(&self.decision_path(&decision.customer_id), decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(customer: &str, id: &str, ts: &str) -> RawInteraction {
        RawInteraction {
            source_record_id: Some(id.to_string()),
            customer_id: customer.to_string(),
            channel: "twitter".into(),
            direction: "inbound".into(),
            timestamp: ts.into(),
            text: "hello".into(),
        }
    }

    #[tokio::test]
    async fn memory_store_filters_by_customer_and_cutoff() {
        let store = MemoryStore::with_records(vec![
            raw("A", "1", "2024-06-01T10:00:00Z"),
            raw("A", "2", "2024-06-02T10:00:00Z"),
            raw("B", "3", "2024-06-01T10:00:00Z"),
        ]);

        let all = store.read_records(None, None).await.unwrap();
        assert_eq!(all.len(), 3);

        let a_only = store.read_records(Some("A"), None).await.unwrap();
        assert_eq!(a_only.len(), 2);

        let cutoff = DateTime::parse_from_rfc3339("2024-06-02T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let recent = store.read_records(Some("A"), Some(cutoff)).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].source_record_id.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn memory_store_profile_upsert_keeps_latest_version() {
        let store = MemoryStore::new();
        let v1 = CustomerProfile::new_customer("A", 1);
        let v2 = CustomerProfile::new_customer("A", 2);
        store.write_profile(&v1).await.unwrap();
        store.write_profile(&v2).await.unwrap();
        store.write_profile(&v2).await.unwrap(); // replay is a no-op
        let latest = store.read_profile("A").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
    }

    #[tokio::test]
    async fn list_customers_is_sorted_and_limited() {
        let store = MemoryStore::with_records(vec![
            raw("B", "1", "2024-06-01T10:00:00Z"),
            raw("A", "2", "2024-06-01T10:00:00Z"),
            raw("A", "3", "2024-06-01T11:00:00Z"),
        ]);
        assert_eq!(store.list_customers(None).await.unwrap(), vec!["A", "B"]);
        assert_eq!(store.list_customers(Some(1)).await.unwrap(), vec!["A"]);
    }
}
