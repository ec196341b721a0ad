use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

/// Values available to `{placeholder}` substitution.
pub type Supply = HashMap<String, Value>;

/// Global supply shared by every worker of a run.
///
/// Writes are atomic per [`merge`](Self::merge) call. Readers get a snapshot
/// taken at call time; there is no cross-call consistency, so two workers may
/// observe another worker's extraction at different moments.
#[derive(Debug, Default)]
pub struct SupplyContext {
    values: RwLock<Supply>,
}

impl SupplyContext {
    pub fn new(initial: Supply) -> Self {
        Self {
            values: RwLock::new(initial),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.read().get(name).cloned()
    }

    /// Apply all `updates` under one write lock.
    pub fn merge(&self, updates: Supply) {
        if updates.is_empty() {
            return;
        }
        self.values.write().extend(updates);
    }

    pub fn snapshot(&self) -> Supply {
        self.values.read().clone()
    }

    /// Snapshot of the global values overlaid with `local`; local keys win.
    pub fn layered(&self, local: &Supply) -> Supply {
        let mut effective = self.snapshot();
        effective.extend(local.iter().map(|(k, v)| (k.clone(), v.clone())));
        effective
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn local_values_win_over_global() {
        let supply = SupplyContext::new(Supply::from([
            ("host".to_string(), json!("global")),
            ("user".to_string(), json!("alice")),
        ]));
        let local = Supply::from([("host".to_string(), json!("local"))]);

        let effective = supply.layered(&local);
        assert_eq!(effective["host"], json!("local"));
        assert_eq!(effective["user"], json!("alice"));
        // layering never writes back
        assert_eq!(supply.get("host"), Some(json!("global")));
    }

    #[test]
    fn concurrent_merges_keep_every_key() {
        let supply = Arc::new(SupplyContext::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let supply = supply.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        supply.merge(Supply::from([(format!("k{i}-{j}"), json!(j))]));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(supply.snapshot().len(), 800);
    }
}
