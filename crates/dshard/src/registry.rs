use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::shard::DataShard;

/// Active shards of one machine, keyed by alias.
///
/// Readers clone the `Arc` for the duration of one check, so replacing a
/// shard never invalidates a reader that is already running; the old shard
/// is dropped when its last reader lets go.
#[derive(Debug, Default)]
pub struct ShardRegistry {
    shards: RwLock<HashMap<String, Arc<DataShard>>>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current shard registered under `alias`.
    pub fn get(&self, alias: &str) -> Option<Arc<DataShard>> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(alias)
            .cloned()
    }

    /// Install `shard` under its alias, returning the shard it replaced.
    pub fn install(&self, shard: DataShard) -> Option<Arc<DataShard>> {
        let alias = shard.alias().to_string();
        self.shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(alias, Arc::new(shard))
    }

    pub fn remove(&self, alias: &str) -> Option<Arc<DataShard>> {
        self.shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(alias)
    }

    pub fn aliases(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use strads_core::{ShardKind, TaskRange};

    use super::*;
    use crate::shard::ShardTag;

    fn shard(alias: &str, h_modulo: usize) -> DataShard {
        DataShard::from_triplets(
            alias,
            ShardKind::Sparse,
            2,
            TaskRange::new(0, 1),
            vec![TaskRange::new(0, 1)],
            ShardTag {
                h_modulo,
                oocdpartitions: 2,
            },
            vec![(0, 0, 1.0)],
        )
        .unwrap()
    }

    #[test]
    fn install_replaces_and_returns_previous() {
        let reg = ShardRegistry::new();
        assert!(reg.install(shard("Acol", 0)).is_none());
        let reader = reg.get("Acol").unwrap();

        let old = reg.install(shard("Acol", 1)).unwrap();
        assert_eq!(old.tag().h_modulo, 0);
        // A reader holding the old shard keeps a valid view.
        assert_eq!(reader.tag().h_modulo, 0);
        assert_eq!(reg.get("Acol").unwrap().tag().h_modulo, 1);
    }

    #[test]
    fn aliases_are_sorted() {
        let reg = ShardRegistry::new();
        reg.install(shard("b", 0));
        reg.install(shard("a", 0));
        assert_eq!(reg.aliases(), vec!["a", "b"]);
        assert!(reg.remove("a").is_some());
        assert!(reg.get("a").is_none());
    }
}
