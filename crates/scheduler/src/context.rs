use strads_core::{ClusterConfig, CoreError, PartitionTable, SchedulerParams, TaskRange};
use strads_dshard::{DataShard, ShardRegistry};
use tracing::debug;

use crate::gate::PartitionGate;

/// Everything the threads of one scheduler machine share.
#[derive(Debug)]
pub struct MachineContext {
    pub mid: usize,
    pub params: SchedulerParams,
    pub table: PartitionTable,
    pub shards: ShardRegistry,
    pub gate: PartitionGate,
    /// Number of out-of-core column groups (1 disables cycling).
    pub ooc_partitions: usize,
}

impl MachineContext {
    pub fn new(
        mid: usize,
        params: SchedulerParams,
        table: PartitionTable,
        ooc_partitions: usize,
    ) -> Result<Self, CoreError> {
        if mid >= table.machines() {
            return Err(CoreError::Partition(format!(
                "machine {mid} outside table of {} machines",
                table.machines()
            )));
        }
        let gate = PartitionGate::new(table.threads_per_machine());
        let ooc_partitions = ooc_partitions.max(1);
        // With column groups cycling nothing is resident until a shard
        // for the checked alias arrives.
        if ooc_partitions > 1 {
            for lid in 0..table.threads_per_machine() {
                gate.set_resident(lid, false);
            }
        }
        Ok(Self {
            mid,
            params,
            table,
            shards: ShardRegistry::new(),
            gate,
            ooc_partitions,
        })
    }

    pub fn from_cluster(
        mid: usize,
        cluster: &ClusterConfig,
        params: SchedulerParams,
    ) -> Result<Self, CoreError> {
        let table = PartitionTable::new(
            params.modelsize,
            cluster.scheduler_machines,
            cluster.threads_per_scheduler,
        )?;
        Self::new(mid, params, table, cluster.ooc_partitions)
    }

    pub fn threads(&self) -> usize {
        self.table.threads_per_machine()
    }

    /// Global partition id of local thread `lid`.
    pub fn gid(&self, lid: usize) -> usize {
        self.mid * self.threads() + lid
    }

    /// Local thread of global partition `gid`, if this machine owns it.
    pub fn lid_of(&self, gid: usize) -> Option<usize> {
        let base = self.mid * self.threads();
        (gid >= base && gid < base + self.threads()).then(|| gid - base)
    }

    pub fn thread_range(&self, lid: usize) -> TaskRange {
        self.table.machine_threads(self.mid)[lid]
    }

    pub fn machine_range(&self) -> TaskRange {
        self.table
            .machine_range(self.mid)
            .unwrap_or(TaskRange::new(0, 0))
    }

    pub fn local_lids(&self) -> Vec<usize> {
        (0..self.threads()).collect()
    }

    /// Make `shard` active and, when column groups cycle, recompute which
    /// partitions it covers.
    pub fn install_shard(&self, shard: DataShard) {
        self.shards.install(shard);
        self.refresh_residency();
    }

    /// Returns the local partitions the checked shard covers.
    pub fn refresh_residency(&self) -> Vec<usize> {
        if self.ooc_partitions <= 1 {
            return self.local_lids();
        }
        let Some(shard) = self.shards.get(&self.params.check_alias) else {
            return Vec::new();
        };
        let mut resident = Vec::new();
        for lid in 0..self.threads() {
            let holds = shard.holds_range(self.thread_range(lid));
            self.gate.set_resident(lid, holds);
            if holds {
                resident.push(lid);
            }
        }
        debug!(mid = self.mid, h_modulo = shard.tag().h_modulo, ?resident, "residency updated");
        resident
    }
}
