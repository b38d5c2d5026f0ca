use std::sync::{LazyLock, RwLock};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("mesh_dataplane")));

pub static NAT_METRICS: LazyLock<NatMetrics> = LazyLock::new(|| register(NatMetrics::default()));
pub static SWEEP_METRICS: LazyLock<SweepMetrics> =
    LazyLock::new(|| register(SweepMetrics::default()));
pub static HOOK_METRICS: LazyLock<HookMetrics> = LazyLock::new(|| register(HookMetrics::default()));

trait Register {
    fn register(&self, r: &mut Registry);
}

fn register<M: Register>(metrics: M) -> M {
    // metrics go unregistered if the registry is poisoned
    if let Ok(mut registry) = REGISTRY.write() {
        metrics.register(&mut registry);
    }
    metrics
}

#[derive(Clone, Default)]
pub struct NatMetrics {
    pub upserts: Counter,
    pub deletes: Counter,
}

impl Register for NatMetrics {
    fn register(&self, r: &mut Registry) {
        r.register(
            "nat_upserts",
            "Number of frontends pointed at a new backend group",
            self.upserts.clone(),
        );
        r.register(
            "nat_deletes",
            "Number of frontends removed",
            self.deletes.clone(),
        );
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TableLabels {
    pub table: String,
}

#[derive(Clone, Default)]
pub struct SweepMetrics {
    pub removed: Family<TableLabels, Counter>,
    pub entries: Family<TableLabels, Gauge>,
}

impl SweepMetrics {
    pub fn record(&self, table: &str, removed: usize, remaining: usize) {
        let labels = TableLabels {
            table: table.into(),
        };
        self.removed.get_or_create(&labels).inc_by(removed as u64);
        self.set_entries(table, remaining);
    }

    pub fn set_entries(&self, table: &str, entries: usize) {
        let labels = TableLabels {
            table: table.into(),
        };
        self.entries.get_or_create(&labels).set(entries as i64);
    }
}

impl Register for SweepMetrics {
    fn register(&self, r: &mut Registry) {
        r.register(
            "sweep_removed",
            "Number of records aged out by a sweep",
            self.removed.clone(),
        );
        r.register(
            "table_entries",
            "Number of records in each table",
            self.entries.clone(),
        );
    }
}

#[derive(Clone, Default)]
pub struct HookMetrics {
    pub attached: Counter,
    pub reattached: Counter,
    pub collected: Counter,
}

impl Register for HookMetrics {
    fn register(&self, r: &mut Registry) {
        r.register(
            "hook_attached",
            "Number of interfaces hooked for the first time",
            self.attached.clone(),
        );
        r.register(
            "hook_reattached",
            "Number of interfaces whose hooks were found missing and reinstalled",
            self.reattached.clone(),
        );
        r.register(
            "hook_collected",
            "Number of orphaned dispatch tables removed",
            self.collected.clone(),
        );
    }
}
