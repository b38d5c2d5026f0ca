use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bpf::affinity::{self, AffinityTable, KernelAffinityTable};
use crate::bpf::conntrack::{self, ConntrackTable, Timeouts};
use crate::bpf::hooks::{AyaTcBackend, HookManager, Trigger};
use crate::bpf::loader::{self, Dataplane};
use crate::bpf::pin::{self, BpffsPinStore, OwnerLock};
use crate::bpf::routes::{self, RouteMap, RouteTableState};
use crate::bpf::service::{self, KernelNatTable, NatState, ServiceSyncer};
use crate::clock::MonotonicClock;
use crate::config::AgentArgs;
use crate::desired::{DesiredState, DesiredStateFile};
use crate::iface::{self, SysLinks};
use crate::markbits::MarkBits;
use crate::metrics::SWEEP_METRICS;
use crate::{Error, Result};

type Nat = NatState<service::FrontendMap, service::BackendMap, service::SourceRangeMap>;

const TRIGGER_QUEUE: usize = 256;

pub async fn start(
    args: AgentArgs,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let marks = MarkBits::validate(args.mark_mask)?;
    loader::disable_unprivileged_bpf();

    let ctx = args.map_context();
    let options = args.options();
    info!(?options, namespace = %ctx.namespace, repin = ctx.repin, "starting dataplane agent");

    let owner = OwnerLock::acquire(&args.lock_file, args.lock_wait).await?;
    info!(path = %owner.path().display(), "holding dataplane owner lock");

    let store = BpffsPinStore;
    let decisions = pin::prepare_all(&store, &ctx)?;
    let mut dataplane = Dataplane::load(&ctx, &options, &marks, &args.bpf_object)?;
    pin::verify(&store, &ctx, &decisions)?;

    info!("opening tables");
    let nat: Nat = NatState::new(load_nat(&ctx)?);
    let affinity = Arc::new(AffinityTable::new(affinity::load_map(&ctx)?, MonotonicClock));
    let conntrack = Arc::new(ConntrackTable::new(
        conntrack::load_map(&ctx)?,
        MonotonicClock,
        Timeouts::default(),
    ));
    let mut routes = RouteTableState::load(routes::load_map(&ctx)?)?;

    info!("initializing hook manager");
    let (ingress, egress) = dataplane.tc_programs()?;
    let backend = Arc::new(AyaTcBackend::new(
        ctx.tc_dir(),
        args.bpf_dispatch_object.clone(),
        ingress,
        egress,
    )?);
    let hooks = Arc::new(HookManager::new(
        backend,
        args.iface_matcher(),
        args.hook_config(),
    ));
    let (triggers, trigger_rx) = mpsc::channel(TRIGGER_QUEUE);

    let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();
    let token = cancel.child_token();
    let scan_period = args.ct_scan_period;
    tasks.spawn(async move {
        let res = conntrack::run_sweeper(conntrack, scan_period, token).await;
        ("conntrack sweeper", res)
    });
    let token = cancel.child_token();
    let (sweep_affinity, lookup, period) = (affinity.clone(), nat.clone(), args.affinity_scan_period);
    tasks.spawn(async move {
        let res = affinity::run_sweeper(sweep_affinity, Arc::new(lookup), period, token).await;
        ("affinity sweeper", res)
    });
    let token = cancel.child_token();
    tasks.spawn(async move { ("hook manager", hooks.run(trigger_rx, token).await) });
    let token = cancel.child_token();
    let (watch_tx, watch_period) = (triggers.clone(), args.reconcile_interval);
    tasks.spawn(async move {
        let res = iface::run_watcher(SysLinks::default(), watch_period, watch_tx, token).await;
        ("interface watcher", res)
    });

    let mut syncer =
        ServiceSyncer::new(options.dsr()).with_protocols(options.protocols.clone());
    let mut feed = DesiredStateFile::new(&args.desired_state);
    let mut ticker = interval(args.desired_state_poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            _ = ticker.tick() => {
                let state = match feed.poll() {
                    Ok(Some(state)) => state,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(%e, path = %feed.path().display(), "failed to read desired state");
                        continue;
                    }
                };
                apply_desired(&state, &nat, &mut syncer, &mut routes, &affinity);
                if let Err(e) = triggers.try_send(Trigger::Notify(None)) {
                    debug!(%e, "hook manager busy, relying on reconcile tick");
                }
                if !ready.is_cancelled() {
                    info!("first sync complete");
                    ready.cancel();
                }
            }
            Some(joined) = tasks.join_next() => match joined {
                Ok((name, Ok(()))) => info!("{name} exited"),
                Ok((name, Err(e))) => {
                    error!("{name} failed with error: {e}");
                    break Err(e);
                }
                Err(e) => break Err(Error::Task(e.to_string())),
            },
        }
    };

    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => debug!("{name} stopped"),
            Ok((name, Err(e))) => error!("{name} failed with error: {e}"),
            Err(e) => error!("task failed to complete: {e}"),
        }
    }
    drop(owner);
    result
}

fn load_nat(ctx: &crate::bpf::context::MapContext) -> Result<KernelNatTable> {
    let table = service::load(ctx)?;
    if table.pending_orphans() > 0 {
        info!(
            groups = table.pending_orphans(),
            "found backend groups without a frontend"
        );
    }
    Ok(table)
}

/// Converges services and routes on `state`. Failures are logged and left
/// for the next change; the tables stay consistent either way.
fn apply_desired(
    state: &DesiredState,
    nat: &Nat,
    syncer: &mut ServiceSyncer,
    routes: &mut RouteTableState<RouteMap>,
    affinity: &KernelAffinityTable<MonotonicClock>,
) {
    let stats = match nat.lock() {
        Ok(mut table) => {
            let stats = syncer.apply(&mut *table, &state.services);
            if let Err(e) = table.gc() {
                warn!(%e, "failed to collect orphaned backend groups");
            }
            SWEEP_METRICS.set_entries("nat_frontend", table.keys().len());
            stats
        }
        Err(e) => {
            error!(%e, "cannot update services");
            return;
        }
    };
    for key in &stats.deleted {
        match affinity.invalidate(key) {
            Ok(0) => {}
            Ok(n) => debug!(%key, removed = n, "dropped affinity of deleted service"),
            Err(e) => warn!(%e, %key, "failed to drop affinity entries"),
        }
    }
    if let Some(e) = &stats.last_error {
        warn!(
            failed = stats.failed,
            capacity = e.is_capacity(),
            "some services could not be programmed: {e}"
        );
    }
    info!(
        upserted = stats.upserted,
        unchanged = stats.unchanged,
        deleted = stats.deleted.len(),
        "services synced"
    );

    if let Err(e) = routes.apply(&routes::build(&state.routes)) {
        warn!(%e, "failed to update route table");
    }
    SWEEP_METRICS.set_entries("routes", routes.len());
}
