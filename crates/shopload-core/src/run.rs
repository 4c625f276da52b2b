use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use crate::client::{ClientSimulator, ClientSummary};
use crate::config::{ClientProfile, Config, PhaseConfig, RampConfig, ReportConfig};
use crate::driver::{RequestDriver, Transport};
use crate::ramp::RampPlanner;
use crate::stats::{PhaseReport, RunStats};

pub const WARMUP_PHASE: &str = "warm-up";
pub const RAMP_PHASE: &str = "ramp-up";
pub const SUSTAINED_PHASE: &str = "sustained";

/// Everything a run shares between its clients. Built once per run and
/// handed to every client task.
pub struct RunContext {
    driver: RequestDriver,
    stats: Arc<RunStats>,
    report: ReportConfig,
}

impl RunContext {
    pub fn new(transport: Arc<dyn Transport>, report: ReportConfig) -> Self {
        let stats = Arc::new(RunStats::new());
        Self {
            driver: RequestDriver::new(transport, stats.clone()),
            stats,
            report,
        }
    }

    pub fn driver(&self) -> &RequestDriver {
        &self.driver
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn report_config(&self) -> &ReportConfig {
        &self.report
    }
}

/// Result of one phase.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub report: PhaseReport,
    pub clients: ClientSummary,
    pub spawned: usize,
    /// Client tasks that died instead of returning a summary
    pub aborted: usize,
    pub duration: Duration,
}

/// Drives warm-up, ramp-up and sustained phases over one `RunContext`.
pub struct Orchestrator {
    ctx: Arc<RunContext>,
    profiles: Vec<ClientProfile>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<RunContext>, profiles: Vec<ClientProfile>) -> Self {
        let profiles = if profiles.is_empty() {
            vec![ClientProfile::anonymous()]
        } else {
            profiles
        };
        Self { ctx, profiles }
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    /// Run every configured phase in order.
    pub async fn run_all(&self, config: &Config, skip_warmup: bool) -> Vec<PhaseOutcome> {
        let mut outcomes = Vec::new();

        if skip_warmup {
            info!("Skipping warm-up phase");
        } else {
            outcomes.push(self.run_fixed(WARMUP_PHASE, &config.warmup).await);
        }

        outcomes.push(self.run_ramp(RAMP_PHASE, &config.ramp).await);

        if let Some(sustained) = &config.sustained {
            outcomes.push(self.run_fixed(SUSTAINED_PHASE, sustained).await);
        }

        outcomes
    }

    /// Spawn `phase.clients` clients at once and wait for all of them.
    pub async fn run_fixed(&self, name: &str, phase: &PhaseConfig) -> PhaseOutcome {
        self.ctx.stats().reset();
        let start = Instant::now();
        info!(
            "[{}] starting {} clients x {} messages (pacing {}ms)",
            name, phase.clients, phase.messages, phase.pacing_ms
        );

        let mut set = JoinSet::new();
        self.spawn_clients(&mut set, 0, phase.clients, phase.messages, phase.pacing());
        let (clients, aborted) = drain(name, &mut set).await;

        self.finish(name, start, clients, phase.clients as usize, aborted)
    }

    /// Spawn clients in waves on the ramp schedule, then wait for all of them.
    pub async fn run_ramp(&self, name: &str, ramp: &RampConfig) -> PhaseOutcome {
        self.ctx.stats().reset();
        let planner = RampPlanner::new(ramp.clone());
        let start = Instant::now();
        info!(
            "[{}] ramping to {} clients x {} messages, +{} every {}ms",
            name,
            planner.total_clients(),
            ramp.messages,
            ramp.step_clients,
            ramp.step_interval_ms
        );

        let mut set = JoinSet::new();
        let mut spawned = 0u32;
        for wave in planner.waves() {
            sleep_until(start + Duration::from_millis(wave.offset_ms)).await;
            info!(
                "[{}] wave {}: +{} clients ({} spawned, {}/{} running)",
                name,
                wave.index,
                wave.clients,
                wave.cumulative,
                self.ctx.driver().active_clients(),
                planner.total_clients()
            );
            self.spawn_clients(&mut set, spawned, wave.clients, ramp.messages, ramp.pacing());
            spawned = wave.cumulative;
        }

        info!("[{}] all waves spawned, waiting for clients to finish", name);
        let (clients, aborted) = drain(name, &mut set).await;

        self.finish(name, start, clients, spawned as usize, aborted)
    }

    fn spawn_clients(
        &self,
        set: &mut JoinSet<ClientSummary>,
        first_id: u32,
        count: u32,
        messages: u32,
        pacing: Duration,
    ) {
        for id in first_id..first_id + count {
            let profile = self.profiles[id as usize % self.profiles.len()].clone();
            let client = ClientSimulator::new(id as usize, profile, messages, pacing);
            set.spawn(client.run(self.ctx.clone()));
        }
    }

    fn finish(
        &self,
        name: &str,
        start: Instant,
        clients: ClientSummary,
        spawned: usize,
        aborted: usize,
    ) -> PhaseOutcome {
        let duration = start.elapsed();
        let report = self.ctx.stats().report(name, self.ctx.report_config());
        info!(
            "[{}] finished in {:.3}s: clients={} aborted={} rounds={} purchases={} verification_errors={} transport_failures={}",
            name,
            duration.as_secs_f64(),
            spawned,
            aborted,
            clients.rounds,
            clients.purchases,
            clients.verification_errors,
            clients.transport_failures
        );
        report.log();

        PhaseOutcome {
            report,
            clients,
            spawned,
            aborted,
            duration,
        }
    }
}

/// Wait for every client task; a task that panicked is logged and counted.
async fn drain(name: &str, set: &mut JoinSet<ClientSummary>) -> (ClientSummary, usize) {
    let mut total = ClientSummary::default();
    let mut aborted = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(summary) => total += summary,
            Err(e) => {
                aborted += 1;
                warn!("[{}] client task aborted: {}", name, e);
            }
        }
    }
    (total, aborted)
}
