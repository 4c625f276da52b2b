use crate::config::RampConfig;

/// A batch of clients spawned at a fixed offset from the phase start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wave {
    pub index: usize,
    pub offset_ms: u64,
    pub clients: u32,
    /// Clients spawned so far in the phase, this wave included
    pub cumulative: u32,
}

/// Deterministic ramp planner: an initial batch at t=0, then `step_clients`
/// more every `step_interval_ms` until `max_clients` have been spawned.
#[derive(Debug, Clone)]
pub struct RampPlanner {
    config: RampConfig,
}

impl RampPlanner {
    pub fn new(config: RampConfig) -> Self {
        Self { config }
    }

    /// Waves in spawn order. Ticks that would add nobody are skipped.
    pub fn waves(&self) -> Vec<Wave> {
        let ceiling = self.total_clients();
        let mut waves = Vec::new();
        let mut spawned = 0u32;
        let mut tick = 0u64;

        loop {
            let want = if tick == 0 {
                self.config.initial_clients
            } else {
                self.config.step_clients
            };
            let clients = want.min(ceiling - spawned);
            if clients > 0 {
                spawned += clients;
                waves.push(Wave {
                    index: waves.len(),
                    offset_ms: tick * self.config.step_interval_ms,
                    clients,
                    cumulative: spawned,
                });
            }
            if spawned >= ceiling || (tick > 0 && self.config.step_clients == 0) {
                break;
            }
            tick += 1;
        }

        waves
    }

    /// Clients the phase spawns in total.
    pub fn total_clients(&self) -> u32 {
        self.config.max_clients.max(self.config.initial_clients)
    }

    /// Offset of the last wave in milliseconds.
    pub fn spawn_duration_ms(&self) -> u64 {
        self.waves().last().map(|w| w.offset_ms).unwrap_or(0)
    }
}
