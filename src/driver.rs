use crate::clock::Clock;
use crate::error::ControlError;
use crate::machine::ImportMachine;
use crate::models::BulkImportJob;
use crate::settings::TargetConfig;
use crate::store::{JobRegistry, JobStore};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct TargetSlot {
    machine: Arc<ImportMachine>,
    enabled: bool,
    bulk_import: bool,
    query: String,
}

/// Periodic scheduler plus the operator controls for every configured target.
pub struct Driver {
    targets: HashMap<String, TargetSlot>,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

/// Marks a job as being stepped; released when the step task ends, even by panic.
struct InFlight {
    set: Arc<Mutex<HashSet<Uuid>>>,
    job_id: Uuid,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.job_id);
    }
}

impl Driver {
    pub fn new(registry: Arc<JobRegistry>, clock: Arc<dyn Clock>, tick_interval: Duration) -> Self {
        Self {
            targets: HashMap::new(),
            registry,
            clock,
            tick_interval,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn register(mut self, config: &TargetConfig, machine: ImportMachine) -> Self {
        self.targets.insert(
            config.name.clone(),
            TargetSlot {
                machine: Arc::new(machine),
                enabled: config.enabled,
                bulk_import: config.bulk_import,
                query: config.query().to_string(),
            },
        );
        self
    }

    pub fn target_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.targets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Count open jobs that the first tick will pick up again.
    pub async fn resume(&self) -> usize {
        let mut open = 0;
        for name in self.target_names() {
            match self.registry.store().list_nonterminal(name).await {
                Ok(jobs) => {
                    crate::metrics::open_jobs(name, jobs.len());
                    for job in &jobs {
                        info!(
                            target = "bulk.driver",
                            job_id = %job.job_id,
                            shop = name,
                            state = %job.state,
                            cursor = job.cursor,
                            "resuming bulk import"
                        );
                    }
                    open += jobs.len();
                }
                Err(err) => warn!(target = "bulk.driver", shop = name, error = %err, "could not list open jobs"),
            }
        }
        open
    }

    /// Spawn one step for every open job that is not already being stepped.
    pub async fn tick(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for (name, slot) in &self.targets {
            let jobs = match self.registry.store().list_nonterminal(name).await {
                Ok(jobs) => jobs,
                Err(err) => {
                    warn!(target = "bulk.driver", shop = %name, error = %err, "could not list open jobs");
                    continue;
                }
            };
            for job in jobs {
                let job_id = job.job_id;
                let claimed = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(job_id);
                if !claimed {
                    debug!(target = "bulk.driver", %job_id, "previous step still running");
                    continue;
                }
                let guard = InFlight {
                    set: self.in_flight.clone(),
                    job_id,
                };
                let machine = slot.machine.clone();
                handles.push(tokio::spawn(async move {
                    let _guard = guard;
                    match machine.step(job_id).await {
                        Ok(job) => debug!(
                            target = "bulk.driver",
                            %job_id,
                            shop = machine.target(),
                            state = %job.state,
                            cursor = job.cursor,
                            "step finished"
                        ),
                        Err(err) => warn!(target = "bulk.driver", %job_id, error = %err, "step failed"),
                    }
                }));
            }
        }
        handles
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let driver = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(driver.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                target = "bulk.driver",
                interval_secs = driver.tick_interval.as_secs(),
                targets = driver.targets.len(),
                "driver started"
            );
            loop {
                ticker.tick().await;
                driver.tick().await;
            }
        })
    }

    pub async fn start_import(&self, target: &str) -> Result<BulkImportJob, ControlError> {
        let slot = self
            .targets
            .get(target)
            .ok_or_else(|| ControlError::UnknownTarget(target.to_string()))?;
        if !slot.enabled {
            return Err(ControlError::IntegrationDisabled(target.to_string()));
        }
        if !slot.bulk_import {
            return Err(ControlError::BulkModeDisabled(target.to_string()));
        }
        let job = BulkImportJob::new(target, slot.query.clone(), self.clock.now());
        let job = self.registry.create_exclusive(job).await?;
        info!(target = "bulk.driver", job_id = %job.job_id, shop = target, "bulk import requested");
        Ok(job)
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<BulkImportJob, ControlError> {
        let job = self.status(job_id).await?;
        match self.targets.get(&job.target) {
            Some(slot) => slot.machine.cancel(job_id).await,
            None => Ok(self.registry.cancel(job_id, self.clock.now()).await?.0),
        }
    }

    pub async fn status(&self, job_id: Uuid) -> Result<BulkImportJob, ControlError> {
        self.registry
            .get(job_id)
            .await?
            .ok_or(ControlError::JobNotFound(job_id))
    }

    pub async fn history(&self, target: &str) -> Result<Vec<BulkImportJob>, ControlError> {
        if !self.targets.contains_key(target) {
            return Err(ControlError::UnknownTarget(target.to_string()));
        }
        Ok(self.registry.store().list_for_target(target).await?)
    }
}
