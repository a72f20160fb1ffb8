//! Startup reconciliation and background loops.

use super::GuestManager;
use crate::cgroup;
use crate::error::{GuestError, Result};
use crate::instance::{GuestRuntimeInstance, KvmGuestInstance, PodGuestInstance};
use crate::observability::metrics;
use crate::remote::DirtyGuestVerdict;
use crate::types::Hypervisor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Wait between failed reconciliation attempts.
pub const BOOTSTRAP_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Period of the pod container reconcile loop.
pub const POD_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

type Candidates = HashMap<String, Arc<dyn GuestRuntimeInstance>>;

impl GuestManager {
    /// Load guests found on disk and reconcile them with the control plane,
    /// retrying until the control plane answers.
    #[instrument(skip(self))]
    pub async fn bootstrap(&self) {
        self.bootstrap_with_retry(BOOTSTRAP_RETRY_INTERVAL).await
    }

    pub async fn bootstrap_with_retry(&self, retry: Duration) {
        let mut candidates = self.load_candidates().await;
        info!(candidates = candidates.len(), "Loaded guest candidates from disk");
        loop {
            match self.verify_existing_guests(&mut candidates).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, retry_secs = retry.as_secs(), "Guest verification failed, retrying");
                    tokio::time::sleep(retry).await;
                }
            }
        }
        info!(guests = self.guest_ids().len(), "Bootstrap finished");
    }

    /// Every directory under the servers path with a readable descriptor.
    pub async fn load_candidates(&self) -> Candidates {
        let mut candidates = Candidates::new();
        let root = &self.ctx.config.servers_path;
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %root.display(), error = %e, "Cannot read servers path");
                return candidates;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            let probe = KvmGuestInstance::new(id.as_str(), self.ctx.clone());
            if let Err(e) = probe.load_desc() {
                warn!(guest_id = %id, error = %e, "Skipping guest with unreadable descriptor");
                continue;
            }
            let hypervisor = probe.source_desc().or_else(|| probe.desc()).map(|d| d.hypervisor);
            let guest: Arc<dyn GuestRuntimeInstance> = match hypervisor {
                None => continue,
                Some(Hypervisor::Kvm) => probe,
                Some(Hypervisor::Pod) => {
                    let pod = PodGuestInstance::new(id.as_str(), self.ctx.clone());
                    if let Err(e) = pod.load_desc() {
                        warn!(guest_id = %id, error = %e, "Skipping pod with unreadable state");
                        continue;
                    }
                    pod
                }
            };
            candidates.insert(id, guest);
        }
        candidates
    }

    /// Two passes over the control plane's view of this host: live guests
    /// first, then guests pending deletion. Candidates matched by neither are
    /// flagged dirty and only dropped when the control plane confirms.
    ///
    /// Matched candidates leave `candidates`, so a retry resumes where a
    /// failed attempt stopped.
    pub async fn verify_existing_guests(&self, candidates: &mut Candidates) -> Result<()> {
        let host_id = self.ctx.config.host_id.clone();
        for pending_delete in [false, true] {
            let remote = self.ctx.control_plane.list_host_guests(&host_id, pending_delete).await?;
            for server in remote {
                if let Some(guest) = candidates.remove(&server.id) {
                    self.import_guest(guest).await;
                }
            }
        }

        let unmatched: Vec<String> = candidates.keys().cloned().collect();
        for id in unmatched {
            let Some(guest) = candidates.get(&id).cloned() else {
                continue;
            };
            guest.set_dirty(true);
            let verdict = self.ctx.control_plane.verify_dirty_guest(&host_id, &id).await?;
            candidates.remove(&id);
            match verdict {
                DirtyGuestVerdict::Remove => {
                    info!(guest_id = %id, "Control plane disowned guest, removing");
                    if let Err(e) = guest.destroy().await {
                        warn!(guest_id = %id, error = %e, "Failed to remove dirty guest");
                    }
                }
                DirtyGuestVerdict::Keep => {
                    warn!(guest_id = %id, "Keeping dirty guest");
                    self.import_guest(guest).await;
                }
            }
        }
        Ok(())
    }

    /// Register a reconciled guest and reattach to its emulator.
    async fn import_guest(&self, guest: Arc<dyn GuestRuntimeInstance>) {
        let id = guest.id().to_string();
        if !self.try_insert(guest.clone()) {
            warn!(guest_id = %id, "Guest already registered, skipping import");
            return;
        }
        if guest.hypervisor() == Hypervisor::Kvm && guest.is_running() {
            if let Ok(kvm) = guest.as_any_arc().downcast::<KvmGuestInstance>() {
                if let Err(e) = kvm.reconnect().await {
                    warn!(guest_id = %id, error = %e, "Failed to reattach monitor");
                }
            }
        }
        info!(guest_id = %id, "Guest imported");
    }

    /// Spread running guests' vCPUs over host CPUs. Returns the number of
    /// guests pinned.
    #[instrument(skip(self))]
    pub async fn balance_cpusets(&self) -> Result<usize> {
        let host_cpus = self.ctx.cgroup.host_cpus().await;
        if host_cpus.is_empty() {
            return Err(GuestError::Internal("no host cpus found".to_string()));
        }
        let mut guests = Vec::new();
        for id in self.guest_ids() {
            let Ok(guest) = self.kvm(&id) else {
                continue;
            };
            if let Some(desc) = guest.desc().filter(|_| guest.is_running()) {
                guests.push((guest, desc.cpu));
            }
        }
        let weights: Vec<(String, u32)> = guests.iter().map(|(g, cpu)| (g.id().to_string(), *cpu)).collect();
        let plan = cgroup::balance(&weights, &host_cpus);

        let mut pinned = 0;
        for (guest, _) in guests {
            let Some(cpus) = plan.get(guest.id()) else {
                continue;
            };
            match guest.set_cpuset(cpus.clone()).await {
                Ok(()) => pinned += 1,
                Err(e) => warn!(guest_id = %guest.id(), error = %e, "Failed to pin guest"),
            }
        }
        Ok(pinned)
    }

    /// Rebalance cpusets every configured interval. `None` when pinning is off.
    pub fn spawn_cpuset_balancer(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.ctx.config.enable_cpu_pinning {
            return None;
        }
        let interval = Duration::from_secs(self.ctx.config.cpuset_balance_interval_secs);
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let pass = Arc::clone(&manager);
                // a panicking pass must not end the loop
                match tokio::spawn(async move { pass.balance_cpusets().await }).await {
                    Ok(Ok(pinned)) => {
                        metrics::record_cpuset_balance("success");
                        info!(pinned, "Cpuset balance pass finished");
                    }
                    Ok(Err(e)) => {
                        metrics::record_cpuset_balance("failure");
                        warn!(error = %e, "Cpuset balance pass failed");
                    }
                    Err(e) if e.is_panic() => {
                        metrics::record_cpuset_balance("panic");
                        error!(error = %e, "Cpuset balance pass panicked");
                    }
                    Err(e) => warn!(error = %e, "Cpuset balance pass aborted"),
                }
            }
        }))
    }

    /// Restart pod containers that died while expected to run.
    pub async fn reconcile_pods(&self) -> usize {
        let mut restarted = 0;
        for id in self.guest_ids() {
            let Ok(pod) = self.pod(&id) else {
                continue;
            };
            match pod.reconcile().await {
                Ok(ids) => restarted += ids.len(),
                Err(e) => warn!(guest_id = %id, error = %e, "Pod reconcile failed"),
            }
        }
        restarted
    }

    /// Run [`reconcile_pods`](Self::reconcile_pods) periodically. `None`
    /// without a container runtime.
    pub fn spawn_pod_reconciler(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        self.ctx.container_runtime.as_ref()?;
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POD_RECONCILE_INTERVAL);
            loop {
                ticker.tick().await;
                let restarted = manager.reconcile_pods().await;
                if restarted > 0 {
                    info!(restarted, "Restarted pod containers");
                }
            }
        }))
    }
}
