//! Cpuset cgroups for guest processes.
//!
//! Each guest gets `<cgroup_root>/<guest_id>` with `cpuset.cpus` and
//! `cpuset.mems` set before its emulator pid is moved in. The balancer
//! recomputes placements for every unpinned running guest.

use crate::error::{GuestError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Format a cpu list the way the kernel prints it, e.g. `0-3,6`.
pub fn format_cpu_list(cpus: &[u32]) -> String {
    let mut sorted = cpus.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<String> = Vec::new();
    let mut iter = sorted.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            ranges.push(start.to_string());
        } else {
            ranges.push(format!("{}-{}", start, end));
        }
    }
    ranges.join(",")
}

/// Parse a kernel cpu list such as `0-3,6`.
pub fn parse_cpu_list(list: &str) -> Result<Vec<u32>> {
    let invalid = || GuestError::InputParameter { name: "cpus".to_string(), reason: format!("bad cpu list {:?}", list) };
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.trim().is_empty()) {
        match part.trim().split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().map_err(|_| invalid())?;
                let hi: u32 = hi.trim().parse().map_err(|_| invalid())?;
                if lo > hi {
                    return Err(invalid());
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.trim().parse().map_err(|_| invalid())?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Spread guests over host cpus, least-loaded cpus first.
///
/// Bigger guests are placed first; ties are broken by guest id so the same
/// input always yields the same placement.
pub fn balance(guests: &[(String, u32)], host_cpus: &[u32]) -> BTreeMap<String, Vec<u32>> {
    let mut placements = BTreeMap::new();
    if host_cpus.is_empty() {
        return placements;
    }
    let mut load: BTreeMap<u32, u32> = host_cpus.iter().map(|c| (*c, 0)).collect();

    let mut order: Vec<&(String, u32)> = guests.iter().collect();
    order.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    for (guest_id, vcpus) in order {
        let want = (*vcpus as usize).clamp(1, host_cpus.len());
        let mut candidates: Vec<(u32, u32)> = load.iter().map(|(cpu, l)| (*l, *cpu)).collect();
        candidates.sort_unstable();
        let mut chosen: Vec<u32> = candidates.into_iter().take(want).map(|(_, cpu)| cpu).collect();
        for cpu in &chosen {
            if let Some(l) = load.get_mut(cpu) {
                *l += 1;
            }
        }
        chosen.sort_unstable();
        placements.insert(guest_id.clone(), chosen);
    }
    placements
}

/// Writer for the cpuset hierarchy.
#[derive(Debug, Clone)]
pub struct CpusetCgroup {
    root: PathBuf,
}

impl CpusetCgroup {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn guest_dir(&self, guest_id: &str) -> PathBuf {
        self.root.join(guest_id)
    }

    /// Cpus available to guests, from the root cpuset or the cpu count.
    pub async fn host_cpus(&self) -> Vec<u32> {
        if let Ok(list) = tokio::fs::read_to_string(self.root.join("cpuset.cpus")).await {
            if let Ok(cpus) = parse_cpu_list(&list) {
                if !cpus.is_empty() {
                    return cpus;
                }
            }
        }
        let count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        (0..count as u32).collect()
    }

    async fn write(path: &Path, value: &str) -> Result<()> {
        tokio::fs::write(path, value).await.map_err(|e| GuestError::io(path, e))
    }

    /// Pin `pid` to `cpus`.
    #[instrument(skip(self, cpus), fields(cpus = %format_cpu_list(cpus)))]
    pub async fn apply(&self, guest_id: &str, pid: i32, cpus: &[u32]) -> Result<()> {
        if cpus.is_empty() {
            return Err(GuestError::InputParameter { name: "cpus".to_string(), reason: "empty cpu set".to_string() });
        }
        let dir = self.guest_dir(guest_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| GuestError::io(&dir, e))?;

        let mems = tokio::fs::read_to_string(self.root.join("cpuset.mems"))
            .await
            .map(|m| m.trim().to_string())
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "0".to_string());
        Self::write(&dir.join("cpuset.cpus"), &format_cpu_list(cpus)).await?;
        Self::write(&dir.join("cpuset.mems"), &mems).await?;
        Self::write(&dir.join("cgroup.procs"), &pid.to_string()).await?;
        info!(pid, "Applied cpuset");
        Ok(())
    }

    /// Current cpus of a guest's cgroup, if it has one.
    pub async fn current(&self, guest_id: &str) -> Option<Vec<u32>> {
        let list = tokio::fs::read_to_string(self.guest_dir(guest_id).join("cpuset.cpus")).await.ok()?;
        parse_cpu_list(&list).ok()
    }

    /// Remove a guest's cgroup. Missing groups are fine.
    #[instrument(skip(self))]
    pub async fn remove(&self, guest_id: &str) {
        let dir = self.guest_dir(guest_id);
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => debug!("Removed cpuset cgroup"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            // a plain directory (tests, or a non-cgroupfs root) still holds files
            Err(_) => {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    warn!(error = %e, "Failed to remove cpuset cgroup");
                }
            }
        }
    }
}
