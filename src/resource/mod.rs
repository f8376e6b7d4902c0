use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use sysinfo::{Pid, System};

/// Best-effort CPU/memory usage of a supervised process tree.
/// `None` fields mean the value is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: Option<f32>,
    pub memory_mb: Option<f64>,
}

impl ResourceUsage {
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn is_available(&self) -> bool {
        self.memory_mb.is_some()
    }
}

/// Samples running processes through a long-lived `sysinfo::System`, so CPU
/// usage is measured between consecutive samples. The first sample of a
/// process reports 0% CPU.
#[derive(Clone)]
pub struct ResourceSampler {
    system: Arc<Mutex<System>>,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    /// Usage of `pid` plus all of its descendants.
    ///
    /// Launcher scripts usually fork the real server, so the script's own
    /// numbers alone would be misleading.
    pub fn sample(&self, pid: u32) -> ResourceUsage {
        let mut sys = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_processes();

        let root = Pid::from_u32(pid);
        if sys.process(root).is_none() {
            tracing::debug!("Process {} is gone, usage unavailable", pid);
            return ResourceUsage::unavailable();
        }

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (child_pid, process) in sys.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*child_pid);
            }
        }

        let mut cpu = 0.0f32;
        let mut memory_bytes = 0u64;
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(process) = sys.process(current) {
                cpu += process.cpu_usage();
                memory_bytes += process.memory();
            }
            if let Some(kids) = children.get(&current) {
                stack.extend(kids.iter().copied());
            }
        }

        ResourceUsage {
            cpu_percent: Some(cpu),
            memory_mb: Some(memory_bytes as f64 / (1024.0 * 1024.0)),
        }
    }

    /// `sample` on the blocking pool; scanning the process table must not stall the runtime.
    pub async fn sample_async(&self, pid: u32) -> ResourceUsage {
        let sampler = self.clone();
        tokio::task::spawn_blocking(move || sampler.sample(pid))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Resource sampling task failed: {}", e);
                ResourceUsage::unavailable()
            })
    }
}
