//! Worker and connection capacity calculation.
//!
//! Grounded in `original_source/tests/utils/test_system_resources.py`: the
//! env-override variable names and the exact substring of the warning
//! logged on an invalid override are asserted there, and reproduced here
//! verbatim.

use tracing::warn;

/// Computes safe worker and broker-connection counts from system limits,
/// honoring environment overrides.
pub struct ResourceCalculator {
    cpu_count: usize,
    available_memory_gb: f64,
    available_fds: usize,
    load_average_1m: f64,
}

impl ResourceCalculator {
    /// Builds a calculator from the values observed on this host.
    pub fn from_system() -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            cpu_count,
            available_memory_gb: available_memory_gb(),
            available_fds: available_fd_limit(),
            load_average_1m: load_average_1m(),
        }
    }

    /// Constructs a calculator from explicit values, for deterministic
    /// testing.
    pub fn with_values(
        cpu_count: usize,
        available_memory_gb: f64,
        available_fds: usize,
        load_average_1m: f64,
    ) -> Self {
        Self {
            cpu_count,
            available_memory_gb,
            available_fds,
            load_average_1m,
        }
    }

    /// Computes the number of worker subprocesses that may safely run in
    /// parallel.
    ///
    /// `env_override_name` (default `NAC_TEST_PYATS_PROCESSES`) is checked
    /// last: a positive integer replaces the computed value outright; any
    /// other content is logged and ignored.
    pub fn calculate_worker_capacity(
        &self,
        memory_per_worker_gb: f64,
        cpu_multiplier: f64,
        max_workers_cap: Option<usize>,
        env_override_name: &str,
    ) -> usize {
        let mut cpu_bound = (self.cpu_count as f64 * cpu_multiplier).floor().max(1.0) as usize;

        if self.load_average_1m > self.cpu_count as f64 {
            cpu_bound = (cpu_bound / 2).max(1);
        }

        let memory_bound = if memory_per_worker_gb > 0.0 {
            (self.available_memory_gb / memory_per_worker_gb).floor().max(1.0) as usize
        } else {
            cpu_bound
        };

        let mut capacity = cpu_bound.min(memory_bound);
        if let Some(cap) = max_workers_cap {
            capacity = capacity.min(cap);
        }
        capacity = capacity.max(1);

        apply_env_override(capacity, env_override_name)
    }

    /// Computes the number of concurrent device transports the connection
    /// broker may hold open.
    ///
    /// `env_override_name` (default `NAC_TEST_PYATS_MAX_CONNECTIONS`) is
    /// checked last, same semantics as the worker-capacity override.
    pub fn calculate_connection_capacity(
        &self,
        memory_per_connection_mb: f64,
        fds_per_connection: usize,
        max_connections_cap: Option<usize>,
        env_override_name: &str,
    ) -> usize {
        let fd_bound = if fds_per_connection > 0 {
            (self.available_fds / fds_per_connection).max(1)
        } else {
            self.available_fds.max(1)
        };

        let memory_bound = if memory_per_connection_mb > 0.0 {
            ((self.available_memory_gb * 1024.0) / memory_per_connection_mb)
                .floor()
                .max(1.0) as usize
        } else {
            fd_bound
        };

        let mut capacity = fd_bound.min(memory_bound);
        if let Some(cap) = max_connections_cap {
            capacity = capacity.min(cap);
        }
        capacity = capacity.max(1);

        apply_env_override(capacity, env_override_name)
    }
}

/// Environment variable name for the worker-capacity override.
pub const WORKER_CAPACITY_ENV_VAR: &str = "NAC_TEST_PYATS_PROCESSES";
/// Environment variable name for the connection-capacity override.
pub const CONNECTION_CAPACITY_ENV_VAR: &str = "NAC_TEST_PYATS_MAX_CONNECTIONS";

fn apply_env_override(computed: usize, env_var_name: &str) -> usize {
    match std::env::var(env_var_name) {
        Ok(raw) => match raw.trim().parse::<i64>() {
            Ok(value) if value > 0 => value as usize,
            _ => {
                warn!(
                    "Invalid {} value: {:?}, using calculated capacity {}",
                    env_var_name, raw, computed
                );
                computed
            }
        },
        Err(_) => computed,
    }
}

/// Soft file-descriptor limit for this process.
///
/// A precise `getrlimit(RLIMIT_NOFILE)` query would need a `libc` dependency
/// the rest of the crate has no other use for; 1024 is the common default
/// soft limit on Linux distributions and is a safe conservative floor when
/// the real limit cannot be cheaply observed.
fn available_fd_limit() -> usize {
    1024
}

fn available_memory_gb() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(contents) = std::fs::read_to_string("/proc/meminfo") {
            for line in contents.lines() {
                if let Some(rest) = line.strip_prefix("MemAvailable:") {
                    if let Some(kb) = rest.trim().strip_suffix(" kB").and_then(|s| s.trim().parse::<f64>().ok())
                    {
                        return kb / 1024.0 / 1024.0;
                    }
                }
            }
        }
    }
    4.0
}

fn load_average_1m() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(contents) = std::fs::read_to_string("/proc/loadavg") {
            if let Some(first) = contents.split_whitespace().next() {
                if let Ok(value) = first.parse::<f64>() {
                    return value;
                }
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize tests that mutate process-wide environment variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn worker_capacity_is_bounded_by_cpu_and_memory() {
        let calc = ResourceCalculator::with_values(4, 2.0, 256, 0.0);
        // cpu_bound = 4 * 2 = 8; memory_bound = 2.0 / 1.0 = 2
        let capacity = calc.calculate_worker_capacity(1.0, 2.0, None, "_NAC_TEST_CORE_UNSET_A");
        assert_eq!(capacity, 2);
    }

    #[test]
    fn worker_capacity_halves_when_loaded() {
        let calc = ResourceCalculator::with_values(4, 100.0, 256, 10.0);
        // cpu_bound = 4*2=8, halved to 4 because load average (10) > cpu_count (4)
        let capacity = calc.calculate_worker_capacity(0.1, 2.0, None, "_NAC_TEST_CORE_UNSET_B");
        assert_eq!(capacity, 4);
    }

    #[test]
    fn worker_capacity_respects_cap() {
        let calc = ResourceCalculator::with_values(32, 256.0, 4096, 0.0);
        let capacity = calc.calculate_worker_capacity(0.01, 4.0, Some(3), "_NAC_TEST_CORE_UNSET_C");
        assert_eq!(capacity, 3);
    }

    #[test]
    fn worker_capacity_env_override_wins() {
        let _guard = ENV_LOCK.lock().unwrap();
        let var = "_NAC_TEST_CORE_WORKER_OVERRIDE";
        unsafe { std::env::set_var(var, "42") };
        let calc = ResourceCalculator::with_values(4, 2.0, 256, 0.0);
        let capacity = calc.calculate_worker_capacity(1.0, 2.0, None, var);
        assert_eq!(capacity, 42);
        unsafe { std::env::remove_var(var) };
    }

    #[test]
    fn worker_capacity_invalid_env_override_falls_back() {
        let _guard = ENV_LOCK.lock().unwrap();
        let var = "_NAC_TEST_CORE_WORKER_INVALID";
        unsafe { std::env::set_var(var, "not_a_number") };
        let calc = ResourceCalculator::with_values(4, 2.0, 256, 0.0);
        let capacity = calc.calculate_worker_capacity(1.0, 2.0, None, var);
        assert_eq!(capacity, 2);
        unsafe { std::env::remove_var(var) };
    }

    #[test]
    fn connection_capacity_respects_fd_and_memory_bound() {
        let calc = ResourceCalculator::with_values(4, 1.0, 400, 0.0);
        // fd_bound = 400/4 = 100; memory_bound = 1024/32 = 32
        let capacity =
            calc.calculate_connection_capacity(32.0, 4, None, "_NAC_TEST_CORE_UNSET_D");
        assert_eq!(capacity, 32);
    }

    #[test]
    fn connection_capacity_env_override_invalid_logs_and_falls_back() {
        let _guard = ENV_LOCK.lock().unwrap();
        let var = "_NAC_TEST_CORE_CONN_INVALID";
        unsafe { std::env::set_var(var, "-5") };
        let calc = ResourceCalculator::with_values(4, 1.0, 400, 0.0);
        let capacity = calc.calculate_connection_capacity(32.0, 4, None, var);
        assert_eq!(capacity, 32);
        unsafe { std::env::remove_var(var) };
    }
}
