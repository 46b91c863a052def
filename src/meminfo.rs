//! Parsing of the kernel memory summary.
//!
//! `/proc/meminfo` is a sequence of `Key:  value kB` lines. Only four keys
//! matter to the daemon: `MemTotal`, `MemAvailable`, `SwapTotal` and
//! `SwapFree`. Everything else is ignored.

use crate::probe::ProbeError;

/// Point-in-time view of system memory, taken once per poll iteration.
///
/// All sizes are in KiB as reported by the kernel. The percentages are
/// floating point and are what every threshold comparison in the daemon
/// operates on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySnapshot {
    pub mem_total_kib: i64,
    pub mem_available_kib: i64,
    pub swap_total_kib: i64,
    pub swap_free_kib: i64,
    /// Percent of total memory the kernel estimates as available.
    pub mem_available_percent: f64,
    /// Percent of total swap that is free. Defined as 100 when the machine
    /// has no swap, so swap conditions never block action.
    pub swap_free_percent: f64,
}

impl MemorySnapshot {
    /// Parse the text of `/proc/meminfo`.
    ///
    /// Fails if any of the four mandatory keys is missing or unparseable.
    pub fn parse(text: &str) -> Result<Self, ProbeError> {
        let mut mem_total = None;
        let mut mem_available = None;
        let mut swap_total = None;
        let mut swap_free = None;

        for line in text.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            let slot = match key {
                "MemTotal" => &mut mem_total,
                "MemAvailable" => &mut mem_available,
                "SwapTotal" => &mut swap_total,
                "SwapFree" => &mut swap_free,
                _ => continue,
            };
            let value = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<i64>().ok())
                .ok_or_else(|| ProbeError::Parse(format!("bad meminfo line '{line}'")))?;
            *slot = Some(value);
        }

        let missing =
            |key: &str| ProbeError::Parse(format!("meminfo is missing mandatory key '{key}'"));
        let mem_total_kib = mem_total.ok_or_else(|| missing("MemTotal"))?;
        let mem_available_kib = mem_available.ok_or_else(|| missing("MemAvailable"))?;
        let swap_total_kib = swap_total.ok_or_else(|| missing("SwapTotal"))?;
        let swap_free_kib = swap_free.ok_or_else(|| missing("SwapFree"))?;

        let mem_available_percent = 100.0 * mem_available_kib as f64 / mem_total_kib as f64;
        let swap_free_percent = if swap_total_kib == 0 {
            100.0
        } else {
            100.0 * swap_free_kib as f64 / swap_total_kib as f64
        };

        Ok(Self {
            mem_total_kib,
            mem_available_kib,
            swap_total_kib,
            swap_free_kib,
            mem_available_percent,
            swap_free_percent,
        })
    }

    pub fn mem_total_mib(&self) -> i64 {
        self.mem_total_kib / 1024
    }

    pub fn mem_available_mib(&self) -> i64 {
        self.mem_available_kib / 1024
    }

    pub fn swap_total_mib(&self) -> i64 {
        self.swap_total_kib / 1024
    }

    pub fn swap_free_mib(&self) -> i64 {
        self.swap_free_kib / 1024
    }

    /// One-line human readable summary, used by the periodic memory report.
    pub fn summary(&self) -> String {
        format!(
            "mem avail: {:5} of {:5} MiB ({:2.0}%), swap free: {:4} of {:4} MiB ({:3.0}%)",
            self.mem_available_mib(),
            self.mem_total_mib(),
            self.mem_available_percent,
            self.swap_free_mib(),
            self.swap_total_mib(),
            self.swap_free_percent,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "\
MemTotal:       16384000 kB
MemFree:         1000000 kB
MemAvailable:    8192000 kB
Buffers:          123456 kB
SwapTotal:       4096000 kB
SwapFree:        1024000 kB
";

    #[test]
    fn test_parse_computes_percentages() {
        let m = MemorySnapshot::parse(FULL).unwrap();
        assert_eq!(m.mem_total_kib, 16_384_000);
        assert_eq!(m.mem_available_kib, 8_192_000);
        assert_eq!(m.swap_total_kib, 4_096_000);
        assert_eq!(m.swap_free_kib, 1_024_000);
        assert!((m.mem_available_percent - 50.0).abs() < 1e-9);
        assert!((m.swap_free_percent - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentages_stay_in_range() {
        let m = MemorySnapshot::parse(FULL).unwrap();
        assert!(m.mem_available_percent >= 0.0 && m.mem_available_percent <= 100.0);
        assert!(m.swap_free_percent >= 0.0 && m.swap_free_percent <= 100.0);
    }

    #[test]
    fn test_zero_swap_counts_as_fully_free() {
        let text = "\
MemTotal:        1000 kB
MemAvailable:     500 kB
SwapTotal:          0 kB
SwapFree:           0 kB
";
        let m = MemorySnapshot::parse(text).unwrap();
        assert_eq!(m.swap_free_percent, 100.0);
    }

    #[test]
    fn test_missing_mandatory_key_is_an_error() {
        let text = "\
MemTotal:        1000 kB
SwapTotal:          0 kB
SwapFree:           0 kB
";
        let err = MemorySnapshot::parse(text).unwrap_err();
        assert!(err.to_string().contains("MemAvailable"));
    }

    #[test]
    fn test_garbage_value_is_an_error() {
        let text = "\
MemTotal:        lots kB
MemAvailable:     500 kB
SwapTotal:          0 kB
SwapFree:           0 kB
";
        assert!(MemorySnapshot::parse(text).is_err());
    }

    #[test]
    fn test_mib_conversions() {
        let m = MemorySnapshot::parse(FULL).unwrap();
        assert_eq!(m.mem_total_mib(), 16_000);
        assert_eq!(m.swap_total_mib(), 4_000);
    }
}
