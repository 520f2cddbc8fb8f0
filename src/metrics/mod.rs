use std::sync::Mutex;

/// Monotonic counters behind a dedicated mutex, kept separate from the
/// engine state mutex so a metrics snapshot never has to wait on an
/// in-flight recreate.
#[derive(Debug, Default, Clone, Copy)]
pub struct Snapshot {
    pub scans_total: u64,
    pub scans_skipped: u64,
    pub containers_scanned: u64,
    pub containers_updated: u64,
    pub containers_failed: u64,
}

#[derive(Default)]
struct Counters {
    scans_total: u64,
    scans_skipped: u64,
    containers_scanned: u64,
    containers_updated: u64,
    containers_failed: u64,
}

pub struct Metrics {
    counters: Mutex<Counters>,
}

impl Metrics {
    pub fn new() -> Self {
        Self { counters: Mutex::new(Counters::default()) }
    }

    pub fn incr_scans_total(&self) {
        self.counters.lock().expect("metrics mutex poisoned").scans_total += 1;
    }

    pub fn incr_scans_skipped(&self) {
        self.counters.lock().expect("metrics mutex poisoned").scans_skipped += 1;
    }

    pub fn add_containers_scanned(&self, n: u64) {
        self.counters.lock().expect("metrics mutex poisoned").containers_scanned += n;
    }

    pub fn incr_containers_updated(&self) {
        self.counters.lock().expect("metrics mutex poisoned").containers_updated += 1;
    }

    pub fn incr_containers_failed(&self) {
        self.counters.lock().expect("metrics mutex poisoned").containers_failed += 1;
    }

    pub fn snapshot(&self) -> Snapshot {
        let c = self.counters.lock().expect("metrics mutex poisoned");
        Snapshot {
            scans_total: c.scans_total,
            scans_skipped: c.scans_skipped,
            containers_scanned: c.containers_scanned,
            containers_updated: c.containers_updated,
            containers_failed: c.containers_failed,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain-text exposition, one `guerite_<counter> <value>` line per counter.
pub fn render(snapshot: Snapshot) -> String {
    format!(
        "guerite_scans_total {}\n\
         guerite_scans_skipped {}\n\
         guerite_containers_scanned {}\n\
         guerite_containers_updated {}\n\
         guerite_containers_failed {}\n",
        snapshot.scans_total,
        snapshot.scans_skipped,
        snapshot.containers_scanned,
        snapshot.containers_updated,
        snapshot.containers_failed,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let metrics = Metrics::new();
        metrics.incr_scans_total();
        metrics.incr_scans_total();
        metrics.add_containers_scanned(3);
        metrics.incr_containers_updated();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.scans_total, 2);
        assert_eq!(snapshot.containers_scanned, 3);
        assert_eq!(snapshot.containers_updated, 1);
        assert_eq!(snapshot.containers_failed, 0);
    }

    #[test]
    fn render_produces_one_line_per_counter() {
        let text = render(Snapshot { scans_total: 1, scans_skipped: 0, containers_scanned: 2, containers_updated: 1, containers_failed: 0 });
        assert_eq!(text.lines().count(), 5);
        assert!(text.contains("guerite_scans_total 1"));
    }
}
