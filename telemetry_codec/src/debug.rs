use std::sync::atomic::{AtomicUsize, Ordering};

/// Internal counters for one encoder
pub struct DebugMetrics {
    encode_count: AtomicUsize,
    encode_errors: AtomicUsize,
    write_errors: AtomicUsize,
    rebuild_count: AtomicUsize,
    metadata_frames: AtomicUsize,
    metadata_bytes: AtomicUsize,
    value_frames: AtomicUsize,
    value_bytes: AtomicUsize,
    labels_assigned: AtomicUsize,
}

/// A point-in-time copy of [`DebugMetrics`]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DebugSnapshot {
    pub encode_count: usize,
    pub encode_errors: usize,
    pub write_errors: usize,
    pub rebuild_count: usize,
    pub metadata_frames: usize,
    pub metadata_bytes: usize,
    pub value_frames: usize,
    pub value_bytes: usize,
    pub labels_assigned: usize,
}

impl Default for DebugMetrics {
    fn default() -> Self {
        DebugMetrics::new()
    }
}

impl DebugMetrics {
    pub const fn new() -> Self {
        DebugMetrics {
            encode_count: AtomicUsize::new(0),
            encode_errors: AtomicUsize::new(0),
            write_errors: AtomicUsize::new(0),
            rebuild_count: AtomicUsize::new(0),
            metadata_frames: AtomicUsize::new(0),
            metadata_bytes: AtomicUsize::new(0),
            value_frames: AtomicUsize::new(0),
            value_bytes: AtomicUsize::new(0),
            labels_assigned: AtomicUsize::new(0),
        }
    }

    pub fn encode_started(&self) {
        self.encode_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn encode_failed(&self) {
        self.encode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_failed(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn registry_rebuilt(&self) {
        self.rebuild_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn label_assigned(&self) {
        self.labels_assigned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn metadata_written(&self, bytes: usize) {
        self.metadata_frames.fetch_add(1, Ordering::Relaxed);
        self.metadata_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn values_written(&self, bytes: usize) {
        self.value_frames.fetch_add(1, Ordering::Relaxed);
        self.value_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DebugSnapshot {
        DebugSnapshot {
            encode_count: self.encode_count.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            rebuild_count: self.rebuild_count.load(Ordering::Relaxed),
            metadata_frames: self.metadata_frames.load(Ordering::Relaxed),
            metadata_bytes: self.metadata_bytes.load(Ordering::Relaxed),
            value_frames: self.value_frames.load(Ordering::Relaxed),
            value_bytes: self.value_bytes.load(Ordering::Relaxed),
            labels_assigned: self.labels_assigned.load(Ordering::Relaxed),
        }
    }

    // Log the current metrics and reset the counters
    pub fn publish(&self) -> DebugSnapshot {
        let snapshot = DebugSnapshot {
            encode_count: self.encode_count.swap(0, Ordering::Relaxed),
            encode_errors: self.encode_errors.swap(0, Ordering::Relaxed),
            write_errors: self.write_errors.swap(0, Ordering::Relaxed),
            rebuild_count: self.rebuild_count.swap(0, Ordering::Relaxed),
            metadata_frames: self.metadata_frames.swap(0, Ordering::Relaxed),
            metadata_bytes: self.metadata_bytes.swap(0, Ordering::Relaxed),
            value_frames: self.value_frames.swap(0, Ordering::Relaxed),
            value_bytes: self.value_bytes.swap(0, Ordering::Relaxed),
            labels_assigned: self.labels_assigned.swap(0, Ordering::Relaxed),
        };

        fn format_bytes(bytes: usize) -> String {
            const KI_B: f32 = 1024.;
            const MI_B: f32 = 1024. * 1024.;

            let bytes = bytes as f32;
            if bytes > MI_B {
                format!("{:.1} {}", bytes / MI_B, "MiB")
            } else {
                format!("{:.1} {}", bytes / KI_B, "KiB")
            }
        }
        tracing::info!(
            "Debug: encodes {} (errors {}, write errors {}) | rebuilds {} | labels {} | metadata {} ({}) | values {} ({})",
            snapshot.encode_count,
            snapshot.encode_errors,
            snapshot.write_errors,
            snapshot.rebuild_count,
            snapshot.labels_assigned,
            snapshot.metadata_frames,
            format_bytes(snapshot.metadata_bytes),
            snapshot.value_frames,
            format_bytes(snapshot.value_bytes),
        );
        snapshot
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn publish_resets_counters() {
        let metrics = DebugMetrics::new();
        metrics.encode_started();
        metrics.metadata_written(10);
        metrics.values_written(20);
        metrics.values_written(5);

        let published = metrics.publish();
        assert_eq!(published.encode_count, 1);
        assert_eq!(published.metadata_frames, 1);
        assert_eq!(published.value_frames, 2);
        assert_eq!(published.value_bytes, 25);
        assert_eq!(metrics.snapshot(), DebugSnapshot::default());
    }
}
