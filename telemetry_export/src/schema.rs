use std::collections::BTreeSet;
use telemetry_codec::{MetricFamily, MetricType};

/// What the peer needs to know about one family to decode its values
#[derive(Debug, Eq, PartialEq)]
struct FamilyShape {
    name: String,
    metric_type: MetricType,
    help: String,
    label_names: BTreeSet<String>,
}

impl FamilyShape {
    fn of(family: &MetricFamily) -> Self {
        FamilyShape {
            name: family.name.clone(),
            metric_type: family.metric_type,
            help: family.help.clone(),
            label_names: family
                .samples
                .iter()
                .flat_map(|sample| sample.labels.iter().map(|(name, _)| name.clone()))
                .collect(),
        }
    }
}

/// Derives the authoritative schema version from successive exports.
///
/// The version starts at 1 and moves forward whenever the ordered family list, a
/// family's type or help text, or the set of label names used by a family changes.
#[derive(Debug, Default)]
pub struct SchemaTracker {
    version: u64,
    shapes: Vec<FamilyShape>,
}

impl SchemaTracker {
    pub fn new() -> Self {
        SchemaTracker::default()
    }

    /// The latest version handed out, or 0 before the first observation
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn observe(&mut self, families: &[MetricFamily]) -> u64 {
        let changed = self.version == 0
            || self.shapes.len() != families.len()
            || self
                .shapes
                .iter()
                .zip(families)
                .any(|(shape, family)| *shape != FamilyShape::of(family));
        if changed {
            self.shapes = families.iter().map(FamilyShape::of).collect();
            self.version += 1;
            tracing::info!(
                version = self.version,
                families = families.len(),
                "metric schema changed"
            );
        }
        self.version
    }
}
