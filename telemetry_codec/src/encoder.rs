//! Builds metadata and value frames from a batch of metric families.

use std::io::Write;

use crate::debug::DebugMetrics;
use crate::encoding::{FrameWriter, VarintEncoding};
use crate::error::EncodeError;
use crate::registry::{Dictionary, Registry};
use crate::{MetricFamily, MetricType, Sample, SampleValue, METADATA_MAGIC, VALUE_MAGIC};

/// Starting capacity of each in-memory frame buffer
const INITIAL_FRAME_CAPACITY: usize = 1024;

/// What a successful encode call produced
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EncodeSummary {
    /// The schema version both frames were encoded against
    pub version: u64,

    /// Whether the call discarded and rebuilt the dictionary
    pub rebuilt: bool,

    /// Size of the metadata frame, if one was emitted
    pub metadata_bytes: Option<usize>,

    /// Size of the value frame
    pub value_bytes: usize,
}

impl EncodeSummary {
    pub fn metadata_sent(&self) -> bool {
        self.metadata_bytes.is_some()
    }

    pub fn total_bytes(&self) -> usize {
        self.metadata_bytes.unwrap_or(0) + self.value_bytes
    }
}

/// Encodes metric batches against a dictionary that persists across calls.
///
/// An encoder can be shared between threads; calls for the same version agree on every
/// family and label index.
pub struct Encoder {
    registry: Registry,
    varint: VarintEncoding,
    stats: DebugMetrics,
}

impl Default for Encoder {
    fn default() -> Self {
        Encoder::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            varint: VarintEncoding::default(),
            stats: DebugMetrics::new(),
        }
    }

    pub fn with_varint_encoding(mut self, varint: VarintEncoding) -> Self {
        self.varint = varint;
        self
    }

    pub fn varint_encoding(&self) -> VarintEncoding {
        self.varint
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> &DebugMetrics {
        &self.stats
    }

    /// Encodes `families` and writes the frames to `out` with a single write.
    ///
    /// `latest_version` is the authoritative schema version; when it differs from the
    /// registry's version the dictionary is rebuilt from `families`. `requested_version`
    /// is the version the peer already holds; when it differs from `latest_version` a
    /// metadata frame precedes the value frame.
    pub fn encode<W: Write + ?Sized>(
        &self,
        families: &[MetricFamily],
        latest_version: u64,
        requested_version: u64,
        out: &mut W,
    ) -> Result<EncodeSummary, EncodeError> {
        let (frames, summary) = self.encode_to_vec(families, latest_version, requested_version)?;
        if let Err(err) = out.write_all(&frames).and_then(|_| out.flush()) {
            self.stats.write_failed();
            tracing::warn!(version = summary.version, bytes = frames.len(), "frame write failed: {}", err);
            return Err(err.into());
        }
        if let Some(bytes) = summary.metadata_bytes {
            self.stats.metadata_written(bytes);
        }
        self.stats.values_written(summary.value_bytes);
        Ok(summary)
    }

    /// Encodes `families` into a new buffer holding the metadata frame (if any) followed
    /// by the value frame.
    pub fn encode_to_vec(
        &self,
        families: &[MetricFamily],
        latest_version: u64,
        requested_version: u64,
    ) -> Result<(Vec<u8>, EncodeSummary), EncodeError> {
        self.stats.encode_started();

        let (dictionary, rebuilt) = self.registry.refresh(latest_version, families);
        if rebuilt {
            self.stats.registry_rebuilt();
            tracing::debug!(
                version = latest_version,
                families = dictionary.len(),
                "rebuilt metric dictionary"
            );
        }

        // Values first, so the metadata includes every label assigned for this batch
        let values = match self.encode_values(&dictionary, families) {
            Ok(values) => values,
            Err(err) => {
                self.stats.encode_failed();
                return Err(err);
            }
        };

        tracing::debug!(
            requested_version,
            held_version = dictionary.version(),
            "negotiating metadata"
        );
        let mut summary = EncodeSummary {
            version: dictionary.version(),
            rebuilt,
            metadata_bytes: None,
            value_bytes: values.len(),
        };
        let frames = if requested_version != dictionary.version() {
            let mut frames = self.encode_metadata(&dictionary);
            summary.metadata_bytes = Some(frames.len());
            frames.extend_from_slice(&values);
            frames
        } else {
            values
        };
        Ok((frames, summary))
    }

    fn encode_values(
        &self,
        dictionary: &Dictionary,
        families: &[MetricFamily],
    ) -> Result<Vec<u8>, EncodeError> {
        let mut frame = FrameWriter::sized_for(INITIAL_FRAME_CAPACITY, self.varint);
        frame.write_magic(VALUE_MAGIC);
        frame.write_u64(dictionary.version());
        frame.write_usize(families.len());
        for family in families {
            let entry = dictionary
                .resolve_family_index(&family.name)
                .and_then(|index| dictionary.family(index))
                .ok_or_else(|| EncodeError::UnknownFamily {
                    name: family.name.clone(),
                    version: dictionary.version(),
                })?;
            frame.write_usize(entry.index());
            frame.write_usize(family.samples.len());
            for sample in &family.samples {
                frame.write_usize(sample.labels.len());
                for (name, value) in &sample.labels {
                    let (label_index, assigned) = entry.assign_label(name);
                    if assigned {
                        self.stats.label_assigned();
                    }
                    frame.write_u64(label_index);
                    frame.write_str(value);
                }
                encode_payload(&mut frame, family, sample)?;
            }
        }
        Ok(frame.finish())
    }

    fn encode_metadata(&self, dictionary: &Dictionary) -> Vec<u8> {
        let mut frame = FrameWriter::sized_for(INITIAL_FRAME_CAPACITY, self.varint);
        frame.write_magic(METADATA_MAGIC);
        frame.write_u64(dictionary.version());
        frame.write_usize(dictionary.len());
        for family in dictionary.families() {
            frame.write_u64(family.metric_type().code());
            frame.write_str(family.name());
            frame.write_str(family.help());
            for label in family.label_names() {
                frame.write_str(&label);
            }
        }
        frame.finish()
    }
}

fn encode_payload(
    frame: &mut FrameWriter,
    family: &MetricFamily,
    sample: &Sample,
) -> Result<(), EncodeError> {
    match (family.metric_type, &sample.value) {
        (MetricType::Counter | MetricType::Gauge | MetricType::Untyped, SampleValue::Scalar(value)) => {
            frame.write_f64(*value);
        }
        (MetricType::Summary, SampleValue::Summary(summary)) => {
            for quantile in &summary.quantiles {
                frame.write_f64(quantile.quantile);
                frame.write_f64(quantile.value);
            }
            frame.write_u64(summary.sample_count);
            frame.write_f64(summary.sample_sum);
        }
        (MetricType::Histogram, SampleValue::Histogram(histogram)) => {
            for bucket in &histogram.buckets {
                frame.write_f64(bucket.upper_bound);
                frame.write_f64(bucket.cumulative_count as f64);
            }
            frame.write_u64(histogram.sample_count);
            frame.write_f64(histogram.sample_sum);
        }
        (MetricType::GaugeHistogram, _) => {
            return Err(EncodeError::UnsupportedMetricType {
                family: family.name.clone(),
                metric_type: family.metric_type,
                sample: sample.to_string(),
            });
        }
        (metric_type, _) => {
            return Err(EncodeError::MismatchedPayload {
                family: family.name.clone(),
                metric_type,
                sample: sample.to_string(),
            });
        }
    }
    Ok(())
}
