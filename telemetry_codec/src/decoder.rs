//! Reconstructs metric families from a stream of metadata and value frames.
//!
//! Neither a family's label list in a metadata frame nor a sample's quantile or bucket
//! list in a value frame carries a count, so the decoder needs to be told the shape of
//! each family up front with [`Decoder::expect_labels`] and [`Decoder::expect_points`].

use serde::Serialize;
use std::collections::HashMap;
use std::str;

use crate::encoding::{FrameReader, VarintEncoding};
use crate::error::DecodeError;
use crate::{
    Bucket, Histogram, MetricFamily, MetricType, Quantile, Sample, SampleValue, Summary,
    METADATA_MAGIC, VALUE_MAGIC,
};

/// Upper bound for pre-allocations driven by counts read off the wire
const MAX_PREALLOCATION: usize = 1024;

/// A family as described by a metadata frame
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SchemaFamily {
    pub name: String,
    pub help: String,
    pub metric_type: MetricType,

    /// Label names in index order
    pub labels: Vec<String>,
}

/// One decoded frame
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Frame {
    Metadata {
        version: u64,
        families: Vec<SchemaFamily>,
    },
    Values {
        version: u64,
        families: Vec<MetricFamily>,
    },
}

pub struct Decoder {
    varint: VarintEncoding,

    /// Number of label names each family carries in metadata frames
    label_counts: HashMap<String, usize>,

    /// Number of quantiles or buckets per summary or histogram sample
    point_counts: HashMap<String, usize>,

    /// The most recently received schema and its version
    schema: Option<(u64, Vec<SchemaFamily>)>,
}

impl Decoder {
    pub fn new(varint: VarintEncoding) -> Self {
        Self {
            varint,
            label_counts: HashMap::new(),
            point_counts: HashMap::new(),
            schema: None,
        }
    }

    /// Sets how many label names `family` carries in metadata frames.
    ///
    /// Without it a family is read with no labels, unless it is the last family of the
    /// frame, which takes every label name up to the next frame.
    pub fn expect_labels(&mut self, family: &str, count: usize) -> &mut Self {
        self.label_counts.insert(family.to_string(), count);
        self
    }

    /// Sets how many quantiles or buckets each sample of `family` carries.
    pub fn expect_points(&mut self, family: &str, count: usize) -> &mut Self {
        self.point_counts.insert(family.to_string(), count);
        self
    }

    pub fn schema_version(&self) -> Option<u64> {
        self.schema.as_ref().map(|(version, _)| *version)
    }

    pub fn schema(&self) -> Option<&[SchemaFamily]> {
        self.schema.as_ref().map(|(_, families)| families.as_slice())
    }

    /// Decodes every frame in `input`, updating the held schema on each metadata frame.
    pub fn decode(&mut self, input: &[u8]) -> Result<Vec<Frame>, DecodeError> {
        let mut reader = FrameReader::new(input, self.varint);
        let mut frames = Vec::new();
        while !reader.is_empty() {
            let offset = reader.offset();
            if reader.read_magic(METADATA_MAGIC) {
                let (version, families) = self.decode_metadata(&mut reader)?;
                tracing::debug!(version, families = families.len(), "received metric schema");
                self.schema = Some((version, families.clone()));
                frames.push(Frame::Metadata { version, families });
            } else if reader.read_magic(VALUE_MAGIC) {
                let (version, families) = self.decode_values(&mut reader)?;
                frames.push(Frame::Values { version, families });
            } else {
                return Err(DecodeError::BadMagic { offset });
            }
        }
        Ok(frames)
    }

    fn decode_metadata(
        &self,
        reader: &mut FrameReader<'_>,
    ) -> Result<(u64, Vec<SchemaFamily>), DecodeError> {
        let version = read_u64(reader)?;
        let count = read_usize(reader)?;
        let mut families = Vec::with_capacity(count.min(MAX_PREALLOCATION));
        for position in 0..count {
            let code = read_u64(reader)?;
            let metric_type =
                MetricType::from_code(code).ok_or(DecodeError::UnknownMetricType { code })?;
            let name = read_string(reader)?;
            let help = read_string(reader)?;
            let labels = match self.label_counts.get(&name) {
                Some(expected) => (0..*expected)
                    .map(|_| read_string(reader))
                    .collect::<Result<Vec<_>, _>>()?,
                None if position + 1 == count => {
                    let mut labels = Vec::new();
                    while !reader.is_empty()
                        && !reader.starts_with(METADATA_MAGIC)
                        && !reader.starts_with(VALUE_MAGIC)
                    {
                        labels.push(read_string(reader)?);
                    }
                    labels
                }
                None => Vec::new(),
            };
            families.push(SchemaFamily {
                name,
                help,
                metric_type,
                labels,
            });
        }
        Ok((version, families))
    }

    fn decode_values(
        &self,
        reader: &mut FrameReader<'_>,
    ) -> Result<(u64, Vec<MetricFamily>), DecodeError> {
        let version = read_u64(reader)?;
        let (schema_version, schema) = self
            .schema
            .as_ref()
            .ok_or(DecodeError::MissingSchema { version })?;
        if *schema_version != version {
            return Err(DecodeError::VersionMismatch {
                frame: version,
                schema: *schema_version,
            });
        }

        let count = read_usize(reader)?;
        let mut families = Vec::with_capacity(count.min(MAX_PREALLOCATION));
        for _ in 0..count {
            let index = read_usize(reader)?;
            let family = schema
                .get(index)
                .ok_or(DecodeError::UnknownFamilyIndex { index })?;
            let points = self.point_counts.get(&family.name).copied().unwrap_or(0);

            let sample_count = read_usize(reader)?;
            let mut samples = Vec::with_capacity(sample_count.min(MAX_PREALLOCATION));
            for _ in 0..sample_count {
                let label_count = read_usize(reader)?;
                let mut labels = Vec::with_capacity(label_count.min(MAX_PREALLOCATION));
                for _ in 0..label_count {
                    let label_index = read_usize(reader)?;
                    let name = family.labels.get(label_index).ok_or_else(|| {
                        DecodeError::UnknownLabelIndex {
                            family: family.name.clone(),
                            index: label_index,
                        }
                    })?;
                    labels.push((name.clone(), read_string(reader)?));
                }
                let value = decode_payload(reader, family, points)?;
                samples.push(Sample { labels, value });
            }

            families.push(MetricFamily {
                name: family.name.clone(),
                help: family.help.clone(),
                metric_type: family.metric_type,
                samples,
            });
        }
        Ok((version, families))
    }
}

fn decode_payload(
    reader: &mut FrameReader<'_>,
    family: &SchemaFamily,
    points: usize,
) -> Result<SampleValue, DecodeError> {
    let value = match family.metric_type {
        MetricType::Counter | MetricType::Gauge | MetricType::Untyped => {
            SampleValue::Scalar(read_f64(reader)?)
        }
        MetricType::Summary => {
            let mut quantiles = Vec::with_capacity(points.min(MAX_PREALLOCATION));
            for _ in 0..points {
                quantiles.push(Quantile {
                    quantile: read_f64(reader)?,
                    value: read_f64(reader)?,
                });
            }
            SampleValue::Summary(Summary {
                quantiles,
                sample_count: read_u64(reader)?,
                sample_sum: read_f64(reader)?,
            })
        }
        MetricType::Histogram => {
            let mut buckets = Vec::with_capacity(points.min(MAX_PREALLOCATION));
            for _ in 0..points {
                buckets.push(Bucket {
                    upper_bound: read_f64(reader)?,
                    // Counts travel as doubles; exact up to 2^53
                    cumulative_count: read_f64(reader)? as u64,
                });
            }
            SampleValue::Histogram(Histogram {
                buckets,
                sample_count: read_u64(reader)?,
                sample_sum: read_f64(reader)?,
            })
        }
        MetricType::GaugeHistogram => {
            return Err(DecodeError::UnsupportedMetricType {
                family: family.name.clone(),
                metric_type: family.metric_type,
            })
        }
    };
    Ok(value)
}

fn read_u64(reader: &mut FrameReader<'_>) -> Result<u64, DecodeError> {
    let offset = reader.offset();
    reader.read_u64().ok_or(DecodeError::Truncated { offset })
}

fn read_usize(reader: &mut FrameReader<'_>) -> Result<usize, DecodeError> {
    let offset = reader.offset();
    reader.read_usize().ok_or(DecodeError::Truncated { offset })
}

fn read_f64(reader: &mut FrameReader<'_>) -> Result<f64, DecodeError> {
    let offset = reader.offset();
    reader.read_f64().ok_or(DecodeError::Truncated { offset })
}

fn read_string(reader: &mut FrameReader<'_>) -> Result<String, DecodeError> {
    let offset = reader.offset();
    let bytes = reader.read_str().ok_or(DecodeError::Truncated { offset })?;
    str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| DecodeError::InvalidUtf8 { offset })
}
