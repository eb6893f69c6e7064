//! Dictionary-compressing binary codec for repeated metric exports.
//!
//! A [`Registry`] maps family names and label names to small integer indices for one
//! schema version. The [`Encoder`] uses it to produce two kinds of frames:
//!
//! * a metadata frame (`"cprmeta"`), carrying the schema, sent only when the peer holds
//!   a different version than the encoder;
//! * a value frame (`"cprval"`), carrying indices and raw values, sent on every call.
//!
//! The [`Decoder`] reverses the process on the receiving side.

pub mod debug;
pub mod decoder;
pub mod encoder;
pub mod encoding;
pub mod error;
pub mod registry;

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

pub use decoder::{Decoder, Frame, SchemaFamily};
pub use encoder::{EncodeSummary, Encoder};
pub use encoding::VarintEncoding;
pub use error::{DecodeError, EncodeError};
pub use registry::{Dictionary, FamilyEntry, Registry};

/// Magic prefix of a value frame
pub const VALUE_MAGIC: &[u8] = b"cprval";

/// Magic prefix of a metadata frame
pub const METADATA_MAGIC: &[u8] = b"cprmeta";

/// The kind of a metric family, numbered like the Prometheus client model.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum MetricType {
    Counter,
    Gauge,
    Summary,
    Untyped,
    Histogram,
    GaugeHistogram,
}

impl MetricType {
    /// The code written to metadata frames.
    pub fn code(self) -> u64 {
        match self {
            MetricType::Counter => 0,
            MetricType::Gauge => 1,
            MetricType::Summary => 2,
            MetricType::Untyped => 3,
            MetricType::Histogram => 4,
            MetricType::GaugeHistogram => 5,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(MetricType::Counter),
            1 => Some(MetricType::Gauge),
            2 => Some(MetricType::Summary),
            3 => Some(MetricType::Untyped),
            4 => Some(MetricType::Histogram),
            5 => Some(MetricType::GaugeHistogram),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Summary => "summary",
            MetricType::Untyped => "untyped",
            MetricType::Histogram => "histogram",
            MetricType::GaugeHistogram => "gaugehistogram",
        }
    }
}

impl FromStr for MetricType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricType::Counter),
            "gauge" => Ok(MetricType::Gauge),
            "summary" => Ok(MetricType::Summary),
            "untyped" => Ok(MetricType::Untyped),
            "histogram" => Ok(MetricType::Histogram),
            "gaugehistogram" => Ok(MetricType::GaugeHistogram),
            _ => Err(()),
        }
    }
}

/// A named group of samples sharing a type and help text
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub metric_type: MetricType,
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    pub fn new(name: impl Into<String>, help: impl Into<String>, metric_type: MetricType) -> Self {
        MetricFamily {
            name: name.into(),
            help: help.into(),
            metric_type,
            samples: Vec::new(),
        }
    }

    pub fn with_sample(mut self, sample: Sample) -> Self {
        self.samples.push(sample);
        self
    }
}

/// One metric instance: an ordered label set plus its payload
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Sample {
    pub labels: Vec<(String, String)>,
    pub value: SampleValue,
}

impl Sample {
    pub fn new(value: SampleValue) -> Self {
        Sample {
            labels: Vec::new(),
            value,
        }
    }

    pub fn scalar(value: f64) -> Self {
        Sample::new(SampleValue::Scalar(value))
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((name.into(), value.into()));
        self
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={:?}", name, value)?;
        }
        f.write_str("} ")?;
        match &self.value {
            SampleValue::Scalar(value) => write!(f, "{}", value),
            SampleValue::Summary(summary) => write!(
                f,
                "summary(quantiles={}, count={}, sum={})",
                summary.quantiles.len(),
                summary.sample_count,
                summary.sample_sum
            ),
            SampleValue::Histogram(histogram) => write!(
                f,
                "histogram(buckets={}, count={}, sum={})",
                histogram.buckets.len(),
                histogram.sample_count,
                histogram.sample_sum
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum SampleValue {
    /// The value of a counter, gauge or untyped sample
    Scalar(f64),
    Summary(Summary),
    Histogram(Histogram),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Summary {
    /// Quantiles in the order they were collected; never re-sorted
    pub quantiles: Vec<Quantile>,
    pub sample_count: u64,
    pub sample_sum: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct Quantile {
    pub quantile: f64,
    pub value: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Histogram {
    /// Buckets in the order they were collected; never re-sorted
    pub buckets: Vec<Bucket>,
    pub sample_count: u64,
    pub sample_sum: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct Bucket {
    pub upper_bound: f64,
    pub cumulative_count: u64,
}
