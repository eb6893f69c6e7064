use anyhow::{Context, Result};
use std::fs;
use std::io::{self, Read, Write};

use telemetry_codec::{
    Decoder, EncodeSummary, Encoder, Frame, MetricFamily, Sample, SampleValue,
};

use crate::config::{Config, Endpoint};
use crate::error::debug_error;
use crate::parser;
use crate::schema::SchemaTracker;

/// Runs export cycles, remembering which schema version the peer holds.
pub struct Exporter {
    input: Endpoint,
    static_labels: Vec<(String, String)>,
    encoder: Encoder,
    schema: SchemaTracker,
    peer_version: u64,
    verifier: Option<Decoder>,
}

impl Exporter {
    pub fn new(config: &Config) -> Self {
        Exporter {
            input: config.input.clone(),
            static_labels: config.static_labels.clone(),
            encoder: Encoder::new().with_varint_encoding(config.varint),
            schema: SchemaTracker::new(),
            peer_version: config.peer_version,
            verifier: if config.verify {
                Some(Decoder::new(config.varint))
            } else {
                None
            },
        }
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn schema_version(&self) -> u64 {
        self.schema.version()
    }

    /// The schema version the peer is believed to hold
    pub fn peer_version(&self) -> u64 {
        self.peer_version
    }

    pub fn read_input(&self) -> Result<String> {
        match &self.input {
            Endpoint::Standard => {
                let mut input = String::new();
                io::stdin()
                    .read_to_string(&mut input)
                    .context("reading metrics from stdin")?;
                Ok(input)
            }
            Endpoint::Path(path) => fs::read_to_string(path)
                .with_context(|| format!("reading metrics from {}", path.display())),
        }
    }

    /// Parses `input` and writes one cycle of frames to `out`.
    pub fn export(&mut self, input: &str, out: &mut dyn Write) -> Result<EncodeSummary> {
        let mut families = parser::parse(input);
        add_static_labels(&mut families, &self.static_labels);
        let version = self.schema.observe(&families);

        let mut capture = Capture::new(out, self.verifier.is_some());
        let summary = self
            .encoder
            .encode(&families, version, self.peer_version, &mut capture)
            .with_context(|| {
                format!("exporting {} families at version {}", families.len(), version)
            })?;

        // The peer now holds the version the frames were encoded against
        self.peer_version = summary.version;
        tracing::debug!(
            version = summary.version,
            metadata = summary.metadata_sent(),
            bytes = summary.total_bytes(),
            "exported metrics"
        );

        if let Some(decoder) = &mut self.verifier {
            match verify(decoder, &self.encoder, &families, &capture.bytes, &summary) {
                Ok(Verification::Mismatched) => tracing::warn!(
                    version = summary.version,
                    "decoded frames do not match the exported metrics"
                ),
                Ok(_) => (),
                Err(err) => debug_error(err.context("verifying exported frames")),
            }
        }
        Ok(summary)
    }
}

/// Prepends the static labels to every sample that doesn't already carry them
fn add_static_labels(families: &mut [MetricFamily], static_labels: &[(String, String)]) {
    if static_labels.is_empty() {
        return;
    }
    for family in families {
        for sample in &mut family.samples {
            let mut labels = Vec::with_capacity(static_labels.len() + sample.labels.len());
            for label in static_labels {
                if !sample.labels.iter().any(|(name, _)| *name == label.0) {
                    labels.push(label.clone());
                }
            }
            labels.append(&mut sample.labels);
            sample.labels = labels;
        }
    }
}

/// Forwards writes, keeping a copy of the bytes when asked to
struct Capture<'w> {
    inner: &'w mut dyn Write,
    keep: bool,
    bytes: Vec<u8>,
}

impl<'w> Capture<'w> {
    fn new(inner: &'w mut dyn Write, keep: bool) -> Self {
        Capture {
            inner,
            keep,
            bytes: Vec::new(),
        }
    }
}

impl Write for Capture<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        if self.keep {
            self.bytes.extend_from_slice(&buf[..written]);
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// The outcome of decoding one cycle's frames
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Verification {
    Matched,
    Mismatched,

    /// The values could not be laid out; only the schema was read
    Unchecked,
}

/// Decodes the frames of one cycle and checks they reproduce `families`
fn verify(
    decoder: &mut Decoder,
    encoder: &Encoder,
    families: &[MetricFamily],
    bytes: &[u8],
    summary: &EncodeSummary,
) -> Result<Verification> {
    // Label counts come from the dictionary the frames were encoded with
    if let Some(dictionary) = encoder.registry().snapshot() {
        for entry in dictionary.families() {
            decoder.expect_labels(entry.name(), entry.label_count());
        }
    }
    let mut uneven = None;
    for family in families {
        match uniform_point_count(family) {
            Some(points) => {
                decoder.expect_points(&family.name, points);
            }
            None => uneven = Some(&family.name),
        }
    }

    if let Some(family) = uneven {
        // The decoder still needs the schema to read later values-only frames
        if let Some(metadata) = summary.metadata_bytes.and_then(|len| bytes.get(..len)) {
            decoder.decode(metadata)?;
        }
        tracing::debug!(family = %family, "skipped verification of uneven samples");
        return Ok(Verification::Unchecked);
    }

    let frames = decoder.decode(bytes)?;
    tracing::debug!(frames = %serde_json::to_string(&frames)?, "decoded frames");
    match frames.last() {
        Some(Frame::Values {
            families: decoded, ..
        }) if same_families(decoded, families) => Ok(Verification::Matched),
        _ => Ok(Verification::Mismatched),
    }
}

/// Compares families like `==`, except that NaN equals NaN
fn same_families(left: &[MetricFamily], right: &[MetricFamily]) -> bool {
    fn same_f64(left: f64, right: f64) -> bool {
        left == right || (left.is_nan() && right.is_nan())
    }

    fn same_value(left: &SampleValue, right: &SampleValue) -> bool {
        match (left, right) {
            (SampleValue::Scalar(left), SampleValue::Scalar(right)) => same_f64(*left, *right),
            (SampleValue::Summary(left), SampleValue::Summary(right)) => {
                left.sample_count == right.sample_count
                    && same_f64(left.sample_sum, right.sample_sum)
                    && left.quantiles.len() == right.quantiles.len()
                    && left.quantiles.iter().zip(&right.quantiles).all(|(l, r)| {
                        same_f64(l.quantile, r.quantile) && same_f64(l.value, r.value)
                    })
            }
            (SampleValue::Histogram(left), SampleValue::Histogram(right)) => {
                left.sample_count == right.sample_count
                    && same_f64(left.sample_sum, right.sample_sum)
                    && left.buckets.len() == right.buckets.len()
                    && left.buckets.iter().zip(&right.buckets).all(|(l, r)| {
                        same_f64(l.upper_bound, r.upper_bound)
                            && l.cumulative_count == r.cumulative_count
                    })
            }
            _ => false,
        }
    }

    fn same_sample(left: &Sample, right: &Sample) -> bool {
        left.labels == right.labels && same_value(&left.value, &right.value)
    }

    left.len() == right.len()
        && left.iter().zip(right).all(|(l, r)| {
            l.name == r.name
                && l.help == r.help
                && l.metric_type == r.metric_type
                && l.samples.len() == r.samples.len()
                && l.samples.iter().zip(&r.samples).all(|(l, r)| same_sample(l, r))
        })
}

/// The number of quantiles or buckets shared by every sample of a family
fn uniform_point_count(family: &MetricFamily) -> Option<usize> {
    let mut counts = family.samples.iter().map(|sample| match &sample.value {
        SampleValue::Scalar(_) => 0,
        SampleValue::Summary(summary) => summary.quantiles.len(),
        SampleValue::Histogram(histogram) => histogram.buckets.len(),
    });
    let first = counts.next().unwrap_or(0);
    if counts.all(|count| count == first) {
        Some(first)
    } else {
        None
    }
}
