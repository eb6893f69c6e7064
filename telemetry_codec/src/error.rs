use std::io;
use thiserror::Error;

use crate::MetricType;

/// Why an encode call produced no output
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("error writing frames")]
    Write(#[from] io::Error),

    #[error("unsupported metric type {metric_type:?} in metric {family} {sample}")]
    UnsupportedMetricType {
        family: String,
        metric_type: MetricType,
        sample: String,
    },

    #[error("payload does not match {metric_type:?} in metric {family} {sample}")]
    MismatchedPayload {
        family: String,
        metric_type: MetricType,
        sample: String,
    },

    #[error("metric family '{name}' is not registered for version {version}")]
    UnknownFamily { name: String, version: u64 },
}

/// Why a frame stream could not be decoded
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("frame truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("no frame magic at offset {offset}")]
    BadMagic { offset: usize },

    #[error("value frame for version {version} arrived before any metadata")]
    MissingSchema { version: u64 },

    #[error("value frame has version {frame} but the schema is version {schema}")]
    VersionMismatch { frame: u64, schema: u64 },

    #[error("unknown family index {index}")]
    UnknownFamilyIndex { index: usize },

    #[error("unknown label index {index} in metric {family}")]
    UnknownLabelIndex { family: String, index: usize },

    #[error("unknown metric type code {code}")]
    UnknownMetricType { code: u64 },

    #[error("metric type {metric_type:?} of {family} cannot be decoded")]
    UnsupportedMetricType {
        family: String,
        metric_type: MetricType,
    },

    #[error("invalid utf-8 at offset {offset}")]
    InvalidUtf8 { offset: usize },
}
