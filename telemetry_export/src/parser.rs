use std::borrow::Cow;
use std::collections::HashMap;

use telemetry_codec::{
    Bucket, Histogram, MetricFamily, MetricType, Quantile, Sample, SampleValue, Summary,
};

/// Which series of a summary or histogram a sample line belongs to
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Series {
    Value,
    Bucket,
    Sum,
    Count,
}

/// A family being assembled, with its samples keyed by label set
struct FamilyBuilder {
    family: MetricFamily,
    samples: HashMap<Vec<(String, String)>, usize>,
}

impl FamilyBuilder {
    fn new(name: &str) -> Self {
        FamilyBuilder {
            family: MetricFamily::new(name, "", MetricType::Untyped),
            samples: HashMap::new(),
        }
    }

    fn sample_mut(&mut self, labels: Vec<(String, String)>) -> &mut SampleValue {
        let metric_type = self.family.metric_type;
        let samples = &mut self.family.samples;
        let index = *self.samples.entry(labels.clone()).or_insert_with(|| {
            samples.push(Sample {
                labels,
                value: empty_value(metric_type),
            });
            samples.len() - 1
        });
        &mut samples[index].value
    }

    /// Returns `None` if the line does not fit the family's type
    fn record(
        &mut self,
        series: Series,
        mut labels: Vec<(String, String)>,
        value: f64,
    ) -> Option<()> {
        match (self.family.metric_type, series) {
            (MetricType::Summary, Series::Value) => {
                let quantile = parse_f64(&take_label(&mut labels, "quantile")?)?;
                match self.sample_mut(labels) {
                    SampleValue::Summary(summary) => {
                        summary.quantiles.push(Quantile { quantile, value })
                    }
                    _ => return None,
                }
            }
            (MetricType::Histogram, Series::Bucket) => {
                let upper_bound = parse_f64(&take_label(&mut labels, "le")?)?;
                match self.sample_mut(labels) {
                    SampleValue::Histogram(histogram) => histogram.buckets.push(Bucket {
                        upper_bound,
                        cumulative_count: value as u64,
                    }),
                    _ => return None,
                }
            }
            (MetricType::Summary, Series::Sum) | (MetricType::Histogram, Series::Sum) => {
                match self.sample_mut(labels) {
                    SampleValue::Summary(Summary { sample_sum, .. })
                    | SampleValue::Histogram(Histogram { sample_sum, .. }) => *sample_sum = value,
                    _ => return None,
                }
            }
            (MetricType::Summary, Series::Count) | (MetricType::Histogram, Series::Count) => {
                match self.sample_mut(labels) {
                    SampleValue::Summary(Summary { sample_count, .. })
                    | SampleValue::Histogram(Histogram { sample_count, .. }) => {
                        *sample_count = value as u64
                    }
                    _ => return None,
                }
            }
            (MetricType::Counter, Series::Value)
            | (MetricType::Gauge, Series::Value)
            | (MetricType::Untyped, Series::Value) => {
                *self.sample_mut(labels) = SampleValue::Scalar(value);
            }
            _ => return None,
        }
        Some(())
    }
}

fn empty_value(metric_type: MetricType) -> SampleValue {
    match metric_type {
        MetricType::Summary => SampleValue::Summary(Summary {
            quantiles: Vec::new(),
            sample_count: 0,
            sample_sum: 0.0,
        }),
        MetricType::Histogram => SampleValue::Histogram(Histogram {
            buckets: Vec::new(),
            sample_count: 0,
            sample_sum: 0.0,
        }),
        _ => SampleValue::Scalar(0.0),
    }
}

fn take_label(labels: &mut Vec<(String, String)>, name: &str) -> Option<String> {
    let position = labels.iter().position(|(label, _)| label == name)?;
    Some(labels.remove(position).1)
}

/// A parser for Prometheus's text exposition format.
///
/// Families are returned in the order they first appear; families that end up
/// without any samples are dropped.
pub fn parse(input: &str) -> Vec<MetricFamily> {
    let mut families: Vec<FamilyBuilder> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();
    let mut continue_help: Option<usize> = None;

    fn family_mut<'f>(
        families: &'f mut Vec<FamilyBuilder>,
        by_name: &mut HashMap<String, usize>,
        name: &str,
    ) -> &'f mut FamilyBuilder {
        let index = *by_name.entry(name.to_string()).or_insert_with(|| {
            families.push(FamilyBuilder::new(name));
            families.len() - 1
        });
        &mut families[index]
    }

    for line in input.lines() {
        if let Some(index) = continue_help {
            let text = line.trim_start_matches('#').trim();
            continue_help = if line.ends_with('\\') { Some(index) } else { None };
            let help = &mut families[index].family.help;
            help.push(' ');
            help.push_str(&unescape_help(text.trim_end_matches('\\').trim_end()));
            continue;
        }

        // The line defines a metric's help text
        if let Some(rest) = line.strip_prefix("# HELP ") {
            let mut parts = rest.trim_start().splitn(2, ' ');
            let name = match parts.next() {
                Some(name) if !name.is_empty() => name,
                _ => continue,
            };
            let text = parts.next().unwrap_or("").trim();
            let family = family_mut(&mut families, &mut by_name, name);
            let help = unescape_help(text.trim_end_matches('\\').trim_end());
            family.family.help = help.into_owned();
            if line.ends_with('\\') {
                continue_help = by_name.get(name).copied();
            }
        }
        // The line defines a metric's type
        else if line.starts_with("# TYPE ") {
            let mut line_parts = line.split(' ').filter(|x| !x.trim().is_empty()).skip(2);
            let (name, type_str) = match (line_parts.next(), line_parts.next()) {
                (Some(name), Some(type_str)) => (name, type_str),
                _ => continue,
            };
            let metric_type = match type_str.parse::<MetricType>() {
                Ok(MetricType::GaugeHistogram) | Err(()) => MetricType::Untyped,
                Ok(metric_type) => metric_type,
            };
            let family = family_mut(&mut families, &mut by_name, name);
            if family.family.samples.is_empty() {
                family.family.metric_type = metric_type;
            }
        }
        // The line is a comment or is empty
        else if line.starts_with('#') || line.trim().is_empty() {
        }
        // The line contains data
        else {
            let (name, labels, value) = match parse_value(line) {
                Some(parsed) => parsed,
                None => continue,
            };
            let (family_name, series) = resolve_series(&families, &by_name, name);
            let labels = labels
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.into_owned()))
                .collect();
            let family = family_mut(&mut families, &mut by_name, family_name);
            if family.record(series, labels, value).is_none() {
                tracing::trace!(line, "skipped sample that does not fit its family");
            }
        }
    }

    families
        .into_iter()
        .map(|builder| builder.family)
        .filter(|family| !family.samples.is_empty())
        .collect()
}

/// Maps a sample name onto its family, stripping summary and histogram suffixes
fn resolve_series<'n>(
    families: &[FamilyBuilder],
    by_name: &HashMap<String, usize>,
    name: &'n str,
) -> (&'n str, Series) {
    let type_of = |name: &str| by_name.get(name).map(|&i| families[i].family.metric_type);
    if type_of(name).is_some() {
        return (name, Series::Value);
    }
    for (suffix, series) in &[
        ("_bucket", Series::Bucket),
        ("_sum", Series::Sum),
        ("_count", Series::Count),
    ] {
        if let Some(base) = name.strip_suffix(suffix) {
            match (type_of(base), series) {
                (Some(MetricType::Histogram), _)
                | (Some(MetricType::Summary), Series::Sum)
                | (Some(MetricType::Summary), Series::Count) => return (base, *series),
                _ => (),
            }
        }
    }
    (name, Series::Value)
}

type Labels<'a> = Vec<(&'a str, Cow<'a, str>)>;

fn parse_value(line: &str) -> Option<(&str, Labels<'_>, f64)> {
    // Split `metric_name{labels} value timestamp` into parts
    let (metric_str, value_str, unix_str) = if line.contains('}') {
        let mut reverse_parts = line.rsplitn(2, '}'); // use rsplit, because lables could contain escaped '}'
        let mut line_parts = reverse_parts.next()?.trim().splitn(2, ' ');
        let metric_str = reverse_parts.next()?;
        let value_str = line_parts.next()?;
        let unix_str = line_parts.next();
        (metric_str, value_str, unix_str)
    } else {
        let mut line_parts = line.split(' ').filter(|x| !x.is_empty());
        let metric_str = line_parts.next()?;
        if metric_str.contains('{') {
            return None;
        }
        let value_str = line_parts.next()?;
        let unix_str = line_parts.next();
        (metric_str, value_str, unix_str)
    };

    // Split `metric_name{label1="value1",label2="value2"}` into parts
    let mut metric_parts = metric_str.trim().splitn(2, '{');
    let name = metric_parts.next()?;
    if name.is_empty() {
        return None;
    }
    let mut labels = Vec::new();
    if let Some(labels_str) = metric_parts.next() {
        let mut tail = labels_str;
        loop {
            let mut parts = tail.splitn(2, '=');
            let head = parts.next().unwrap_or("").trim();
            tail = parts.next().unwrap_or("").trim_start();
            if head.is_empty() || tail.is_empty() {
                break;
            }

            let (value, offset) = parse_label_value(tail)?;
            labels.push((head, value));

            tail = tail[offset..].trim_start();
            if !tail.starts_with(',') {
                break;
            }
            tail = &tail[1..];
        }

        // Skip this metric if the labels couldn't be parsed
        if !tail.trim().is_empty() {
            return None;
        }
    }

    let value = parse_f64(value_str.trim())?;

    // Timestamps are validated but not exported
    if let Some(unix_str) = unix_str {
        unix_str.trim().parse::<i64>().ok()?;
    }

    Some((name, labels, value))
}

/// Parses a quoted label value, returning the unescaped value and the number of bytes
/// consumed including both quotes.
fn parse_label_value(value: &str) -> Option<(Cow<str>, usize)> {
    let body = value.strip_prefix('"')?;
    if !body.contains('\\') {
        let end = body.find('"')?;
        return Some((body[..end].into(), end + 2));
    }

    let mut esc = String::new();
    let mut chars = body.char_indices();
    while let Some((i, ch)) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some((_, 'n')) => esc.push('\n'),
                Some((_, ch)) => esc.push(ch),
                None => return None,
            },
            '"' => return Some((esc.into(), i + 2)),
            _ => esc.push(ch),
        }
    }
    None
}

fn unescape_help(text: &str) -> Cow<str> {
    if !text.contains('\\') {
        return text.into();
    }
    let mut esc = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match (ch, chars.peek()) {
            ('\\', Some('n')) => {
                esc.push('\n');
                chars.next();
            }
            ('\\', Some('\\')) => {
                esc.push('\\');
                chars.next();
            }
            _ => esc.push(ch),
        }
    }
    esc.into()
}

fn parse_f64(value: &str) -> Option<f64> {
    match value {
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ => value.parse().ok(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn parses_text_format() {
        let families = parse(
            r#"
# HELP http_requests_total The total number of HTTP requests.
# TYPE http_requests_total counter
http_requests_total{method="post",code="200"} 1027 1395066363000
http_requests_total{method="post",code="400"}    3 1395066363000
http_requests_total{method="post",code="2,00",content="text==true"}  24 1395066363000

# Escaping in label values:
# TYPE msdos_file_access_time_seconds gauge
msdos_file_access_time_seconds{path="C:\\DIR\\FILE.TXT",error="Cannot find file:\n\"FILE.TXT\""} 1.458255915e9

# Minimalistic line:
# TYPE metric_without_timestamp_and_labels gauge
metric_without_timestamp_and_labels 12.47

# A weird metric from before the epoch:
# HELP something_weird The help text can contain \
#      escaped \
#      newlines
something_weird{problem="division by zero"} +Inf -3982045
something_weird{problem="missing closing quote} 1

# A histogram, which has a pretty complex representation in the text format:
# HELP http_request_duration_seconds A histogram of the request duration.
# TYPE http_request_duration_seconds histogram
http_request_duration_seconds_bucket{le="0.05"} 24054
http_request_duration_seconds_bucket{le="0.1"} 33444
http_request_duration_seconds_bucket{le="0.2"} 100392
http_request_duration_seconds_bucket{le="0.5"} 129389
http_request_duration_seconds_bucket{le="1"} 133988
http_request_duration_seconds_bucket{le="+Inf"} 144320
http_request_duration_seconds_sum 53423
http_request_duration_seconds_count 144320

# Finally a summary, which has a complex representation, too:
# HELP rpc_duration_seconds A summary of the RPC duration in seconds.
# TYPE rpc_duration_seconds summary
rpc_duration_seconds{quantile="0.01"} 3102
rpc_duration_seconds{quantile="0.05"} 3272
rpc_duration_seconds{quantile="0.5"} 4773
rpc_duration_seconds{quantile="0.9"} 9001
rpc_duration_seconds{quantile="0.99"} 76656
rpc_duration_seconds_sum 1.7560473e+07
rpc_duration_seconds_count 2693

# TYPE unsual_spacing counter
unsual_spacing{label="}"}     1     1395066363000
unsual_spacing     1     1395066363000

# TYPE escaped_counter counter
escaped_counter{label="}"} 1
        "#,
        );

        // It groups all valid measurements into families, in order of appearance
        let names = families.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "http_requests_total",
                "msdos_file_access_time_seconds",
                "metric_without_timestamp_and_labels",
                "something_weird",
                "http_request_duration_seconds",
                "rpc_duration_seconds",
                "unsual_spacing",
                "escaped_counter",
            ]
        );

        // It can parse label and number values
        let requests = &families[0];
        assert_eq!(requests.metric_type, MetricType::Counter);
        assert_eq!(requests.help, "The total number of HTTP requests.");
        assert_eq!(requests.samples.len(), 3);
        assert_eq!(requests.samples[0].labels, labels(&[("method", "post"), ("code", "200")]));
        assert_eq!(requests.samples[0].value, SampleValue::Scalar(1027.0));
        assert_eq!(requests.samples[1].value, SampleValue::Scalar(3.0));

        // It can handle commas and equal signs in label values
        assert_eq!(
            requests.samples[2].labels,
            labels(&[("method", "post"), ("code", "2,00"), ("content", "text==true")])
        );

        // It parses escaped characters in label values
        assert_eq!(
            families[1].samples[0].labels,
            labels(&[
                ("path", "C:\\DIR\\FILE.TXT"),
                ("error", "Cannot find file:\n\"FILE.TXT\""),
            ])
        );

        // It parses measurements without labels
        assert!(families[2].samples[0].labels.is_empty());
        assert_eq!(families[2].samples[0].value, SampleValue::Scalar(12.47));

        // It joins continued help lines and skips unterminated label values
        let weird = &families[3];
        assert_eq!(weird.metric_type, MetricType::Untyped);
        assert_eq!(weird.help, "The help text can contain escaped newlines");
        assert_eq!(weird.samples.len(), 1);
        assert_eq!(weird.samples[0].value, SampleValue::Scalar(f64::INFINITY));

        // It folds histogram series into one sample
        let histogram = &families[4];
        assert_eq!(histogram.samples.len(), 1);
        match &histogram.samples[0].value {
            SampleValue::Histogram(histogram) => {
                assert_eq!(histogram.buckets.len(), 6);
                assert_eq!(
                    histogram.buckets[0],
                    Bucket { upper_bound: 0.05, cumulative_count: 24054 }
                );
                assert_eq!(histogram.buckets[5].upper_bound, f64::INFINITY);
                assert_eq!(histogram.sample_count, 144320);
                assert_eq!(histogram.sample_sum, 53423.0);
            }
            value => panic!("expected a histogram, got {:?}", value),
        }
        assert!(histogram.samples[0].labels.is_empty());

        // It folds summary series into one sample, keeping quantile order
        match &families[5].samples[0].value {
            SampleValue::Summary(summary) => {
                let quantiles = summary.quantiles.iter().map(|q| q.quantile).collect::<Vec<_>>();
                assert_eq!(quantiles, vec![0.01, 0.05, 0.5, 0.9, 0.99]);
                assert_eq!(summary.quantiles[2].value, 4773.0);
                assert_eq!(summary.sample_count, 2693);
                assert_eq!(summary.sample_sum, 1.7560473e7);
            }
            value => panic!("expected a summary, got {:?}", value),
        }

        // It handles unusual spacing between value and timestamp
        assert_eq!(families[6].samples.len(), 2);
        assert_eq!(families[6].samples[1].value, SampleValue::Scalar(1.0));

        // It handles '}' in label value
        assert_eq!(families[7].samples[0].labels, labels(&[("label", "}")]));
    }

    #[test]
    fn groups_histograms_by_label_set() {
        let families = parse(
            r#"
# TYPE latency histogram
latency_bucket{path="/a",le="1"} 2
latency_bucket{path="/b",le="1"} 5
latency_bucket{path="/a",le="+Inf"} 3
latency_bucket{path="/b",le="+Inf"} 6
latency_count{path="/a"} 3
latency_count{path="/b"} 6
latency_sum{path="/a"} 0.25
latency_sum{path="/b"} 1.5
"#,
        );
        assert_eq!(families.len(), 1);
        let samples = &families[0].samples;
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].labels, labels(&[("path", "/a")]));
        assert_eq!(
            samples[1].value,
            SampleValue::Histogram(Histogram {
                buckets: vec![
                    Bucket { upper_bound: 1.0, cumulative_count: 5 },
                    Bucket { upper_bound: f64::INFINITY, cumulative_count: 6 },
                ],
                sample_count: 6,
                sample_sum: 1.5,
            })
        );
    }

    #[test]
    fn untyped_suffixes_are_separate_families() {
        let families = parse(
            r#"
jobs_count 4
jobs_sum 10
# TYPE temperature gauge
temperature{room="lab"} 21.5
temperature_count 1
"#,
        );
        let names = families.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["jobs_count", "jobs_sum", "temperature", "temperature_count"]);
        assert!(families.iter().all(|f| f.samples.len() == 1));
        assert_eq!(families[0].metric_type, MetricType::Untyped);
    }

    #[test]
    fn skips_malformed_lines() {
        let families = parse(
            r#"
# TYPE up gauge
up 1
up{job="a" 1
up{job="b"} one
up{job="c"} 1 yesterday
# TYPE rpc summary
rpc{job="a"} 4
rpc_sum{job="a"} 4
"#,
        );
        assert_eq!(families.len(), 2);
        assert_eq!(families[0].samples.len(), 1);

        // A summary line without a quantile label does not create a quantile
        match &families[1].samples[0].value {
            SampleValue::Summary(summary) => {
                assert!(summary.quantiles.is_empty());
                assert_eq!(summary.sample_sum, 4.0);
            }
            value => panic!("expected a summary, got {:?}", value),
        }
    }

    #[test]
    fn unescapes_help_text() {
        let families = parse("# HELP path Files in C:\\\\DIR\\nand below.\npath 1\n");
        assert_eq!(families[0].help, "Files in C:\\DIR\nand below.");
    }
}
