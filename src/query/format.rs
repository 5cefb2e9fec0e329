//! Response serialization.
//!
//! Line writers append one serialized unit to a byte buffer; the streaming
//! pipeline concatenates units between a `ResponseFraming` prefix and suffix.
//! Envelope writers produce a whole JSON response at once.

use serde_json::{json, Map, Value};
use std::io::Write;

use crate::query::pool::ExportRows;
use crate::storage::data::{MetricName, SeriesResult, NAME_LABEL};
use crate::storage::netstorage::{LabelEntry, TopHeapEntry, TsdbStatus};

/// Bytes written around the streamed fragments of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFraming {
    pub prefix: &'static str,
    pub separator: &'static str,
    pub suffix: &'static str,
}

impl ResponseFraming {
    /// Fragments written back to back, as for line-delimited formats
    pub const STD: ResponseFraming = ResponseFraming {
        prefix: "",
        separator: "",
        suffix: "",
    };

    /// Matrix envelope of the Prometheus query API
    pub const PROM_API: ResponseFraming = ResponseFraming {
        prefix: r#"{"status":"success","data":{"resultType":"matrix","result":["#,
        separator: ",",
        suffix: "]}}",
    };

    /// Envelope of the series API
    pub const SERIES: ResponseFraming = ResponseFraming {
        prefix: r#"{"status":"success","data":["#,
        separator: ",",
        suffix: "]}",
    };
}

/// Formats a sample value the way the Prometheus text format does
pub fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        v.to_string()
    }
}

fn json_number(v: f64) -> Value {
    serde_json::Number::from_f64(v).map_or_else(|| Value::String(format_value(v)), Value::Number)
}

/// Milliseconds as fractional seconds
fn json_seconds(ts: i64) -> Value {
    json_number(ts as f64 / 1e3)
}

fn payload_text(p: &[u8]) -> String {
    String::from_utf8_lossy(p).into_owned()
}

/// Label set as a JSON object, the metric name under `__name__`
pub fn metric_labels(mn: &MetricName) -> Value {
    let mut labels = Map::new();
    if !mn.metric_group.is_empty() {
        labels.insert(NAME_LABEL.to_string(), Value::String(mn.metric_group.clone()));
    }
    for tag in &mn.tags {
        labels.insert(tag.key.clone(), Value::String(tag.value.clone()));
    }
    Value::Object(labels)
}

fn prometheus_series(dst: &mut Vec<u8>, mn: &MetricName) {
    dst.extend_from_slice(mn.metric_group.as_bytes());
    if mn.tags.is_empty() {
        return;
    }
    dst.push(b'{');
    for (i, tag) in mn.tags.iter().enumerate() {
        if i > 0 {
            dst.push(b',');
        }
        dst.extend_from_slice(tag.key.as_bytes());
        dst.push(b'=');
        write_label_value(dst, &tag.value);
    }
    dst.push(b'}');
}

/// Quoted label value of the text exposition format, where only backslash,
/// double quote and line feed are escaped
fn write_label_value(dst: &mut Vec<u8>, value: &str) {
    dst.push(b'"');
    for b in value.bytes() {
        match b {
            b'\\' => dst.extend_from_slice(b"\\\\"),
            b'"' => dst.extend_from_slice(b"\\\""),
            b'\n' => dst.extend_from_slice(b"\\n"),
            _ => dst.push(b),
        }
    }
    dst.push(b'"');
}

/// Sample text of row `i`: the raw payload when present, else the value
fn row_text(values: &[f64], payloads: &[Vec<u8>], i: usize) -> String {
    match payloads.get(i) {
        Some(p) => payload_text(p),
        None => format_value(values.get(i).copied().unwrap_or(f64::NAN)),
    }
}

/// `{"metric":{...},"values":[...],"timestamps":[...]}` followed by a newline
pub fn write_export_json_line(dst: &mut Vec<u8>, xb: &ExportRows<'_>) -> serde_json::Result<()> {
    if xb.is_empty() {
        return Ok(());
    }
    let mut line = Map::new();
    line.insert("metric".to_string(), metric_labels(xb.metric_name));
    line.insert(
        "values".to_string(),
        Value::Array(xb.values.iter().map(|&v| json_number(v)).collect()),
    );
    line.insert("timestamps".to_string(), json!(xb.timestamps));
    if !xb.payloads.is_empty() {
        line.insert(
            "payloads".to_string(),
            Value::Array(xb.payloads.iter().map(|p| Value::String(payload_text(p))).collect()),
        );
    }
    serde_json::to_writer(&mut *dst, &Value::Object(line))?;
    dst.push(b'\n');
    Ok(())
}

/// One `name{labels} value timestamp` line per row
pub fn write_export_prometheus_line(dst: &mut Vec<u8>, xb: &ExportRows<'_>) {
    for (i, ts) in xb.timestamps.iter().enumerate() {
        prometheus_series(dst, xb.metric_name);
        let v = xb.values.get(i).copied().unwrap_or(f64::NAN);
        let _ = writeln!(dst, " {} {}", format_value(v), ts);
    }
}

/// `{"metric":{...},"values":[[seconds,"value"],...]}`
pub fn write_export_promapi_line(dst: &mut Vec<u8>, xb: &ExportRows<'_>) -> serde_json::Result<()> {
    let values: Vec<Value> = (0..xb.len())
        .map(|i| json!([json_seconds(xb.timestamps[i]), row_text(xb.values, xb.payloads, i)]))
        .collect();
    serde_json::to_writer(
        &mut *dst,
        &json!({"metric": metric_labels(xb.metric_name), "values": values}),
    )
}

/// Last sample of the series in the Prometheus text format
pub fn write_federate(dst: &mut Vec<u8>, rs: &SeriesResult) {
    let (Some(&ts), Some(&v)) = (rs.timestamps.last(), rs.values.last()) else {
        return;
    };
    prometheus_series(dst, &rs.metric_name);
    let _ = writeln!(dst, " {} {}", format_value(v), ts);
}

/// Label set object used by the series API
pub fn write_metric_name_object(dst: &mut Vec<u8>, mn: &MetricName) -> serde_json::Result<()> {
    serde_json::to_writer(&mut *dst, &metric_labels(mn))
}

/// Native export header: start and end as big-endian i64
pub fn write_native_header(dst: &mut Vec<u8>, start: i64, end: i64) {
    dst.extend_from_slice(&start.to_be_bytes());
    dst.extend_from_slice(&end.to_be_bytes());
}

/// Appends `{u32 len, bytes}` to `dst`
pub fn write_length_prefixed(dst: &mut Vec<u8>, b: &[u8]) {
    dst.extend_from_slice(&(b.len() as u32).to_be_bytes());
    dst.extend_from_slice(b);
}

fn success(data: Value) -> Value {
    json!({"status": "success", "data": data})
}

fn success_partial(is_partial: bool, data: Value) -> Value {
    json!({"status": "success", "isPartial": is_partial, "data": data})
}

pub fn labels_response(labels: &[String]) -> Value {
    success(json!(labels))
}

pub fn label_values_response(values: &[String]) -> Value {
    success(json!(values))
}

/// Number of values per label name
pub fn labels_count_response(entries: &[LabelEntry]) -> Value {
    let counts: Map<String, Value> = entries
        .iter()
        .map(|e| (e.key.clone(), json!(e.values.len())))
        .collect();
    success(Value::Object(counts))
}

pub fn series_count_response(n: u64) -> Value {
    success(json!([n]))
}

pub fn tsdb_status_response(status: &TsdbStatus) -> Value {
    let entries = |es: &[TopHeapEntry]| -> Value {
        es.iter()
            .map(|e| json!({"name": e.name, "value": e.count}))
            .collect()
    };
    success(json!({
        "seriesCountByMetricName": entries(&status.series_count_by_metric_name),
        "labelValueCountByLabelName": entries(&status.label_value_count_by_label_name),
        "seriesCountByLabelValuePair": entries(&status.series_count_by_label_value_pair),
    }))
}

/// Sample pairs of one series: `[seconds, "value"]`
fn matrix_values(rs: &SeriesResult) -> Value {
    let payloads = rs.payloads.as_deref().unwrap_or(&[]);
    (0..rs.timestamps.len())
        .map(|i| json!([json_seconds(rs.timestamps[i]), row_text(&rs.values, payloads, i)]))
        .collect()
}

/// Stream entries of one series: `["<nanoseconds>", "line"]`
fn stream_values(rs: &SeriesResult) -> Value {
    let payloads = rs.payloads.as_deref().unwrap_or(&[]);
    (0..rs.timestamps.len())
        .map(|i| {
            let ns = i128::from(rs.timestamps[i]) * 1_000_000;
            json!([ns.to_string(), row_text(&rs.values, payloads, i)])
        })
        .collect()
}

fn streams(results: &[SeriesResult]) -> Value {
    results
        .iter()
        .map(|rs| json!({"stream": metric_labels(&rs.metric_name), "values": stream_values(rs)}))
        .collect()
}

/// Instant query over numeric series: the last sample of each series
pub fn vector_query_response(results: &[SeriesResult], is_partial: bool) -> Value {
    let result: Vec<Value> = results
        .iter()
        .filter_map(|rs| {
            let ts = *rs.timestamps.last()?;
            let v = *rs.values.last()?;
            Some(json!({
                "metric": metric_labels(&rs.metric_name),
                "value": [json_seconds(ts), format_value(v)],
            }))
        })
        .collect();
    success_partial(is_partial, json!({"resultType": "vector", "result": result}))
}

pub fn streams_query_response(results: &[SeriesResult], is_partial: bool) -> Value {
    success_partial(is_partial, json!({"resultType": "streams", "result": streams(results)}))
}

pub fn matrix_query_range_response(results: &[SeriesResult], is_partial: bool) -> Value {
    let result: Vec<Value> = results
        .iter()
        .map(|rs| json!({"metric": metric_labels(&rs.metric_name), "values": matrix_values(rs)}))
        .collect();
    success_partial(is_partial, json!({"resultType": "matrix", "result": result}))
}

pub fn streams_query_range_response(results: &[SeriesResult], is_partial: bool) -> Value {
    streams_query_response(results, is_partial)
}

/// Frame pushed to a tailing client
pub fn tail_response(results: &[SeriesResult]) -> Value {
    json!({"streams": streams(results)})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::pool::ExportBlock;

    fn block() -> ExportBlock {
        ExportBlock {
            metric_name: MetricName::new("up").with_tag("job", "a"),
            timestamps: vec![1000, 2500],
            values: vec![1.0, f64::NAN],
            payloads: Vec::new(),
        }
    }

    #[test]
    fn test_json_line() {
        let mut dst = Vec::new();
        write_export_json_line(&mut dst, &block().rows()).unwrap();
        let line = String::from_utf8(dst).unwrap();
        assert!(line.ends_with('\n'));
        let v: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(v["metric"]["__name__"], "up");
        assert_eq!(v["metric"]["job"], "a");
        assert_eq!(v["timestamps"], json!([1000, 2500]));
        assert_eq!(v["values"][1], "NaN");
        assert!(v.get("payloads").is_none());
    }

    #[test]
    fn test_prometheus_line() {
        let mut dst = Vec::new();
        write_export_prometheus_line(&mut dst, &block().rows());
        assert_eq!(
            String::from_utf8(dst).unwrap(),
            "up{job=\"a\"} 1 1000\nup{job=\"a\"} NaN 2500\n"
        );

        let mut dst = Vec::new();
        let rs = SeriesResult::new(MetricName::new("bare"), vec![1, 2], vec![0.5, f64::INFINITY]);
        write_federate(&mut dst, &rs);
        assert_eq!(String::from_utf8(dst).unwrap(), "bare +Inf 2\n");
    }

    #[test]
    fn test_label_value_escaping() {
        let mn = MetricName::new("log")
            .with_tag("msg", "a\tb \"q\" c:\\d\nend\u{1}é");
        let rs = SeriesResult::new(mn, vec![7], vec![1.0]);
        let mut dst = Vec::new();
        write_federate(&mut dst, &rs);
        assert_eq!(
            String::from_utf8(dst).unwrap(),
            "log{msg=\"a\tb \\\"q\\\" c:\\\\d\\nend\u{1}é\"} 1 7\n"
        );
    }

    #[test]
    fn test_promapi_framing() {
        let mut dst = ResponseFraming::PROM_API.prefix.as_bytes().to_vec();
        write_export_promapi_line(&mut dst, &block().rows()).unwrap();
        dst.extend_from_slice(ResponseFraming::PROM_API.separator.as_bytes());
        let mut logs = block();
        logs.payloads = vec![b"GET /".to_vec(), b"POST /".to_vec()];
        write_export_promapi_line(&mut dst, &logs.rows()).unwrap();
        dst.extend_from_slice(ResponseFraming::PROM_API.suffix.as_bytes());

        let v: Value = serde_json::from_slice(&dst).unwrap();
        assert_eq!(v["status"], "success");
        let result = v["data"]["result"].as_array().unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0]["values"][0][0], 1.0);
        assert_eq!(result[0]["values"][0][1], "1");
        assert_eq!(result[1]["values"][1][1], "POST /");
    }

    #[test]
    fn test_envelopes() {
        let rs = SeriesResult::new(MetricName::new("up"), vec![1000, 2000], vec![1.0, 2.0]);
        let v = vector_query_response(std::slice::from_ref(&rs), true);
        assert_eq!(v["isPartial"], true);
        assert_eq!(v["data"]["resultType"], "vector");
        assert_eq!(v["data"]["result"][0]["value"], json!([2.0, "2"]));

        let v = matrix_query_range_response(std::slice::from_ref(&rs), false);
        assert_eq!(v["data"]["result"][0]["values"].as_array().unwrap().len(), 2);

        let logs = rs.with_payloads(vec![b"a".to_vec(), b"b".to_vec()]);
        let v = tail_response(std::slice::from_ref(&logs));
        assert_eq!(v["streams"][0]["values"][1], json!(["2000000000", "b"]));

        let v = labels_count_response(&[LabelEntry {
            key: "job".to_string(),
            values: vec!["a".to_string(), "b".to_string()],
        }]);
        assert_eq!(v["data"]["job"], 2);
        assert_eq!(series_count_response(7)["data"], json!([7]));
    }

    #[test]
    fn test_native_framing() {
        let mut dst = Vec::new();
        write_native_header(&mut dst, 1, 2);
        write_length_prefixed(&mut dst, b"abc");
        assert_eq!(dst.len(), 16 + 4 + 3);
        assert_eq!(&dst[16..20], &[0, 0, 0, 3]);
    }
}
