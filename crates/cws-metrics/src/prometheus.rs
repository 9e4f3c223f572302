//! Prometheus text exposition format.
//!
//! Renders monitor samples into the Prometheus text exposition format.
//! Timings become `cws_operation_duration_ms{operation=...}` gauges, every
//! other metric becomes a `cws_<name>` gauge with its latest value and a
//! `cws_<name>_observations` gauge with the retained history length.

use crate::monitor::MetricSample;

const TIMING_PREFIX: &str = "timing_";

/// Render a list of metric samples into Prometheus text format.
pub fn render_prometheus(samples: &[MetricSample]) -> String {
    let mut out = String::new();

    out.push_str("# HELP cws_operation_duration_ms Last observed operation duration in milliseconds.\n");
    out.push_str("# TYPE cws_operation_duration_ms gauge\n");
    for s in samples {
        if let Some(op) = s.name.strip_prefix(TIMING_PREFIX) {
            out.push_str(&format!(
                "cws_operation_duration_ms{{operation=\"{op}\"}} {:.3}\n",
                s.value
            ));
        }
    }

    for s in samples {
        if s.name.starts_with(TIMING_PREFIX) {
            continue;
        }
        let name = sanitize(&s.name);
        out.push_str(&format!("# HELP cws_{name} Latest value ({}).\n", s.unit));
        out.push_str(&format!("# TYPE cws_{name} gauge\n"));
        out.push_str(&format!("cws_{name}{{unit=\"{}\"}} {}\n", s.unit, s.value));
        out.push_str(&format!(
            "cws_{name}_observations{{unit=\"{}\"}} {}\n",
            s.unit,
            s.history.len()
        ));
    }

    out
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
