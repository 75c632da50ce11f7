//! Counter metrics over the state store.
//!
//! Counters are persisted through the store gateway under rendered keys of
//! the form `name{label="value",...}` and exposed as Prometheus text.

use super::store::JobStore;

/// Render a metric key from a name and label pairs. Labels are sorted so
/// the same labels always produce the same key.
pub fn metric_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut labels = labels.to_vec();
    labels.sort();
    let rendered: Vec<String> = labels
        .iter()
        .map(|(key, value)| format!("{key}=\"{value}\""))
        .collect();
    format!("{name}{{{}}}", rendered.join(","))
}

/// Bump a counter, logging instead of failing: metrics are best-effort.
pub async fn increment(store: &dyn JobStore, name: &str, labels: &[(&str, &str)]) {
    let key = metric_key(name, labels);
    if let Err(error) = store.increment_metric(&key).await {
        tracing::warn!(metric = %key, %error, "failed to increment metric");
    }
}

/// Render all counters in Prometheus text exposition format.
pub async fn render(store: &dyn JobStore) -> Result<String, super::store::StoreError> {
    let counters = store.list_metrics().await?;
    let mut out = String::new();
    for (key, value) in counters {
        out.push_str(&key);
        out.push(' ');
        out.push_str(&value.to_string());
        out.push('\n');
    }
    Ok(out)
}
