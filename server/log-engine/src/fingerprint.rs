//! Stable identifiers for anomalies and hypotheses.

use crate::types::{AnomalyKind, DimensionKey, Window};

/// Anomaly id from kind + dimension key + window start.
///
/// Uses blake3 so the same finding gets the same id in every run.
pub fn anomaly_id(kind: AnomalyKind, key: &DimensionKey, window: &Window) -> String {
  let mut hasher = blake3::Hasher::new();
  hasher.update(kind.as_str().as_bytes());
  hasher.update(b"|");
  hasher.update(key.service.as_bytes());
  hasher.update(b"|");
  hasher.update(key.severity.as_bytes());
  hasher.update(b"|");
  hasher.update(key.signature.as_bytes());
  hasher.update(b"|");
  hasher.update(window.start.timestamp().to_string().as_bytes());
  let hex = hasher.finalize().to_hex();
  format!("anom-{}", &hex[..16])
}

/// Hypothesis id from the (sorted) ids of the anomalies it explains.
pub fn hypothesis_id(anomaly_refs: &[String]) -> String {
  let mut refs: Vec<&str> = anomaly_refs.iter().map(String::as_str).collect();
  refs.sort_unstable();
  let mut hasher = blake3::Hasher::new();
  for (i, r) in refs.iter().enumerate() {
    if i > 0 {
      hasher.update(b"|");
    }
    hasher.update(r.as_bytes());
  }
  let hex = hasher.finalize().to_hex();
  format!("hyp-{}", &hex[..16])
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{TimeZone, Utc};

  fn window(hour: u32) -> Window {
    Window {
      start: Utc.with_ymd_and_hms(2025, 1, 15, hour, 0, 0).unwrap(),
      end: Utc.with_ymd_and_hms(2025, 1, 15, hour + 1, 0, 0).unwrap(),
    }
  }

  #[test]
  fn same_input_same_id() {
    let key = DimensionKey::new("api", "ERROR", "*");
    assert_eq!(
      anomaly_id(AnomalyKind::Spike, &key, &window(10)),
      anomaly_id(AnomalyKind::Spike, &key, &window(10))
    );
  }

  #[test]
  fn kind_key_and_window_all_matter() {
    let key = DimensionKey::new("api", "ERROR", "*");
    let base = anomaly_id(AnomalyKind::Spike, &key, &window(10));
    assert_ne!(base, anomaly_id(AnomalyKind::MissingBaseline, &key, &window(10)));
    assert_ne!(base, anomaly_id(AnomalyKind::Spike, &DimensionKey::new("web", "ERROR", "*"), &window(10)));
    assert_ne!(base, anomaly_id(AnomalyKind::Spike, &key, &window(11)));
  }

  #[test]
  fn anomaly_id_shape() {
    let id = anomaly_id(AnomalyKind::Spike, &DimensionKey::total(), &window(10));
    assert!(id.starts_with("anom-"));
    assert_eq!(id.len(), "anom-".len() + 16);
    assert!(id["anom-".len()..].chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn hypothesis_id_ignores_ref_order() {
    let a = vec!["anom-1".to_string(), "anom-2".to_string()];
    let b = vec!["anom-2".to_string(), "anom-1".to_string()];
    assert_eq!(hypothesis_id(&a), hypothesis_id(&b));
    assert_ne!(hypothesis_id(&a), hypothesis_id(&a[..1]));
    assert!(hypothesis_id(&a).starts_with("hyp-"));
  }
}
