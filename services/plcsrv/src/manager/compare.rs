//! Type-tolerant value comparison for change detection

use crate::model::TagValue;

/// Relative tolerance for numeric comparison
pub const EPSILON: f64 = 1e-6;

/// Whether `new` should count as unchanged from `old`
///
/// Numbers compare within [`EPSILON`] (relative, absolute below 1.0); a bool
/// against a number compares truthiness; strings compare exactly and never
/// equal a non-string.
pub fn values_equal(old: &TagValue, new: &TagValue) -> bool {
    match (old, new) {
        (TagValue::String(a), TagValue::String(b)) => a == b,
        (TagValue::String(_), _) | (_, TagValue::String(_)) => false,
        (TagValue::Bool(_), _) | (_, TagValue::Bool(_)) => truthy(old) == truthy(new),
        _ => match (old.as_f64(), new.as_f64()) {
            (Some(a), Some(b)) => numbers_equal(a, b),
            _ => false,
        },
    }
}

fn truthy(v: &TagValue) -> bool {
    v.as_f64().is_some_and(|n| n != 0.0)
}

fn numbers_equal(a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return a.is_nan() && b.is_nan();
    }
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= EPSILON * scale
}
