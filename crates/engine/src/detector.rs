//! Change detection between successive observations.

use ceremony_core::{Observation, StatusKind};

/// Decide whether `current` warrants an alert given the last stored
/// observation for the same token.
///
/// - No previous observation: alert, unless the first result is `Unknown`
///   (startup transients stay quiet). `ServiceDown` as a baseline alerts.
/// - Two `Unknown`s in a row never alert.
/// - Otherwise alert when the status kind or the position differs.
pub fn has_changed(previous: Option<&Observation>, current: &Observation) -> bool {
    let Some(previous) = previous else {
        return current.status() != StatusKind::Unknown;
    };

    if previous.is_unknown() && current.is_unknown() {
        return false;
    }

    previous.status() != current.status() || previous.position() != current.position()
}

/// Position movement between two observations, when both carry one.
///
/// Positive means the token moved forward in the queue. `None` when the
/// movement does not fit an `i64`.
pub fn position_delta(previous: Option<&Observation>, current: &Observation) -> Option<i64> {
    let old = i128::from(previous?.position()?);
    let new = i128::from(current.position()?);
    i64::try_from(old - new).ok()
}
