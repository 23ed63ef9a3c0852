//! Small equality helpers treating absent and empty collections alike.

use std::collections::BTreeMap;

pub(crate) fn maps_equal(
    a: Option<&BTreeMap<String, String>>,
    b: Option<&BTreeMap<String, String>>,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), None) => a.is_empty(),
        (None, Some(b)) => b.is_empty(),
        (Some(a), Some(b)) => a == b,
    }
}

pub(crate) fn lists_equal(a: Option<&Vec<String>>, b: Option<&Vec<String>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), None) => a.is_empty(),
        (None, Some(b)) => b.is_empty(),
        (Some(a), Some(b)) => a == b,
    }
}
