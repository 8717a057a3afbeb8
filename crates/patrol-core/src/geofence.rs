//! Patrol-zone membership.

use crate::types::{Point, Zone};

/// All zones whose circle contains `point`, boundary inclusive.
///
/// Overlapping zones are all reported, in the order given.
pub fn zones_containing<'a>(point: &Point, zones: &'a [Zone]) -> Vec<&'a Zone> {
    zones.iter().filter(|zone| zone.contains(point)).collect()
}
