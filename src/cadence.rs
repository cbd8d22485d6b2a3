//! Per-sensor reporting-cadence classification and election of the single
//! global sampling interval for the run.

use std::collections::BTreeSet;

use tracing::info;

use crate::config::IntervalTiePolicy;
use crate::models::{CadenceLabel, CadenceSummary, Interval, Reading};
use crate::temporal::round_to_slot;

const THIRTY_THRESHOLD: f64 = 0.7;
const HOURLY_THRESHOLD: f64 = 0.3;

/// Labels every sensor by the fraction of half-hour slots in its observed
/// range holding a valid reading: `f > 0.7` thirty, `f < 0.3` hourly,
/// in between mixed. Sensors with no valid readings (or no half-hour slots
/// in range) are `Other`.
pub fn classify(readings: &[Reading], n_sensors: usize) -> (Vec<CadenceLabel>, CadenceSummary) {
    let mut valid_slots: Vec<BTreeSet<i64>> = vec![BTreeSet::new(); n_sensors];
    for reading in readings {
        if reading.pm25.is_some() {
            valid_slots[reading.sensor as usize].insert(round_to_slot(reading.datetime, 30));
        }
    }

    let mut labels = Vec::with_capacity(n_sensors);
    let mut summary = CadenceSummary {
        total: n_sensors,
        ..CadenceSummary::default()
    };
    for slots in &valid_slots {
        let label = classify_one(slots);
        match label {
            CadenceLabel::Thirty => summary.thirty += 1,
            CadenceLabel::Hourly => summary.hourly += 1,
            CadenceLabel::Mixed => summary.mixed += 1,
            CadenceLabel::Other => summary.other += 1,
        }
        labels.push(label);
    }

    info!(
        "Cadence summary: thirty={} hourly={} mixed={} other={} total={}",
        summary.thirty, summary.hourly, summary.mixed, summary.other, summary.total
    );
    (labels, summary)
}

fn classify_one(slots: &BTreeSet<i64>) -> CadenceLabel {
    let (first, last) = match (slots.iter().next(), slots.iter().next_back()) {
        (Some(&f), Some(&l)) => (f, l),
        _ => return CadenceLabel::Other,
    };

    // Half-hour grid slots at minute 30 within [first, last].
    let total_half_slots = count_minute30_slots(first, last);
    if total_half_slots == 0 {
        return CadenceLabel::Other;
    }
    let filled_half_slots = slots.iter().filter(|&&s| s.rem_euclid(60) == 30).count();

    let f = filled_half_slots as f64 / total_half_slots as f64;
    if f > THIRTY_THRESHOLD {
        CadenceLabel::Thirty
    } else if f < HOURLY_THRESHOLD {
        CadenceLabel::Hourly
    } else {
        CadenceLabel::Mixed
    }
}

fn count_minute30_slots(first: i64, last: i64) -> usize {
    // 30-minute slots between first and last inclusive whose minute is 30.
    let mut count = 0usize;
    let mut slot = first;
    if slot.rem_euclid(60) == 0 {
        slot += 30;
    }
    while slot <= last {
        count += 1;
        slot += 60;
    }
    count
}

/// Elects the run-wide interval by majority between thirty and hourly
/// sensors; ties go to the configured policy.
pub fn elect_interval(summary: &CadenceSummary, policy: IntervalTiePolicy) -> Interval {
    let interval = if summary.thirty > summary.hourly {
        Interval::ThirtyMin
    } else if summary.thirty < summary.hourly {
        Interval::SixtyMin
    } else {
        match policy {
            IntervalTiePolicy::PreferHourly => Interval::SixtyMin,
            IntervalTiePolicy::Prefer30min => Interval::ThirtyMin,
        }
    };
    info!(
        "Elected global interval: {} minutes ({} thirty vs {} hourly)",
        interval.minutes(),
        summary.thirty,
        summary.hourly
    );
    interval
}
