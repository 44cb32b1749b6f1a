//! Recording schedule: which hours of the day a channel records.
//!
//! The schedule string is a comma-separated list of inclusive hour ranges;
//! a range whose start exceeds its end wraps midnight (`22-6` covers the
//! evening through dawn). A bare number is a single hour.

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use chrono::{Local, Timelike};

/// Parse a schedule string like `"8-17,22-6"` into the set of recording
/// hours.
pub fn parse_schedule(s: &str) -> Result<BTreeSet<u8>> {
    let mut hours = BTreeSet::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((a, b)) = part.split_once('-') {
            let a: u8 = a
                .trim()
                .parse()
                .with_context(|| format!("bad hour in schedule range '{part}'"))?;
            let b: u8 = b
                .trim()
                .parse()
                .with_context(|| format!("bad hour in schedule range '{part}'"))?;
            if a > 23 || b > 23 {
                bail!("schedule hour out of range in '{part}'");
            }
            if a <= b {
                hours.extend(a..=b);
            } else {
                // wraps midnight
                hours.extend(a..=23);
                hours.extend(0..=b);
            }
        } else {
            let h: u8 = part
                .parse()
                .with_context(|| format!("bad hour in schedule '{part}'"))?;
            if h > 23 {
                bail!("schedule hour out of range: {h}");
            }
            hours.insert(h);
        }
    }
    Ok(hours)
}

/// True when the current local hour is inside the schedule.
pub fn is_scheduled_now(hours: &BTreeSet<u8>) -> bool {
    hours.contains(&(Local::now().hour() as u8))
}
