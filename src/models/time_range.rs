use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_FROM: &str = "now-1h";
const DEFAULT_TO: &str = "now";

/// A Grafana time range, kept as the raw expressions the caller sent
/// (`now-6h`, `now`, epoch millis) so they can be forwarded to the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: String,
    pub to: String,
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::new("", "")
    }
}

impl TimeRange {
    pub fn new(from: &str, to: &str) -> Self {
        let from = if from.trim().is_empty() { DEFAULT_FROM } else { from.trim() };
        let to = if to.trim().is_empty() { DEFAULT_TO } else { to.trim() };
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Resolve both ends against `now`.
    pub fn bounds_at(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let from = parse_time(&self.from, now).unwrap_or_else(|| {
            tracing::warn!("unparseable range start {:?}, using {DEFAULT_FROM}", self.from);
            now - Duration::hours(1)
        });
        let to = parse_time(&self.to, now).unwrap_or_else(|| {
            tracing::warn!("unparseable range end {:?}, using {DEFAULT_TO}", self.to);
            now
        });
        (from, to)
    }

    pub fn from_unix(&self) -> i64 {
        self.bounds_at(Utc::now()).0.timestamp()
    }

    pub fn to_unix(&self) -> i64 {
        self.bounds_at(Utc::now()).1.timestamp()
    }

    pub fn from_formatted(&self) -> String {
        format_time(self.bounds_at(Utc::now()).0)
    }

    pub fn to_formatted(&self) -> String {
        format_time(self.bounds_at(Utc::now()).1)
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} to {}", self.from, self.to)
    }
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parse `now`, `now-<n><unit>`, `now+<n><unit>` or epoch milliseconds.
fn parse_time(expr: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Ok(ms) = expr.parse::<i64>() {
        return DateTime::from_timestamp_millis(ms);
    }

    let rest = expr.strip_prefix("now")?;
    if rest.is_empty() {
        return Some(now);
    }

    let (negative, offset) = match rest.as_bytes()[0] {
        b'-' => (true, &rest[1..]),
        b'+' => (false, &rest[1..]),
        _ => return None,
    };
    let unit_at = offset.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = offset.split_at(unit_at);
    let amount: i64 = amount.parse().ok()?;

    let shift_months = |months: u32| {
        if negative {
            now.checked_sub_months(Months::new(months))
        } else {
            now.checked_add_months(Months::new(months))
        }
    };

    let delta = match unit {
        "s" => Duration::try_seconds(amount)?,
        "m" => Duration::try_minutes(amount)?,
        "h" => Duration::try_hours(amount)?,
        "d" => Duration::try_days(amount)?,
        "w" => Duration::try_weeks(amount)?,
        "M" => return shift_months(u32::try_from(amount).ok()?),
        "y" => return shift_months(u32::try_from(amount).ok()?.checked_mul(12)?),
        _ => return None,
    };

    if negative {
        now.checked_sub_signed(delta)
    } else {
        now.checked_add_signed(delta)
    }
}
