//! Retry tiers and the two escalation ladders over them.
//!
//! Every tier except [`Tier::None`] is backed by a delayed queue whose
//! messages expire after a fixed TTL and are dead-lettered back into the
//! primary exchange. All of this is constant data.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry tier a job was last placed into.
///
/// Serialized as its integer position (0 = none ... 7 = day).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Tier {
    /// Never retried yet.
    #[default]
    None,
    Second,
    Minute,
    TenMinutes,
    ThirtyMinutes,
    Hour,
    SixHours,
    Day,
}

/// Tiers that own a delayed queue, in declaration order.
pub const DELAYED_TIERS: [Tier; 7] = [
    Tier::Second,
    Tier::Minute,
    Tier::TenMinutes,
    Tier::ThirtyMinutes,
    Tier::Hour,
    Tier::SixHours,
    Tier::Day,
];

/// Ladder for generic transient failures, as (current, next) pairs.
pub const ESCALATION_LADDER: [(Tier, Tier); 5] = [
    (Tier::None, Tier::Second),
    (Tier::Second, Tier::Minute),
    (Tier::Minute, Tier::TenMinutes),
    (Tier::TenMinutes, Tier::Hour),
    (Tier::Hour, Tier::SixHours),
];

/// Ladder used when the sender reports a rate limit was exceeded.
pub const OVERLIMIT_LADDER: [Tier; 4] = [Tier::Second, Tier::Minute, Tier::Hour, Tier::Day];

impl Tier {
    /// Name suffix appended to the primary exchange and queue names.
    ///
    /// `None` has no delayed queue and therefore no suffix.
    pub const fn suffix(self) -> Option<&'static str> {
        match self {
            Tier::None => None,
            Tier::Second => Some("dlx.second"),
            Tier::Minute => Some("dlx.minute"),
            Tier::TenMinutes => Some("dlx.ten.minutes"),
            Tier::ThirtyMinutes => Some("dlx.thirty.minutes"),
            Tier::Hour => Some("dlx.hour"),
            Tier::SixHours => Some("dlx.six.hours"),
            Tier::Day => Some("dlx.day"),
        }
    }

    /// How long a message waits in this tier's delayed queue.
    pub const fn delay(self) -> Option<Duration> {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;

        let secs = match self {
            Tier::None => return None,
            Tier::Second => 1,
            Tier::Minute => MINUTE,
            Tier::TenMinutes => 10 * MINUTE,
            Tier::ThirtyMinutes => 30 * MINUTE,
            Tier::Hour => HOUR,
            Tier::SixHours => 6 * HOUR,
            Tier::Day => 24 * HOUR,
        };
        Some(Duration::from_secs(secs))
    }

    /// Queue `x-message-ttl` value in milliseconds.
    pub fn ttl_millis(self) -> Option<u64> {
        self.delay().map(|d| d.as_millis() as u64)
    }

    /// Next tier on the escalation ladder, if any.
    pub fn next_escalation(self) -> Option<Tier> {
        ESCALATION_LADDER
            .iter()
            .find(|(current, _)| *current == self)
            .map(|(_, next)| *next)
    }

    /// Next tier on the overlimit ladder, if any.
    ///
    /// Tiers that are not on the ladder have no successor.
    pub fn next_overlimit(self) -> Option<Tier> {
        let position = OVERLIMIT_LADDER.iter().position(|tier| *tier == self)?;
        OVERLIMIT_LADDER.get(position + 1).copied()
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.suffix() {
            Some(suffix) => f.write_str(suffix.trim_start_matches("dlx.")),
            None => f.write_str("none"),
        }
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> u8 {
        tier as u8
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Tier::None),
            1 => Ok(Tier::Second),
            2 => Ok(Tier::Minute),
            3 => Ok(Tier::TenMinutes),
            4 => Ok(Tier::ThirtyMinutes),
            5 => Ok(Tier::Hour),
            6 => Ok(Tier::SixHours),
            7 => Ok(Tier::Day),
            other => Err(format!("unknown retry tier {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_ladder_sequence() {
        let mut tier = Tier::None;
        let mut seen = vec![tier];
        while let Some(next) = tier.next_escalation() {
            seen.push(next);
            tier = next;
        }
        assert_eq!(
            seen,
            vec![
                Tier::None,
                Tier::Second,
                Tier::Minute,
                Tier::TenMinutes,
                Tier::Hour,
                Tier::SixHours
            ]
        );
    }

    #[test]
    fn test_escalation_has_no_successor_off_ladder() {
        assert_eq!(Tier::SixHours.next_escalation(), None);
        assert_eq!(Tier::ThirtyMinutes.next_escalation(), None);
        assert_eq!(Tier::Day.next_escalation(), None);
    }

    #[test]
    fn test_overlimit_ladder() {
        assert_eq!(Tier::Second.next_overlimit(), Some(Tier::Minute));
        assert_eq!(Tier::Minute.next_overlimit(), Some(Tier::Hour));
        assert_eq!(Tier::Hour.next_overlimit(), Some(Tier::Day));
        assert_eq!(Tier::Day.next_overlimit(), None);
        assert_eq!(Tier::None.next_overlimit(), None);
        assert_eq!(Tier::TenMinutes.next_overlimit(), None);
    }

    #[test]
    fn test_ttl_table() {
        let ttls: Vec<u64> = DELAYED_TIERS.iter().filter_map(|t| t.ttl_millis()).collect();
        assert_eq!(
            ttls,
            vec![1_000, 60_000, 600_000, 1_800_000, 3_600_000, 21_600_000, 86_400_000]
        );
        assert_eq!(Tier::None.ttl_millis(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Tier::None.to_string(), "none");
        assert_eq!(Tier::ThirtyMinutes.to_string(), "thirty.minutes");
        assert_eq!(Tier::Day.to_string(), "day");
    }

    #[test]
    fn test_wire_format_is_integer() {
        assert_eq!(serde_json::to_string(&Tier::SixHours).unwrap(), "6");
        let tier: Tier = serde_json::from_str("4").unwrap();
        assert_eq!(tier, Tier::ThirtyMinutes);
        assert!(serde_json::from_str::<Tier>("8").is_err());
    }
}
