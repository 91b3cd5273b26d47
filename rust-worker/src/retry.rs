//! Retry routing for failed sends.
//!
//! Given the tier a job was last placed into, whether the sender hit a rate
//! limit, and the remote error (if the remote answered at all), decide which
//! queue the job goes to next:
//!
//! | error        | overlimit | target                                   |
//! |--------------|-----------|------------------------------------------|
//! | none         | false     | next tier on the escalation ladder       |
//! | none         | true      | next tier on the overlimit ladder        |
//! | 5xx          | any       | failure queue                            |
//! | 451          | any       | thirty-minute delayed queue              |
//! | anything else| any       | nothing, the job is abandoned            |

use std::fmt;

use crate::queue::{JobError, Tier};

/// SMTP code servers use for greylisting.
pub const GREYLIST_CODE: i64 = 451;

/// Where a failed job should be republished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Delayed queue of the given tier
    Delayed(Tier),
    /// Terminal failure queue
    Failure,
}

/// Why a failed job was not republished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// The ladder has no tier after the current one
    LadderExhausted,
    /// The remote returned a code we do not route
    UnroutedCode(i64),
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbandonReason::LadderExhausted => f.write_str("ladder_exhausted"),
            AbandonReason::UnroutedCode(code) => write!(f, "unrouted_code_{code}"),
        }
    }
}

/// Decide the next queue for a failed job.
pub fn route(current: Tier, overlimit: bool, error: Option<&JobError>) -> Result<Route, AbandonReason> {
    match error {
        None => {
            let next = if overlimit {
                current.next_overlimit()
            } else {
                current.next_escalation()
            };
            next.map(Route::Delayed).ok_or(AbandonReason::LadderExhausted)
        }
        Some(error) if is_permanent(error.code) => Ok(Route::Failure),
        Some(error) if error.code == GREYLIST_CODE => Ok(Route::Delayed(Tier::ThirtyMinutes)),
        Some(error) => Err(AbandonReason::UnroutedCode(error.code)),
    }
}

fn is_permanent(code: i64) -> bool {
    (500..600).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DELAYED_TIERS;

    fn all_tiers() -> impl Iterator<Item = Tier> {
        std::iter::once(Tier::None).chain(DELAYED_TIERS)
    }

    #[test]
    fn test_transient_failures_escalate() {
        assert_eq!(route(Tier::None, false, None), Ok(Route::Delayed(Tier::Second)));
        assert_eq!(route(Tier::Second, false, None), Ok(Route::Delayed(Tier::Minute)));
        assert_eq!(route(Tier::Minute, false, None), Ok(Route::Delayed(Tier::TenMinutes)));
        assert_eq!(route(Tier::TenMinutes, false, None), Ok(Route::Delayed(Tier::Hour)));
        assert_eq!(route(Tier::Hour, false, None), Ok(Route::Delayed(Tier::SixHours)));
        assert_eq!(route(Tier::SixHours, false, None), Err(AbandonReason::LadderExhausted));
    }

    #[test]
    fn test_transient_failure_off_ladder_is_abandoned() {
        assert_eq!(route(Tier::ThirtyMinutes, false, None), Err(AbandonReason::LadderExhausted));
        assert_eq!(route(Tier::Day, false, None), Err(AbandonReason::LadderExhausted));
    }

    #[test]
    fn test_overlimit_ladder() {
        assert_eq!(route(Tier::Second, true, None), Ok(Route::Delayed(Tier::Minute)));
        assert_eq!(route(Tier::Minute, true, None), Ok(Route::Delayed(Tier::Hour)));
        assert_eq!(route(Tier::Hour, true, None), Ok(Route::Delayed(Tier::Day)));
        assert_eq!(route(Tier::Day, true, None), Err(AbandonReason::LadderExhausted));
        assert_eq!(route(Tier::None, true, None), Err(AbandonReason::LadderExhausted));
        assert_eq!(route(Tier::SixHours, true, None), Err(AbandonReason::LadderExhausted));
    }

    #[test]
    fn test_permanent_errors_go_to_failure_queue() {
        for tier in all_tiers() {
            for overlimit in [false, true] {
                let error = JobError::new(550, "mailbox unavailable");
                assert_eq!(route(tier, overlimit, Some(&error)), Ok(Route::Failure));
            }
        }
        assert_eq!(route(Tier::None, false, Some(&JobError::new(500, ""))), Ok(Route::Failure));
        assert_eq!(route(Tier::None, false, Some(&JobError::new(599, ""))), Ok(Route::Failure));
    }

    #[test]
    fn test_greylisting_waits_thirty_minutes() {
        for tier in all_tiers() {
            let error = JobError::new(451, "try again later");
            assert_eq!(
                route(tier, false, Some(&error)),
                Ok(Route::Delayed(Tier::ThirtyMinutes))
            );
        }
    }

    #[test]
    fn test_other_codes_are_abandoned() {
        for code in [-1, 0, 399, 421, 450, 600, 70000] {
            let error = JobError::new(code, "");
            assert_eq!(
                route(Tier::Second, false, Some(&error)),
                Err(AbandonReason::UnroutedCode(code))
            );
        }
    }

    #[test]
    fn test_abandon_reason_display() {
        assert_eq!(AbandonReason::LadderExhausted.to_string(), "ladder_exhausted");
        assert_eq!(AbandonReason::UnroutedCode(399).to_string(), "unrouted_code_399");
    }
}
