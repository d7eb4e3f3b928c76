//! What to do when a download runs out of usable sources.

use std::time::Duration;

use crate::hooks::SourceLookup;

/// Decision taken after the swarm stops without finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Every source is backed off; retry once the shortest backoff ends.
    WaitForBusy(Duration),
    /// A lookup is already running; wait for its results.
    LookupInFlight,
    /// Start a new lookup.
    Requery,
    /// Nothing left to try until the application adds sources.
    GiveUp,
}

impl RetryPolicy {
    /// Picks the policy for a swarm that stopped with `busy_wait` left on
    /// its shortest backoff (None when the pool is empty).
    pub fn decide(busy_wait: Option<Duration>, lookup: &dyn SourceLookup) -> Self {
        if let Some(wait) = busy_wait
            && !wait.is_zero()
        {
            return RetryPolicy::WaitForBusy(wait);
        }
        if lookup.is_lookup_in_flight() {
            RetryPolicy::LookupInFlight
        } else if lookup.can_requery() {
            RetryPolicy::Requery
        } else {
            RetryPolicy::GiveUp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoLookup;

    struct Lookup {
        in_flight: bool,
        can_requery: bool,
    }

    impl SourceLookup for Lookup {
        fn is_lookup_in_flight(&self) -> bool {
            self.in_flight
        }

        fn can_requery(&self) -> bool {
            self.can_requery
        }
    }

    #[test]
    fn test_busy_sources_win() {
        let lookup = Lookup {
            in_flight: true,
            can_requery: true,
        };
        assert_eq!(
            RetryPolicy::decide(Some(Duration::from_secs(120)), &lookup),
            RetryPolicy::WaitForBusy(Duration::from_secs(120))
        );
    }

    #[test]
    fn test_lookup_order() {
        let in_flight = Lookup {
            in_flight: true,
            can_requery: true,
        };
        assert_eq!(RetryPolicy::decide(None, &in_flight), RetryPolicy::LookupInFlight);

        let requery = Lookup {
            in_flight: false,
            can_requery: true,
        };
        assert_eq!(
            RetryPolicy::decide(Some(Duration::ZERO), &requery),
            RetryPolicy::Requery
        );

        assert_eq!(RetryPolicy::decide(None, &NoLookup), RetryPolicy::GiveUp);
    }
}
