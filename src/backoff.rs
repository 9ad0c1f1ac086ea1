//! Exponential backoff with jitter for queue retries

use rand::Rng;
use std::time::Duration;

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
/// capped, with equal jitter so a burst of failures does not retry in
/// lockstep.
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
	let exp = base.saturating_mul(2u32.saturating_pow(attempt.min(16)));
	let capped = exp.min(cap);
	if capped.is_zero() {
		return capped;
	}
	let half = capped / 2;
	half + rand::thread_rng().gen_range(Duration::ZERO..=half)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn grows_and_caps() {
		let base = Duration::from_secs(1);
		let cap = Duration::from_secs(300);
		let mut previous_max = Duration::ZERO;
		for attempt in 0..12 {
			let delay = backoff_delay(base, attempt, cap);
			let max = (base * 2u32.pow(attempt)).min(cap);
			assert!(delay <= max, "attempt {attempt}: {delay:?} > {max:?}");
			assert!(delay >= max / 2, "attempt {attempt}: {delay:?} < {:?}", max / 2);
			assert!(max >= previous_max);
			previous_max = max;
		}
		assert_eq!(previous_max, cap);
	}

	#[test]
	fn zero_base_stays_zero() {
		assert_eq!(
			backoff_delay(Duration::ZERO, 3, Duration::from_secs(10)),
			Duration::ZERO
		);
	}
}
