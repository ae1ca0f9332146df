use crate::prelude::*;
use rand::distributions::{Alphanumeric, DistString};
use std::any::Any;

pub mod cancel;
pub(crate) mod http;
#[macro_use]
mod macros;
#[cfg(test)]
pub(crate) mod stub;

/// Length of the random part of generated identifiers.
const ID_ENTROPY: usize = 12;

/// Generates a prefixed identifier like `inv-d41Gz0qPb3Xk`.
pub fn random_id(prefix: &str) -> String {
    format!(
        "{}-{}",
        prefix,
        Alphanumeric.sample_string(&mut rand::thread_rng(), ID_ENTROPY)
    )
}

pub fn report_panic(e: &dyn Any) {
    if let Some(e) = e.downcast_ref::<String>() {
        error!("panicked: {}", e)
    } else if let Some(e) = e.downcast_ref::<&'static str>() {
        error!("panicked: {}", e)
    } else {
        error!("panicked")
    }
}

pub fn report_failure(err: &anyhow::Error) {
    error!("{}", err);

    for cause in err.chain().skip(1) {
        error!("caused by: {}", cause);
    }
}

/// Exponential backoff with jitter: `base * 2^attempt`, capped, plus up to
/// 25% random jitter so synchronized retries spread out.
pub fn backoff_delay(
    base: std::time::Duration,
    attempt: u32,
    cap: std::time::Duration,
) -> std::time::Duration {
    use rand::Rng;

    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(cap);
    let jitter = rand::thread_rng().gen_range(0.0..0.25);
    capped.mul_f64(1.0 + jitter).min(cap)
}

#[cfg(test)]
mod tests {
    use super::{backoff_delay, random_id};
    use std::time::Duration;

    #[test]
    fn test_random_id_shape() {
        let id = random_id("inv");
        assert!(id.starts_with("inv-"));
        assert_eq!(id.len(), "inv-".len() + super::ID_ENTROPY);
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(5);

        let first = backoff_delay(base, 0, cap);
        assert!(first >= base && first <= base.mul_f64(1.25));

        // High attempts never exceed the cap
        assert!(backoff_delay(base, 20, cap) <= cap);
    }
}
