// Exponential backoff with jitter for FAILED_TEMP -> QUEUED requeues.

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub jitter_ratio: f64,
}

pub fn next_delay_ms(attempt_no: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> u64 {
    let attempt_no = attempt_no.max(1) as u32;
    let exp = attempt_no.saturating_sub(1);
    let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);

    let mut delay = cfg.base_ms.saturating_mul(pow2);
    if delay > cfg.cap_ms {
        delay = cfg.cap_ms;
    }

    let jitter_range = (delay as f64) * cfg.jitter_ratio;
    let jitter = rng.gen_range(-jitter_range..=jitter_range);
    let jittered = (delay as f64 + jitter).round();
    jittered.clamp(0.0, cfg.cap_ms as f64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn cfg() -> RetryConfig {
        RetryConfig { base_ms: 1_000, cap_ms: 60_000, jitter_ratio: 0.2 }
    }

    #[test]
    fn delay_grows_exponentially_with_attempt_number() {
        let mut rng = StdRng::seed_from_u64(1);
        let cfg = RetryConfig { jitter_ratio: 0.0, ..cfg() };

        assert_eq!(next_delay_ms(1, &cfg, &mut rng), 1_000);
        assert_eq!(next_delay_ms(2, &cfg, &mut rng), 2_000);
        assert_eq!(next_delay_ms(3, &cfg, &mut rng), 4_000);
        assert_eq!(next_delay_ms(4, &cfg, &mut rng), 8_000);
    }

    #[test]
    fn delay_never_exceeds_the_configured_cap() {
        let mut rng = StdRng::seed_from_u64(2);
        let cfg = cfg();

        let delay = next_delay_ms(30, &cfg, &mut rng);
        assert!(delay <= cfg.cap_ms);
    }

    #[test]
    fn jitter_stays_within_the_configured_ratio_of_the_base_delay() {
        let mut rng = StdRng::seed_from_u64(3);
        let cfg = cfg();

        for attempt in 1..10 {
            let delay = next_delay_ms(attempt, &cfg, &mut rng);
            let unjittered = (cfg.base_ms.saturating_mul(1_u64 << (attempt - 1))).min(cfg.cap_ms);
            let bound = (unjittered as f64 * cfg.jitter_ratio).ceil() as u64 + 1;
            let diff = delay.abs_diff(unjittered);
            assert!(diff <= bound, "attempt {attempt}: delay {delay} strayed too far from {unjittered} (bound {bound})");
        }
    }

    #[test]
    fn attempt_zero_is_treated_as_attempt_one() {
        let mut rng = StdRng::seed_from_u64(4);
        let cfg = RetryConfig { jitter_ratio: 0.0, ..cfg() };

        assert_eq!(next_delay_ms(0, &cfg, &mut rng), next_delay_ms(1, &cfg, &mut rng));
    }
}
