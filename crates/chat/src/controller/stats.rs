use parley_storage::ResponseStats;
use tokio::time::Instant;

/// Whitespace-delimited word count, a rough stand-in for provider tokens.
pub fn approximate_tokens(fragment: &str) -> u64 {
    fragment.split_whitespace().count() as u64
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

/// Timing and token accounting for one stream.
#[derive(Debug, Clone)]
pub(crate) struct StreamTiming {
    started_at: Instant,
    first_fragment_at: Option<Instant>,
    total_tokens: u64,
}

impl StreamTiming {
    pub(crate) fn start() -> Self {
        Self {
            started_at: Instant::now(),
            first_fragment_at: None,
            total_tokens: 0,
        }
    }

    pub(crate) fn record_fragment(&mut self, fragment: &str) {
        if self.first_fragment_at.is_none() {
            self.first_fragment_at = Some(Instant::now());
        }
        self.total_tokens += approximate_tokens(fragment);
    }

    pub(crate) fn finish(&self, model: &str) -> ResponseStats {
        let total_time = self.started_at.elapsed().as_secs_f64();
        let time_to_first_token = self
            .first_fragment_at
            .map(|first| first.duration_since(self.started_at).as_secs_f64())
            .unwrap_or(0.0);
        let tokens_per_second = if self.total_tokens == 0 || total_time == 0.0 {
            0.0
        } else {
            self.total_tokens as f64 / total_time
        };

        ResponseStats {
            tokens_per_second: round_to(tokens_per_second, 2),
            time_to_first_token: round_to(time_to_first_token, 3),
            total_time: round_to(total_time, 3),
            total_tokens: self.total_tokens,
            model: model.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn token_approximation_ignores_surrounding_whitespace() {
        assert_eq!(approximate_tokens("Hi"), 1);
        assert_eq!(approximate_tokens(" there"), 1);
        assert_eq!(approximate_tokens("  one\ttwo\nthree  "), 3);
        assert_eq!(approximate_tokens("   "), 0);
        assert_eq!(approximate_tokens(""), 0);
    }

    #[test]
    fn rounding_matches_display_precision() {
        assert_eq!(round_to(12.345_6, 2), 12.35);
        assert_eq!(round_to(0.123_45, 3), 0.123);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_measure_first_fragment_and_total_time() {
        let mut timing = StreamTiming::start();
        tokio::time::advance(Duration::from_millis(250)).await;
        timing.record_fragment("Hi");
        tokio::time::advance(Duration::from_millis(250)).await;
        timing.record_fragment(" there");
        tokio::time::advance(Duration::from_millis(500)).await;

        let stats = timing.finish("llama-3.3-70b-versatile");

        assert_eq!(stats.time_to_first_token, 0.25);
        assert_eq!(stats.total_time, 1.0);
        assert_eq!(stats.total_tokens, 2);
        assert_eq!(stats.tokens_per_second, 2.0);
        assert!(stats.time_to_first_token <= stats.total_time);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_stream_reports_zero_rates() {
        let timing = StreamTiming::start();
        tokio::time::advance(Duration::from_millis(100)).await;

        let stats = timing.finish("gemini-2.0-flash");

        assert_eq!(stats.time_to_first_token, 0.0);
        assert_eq!(stats.tokens_per_second, 0.0);
        assert_eq!(stats.total_tokens, 0);
        assert_eq!(stats.total_time, 0.1);
    }
}
