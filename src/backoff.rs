use crate::error::ConfigError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Capped exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub min: Duration,
    pub max: Duration,
    /// Growth per attempt, `>= 1`.
    pub factor: f64,
    /// Relative spread in `[0, 1]`: a wait `d` becomes `d * (1 ± u * jitter)`.
    pub jitter: f64,
}

impl BackoffConfig {
    pub const LOGIN: BackoffConfig = BackoffConfig {
        min: Duration::from_secs(1),
        max: Duration::from_secs(300),
        factor: 2.0,
        jitter: 0.2,
    };

    pub const RENEW: BackoffConfig = BackoffConfig {
        min: Duration::from_secs(1),
        max: Duration::from_secs(30),
        factor: 2.0,
        jitter: 0.2,
    };

    pub const SINK: BackoffConfig = BackoffConfig {
        min: Duration::from_millis(250),
        max: Duration::from_secs(30),
        factor: 2.0,
        jitter: 0.2,
    };

    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            ..Self::LOGIN
        }
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Validates the parameters. An inverted `min`/`max` pair is swapped.
    pub fn validate(self) -> Result<Self, ConfigError> {
        let mut config = self;
        if config.min > config.max {
            std::mem::swap(&mut config.min, &mut config.max);
        }
        if config.min.is_zero() {
            return Err(ConfigError::Backoff("min must be greater than zero".into()));
        }
        if !config.factor.is_finite() || config.factor < 1.0 {
            return Err(ConfigError::Backoff(format!(
                "factor must be >= 1, got {}",
                config.factor
            )));
        }
        if !(0.0..=1.0).contains(&config.jitter) {
            return Err(ConfigError::Backoff(format!(
                "jitter must be within [0, 1], got {}",
                config.jitter
            )));
        }
        Ok(config)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::LOGIN
    }
}

/// Stateful backoff. Not shared: every retry loop owns its own instance.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.min,
            config,
            rng: StdRng::from_rng(&mut rand::rng()),
        }
    }

    /// Deterministic jitter for tests.
    pub fn with_seed(config: BackoffConfig, seed: u64) -> Self {
        Self {
            current: config.min,
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Un-jittered base of the next wait.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn next(&mut self) -> Duration {
        let base = self.current;
        self.current = base.mul_f64(self.config.factor).min(self.config.max);

        let wait = if self.config.jitter > 0.0 {
            let spread = (2.0 * self.rng.random::<f64>() - 1.0) * self.config.jitter;
            base.mul_f64((1.0 + spread).max(0.0))
        } else {
            base
        };
        wait.clamp(self.config.min, self.config.max)
    }

    pub fn reset(&mut self) {
        self.current = self.config.min;
    }
}
