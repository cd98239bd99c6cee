//! Static checks with a configured outcome

use std::time::Duration;

use async_trait::async_trait;

use super::{CheckContext, CheckVerdict, QualityCheck};
use crate::config::StaticOutcome;
use crate::error::Result;

/// A check whose result is fixed in configuration
#[derive(Debug, Clone)]
pub struct StaticCheck {
    name: String,
    outcome: StaticOutcome,
    delay: Duration,
    timeout: Duration,
}

impl StaticCheck {
    pub fn new(name: impl Into<String>, outcome: StaticOutcome, delay: Duration, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            outcome,
            delay,
            timeout,
        }
    }

    pub fn passing(name: impl Into<String>) -> Self {
        Self::new(name, StaticOutcome::Pass, Duration::ZERO, Duration::from_secs(5))
    }

    pub fn failing(name: impl Into<String>) -> Self {
        Self::new(name, StaticOutcome::Fail, Duration::ZERO, Duration::from_secs(5))
    }

    pub fn hanging(name: impl Into<String>, timeout: Duration) -> Self {
        Self::new(name, StaticOutcome::Hang, Duration::ZERO, timeout)
    }
}

#[async_trait]
impl QualityCheck for StaticCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, _ctx: &CheckContext) -> Result<CheckVerdict> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.outcome {
            StaticOutcome::Pass => Ok(CheckVerdict::pass("static pass")),
            StaticOutcome::Fail => Ok(CheckVerdict::fail("static failure")),
            StaticOutcome::Hang => std::future::pending().await,
        }
    }
}
