use tracing::debug;

use crate::alert::AlertEmitter;
use crate::decision::Verdict;
use crate::evaluator::DecisionEngine;
use crate::event::AccessEvent;

/// The enforcement callback handed to interception points: decide, alert,
/// and return the verdict.
///
/// Cheap to clone; every clone shares the same rule index and alert sink.
#[derive(Debug, Clone)]
pub struct Enforcer {
    engine: DecisionEngine,
    emitter: AlertEmitter,
}

impl Enforcer {
    pub fn new(engine: DecisionEngine, emitter: AlertEmitter) -> Self {
        Self { engine, emitter }
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    pub fn emitter(&self) -> &AlertEmitter {
        &self.emitter
    }

    /// Decide `event` and queue its alert. Alert failures are already
    /// logged by the emitter and do not affect the returned verdict.
    pub fn enforce(&self, event: &AccessEvent) -> Verdict {
        let verdict = self.engine.decide(event);
        if let Err(failure) = self.emitter.emit(event, &verdict) {
            debug!(error = %failure, blocked = verdict.is_block(), "verdict stands without alert");
        }
        verdict
    }
}
