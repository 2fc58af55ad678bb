//! Per-task cost accounting.

use parking_lot::Mutex;
use scholarqa_core::{CostRecord, ModelUsage};
use scholarqa_llm::Completion;

/// Thread-safe accumulator fed by every completion of one task. Cached
/// completions are counted separately but keep their token accounting.
#[derive(Default)]
pub struct CostLedger {
    inner: Mutex<CostRecord>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, completion: &Completion) {
        let usage = ModelUsage {
            calls: 1,
            cached_calls: completion.cached as u64,
            fallback_calls: completion.fallback as u64,
            input_tokens: completion.usage.input_tokens,
            output_tokens: completion.usage.output_tokens,
            waited_ms: completion.waited_ms,
            cost_usd: completion.cost_usd,
        };
        self.inner.lock().record(&completion.model, &usage);
    }

    pub fn snapshot(&self) -> CostRecord {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scholarqa_llm::TokenUsage;

    fn completion(model: &str, cached: bool) -> Completion {
        Completion {
            text: "x".into(),
            model: model.into(),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
            },
            cost_usd: 0.002,
            cached,
            fallback: false,
            waited_ms: 0,
        }
    }

    #[test]
    fn test_ledger_accumulates_and_flags_cached() {
        let ledger = CostLedger::new();
        ledger.record(&completion("m1", false));
        ledger.record(&completion("m1", true));

        let snapshot = ledger.snapshot();
        let usage = &snapshot.by_model["m1"];
        assert_eq!(usage.calls, 2);
        assert_eq!(usage.cached_calls, 1);
        assert_eq!(usage.input_tokens, 200);
        assert!((snapshot.total_usd() - 0.004).abs() < 1e-12);
    }
}
