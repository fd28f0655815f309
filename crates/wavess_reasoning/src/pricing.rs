//! Per-model token prices, in USD per 1M tokens.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Rate {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

/// Unknown models are billed at this rate.
pub const DEFAULT_RATE: Rate = Rate::new(1.0, 2.0);

const BUILTIN: &[(&str, Rate)] = &[
    ("gpt-5", Rate::new(1.25, 10.0)),
    ("gpt-5-mini", Rate::new(0.25, 2.0)),
    ("gpt-5-nano", Rate::new(0.05, 0.40)),
    ("gpt-4.1", Rate::new(2.0, 8.0)),
    ("gpt-4.1-mini", Rate::new(0.40, 1.60)),
    ("gpt-4.1-nano", Rate::new(0.10, 0.40)),
    ("gpt-4o", Rate::new(2.5, 10.0)),
    ("gpt-4o-mini", Rate::new(0.15, 0.60)),
    ("gpt-4-turbo", Rate::new(10.0, 30.0)),
    ("gpt-4", Rate::new(30.0, 60.0)),
    ("gpt-3.5-turbo", Rate::new(0.50, 1.50)),
    ("o1", Rate::new(15.0, 60.0)),
    ("o1-pro", Rate::new(150.0, 600.0)),
    ("o1-mini", Rate::new(1.10, 4.40)),
    ("o3", Rate::new(2.0, 8.0)),
    ("o3-mini", Rate::new(1.10, 4.40)),
    ("o4-mini", Rate::new(1.10, 4.40)),
];

/// Model-keyed price table. Lookups use the longest matching prefix so dated
/// snapshots ("gpt-4o-2024-08-06") bill like their family.
#[derive(Debug, Clone)]
pub struct PricingTable {
    rates: HashMap<String, Rate>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            rates: BUILTIN
                .iter()
                .map(|(model, rate)| (model.to_string(), *rate))
                .collect(),
        }
    }
}

impl PricingTable {
    pub fn empty() -> Self {
        Self {
            rates: HashMap::new(),
        }
    }

    pub fn with_rate(mut self, model: &str, rate: Rate) -> Self {
        self.rates.insert(model.to_string(), rate);
        self
    }

    pub fn rate(&self, model: &str) -> Rate {
        self.rates
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, rate)| *rate)
            .unwrap_or(DEFAULT_RATE)
    }

    pub fn cost(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        let rate = self.rate(model);
        prompt_tokens as f64 * rate.input_per_million / 1_000_000.0
            + completion_tokens as f64 * rate.output_per_million / 1_000_000.0
    }
}
