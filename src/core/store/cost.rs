//! Static per-model price table, in US dollars per million tokens.

pub struct ModelPrice {
    pub prefix: &'static str,
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

const fn price(prefix: &'static str, input_per_mtok: f64, output_per_mtok: f64) -> ModelPrice {
    ModelPrice {
        prefix,
        input_per_mtok,
        output_per_mtok,
    }
}

pub const PRICES: &[ModelPrice] = &[
    price("claude-opus-4", 15.0, 75.0),
    price("claude-sonnet-4", 3.0, 15.0),
    price("claude-3-7-sonnet", 3.0, 15.0),
    price("claude-3-5-sonnet", 3.0, 15.0),
    price("claude-3-5-haiku", 0.8, 4.0),
    price("claude-haiku-4-5", 1.0, 5.0),
    price("gpt-4o", 2.5, 10.0),
    price("gpt-4o-mini", 0.15, 0.6),
    price("gpt-4.1", 2.0, 8.0),
    price("gpt-4.1-mini", 0.4, 1.6),
    price("o3-mini", 1.1, 4.4),
    price("o1", 15.0, 60.0),
];

/// Longest matching prefix wins, so `gpt-4o-mini-2024-07-18` prices as
/// `gpt-4o-mini` rather than `gpt-4o`.
pub fn lookup(model: &str) -> Option<&'static ModelPrice> {
    PRICES
        .iter()
        .filter(|p| model.starts_with(p.prefix))
        .max_by_key(|p| p.prefix.len())
}

/// Unknown models cost nothing.
pub fn compute_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    match lookup(model) {
        Some(p) => {
            (input_tokens as f64 * p.input_per_mtok + output_tokens as f64 * p.output_per_mtok)
                / 1_000_000.0
        }
        None => 0.0,
    }
}
