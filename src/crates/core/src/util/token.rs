/// Rough token count: one token per four characters, rounded.
pub fn estimate(text: &str) -> u64 {
    (text.chars().count() as f64 / 4.0).round() as u64
}
