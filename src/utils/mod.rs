use std::time::Instant;
use tracing::info;

/// Logs how long a stage took when dropped.
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        info!("▶ {}", label);
        Self {
            label,
            start: Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        info!("■ {} finished in {:.2?}", self.label, self.start.elapsed());
    }
}

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Group digits in threes: 1234567 → "1,234,567".
pub fn fmt_number(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let head = digits.len() % 3;
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (i + 3 - head) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(9.954, 2), 9.95);
        assert_eq!(round_to(0.125, 2), 0.13);
        assert_eq!(round_to(-0.125, 2), -0.13);
        assert_eq!(round_to(0.0123456789, 6), 0.012346);
        assert_eq!(round_to(10.0, 2), 10.0);
    }

    #[test]
    fn test_fmt_number() {
        assert_eq!(fmt_number(1_234_567), "1,234,567");
        assert_eq!(fmt_number(0), "0");
        assert_eq!(fmt_number(-42_000), "-42,000");
        assert_eq!(fmt_number(999), "999");
        assert_eq!(fmt_number(1000), "1,000");
    }
}
