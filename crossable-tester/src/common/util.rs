use crossable_game::Cents;
use crossable_game::constants::CENTS_PER_UNIT;

pub fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(|x| x.trim().to_string())
        .filter(|x| !x.is_empty())
        .collect()
}

/// Render cents as a signed decimal amount (`-12.05`).
pub fn format_cents(cents: Cents) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    let unit = CENTS_PER_UNIT.unsigned_abs();
    format!("{sign}{}.{:02}", abs / unit, abs % unit)
}
