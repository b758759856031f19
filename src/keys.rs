//! Hierarchical keys for numeric ids
//!
//! Sequential ids share long prefixes, which piles consecutive writes onto
//! the same backend partition. Reversing the padded id puts the fastest
//! changing digits first: `123456789` becomes `987/654/321`.

const ID_WIDTH: usize = 9;

/// Zero-pad `id` to nine digits; `None` pads to all zeros.
///
/// Ids wider than nine digits are returned unchanged, not truncated.
pub fn pad_numeric_id(id: Option<u64>) -> String {
    format!("{:0width$}", id.unwrap_or(0), width = ID_WIDTH)
}

/// Padded id, reversed and split into `/`-joined groups of three digits.
pub fn format_numeric_key(id: u64) -> String {
    let reversed: Vec<char> = pad_numeric_id(Some(id)).chars().rev().collect();
    reversed
        .chunks(3)
        .map(|group| group.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("/")
}
