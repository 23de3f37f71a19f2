//! Human-readable byte sizes ("10kb", "1.5mb").

/// Fallback when a size string cannot be parsed (1 MiB).
pub const DEFAULT_SIZE_BYTES: u64 = 1024 * 1024;

/// Parse a size string with a `b|kb|mb|gb` suffix into bytes.
///
/// Units are binary (1kb = 1024 bytes), case-insensitive, and may be
/// separated from the number by whitespace. Anything unrecognized falls
/// back to [`DEFAULT_SIZE_BYTES`].
pub fn parse_size(input: &str) -> u64 {
    let normalized = input.trim().to_ascii_lowercase();
    let split = normalized
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(normalized.len());
    let (number, unit) = normalized.split_at(split);

    let multiplier: u64 = match unit.trim() {
        "b" => 1,
        "kb" => 1024,
        "mb" => 1024 * 1024,
        "gb" => 1024 * 1024 * 1024,
        _ => return DEFAULT_SIZE_BYTES,
    };

    match number.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => (value * multiplier as f64).floor() as u64,
        _ => DEFAULT_SIZE_BYTES,
    }
}
