use std::fmt;

/// Displays a byte count with the largest binary unit that keeps the value
/// at or above one, e.g. `1.50Gi`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ByteSize(pub i64);

const UNITS: [&str; 7] = ["Bi", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut value = self.0 as f64;
        let mut unit = 0;
        while value.abs() >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        write!(f, "{value:.2}{}", UNITS[unit])
    }
}
