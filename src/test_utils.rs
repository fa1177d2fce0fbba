//! Helpers shared by the test modules.

/// Byte-slice equality with a readable failure: first mismatch index plus
/// a small hex window around it, instead of two multi-megabyte dumps.
#[macro_export]
macro_rules! assert_bytes_eq {
    ($left:expr, $right:expr) => {{
        let left: &[u8] = &$left[..];
        let right: &[u8] = &$right[..];
        let common = left.len().min(right.len());
        if let Some(position) = (0..common).find(|&i| left[i] != right[i]) {
            let from = position.saturating_sub(8);
            let to = (position + 8).min(common);
            panic!(
                "byte slices differ at index {position}:\n  left[{from}..{to}]:  {:02X?}\n  right[{from}..{to}]: {:02X?}",
                &left[from..to],
                &right[from..to],
            );
        }
        if left.len() != right.len() {
            panic!(
                "byte slices differ in length: left {} vs right {} (equal up to the shorter one)",
                left.len(),
                right.len(),
            );
        }
    }};
}
