//! Chunk arithmetic shared by the reservation and the manager, and a
//! compact size formatter for log lines.

/// Rounds `value` up to the next multiple of `divisor`.  Returns
/// `None` on overflow.
#[inline]
pub fn align_forward(value: u64, divisor: u64) -> Option<u64> {
    assert!(divisor > 0);

    match value % divisor {
        0 => Some(value),
        rem => value.checked_add(divisor - rem),
    }
}

/// Returns the number of bytes in `chunks` chunks of `chunk_size`
/// bytes, or `None` if that does not fit in the address space.
#[inline]
pub fn bytes_for_chunks(chunks: usize, chunk_size: usize) -> Option<usize> {
    chunks.checked_mul(chunk_size)
}

/// Renders `size` as a list of binary units, largest first, e.g.
/// `1GB;512MB;` for 1.5 GB.  Zero renders as `0B`.
pub fn format_memory_size(size: u64) -> String {
    const UNITS: [(u64, &str); 4] = [(1 << 30, "GB"), (1 << 20, "MB"), (1 << 10, "KB"), (1, "B")];

    if size == 0 {
        return "0B".to_string();
    }

    let mut remainder = size;
    let mut ret = String::with_capacity(64);
    for (divisor, unit) in UNITS.iter() {
        let quotient = remainder / divisor;

        remainder %= divisor;
        if quotient != 0 {
            ret.push_str(&format!("{}{};", quotient, unit));
        }
    }

    ret
}

#[test]
fn test_align_forward() {
    assert_eq!(align_forward(0, 8192), Some(0));
    assert_eq!(align_forward(1, 8192), Some(8192));
    assert_eq!(align_forward(8192, 8192), Some(8192));
    assert_eq!(align_forward(5 * 8192 + 4096, 8192), Some(6 * 8192));
    assert_eq!(align_forward(u64::MAX, 8192), None);
}

#[test]
fn test_bytes_for_chunks() {
    assert_eq!(bytes_for_chunks(3, 8192), Some(3 * 8192));
    assert_eq!(bytes_for_chunks(usize::MAX, 2), None);
}

#[test]
fn test_format_memory_size() {
    assert_eq!(format_memory_size(0), "0B");
    assert_eq!(format_memory_size(8192), "8KB;");
    assert_eq!(format_memory_size((1 << 30) + (512 << 20)), "1GB;512MB;");
    assert_eq!(format_memory_size((4 << 20) + 3), "4MB;3B;");
}
