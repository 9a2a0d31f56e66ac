const KB: f64 = 1024.0;
const MB: f64 = KB * KB;
const GB: f64 = MB * KB;

/// Render a byte count in the largest binary unit it reaches.
///
/// Values below 1 KB stay in bytes; larger values use two decimals.
pub fn format_size(size: u64) -> String {
    let value = size as f64;
    if value >= GB {
        format!("{:.2} GB", value / GB)
    } else if value >= MB {
        format!("{:.2} MB", value / MB)
    } else if value >= KB {
        format!("{:.2} KB", value / KB)
    } else {
        format!("{size} bytes")
    }
}

#[cfg(test)]
mod tests {
    use super::format_size;

    #[test]
    fn unit_boundaries() {
        assert_eq!(format_size(0), "0 bytes");
        assert_eq!(format_size(1023), "1023 bytes");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(1024 * 1024 - 1), "1024.00 KB");
        assert_eq!(format_size(1024 * 1024), "1.00 MB");
        assert_eq!(format_size(1024 * 1024 * 1024), "1.00 GB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024 / 2), "2.50 GB");
    }
}
