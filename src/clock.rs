//! UTC timestamps for backup suffixes, temporary-key stamps and reports.

use time::OffsetDateTime;

/// `YYYYMMDDTHHMMSSZ`, safe to embed in file names.
pub fn utc_compact(at: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        at.year(),
        at.month() as u8,
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

pub fn now_utc_compact() -> String {
    utc_compact(OffsetDateTime::now_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utc_compact_format() {
        let at = OffsetDateTime::from_unix_timestamp(1_729_000_000).unwrap();
        assert_eq!(utc_compact(at), "20241015T134640Z");
    }
}
