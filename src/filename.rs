//! Centralized radar filename parsing and path construction.
//!
//! Every observation file follows the convention
//! `<RADAR>_<VOLCODE>_<VOLNUM>_<FIELD>_<YYYYMMDDTHHMMSSZ>.<EXT>`, e.g.
//! `RMA1_0315_03_DBZH_20250925T000534Z.BUFR`. All components depend on this
//! single definition; nothing else in the crate splits filenames by hand.
//!
//! The same module owns the calendar-hierarchy path layout shared by the
//! remote server, the local raw-file mirror, and the output trees:
//! `<root>/<radar>/<YYYY>/<MM>/<DD>/<HH>/<MMSS>/<filename>` on the remote,
//! and date-bucketed variants locally.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};

/// Timestamp layout used inside filenames.
const FILENAME_INSTANT_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Structured view of one observation filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFilename {
    pub radar: String,
    pub vol_code: String,
    pub vol_num: String,
    pub field: String,
    pub instant: DateTime<Utc>,
    pub extension: String,
}

impl ParsedFilename {
    /// Parse a bare filename (no directory components).
    pub fn parse(filename: &str) -> PipelineResult<Self> {
        let bad = || PipelineError::BadFilename(filename.to_string());

        let (stem, extension) = filename.rsplit_once('.').ok_or_else(bad)?;
        let parts: Vec<&str> = stem.split('_').collect();
        if parts.len() != 5 || parts.iter().any(|p| p.is_empty()) {
            return Err(bad());
        }

        let naive = NaiveDateTime::parse_from_str(parts[4], FILENAME_INSTANT_FORMAT)
            .map_err(|_| bad())?;

        Ok(Self {
            radar: parts[0].to_string(),
            vol_code: parts[1].to_string(),
            vol_num: parts[2].to_string(),
            field: parts[3].to_string(),
            instant: naive.and_utc(),
            extension: extension.to_string(),
        })
    }

    /// Deterministic volume identifier shared by every file of one scan.
    ///
    /// The field is deliberately not part of the identity: different fields
    /// with the same quadruple belong to the same volume.
    pub fn volume_id(&self) -> String {
        volume_id(&self.radar, &self.vol_code, &self.vol_num, self.instant)
    }

    /// Reassemble the canonical filename.
    pub fn filename(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}.{}",
            self.radar,
            self.vol_code,
            self.vol_num,
            self.field,
            self.instant.format(FILENAME_INSTANT_FORMAT),
            self.extension
        )
    }

    /// Remote path under the calendar hierarchy:
    /// `<base>/<radar>/<YYYY>/<MM>/<DD>/<HH>/<MMSS>/<filename>`.
    pub fn remote_path(&self, base: &str) -> String {
        let t = self.instant;
        format!(
            "{}/{}/{:04}/{:02}/{:02}/{:02}/{:02}{:02}/{}",
            base.trim_end_matches('/'),
            self.radar,
            t.year(),
            t.month(),
            t.day(),
            t.hour(),
            t.minute(),
            t.second(),
            self.filename()
        )
    }

    /// Local materialization path under the raw-download root, bucketed by
    /// day and hour so one directory never accumulates a whole campaign.
    pub fn local_path(&self, raw_root: &Path) -> PathBuf {
        let t = self.instant;
        raw_root
            .join(&self.radar)
            .join(format!("{:04}", t.year()))
            .join(format!("{:02}", t.month()))
            .join(format!("{:02}", t.day()))
            .join(format!("{:02}", t.hour()))
            .join(self.filename())
    }
}

/// Encode the volume identity quadruple.
pub fn volume_id(radar: &str, vol_code: &str, vol_num: &str, instant: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}_{}",
        radar,
        vol_code,
        vol_num,
        instant.format(FILENAME_INSTANT_FORMAT)
    )
}

/// Output container path:
/// `<out_root>/<radar>/YYYY/MM/DD/<radar>_<volcode>_<volnum>_<instant>.arrow`.
pub fn container_path(
    out_root: &Path,
    radar: &str,
    vol_code: &str,
    vol_num: &str,
    instant: DateTime<Utc>,
) -> PathBuf {
    out_root
        .join(radar)
        .join(format!("{:04}", instant.year()))
        .join(format!("{:02}", instant.month()))
        .join(format!("{:02}", instant.day()))
        .join(format!(
            "{}_{}_{}_{}.arrow",
            radar,
            vol_code,
            vol_num,
            instant.format(FILENAME_INSTANT_FORMAT)
        ))
}

/// Rendered product path:
/// `<out>/<radar>/YYYY/MM/DD/<radar>_<instant>_<field>_<elev>.png`.
///
/// The instant is rounded to the 10-minute grid so products from the same
/// nominal scan cycle share a name regardless of a volume starting a few
/// seconds early or late.
pub fn product_path(
    out_root: &Path,
    radar: &str,
    instant: DateTime<Utc>,
    field: &str,
    sweep: usize,
) -> PathBuf {
    let rounded = round_to_ten_minutes(instant);
    out_root
        .join(radar)
        .join(format!("{:04}", rounded.year()))
        .join(format!("{:02}", rounded.month()))
        .join(format!("{:02}", rounded.day()))
        .join(format!(
            "{}_{}_{}_{:02}.png",
            radar,
            rounded.format(FILENAME_INSTANT_FORMAT),
            field,
            sweep
        ))
}

/// Round an instant to the nearest 10-minute mark, seconds dropped.
/// Ties round half to even: minute 05 goes to :00, minute 15 to :20.
pub fn round_to_ten_minutes(t: DateTime<Utc>) -> DateTime<Utc> {
    let bucket = t.minute() / 10;
    let remainder = t.minute() % 10;
    let bucket = match remainder.cmp(&5) {
        std::cmp::Ordering::Less => bucket,
        std::cmp::Ordering::Greater => bucket + 1,
        std::cmp::Ordering::Equal => {
            if bucket % 2 == 0 {
                bucket
            } else {
                bucket + 1
            }
        }
    };
    let minute = bucket * 10;
    let (extra_hour, minute) = if minute == 60 { (1, 0) } else { (0, minute) };
    truncate_to_hour(t) + chrono::Duration::minutes(minute as i64) + chrono::Duration::hours(extra_hour)
}

/// Truncate an instant to the top of its hour.
pub fn truncate_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
        .single()
        .unwrap_or(t)
}

/// Format an instant the way filenames do, e.g. `20250101T120000Z`.
pub fn format_instant(t: DateTime<Utc>) -> String {
    t.format(FILENAME_INSTANT_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    #[test]
    fn parses_canonical_filename() {
        let p = ParsedFilename::parse("RMA1_0315_03_DBZH_20250925T000534Z.BUFR").unwrap();
        assert_eq!(p.radar, "RMA1");
        assert_eq!(p.vol_code, "0315");
        assert_eq!(p.vol_num, "03");
        assert_eq!(p.field, "DBZH");
        assert_eq!(p.instant, ts("2025-09-25 00:05:34"));
        assert_eq!(p.extension, "BUFR");
        assert_eq!(p.filename(), "RMA1_0315_03_DBZH_20250925T000534Z.BUFR");
    }

    #[test]
    fn rejects_malformed_names() {
        for bad in [
            "RMA1_0315_03_DBZH.BUFR",
            "RMA1_0315_03_DBZH_20250925.BUFR",
            "RMA1_0315_03_DBZH_20250925T000534Z",
            "justaname.BUFR",
            "",
        ] {
            assert!(ParsedFilename::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn volume_id_excludes_field() {
        let a = ParsedFilename::parse("RMA1_0315_01_DBZH_20250101T120000Z.BUFR").unwrap();
        let b = ParsedFilename::parse("RMA1_0315_01_VRAD_20250101T120000Z.BUFR").unwrap();
        assert_eq!(a.volume_id(), b.volume_id());
        assert_eq!(a.volume_id(), "RMA1_0315_01_20250101T120000Z");
    }

    #[test]
    fn remote_path_follows_calendar_hierarchy() {
        let p = ParsedFilename::parse("RMA1_0315_03_DBZH_20250925T000534Z.BUFR").unwrap();
        assert_eq!(
            p.remote_path("/L2"),
            "/L2/RMA1/2025/09/25/00/0534/RMA1_0315_03_DBZH_20250925T000534Z.BUFR"
        );
    }

    #[test]
    fn product_path_rounds_to_ten_minutes() {
        let path = product_path(
            Path::new("/out"),
            "RMA1",
            ts("2025-01-01 12:07:34"),
            "DBZH",
            0,
        );
        assert_eq!(
            path,
            Path::new("/out/RMA1/2025/01/01/RMA1_20250101T121000Z_DBZH_00.png")
        );
    }

    #[test]
    fn rounding_carries_into_next_hour() {
        assert_eq!(
            round_to_ten_minutes(ts("2025-01-01 12:57:00")),
            ts("2025-01-01 13:00:00")
        );
        assert_eq!(
            round_to_ten_minutes(ts("2025-01-01 12:53:10")),
            ts("2025-01-01 12:50:00")
        );
    }

    #[test]
    fn rounding_ties_go_to_even_buckets() {
        // even buckets hold their ties
        assert_eq!(
            round_to_ten_minutes(ts("2025-01-01 12:05:00")),
            ts("2025-01-01 12:00:00")
        );
        assert_eq!(
            round_to_ten_minutes(ts("2025-01-01 12:25:00")),
            ts("2025-01-01 12:20:00")
        );
        assert_eq!(
            round_to_ten_minutes(ts("2025-01-01 12:45:00")),
            ts("2025-01-01 12:40:00")
        );
        // odd buckets push their ties up
        assert_eq!(
            round_to_ten_minutes(ts("2025-01-01 12:15:00")),
            ts("2025-01-01 12:20:00")
        );
        assert_eq!(
            round_to_ten_minutes(ts("2025-01-01 12:35:00")),
            ts("2025-01-01 12:40:00")
        );
        assert_eq!(
            round_to_ten_minutes(ts("2025-01-01 12:55:00")),
            ts("2025-01-01 13:00:00")
        );
    }
}
