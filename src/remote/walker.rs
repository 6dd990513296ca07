//! Calendar-hierarchy traversal of a radar's remote tree.
//!
//! The remote layout is `<base>/<radar>/<YYYY>/<MM>/<DD>/<HH>/<mmss>/<file>`.
//! The walker enumerates hour directories from the resume instant up to
//! `min(end, now)`, sorts the four-digit minute-second buckets
//! lexicographically (equivalent to temporal order), and yields candidates
//! in non-decreasing observation time. Hours and buckets that do not exist
//! yet are tolerated; any other listing failure propagates so the Fetcher
//! can retry the sweep.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use std::sync::Arc;
use tracing::{debug, trace};

use super::RemoteStore;
use crate::config::VolumeExpectations;
use crate::error::PipelineResult;
use crate::filename::{truncate_to_hour, ParsedFilename};

/// One downloadable file discovered during traversal.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub parsed: ParsedFilename,
    pub remote_path: String,
}

/// Lazy producer of candidate files for one radar.
pub struct RemoteWalker {
    remote: Arc<dyn RemoteStore>,
    base: String,
    radar: String,
    extension: String,
    expectations: VolumeExpectations,
}

impl RemoteWalker {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        base: &str,
        radar: &str,
        extension: &str,
        expectations: VolumeExpectations,
    ) -> Self {
        Self {
            remote,
            base: base.trim_end_matches('/').to_string(),
            radar: radar.to_string(),
            extension: extension.trim_start_matches('.').to_string(),
            expectations,
        }
    }

    /// Collect all candidates with observation time in `[resume, min(end, now))`.
    /// The end of the window is exclusive: `end == resume` yields nothing.
    pub async fn collect_candidates(
        &self,
        resume: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> PipelineResult<Vec<Candidate>> {
        let window_end = match end {
            Some(e) => e.min(Utc::now()),
            None => Utc::now(),
        };
        let mut out = Vec::new();
        let mut hour = truncate_to_hour(resume);

        while hour < window_end {
            let hour_path = self.hour_path(hour);
            let buckets = match self.remote.list_dir(&hour_path).await {
                Ok(buckets) => buckets,
                Err(e) if e.is_not_found() => {
                    trace!(path = %hour_path, "Hour directory not present yet");
                    hour = hour + Duration::hours(1);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let mut buckets: Vec<String> = buckets
                .into_iter()
                .filter(|b| b.len() == 4 && b.bytes().all(|c| c.is_ascii_digit()))
                .collect();
            buckets.sort();

            for bucket in buckets {
                let minute: u32 = bucket[..2].parse().unwrap_or(0);
                let second: u32 = bucket[2..].parse().unwrap_or(0);
                if minute > 59 || second > 59 {
                    continue;
                }
                let bucket_instant = hour + Duration::minutes(minute as i64) + Duration::seconds(second as i64);
                if bucket_instant < resume || bucket_instant >= window_end {
                    continue;
                }

                let bucket_path = format!("{hour_path}/{bucket}");
                let names = match self.remote.list_dir(&bucket_path).await {
                    Ok(names) => names,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e.into()),
                };

                let mut names = names;
                names.sort();
                for name in names {
                    if let Some(candidate) = self.accept(&name, &bucket_path) {
                        out.push(candidate);
                    }
                }
            }

            hour = hour + Duration::hours(1);
        }

        debug!(
            radar = %self.radar,
            from = %resume,
            to = %window_end,
            candidates = out.len(),
            "Traversal complete"
        );
        Ok(out)
    }

    /// Filter one listed name: extension, parseable, this radar, and a
    /// `(vol_code, vol_num)` the expectation map knows about.
    fn accept(&self, name: &str, bucket_path: &str) -> Option<Candidate> {
        if !name.ends_with(&format!(".{}", self.extension)) {
            return None;
        }
        let parsed = match ParsedFilename::parse(name) {
            Ok(p) => p,
            Err(_) => {
                debug!(name, "Skipping unparseable filename");
                return None;
            }
        };
        if parsed.radar != self.radar {
            return None;
        }
        self.expectations
            .get(&parsed.vol_code)
            .and_then(|nums| nums.get(&parsed.vol_num))?;
        Some(Candidate {
            remote_path: format!("{bucket_path}/{name}"),
            parsed,
        })
    }

    fn hour_path(&self, hour: DateTime<Utc>) -> String {
        format!(
            "{}/{}/{:04}/{:02}/{:02}/{:02}",
            self.base,
            self.radar,
            hour.year(),
            hour.month(),
            hour.day(),
            hour.hour()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Fetched, RemoteError};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::path::Path;

    /// In-memory remote tree: directory path -> entry names.
    struct FakeRemote {
        dirs: BTreeMap<String, Vec<String>>,
    }

    #[async_trait]
    impl RemoteStore for FakeRemote {
        async fn list_dir(&self, path: &str) -> Result<Vec<String>, RemoteError> {
            self.dirs
                .get(path)
                .cloned()
                .ok_or_else(|| RemoteError::NotFound(path.to_string()))
        }

        async fn download(&self, path: &str, _local: &Path) -> Result<Fetched, RemoteError> {
            Err(RemoteError::NotFound(path.to_string()))
        }
    }

    fn expectations() -> VolumeExpectations {
        let mut m = VolumeExpectations::new();
        m.entry("0315".into())
            .or_default()
            .insert("01".into(), vec!["DBZH".into(), "VRAD".into()]);
        m
    }

    fn walker(dirs: BTreeMap<String, Vec<String>>) -> RemoteWalker {
        RemoteWalker::new(
            Arc::new(FakeRemote { dirs }),
            "/L2",
            "RMA1",
            "BUFR",
            expectations(),
        )
    }

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, h, m, s).unwrap()
    }

    #[tokio::test]
    async fn yields_candidates_in_time_order() {
        let mut dirs = BTreeMap::new();
        dirs.insert(
            "/L2/RMA1/2025/01/01/12".to_string(),
            vec!["1000".to_string(), "0500".to_string()],
        );
        dirs.insert(
            "/L2/RMA1/2025/01/01/12/0500".to_string(),
            vec![
                "RMA1_0315_01_VRAD_20250101T120500Z.BUFR".to_string(),
                "RMA1_0315_01_DBZH_20250101T120500Z.BUFR".to_string(),
            ],
        );
        dirs.insert(
            "/L2/RMA1/2025/01/01/12/1000".to_string(),
            vec!["RMA1_0315_01_DBZH_20250101T121000Z.BUFR".to_string()],
        );

        let w = walker(dirs);
        let candidates = w
            .collect_candidates(ts(12, 0, 0), Some(ts(12, 30, 0)))
            .await
            .unwrap();
        assert_eq!(candidates.len(), 3);
        let instants: Vec<_> = candidates.iter().map(|c| c.parsed.instant).collect();
        let mut sorted = instants.clone();
        sorted.sort();
        assert_eq!(instants, sorted);
        assert_eq!(
            candidates[0].remote_path,
            "/L2/RMA1/2025/01/01/12/0500/RMA1_0315_01_DBZH_20250101T120500Z.BUFR"
        );
    }

    #[tokio::test]
    async fn missing_hours_are_skipped_silently() {
        // only hour 13 exists; hour 12 listing returns NotFound
        let mut dirs = BTreeMap::new();
        dirs.insert(
            "/L2/RMA1/2025/01/01/13".to_string(),
            vec!["0000".to_string()],
        );
        dirs.insert(
            "/L2/RMA1/2025/01/01/13/0000".to_string(),
            vec!["RMA1_0315_01_DBZH_20250101T130000Z.BUFR".to_string()],
        );
        let w = walker(dirs);
        let candidates = w
            .collect_candidates(ts(12, 0, 0), Some(ts(13, 30, 0)))
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn filters_extension_radar_and_expectation_map() {
        let mut dirs = BTreeMap::new();
        dirs.insert(
            "/L2/RMA1/2025/01/01/12".to_string(),
            vec!["0000".to_string()],
        );
        dirs.insert(
            "/L2/RMA1/2025/01/01/12/0000".to_string(),
            vec![
                "RMA1_0315_01_DBZH_20250101T120000Z.BUFR".to_string(),
                // wrong extension
                "RMA1_0315_01_DBZH_20250101T120000Z.tmp".to_string(),
                // unconfigured volume number
                "RMA1_0315_99_DBZH_20250101T120000Z.BUFR".to_string(),
                // different radar
                "RMA5_0315_01_DBZH_20250101T120000Z.BUFR".to_string(),
                // unparseable
                "README.BUFR".to_string(),
            ],
        );
        let w = walker(dirs);
        let candidates = w
            .collect_candidates(ts(12, 0, 0), Some(ts(12, 30, 0)))
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].parsed.field, "DBZH");
    }

    #[tokio::test]
    async fn empty_window_yields_nothing() {
        // data exists right at the window start, but end == start means an
        // empty window
        let mut dirs = BTreeMap::new();
        dirs.insert(
            "/L2/RMA1/2025/01/01/12".to_string(),
            vec!["0000".to_string()],
        );
        dirs.insert(
            "/L2/RMA1/2025/01/01/12/0000".to_string(),
            vec!["RMA1_0315_01_DBZH_20250101T120000Z.BUFR".to_string()],
        );
        let w = walker(dirs);
        let candidates = w
            .collect_candidates(ts(12, 0, 0), Some(ts(12, 0, 0)))
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn buckets_before_resume_are_excluded() {
        let mut dirs = BTreeMap::new();
        dirs.insert(
            "/L2/RMA1/2025/01/01/12".to_string(),
            vec!["0000".to_string(), "3000".to_string()],
        );
        dirs.insert(
            "/L2/RMA1/2025/01/01/12/0000".to_string(),
            vec!["RMA1_0315_01_DBZH_20250101T120000Z.BUFR".to_string()],
        );
        dirs.insert(
            "/L2/RMA1/2025/01/01/12/3000".to_string(),
            vec!["RMA1_0315_01_DBZH_20250101T123000Z.BUFR".to_string()],
        );
        let w = walker(dirs);
        let candidates = w
            .collect_candidates(ts(12, 15, 0), Some(ts(13, 0, 0)))
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].parsed.instant, ts(12, 30, 0));
    }
}
