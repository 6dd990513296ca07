//! Volume assembly: turning the flat stream of completed files into
//! volume rows.
//!
//! Runs inline on the Fetcher's commit path: every time a File row lands,
//! the assembler upserts the owning volume and adds the file's field to
//! its downloaded set. The store recomputes completeness inside the same
//! operation, so a volume becomes claimable the instant its last expected
//! field arrives — no scanning pass needed.

use std::sync::Arc;
use tracing::{debug, info};

use crate::config::VolumeExpectations;
use crate::error::PipelineResult;
use crate::filename::ParsedFilename;
use crate::state::StateStore;

#[derive(Clone)]
pub struct Assembler {
    store: Arc<StateStore>,
    expectations: VolumeExpectations,
}

impl Assembler {
    pub fn new(store: Arc<StateStore>, expectations: VolumeExpectations) -> Self {
        Self { store, expectations }
    }

    /// Update volume membership for a freshly committed file.
    pub fn on_file_recorded(&self, parsed: &ParsedFilename) -> PipelineResult<()> {
        let Some(expected) = self
            .expectations
            .get(&parsed.vol_code)
            .and_then(|nums| nums.get(&parsed.vol_num))
        else {
            // the walker filters unconfigured volumes; a file slipping
            // through (e.g. recorded by an older configuration) is ignored
            debug!(
                vol_code = %parsed.vol_code,
                vol_num = %parsed.vol_num,
                "No expectation entry for volume, skipping assembly"
            );
            return Ok(());
        };

        let volume_id = parsed.volume_id();
        self.store.upsert_volume(
            &volume_id,
            &parsed.radar,
            &parsed.vol_code,
            &parsed.vol_num,
            parsed.instant,
            expected,
        )?;
        let complete = self.store.add_field_to_volume(&volume_id, &parsed.field)?;
        if complete {
            info!(volume_id, "Volume complete, ready for processing");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProcessingStatus;

    fn expectations() -> VolumeExpectations {
        let mut m = VolumeExpectations::new();
        m.entry("0315".into())
            .or_default()
            .insert("01".into(), vec!["DBZH".into(), "VRAD".into()]);
        m
    }

    #[test]
    fn assembles_volume_across_two_files() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        let assembler = Assembler::new(store.clone(), expectations());

        let dbzh = ParsedFilename::parse("RMA1_0315_01_DBZH_20250101T120000Z.BUFR").unwrap();
        let vrad = ParsedFilename::parse("RMA1_0315_01_VRAD_20250101T120000Z.BUFR").unwrap();

        assembler.on_file_recorded(&dbzh).unwrap();
        let vol = store.volume(&dbzh.volume_id()).unwrap().unwrap();
        assert!(!vol.is_complete);
        assert_eq!(vol.status, ProcessingStatus::Pending);
        assert_eq!(vol.expected_fields, vec!["DBZH", "VRAD"]);

        assembler.on_file_recorded(&vrad).unwrap();
        let vol = store.volume(&dbzh.volume_id()).unwrap().unwrap();
        assert!(vol.is_complete);
    }

    #[test]
    fn unconfigured_volume_is_ignored() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        let assembler = Assembler::new(store.clone(), expectations());

        let odd = ParsedFilename::parse("RMA1_9999_01_DBZH_20250101T120000Z.BUFR").unwrap();
        assembler.on_file_recorded(&odd).unwrap();
        assert!(store.volume(&odd.volume_id()).unwrap().is_none());
    }

    #[test]
    fn duplicate_file_is_idempotent() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        let assembler = Assembler::new(store.clone(), expectations());

        let dbzh = ParsedFilename::parse("RMA1_0315_01_DBZH_20250101T120000Z.BUFR").unwrap();
        assembler.on_file_recorded(&dbzh).unwrap();
        assembler.on_file_recorded(&dbzh).unwrap();
        let vol = store.volume(&dbzh.volume_id()).unwrap().unwrap();
        assert_eq!(vol.downloaded_fields, vec!["DBZH"]);
    }
}
