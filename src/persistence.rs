use crate::store::{RealtimeStore, RealtimeTables};

use anyhow::Result;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

const STORE_FILE: &str = "realtime.bin";

/// Writes the current realtime tables so a restart can serve the last
/// known state until the first poll lands.
pub fn save_store(store: &RealtimeStore, dir: &str) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let path = Path::new(dir).join(STORE_FILE);
    let tmp_path = Path::new(dir).join(format!("{}.tmp", STORE_FILE));

    {
        let tables = store.read();
        let mut w = BufWriter::new(File::create(&tmp_path)?);
        bincode::serialize_into(&mut w, &*tables)?;
        w.flush()?;
    }
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Returns `None` when nothing was saved yet.
pub fn load_store(dir: &str) -> Result<Option<RealtimeStore>> {
    let path = Path::new(dir).join(STORE_FILE);
    if !path.exists() {
        return Ok(None);
    }

    let f = BufReader::new(File::open(&path)?);
    let tables: RealtimeTables = bincode::deserialize_from(f)?;
    info!(
        vehicles = tables.vehicle_count(),
        trip_updates = tables.trip_update_count(),
        "loaded realtime store from disk"
    );
    Ok(Some(RealtimeStore::from_tables(tables)))
}
