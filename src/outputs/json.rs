//! Dataset serialization.
//!
//! This module writes the run's article records to a single JSON file for
//! consumption by external clients.
//!
//! # Merge Mode
//!
//! With merge enabled the existing dataset is read first and fresh records
//! are upserted into it by `id`. Ids derive from source URLs, so
//! re-harvesting the same releases replaces their records in place instead
//! of duplicating them; records from earlier runs that this run did not
//! touch are kept. A missing dataset file means merge degenerates to a
//! plain write; an unparseable one is replaced (with a warning) rather than
//! aborting the run.

use crate::models::ArticleRecord;
use std::collections::HashMap;
use std::error::Error;
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tracing::{error, info, instrument, warn};

/// File name of the dataset inside the output directory.
pub const DATASET_FILENAME: &str = "bc_news.json";

/// Write the records to `{output_dir}/bc_news.json` as pretty JSON.
///
/// With `merge` set, fresh records are upserted by id into whatever the
/// file already holds.
#[instrument(level = "info", skip_all, fields(output_dir = %output_dir, merge))]
pub async fn write_dataset(
    records: &[ArticleRecord],
    output_dir: &str,
    merge: bool,
) -> Result<(), Box<dyn Error>> {
    let path = Path::new(output_dir).join(DATASET_FILENAME);

    let merged;
    let to_write: &[ArticleRecord] = if merge {
        merged = merge_existing(&path, records).await?;
        &merged
    } else {
        records
    };

    let json = serde_json::to_string_pretty(to_write)?;

    if let Err(e) = fs::create_dir_all(output_dir).await {
        error!(%output_dir, error = %e, "Failed to create output dir");
        return Err(e.into());
    }

    fs::write(&path, json).await?;
    info!(path = %path.display(), records = to_write.len(), "Wrote dataset");
    Ok(())
}

/// Upsert fresh records into the dataset already on disk.
///
/// Same-id records are replaced in place, everything else is kept, and
/// genuinely new records are appended in run order.
async fn merge_existing(
    path: &Path,
    fresh: &[ArticleRecord],
) -> Result<Vec<ArticleRecord>, Box<dyn Error>> {
    let mut existing: Vec<ArticleRecord> = match fs::read_to_string(path).await {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Existing dataset unreadable; replacing it");
                Vec::new()
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read existing dataset");
            return Err(e.into());
        }
    };

    let mut index_of: HashMap<String, usize> = existing
        .iter()
        .enumerate()
        .map(|(i, r)| (r.id.clone(), i))
        .collect();

    for record in fresh {
        match index_of.get(&record.id) {
            Some(&i) => existing[i] = record.clone(),
            None => {
                index_of.insert(record.id.clone(), existing.len());
                existing.push(record.clone());
            }
        }
    }

    Ok(existing)
}
