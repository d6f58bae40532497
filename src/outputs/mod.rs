//! Output generation for the harvested dataset.
//!
//! # Submodules
//!
//! - [`json`]: Writes the run's article records to the dataset JSON file,
//!   optionally merging into an existing dataset by record id.
//!
//! # Output Structure
//!
//! ```text
//! output_dir/
//! └── bc_news.json
//! ```

pub mod json;
