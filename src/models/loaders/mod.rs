pub mod toml_loader;

pub use toml_loader::{load_all_dataset_files, load_dataset_file, DatasetFile};
