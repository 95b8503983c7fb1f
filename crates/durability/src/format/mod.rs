//! On-disk formats for save-files.
//!
//! - `record`: the record stream inside a save-file
//! - `savefile`: save-file naming and name parsing

pub mod record;
pub mod savefile;

pub use record::{
    decode_records, encode_pages, RecordEncoder, RecordReader, RecordWriter, SnapshotRecord,
    MARKER_BLOCK, MARKER_FORK, MARKER_RANGE, MARKER_RELATION, RECORD_SIZE,
};
pub use savefile::{
    is_temp_file_name, parse_save_file_name, save_file_name, temp_file_name, SAVE_FILE_EXTENSION,
    TEMP_FILE_SUFFIX,
};
