#![no_main]

use libfuzzer_sys::fuzz_target;
use soupstore_core::naming::{derive_store_name, StorageLayout, StoreName};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let (prefix, table) = text.split_once('|').unwrap_or((text, "tbl"));

    // Whatever is accepted must stay below the storage root
    let layout = StorageLayout::new("/root");
    if let Ok(name) = derive_store_name(prefix, None) {
        if let Ok(path) = layout.blob_path(&name, table, 1) {
            assert!(path.starts_with(layout.databases_dir()));
        }
    }
    let _ = StoreName::from_file_name(text);
});
