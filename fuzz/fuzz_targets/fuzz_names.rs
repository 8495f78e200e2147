#![no_main]

use libfuzzer_sys::fuzz_target;
use seqkeep::contracts::{Document, Filter, RecordRepository, SequenceStore};
use seqkeep::storage::RocksDbStore;
use tempfile::TempDir;

fuzz_target!(|data: &[u8]| {
    // Collection, counter and field names from arbitrary bytes must never panic
    let dir = TempDir::new().unwrap();
    let store = RocksDbStore::open(dir.path()).unwrap();
    let name = String::from_utf8_lossy(data);

    let _ = store.allocate(&name);
    let _ = store.peek(&name);
    let _ = store.advance_to(&name, 7);

    let doc = Document::new("id").with(&name, 1);
    let _ = store.insert(&name, &doc);
    let _ = store.insert("fuzz", &doc);
    let _ = store.count(&name, &Filter::non_numeric(name.to_string()));
    let _ = store.update_many("fuzz", &name, &serde_json::json!(1), &serde_json::json!(2));
});
