#![no_main]

use libfuzzer_sys::fuzz_target;
use seqkeep::contracts::{parse_sequence_value, Document, Filter};
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    // Arbitrary JSON stored as a sequence field
    let Ok(value) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    let parsed = parse_sequence_value(&value);
    if let (Some(n), Value::Number(_)) = (parsed, &value) {
        assert_eq!(value.as_u64(), Some(n));
    }

    let doc = Document::new("fuzz").with("seq", value.clone());
    let numeric = Filter::numeric("seq").matches(&doc);
    let non_numeric = Filter::non_numeric("seq").matches(&doc);
    assert!(numeric != non_numeric, "field is present, exactly one filter matches");
    assert!(Filter::eq("seq", value).matches(&doc));
});
