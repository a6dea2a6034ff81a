// The subscriber is process-global, so this lives in its own test binary.
use utils::logging::{self, LogFormat};

#[test]
fn second_init_is_rejected() {
    logging::init(LogFormat::Json).expect("first init installs the subscriber");

    tracing::info!(object_id = 7, "logging initialised");

    let err = logging::init(LogFormat::Plain).unwrap_err();
    assert!(format!("{err:#}").contains("global tracing subscriber"));

    // must stay a no-op once a subscriber exists
    logging::init_for_tests();
}
