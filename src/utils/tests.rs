use tracing::Level;

use super::BrokerError;
use super::logging;
use crate::config::LoggingSettings;
use crate::destination::Destination;

fn level(name: &str) -> LoggingSettings {
    LoggingSettings {
        level: name.to_string(),
        ..LoggingSettings::default()
    }
}

#[test]
fn logging_level_names_map_to_tracing_levels() {
    assert_eq!(level("info").max_level(), Level::INFO);
    assert_eq!(level("DEBUG").max_level(), Level::DEBUG);
    assert_eq!(level(" trace ").max_level(), Level::TRACE);
    assert_eq!(level("warning").max_level(), Level::WARN);
    assert_eq!(level("warn").max_level(), Level::WARN);
    assert_eq!(level("error").max_level(), Level::ERROR);
    assert_eq!(level("bogus").max_level(), Level::INFO);
}

#[test]
fn logging_init_only_installs_once() {
    // an earlier test in this binary may already have installed it
    logging::init(&level("debug"));
    assert!(!logging::init(&level("error")));
}

#[test]
fn destination_unavailable_names_the_destination() {
    let err = BrokerError::DestinationUnavailable(Destination::temp_queue("ID:abc:1"));
    assert_eq!(
        err.to_string(),
        "destination temp-queue://ID:abc:1 is unavailable"
    );
}

#[test]
fn invalid_selector_carries_reason() {
    let err = BrokerError::InvalidSelector {
        selector: "JMSType ==".to_string(),
        reason: "unexpected end of input".to_string(),
    };
    assert!(err.to_string().contains("unexpected end of input"));
}
