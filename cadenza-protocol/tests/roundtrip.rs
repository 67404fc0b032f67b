//! Property tests: every well-formed command/event/batch survives an
//! encode/decode cycle, and decoders reject malformed input instead of
//! panicking.

use proptest::prelude::*;

use cadenza_protocol::log::{decode_batch, encode_batch};
use cadenza_protocol::{Command, Event, Level, LogEntry, LogField, LogSettings};

fn level_strategy() -> impl Strategy<Value = Level> {
    prop_oneof![
        Just(Level::Error),
        Just(Level::Warn),
        Just(Level::Notice),
        Just(Level::Info),
        Just(Level::Talkative),
        Just(Level::Chatty),
        Just(Level::Debug),
        Just(Level::Vomit),
    ]
}

fn field_strategy() -> impl Strategy<Value = LogField> {
    prop_oneof![
        any::<u64>().prop_map(LogField::Int),
        ".{0,40}".prop_map(LogField::Text),
    ]
}

fn entry_strategy() -> impl Strategy<Value = LogEntry> {
    prop_oneof![
        (level_strategy(), any::<u64>(), ".{0,80}").prop_map(|(level, ms, text)| {
            LogEntry::Msg { level, ms, text }
        }),
        (
            any::<u64>(),
            level_strategy(),
            any::<u64>(),
            any::<u64>(),
            ".{0,80}",
            prop::collection::vec(field_strategy(), 0..4),
            any::<u64>(),
        )
            .prop_map(|(act, level, ms, kind, text, fields, parent)| {
                LogEntry::StartActivity {
                    act,
                    level,
                    ms,
                    kind,
                    text,
                    fields,
                    parent,
                }
            }),
        (any::<u64>(), any::<u64>())
            .prop_map(|(act, ms)| LogEntry::StopActivity { act, ms }),
        (
            any::<u64>(),
            any::<u64>(),
            any::<u64>(),
            prop::collection::vec(field_strategy(), 0..4),
        )
            .prop_map(|(act, ms, kind, fields)| LogEntry::Result {
                act,
                ms,
                kind,
                fields,
            }),
    ]
}

fn command_strategy() -> impl Strategy<Value = Command> {
    (
        "/nix/store/[a-z0-9]{8}-[a-z]{1,12}\\.drv",
        prop::collection::vec("/nix/store/[a-z0-9]{8}-[a-z]{1,12}".prop_map(String::from), 0..5),
        ".{0,20}",
        ".{0,20}",
        ".{0,20}",
    )
        .prop_map(|(drv_path, input_paths, token, path, host)| Command::Build {
            drv_path,
            input_paths,
            log_settings: LogSettings { token, path, host },
        })
}

fn event_strategy() -> impl Strategy<Value = Event> {
    prop_oneof![
        any::<bool>().prop_map(Event::BuildResult),
        ".{0,80}".prop_map(Event::Exception),
        entry_strategy().prop_map(Event::Log),
    ]
}

proptest! {
    #[test]
    fn command_roundtrip(command in command_strategy()) {
        let payload = command.encode();
        prop_assert_eq!(Command::decode(&payload).unwrap(), command);
    }

    #[test]
    fn event_roundtrip(event in event_strategy()) {
        let payload = event.encode();
        prop_assert_eq!(Event::decode(&payload).unwrap(), event);
    }

    #[test]
    fn batch_roundtrip(entries in prop::collection::vec(entry_strategy(), 0..16)) {
        let bytes = encode_batch(&entries);
        prop_assert_eq!(decode_batch(&bytes).unwrap(), entries);
    }

    #[test]
    fn truncated_event_never_panics(event in event_strategy(), cut in 0usize..64) {
        let payload = event.encode();
        if cut < payload.len() {
            // Must error, not panic or succeed with partial data.
            prop_assert!(Event::decode(&payload[..cut]).is_err());
        }
    }

    #[test]
    fn garbage_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
        let _ = Event::decode(&bytes);
        let _ = Command::decode(&bytes);
        let _ = decode_batch(&bytes);
    }
}
