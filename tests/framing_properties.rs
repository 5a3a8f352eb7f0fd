//! Property tests for line reassembly and command parsing.

use proptest::prelude::*;
use serial_command_channel::command::parse;
use serial_command_channel::frame::LineAssembler;
use serial_command_channel::CommandKind;

/// Feed `bytes` split at `cuts` and collect every line produced.
fn feed_in_chunks(bytes: &[u8], cuts: &[usize]) -> Vec<String> {
    let mut asm = LineAssembler::new(4096);
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (bytes.len() + 1)).collect();
    points.push(0);
    points.push(bytes.len());
    points.sort_unstable();
    points.dedup();

    points
        .windows(2)
        .flat_map(|w| asm.push(&bytes[w[0]..w[1]]))
        .collect()
}

fn line_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("CAPTURE".to_string()),
        Just("UV".to_string()),
        Just("RGB".to_string()),
        Just(" capture\r".to_string()),
        Just(String::new()),
        "[A-Za-z ]{0,12}",
    ]
}

proptest! {
    #[test]
    fn chunking_does_not_change_lines(
        lines in prop::collection::vec(line_strategy(), 0..20),
        cuts in prop::collection::vec(any::<usize>(), 0..12),
    ) {
        let stream: String = lines.iter().map(|l| format!("{l}\n")).collect();
        let bytes = stream.as_bytes();

        let whole = LineAssembler::new(4096).push(bytes);
        let chunked = feed_in_chunks(bytes, &cuts);
        prop_assert_eq!(&chunked, &whole);

        let expected: Vec<String> = lines
            .iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        prop_assert_eq!(whole, expected);
    }

    #[test]
    fn byte_at_a_time_matches_whole(text in "[A-Z\n]{0,64}") {
        let bytes = text.as_bytes();
        let whole = LineAssembler::new(1024).push(bytes);

        let mut asm = LineAssembler::new(1024);
        let single: Vec<String> = bytes.iter().flat_map(|b| asm.push(&[*b])).collect();
        prop_assert_eq!(single, whole);
    }

    #[test]
    fn pending_never_exceeds_limit(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..700), 0..10)) {
        let mut asm = LineAssembler::new(256);
        for chunk in &chunks {
            asm.push(chunk);
            prop_assert!(asm.len() <= asm.limit());
        }
    }

    #[test]
    fn parse_ignores_case_and_padding(pad_left in " {0,3}", pad_right in "[ \t]{0,3}", upper in any::<bool>()) {
        let token = if upper { "CAPTURE" } else { "capture" };
        let command = parse(&format!("{pad_left}{token}{pad_right}"));
        prop_assert_eq!(command.kind(), CommandKind::Capture);
    }
}

#[test]
fn noise_without_newline_is_discarded() {
    let mut asm = LineAssembler::new(1024);
    let noise = vec![b'#'; 3000];
    for chunk in noise.chunks(1024) {
        assert!(asm.push(chunk).is_empty());
    }
    assert_eq!(asm.len(), 0);
}

#[test]
fn parse_examples() {
    assert_eq!(parse("capture").kind(), CommandKind::Capture);
    assert_eq!(parse("CAPTURE").kind(), CommandKind::Capture);
    assert_eq!(parse(" Capture ").kind(), CommandKind::Capture);
    assert_eq!(parse("uv").kind(), CommandKind::SwitchFluorescence);
    assert_eq!(parse("Rgb").kind(), CommandKind::SwitchNormal);
    assert_eq!(parse("BADCMD").kind(), CommandKind::Unknown);
    assert_eq!(parse("").kind(), CommandKind::Unknown);
}
