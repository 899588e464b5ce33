use perfetto_protos::interned_data::InternedData;

use crate::ids::IdRegistry;
use crate::intern::InternTables;

/// Splits a bpftrace `kstack`/`ustack` string into frame descriptions.
///
/// bpftrace prints a leading header line and a trailing newline around the
/// frames, so the first and last lines are dropped and the rest trimmed.
pub fn parse_stack_text(text: &str) -> Vec<String> {
    let lines: Vec<&str> = text.split('\n').collect();
    if lines.len() <= 2 {
        return Vec::new();
    }
    lines[1..lines.len() - 1]
        .iter()
        .map(|line| line.trim().to_string())
        .collect()
}

/// Interns the frames of a sample and returns its callstack iid.
///
/// Kernel frames come first, followed by user frames. Returns `None` when
/// neither stack yields a frame.
pub fn encode_sample(
    tables: &mut InternTables,
    ids: &mut IdRegistry,
    interned: &mut InternedData,
    kernel: Option<&str>,
    user: Option<&str>,
) -> Option<u64> {
    let frames: Vec<String> = kernel
        .into_iter()
        .chain(user)
        .flat_map(parse_stack_text)
        .collect();

    if frames.is_empty() {
        return None;
    }

    let frame_ids: Vec<u64> = frames
        .iter()
        .map(|frame| tables.intern_frame(ids, interned, frame))
        .collect();

    Some(tables.intern_callstack(ids, interned, &frame_ids))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KSTACK: &str = "\n        handle_mm_fault+0\n        do_user_addr_fault+412\n";
    const USTACK: &str = "\n        malloc+22\n        main+48\n";

    #[test]
    fn test_parse_drops_header_and_trailer() {
        assert_eq!(
            parse_stack_text(KSTACK),
            vec!["handle_mm_fault+0", "do_user_addr_fault+412"]
        );
    }

    #[test]
    fn test_parse_short_input_is_empty() {
        assert!(parse_stack_text("").is_empty());
        assert!(parse_stack_text("\n").is_empty());
        assert!(parse_stack_text("header only").is_empty());
    }

    #[test]
    fn test_kernel_frames_precede_user_frames() {
        let mut tables = InternTables::new();
        let mut ids = IdRegistry::new();
        let mut interned = InternedData::default();

        let iid = encode_sample(
            &mut tables,
            &mut ids,
            &mut interned,
            Some(KSTACK),
            Some(USTACK),
        );

        let names: Vec<&[u8]> = interned.function_names.iter().map(|f| f.str()).collect();
        assert_eq!(
            names,
            vec![
                b"handle_mm_fault+0".as_slice(),
                b"do_user_addr_fault+412".as_slice(),
                b"malloc+22".as_slice(),
                b"main+48".as_slice(),
            ]
        );
        assert_eq!(iid, Some(9));
        // Leaf-first: the last parsed frame comes first.
        assert_eq!(interned.callstacks[0].frame_ids, vec![8, 6, 4, 2]);
    }

    #[test]
    fn test_user_only_stack() {
        let mut tables = InternTables::new();
        let mut ids = IdRegistry::new();
        let mut interned = InternedData::default();

        let iid = encode_sample(&mut tables, &mut ids, &mut interned, None, Some(USTACK));
        assert_eq!(iid, Some(5));
        assert_eq!(interned.frames.len(), 2);
    }

    #[test]
    fn test_no_frames_means_no_callstack() {
        let mut tables = InternTables::new();
        let mut ids = IdRegistry::new();
        let mut interned = InternedData::default();

        assert_eq!(
            encode_sample(&mut tables, &mut ids, &mut interned, None, None),
            None
        );
        assert_eq!(
            encode_sample(&mut tables, &mut ids, &mut interned, Some("\n"), Some("")),
            None
        );
        assert_eq!(interned, InternedData::default());
    }

    #[test]
    fn test_repeated_sample_reuses_callstack() {
        let mut tables = InternTables::new();
        let mut ids = IdRegistry::new();
        let mut first = InternedData::default();
        let mut second = InternedData::default();

        let a = encode_sample(&mut tables, &mut ids, &mut first, Some(KSTACK), None);
        let b = encode_sample(&mut tables, &mut ids, &mut second, Some(KSTACK), None);
        assert_eq!(a, b);
        assert_eq!(second, InternedData::default());
    }
}
