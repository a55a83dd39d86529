//! Snapshot Serializer (§4.2 "Snapshot"): emits the current non-expired store
//! contents as a single JSON object, in first-observation order.

use crate::store::Store;

const INITIAL_ALLOC: usize = 8192;
const NEXT_ALLOC: usize = 4096;

/// A byte buffer that grows in fixed 4 KiB increments once its initial 8 KiB
/// is exhausted, mirroring the reference implementation's `MAKE_SPACE` macro
/// so the snapshot is always handed back as one contiguous allocation built
/// with a bounded number of reallocations.
struct SnapshotBuffer {
    buf: Vec<u8>,
}

impl SnapshotBuffer {
    fn new() -> Self {
        SnapshotBuffer {
            buf: Vec::with_capacity(INITIAL_ALLOC),
        }
    }

    fn ensure_space(&mut self, extra: usize) {
        while self.buf.capacity() - self.buf.len() < extra {
            self.buf.reserve_exact(NEXT_ALLOC);
        }
    }

    fn push(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
    }
}

/// Builds the full-state JSON snapshot described in §4.2. `now` is the
/// caller's single timestamp capture for this snapshot (§5 ordering
/// guarantee 2).
pub fn build_snapshot(store: &Store, now: i64) -> String {
    let mut out = SnapshotBuffer::new();
    let mut wrote_any_pgn = false;

    for pgn in store.iter_pgns() {
        let description = pgn.description.as_deref().unwrap_or("");
        out.ensure_space(64 + description.len());
        out.push(&format!(
            "{}\"{}\":\n  {{\"description\":\"{}\"\n",
            if wrote_any_pgn { ',' } else { '{' },
            pgn.prn,
            description
        ));
        wrote_any_pgn = true;

        for message in &pgn.messages {
            if message.expires_at < now {
                continue;
            }
            let key_suffix = message
                .secondary_key
                .as_deref()
                .map(|k| format!("_{k}"))
                .unwrap_or_default();
            out.ensure_space(32 + key_suffix.len() + message.text.len());
            out.push(&format!(
                "  ,\"{}{}\":{}\n",
                message.src, key_suffix, message.text
            ));
        }

        out.ensure_space(8);
        out.push("  }\n");
    }

    out.ensure_space(8);
    out.push(if wrote_any_pgn { "}\n" } else { "\n" });

    String::from_utf8(out.buf).expect("snapshot buffer only ever receives valid utf-8")
}
