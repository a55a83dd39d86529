//! PGN-indexed latest-value store keyed by `(source, secondaryKey)` with
//! expiry (§3, §4.2).

/// Lowest PGN the dense index covers.
pub const MIN_PGN: u32 = 59391;
/// Highest "ordinary" PGN the dense index covers.
pub const MAX_PGN: u32 = 131_000;
/// Base of the Actisense vendor-extension band.
pub const ACTISENSE_BEM: u32 = 0x400000;
/// Width of the Actisense vendor-extension band.
pub const ACTISENSE_RNG: u32 = 0x100;
/// Total dense-index size: `ACTISENSE_RNG + (MAX_PGN - MIN_PGN)`.
pub const PGN_SPACE: usize = (ACTISENSE_RNG + MAX_PGN - MIN_PGN) as usize;
/// Maximum number of distinct PGNs the secondary ordered list can hold.
pub const MAX_PGN_LIST: usize = 512;

/// Maps a PGN to its slot in the dense index, or `None` if the PGN falls
/// outside both the ordinary range and the Actisense band.
///
/// Carried forward from the reference layout as-is: both branches compute an
/// offset from a different base, and for PGNs just inside the Actisense band
/// this can coincide with an index also reachable from an ordinary low PGN.
/// The 71,865-slot array was sized generously enough that this has never
/// been observed to matter in practice; see DESIGN.md.
pub fn pgn_to_idx(prn: u32) -> Option<usize> {
    if prn >= MIN_PGN && prn <= MAX_PGN {
        Some((prn - MIN_PGN) as usize)
    } else if prn >= ACTISENSE_BEM && prn < ACTISENSE_BEM + ACTISENSE_RNG {
        Some((prn - ACTISENSE_BEM) as usize)
    } else {
        None
    }
}

/// Expiry class a secondary-key field (or PGN override) selects (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryClass {
    Sensor,
    Ais,
    SonicHub,
}

impl ExpiryClass {
    pub fn seconds(self) -> i64 {
        match self {
            ExpiryClass::Sensor => 120,
            ExpiryClass::Ais => 3_600,
            ExpiryClass::SonicHub => 31 * 24 * 3_600,
        }
    }
}

/// Applies the PGN-specific expiry overrides from §3: PGN 126996 always
/// expires on the AIS schedule, PGN 130816 always expires on the SonicHub
/// schedule, regardless of which secondary-key field (if any) was matched.
pub fn expiry_class_for(prn: u32, matched: Option<ExpiryClass>) -> ExpiryClass {
    match prn {
        126996 => ExpiryClass::Ais,
        130816 => ExpiryClass::SonicHub,
        _ => matched.unwrap_or(ExpiryClass::Sensor),
    }
}

/// One observation from one source device for one PGN.
#[derive(Debug, Clone)]
pub struct Message {
    pub src: u8,
    pub secondary_key: Option<String>,
    pub expires_at: i64,
    pub text: String,
}

impl Message {
    fn key_matches(&self, src: u8, secondary_key: Option<&str>) -> bool {
        self.src == src && self.secondary_key.as_deref() == secondary_key
    }
}

/// All known observations for one PGN.
#[derive(Debug)]
pub struct PgnEntry {
    pub prn: u32,
    pub description: Option<String>,
    pub messages: Vec<Message>,
}

impl PgnEntry {
    fn new(prn: u32) -> Self {
        PgnEntry {
            prn,
            description: None,
            messages: Vec::with_capacity(1),
        }
    }

    /// Count of live slots, including expired-but-reusable ones — this is
    /// the observable `maxSrc` from the reference design (§9).
    pub fn max_src(&self) -> usize {
        self.messages.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("pgn out of supported range")]
    PgnOutOfRange,
    #[error("secondary-ordered-list full ({0} pgns)")]
    PgnListFull(usize),
}

/// PGN-indexed latest-value store (§3, §4.2).
#[derive(Debug, Default)]
pub struct Store {
    index: Vec<Option<PgnEntry>>,
    /// Ordered list of live PGN slot indices, in first-observation order —
    /// the "secondary" lookup used for whole-store iteration (snapshot).
    order: Vec<usize>,
}

impl Store {
    pub fn new() -> Self {
        Store {
            index: (0..PGN_SPACE).map(|_| None).collect(),
            order: Vec::new(),
        }
    }

    /// Inserts or overwrites one observation (§4.2 steps 1–6).
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        prn: u32,
        src: u8,
        secondary_key: Option<String>,
        description: Option<&str>,
        text: String,
        now: i64,
        class: ExpiryClass,
    ) -> Result<(), StoreError> {
        let idx = pgn_to_idx(prn).ok_or(StoreError::PgnOutOfRange)?;

        if self.index[idx].is_none() {
            if self.order.len() >= MAX_PGN_LIST {
                return Err(StoreError::PgnListFull(MAX_PGN_LIST));
            }
            self.index[idx] = Some(PgnEntry::new(prn));
            self.order.push(idx);
        }
        let entry = self.index[idx].as_mut().expect("just inserted");

        if entry.description.is_none() {
            if let Some(desc) = description {
                entry.description = Some(desc.to_owned());
            }
        }

        let expires_at = now + class.seconds();
        let key_ref = secondary_key.as_deref();

        if let Some(slot) = entry
            .messages
            .iter_mut()
            .find(|m| m.key_matches(src, key_ref))
        {
            slot.text = text;
            slot.expires_at = expires_at;
            return Ok(());
        }

        if let Some(slot) = entry.messages.iter_mut().find(|m| m.expires_at < now) {
            slot.src = src;
            slot.secondary_key = secondary_key;
            slot.text = text;
            slot.expires_at = expires_at;
            return Ok(());
        }

        entry.messages.push(Message {
            src,
            secondary_key,
            expires_at,
            text,
        });
        Ok(())
    }

    /// Iterates live PGN entries in first-observation order (the order used
    /// by the Snapshot Serializer).
    pub fn iter_pgns(&self) -> impl Iterator<Item = &PgnEntry> {
        self.order.iter().map(move |&idx| {
            self.index[idx]
                .as_ref()
                .expect("order only references populated slots")
        })
    }

    #[cfg(test)]
    pub fn pgn_count(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_pgns_map_as_specified() {
        assert_eq!(pgn_to_idx(59391), Some(0));
        assert_eq!(pgn_to_idx(131_000), Some(131_000 - 59391));
        assert_eq!(pgn_to_idx(131_001), None);
        assert_eq!(pgn_to_idx(0x400000), Some(0));
        assert_eq!(pgn_to_idx(0x4000FF), Some(0xFF));
        assert_eq!(pgn_to_idx(0x400100), None);
    }

    #[test]
    fn pgn_overrides_apply_regardless_of_matched_field() {
        assert_eq!(expiry_class_for(126996, None), ExpiryClass::Ais);
        assert_eq!(
            expiry_class_for(126996, Some(ExpiryClass::Sensor)),
            ExpiryClass::Ais
        );
        assert_eq!(expiry_class_for(130816, Some(ExpiryClass::Ais)), ExpiryClass::SonicHub);
        assert_eq!(expiry_class_for(128267, None), ExpiryClass::Sensor);
    }

    #[test]
    fn insert_then_reinsert_overwrites_in_place() {
        let mut store = Store::new();
        store
            .insert(128267, 1, None, Some("Water Depth"), "line-1".into(), 1000, ExpiryClass::Sensor)
            .unwrap();
        store
            .insert(128267, 1, None, Some("Water Depth"), "line-2".into(), 1001, ExpiryClass::Sensor)
            .unwrap();

        let entry = store.iter_pgns().next().unwrap();
        assert_eq!(entry.max_src(), 1);
        assert_eq!(entry.messages[0].text, "line-2");
        assert_eq!(entry.description.as_deref(), Some("Water Depth"));
    }

    #[test]
    fn distinct_secondary_keys_do_not_overwrite_each_other() {
        let mut store = Store::new();
        store
            .insert(127508, 5, Some("0".into()), None, "a".into(), 0, ExpiryClass::Sensor)
            .unwrap();
        store
            .insert(127508, 5, Some("1".into()), None, "b".into(), 0, ExpiryClass::Sensor)
            .unwrap();

        let entry = store.iter_pgns().next().unwrap();
        assert_eq!(entry.max_src(), 2);
    }

    #[test]
    fn expired_slot_is_reused_without_growing_max_src() {
        let mut store = Store::new();
        store
            .insert(128267, 1, None, None, "a".into(), 0, ExpiryClass::Sensor)
            .unwrap();
        // well past the sensor expiry of 120s
        store
            .insert(128267, 2, None, None, "b".into(), 1000, ExpiryClass::Sensor)
            .unwrap();

        let entry = store.iter_pgns().next().unwrap();
        assert_eq!(entry.max_src(), 1);
        assert_eq!(entry.messages[0].src, 2);
        assert_eq!(entry.messages[0].text, "b");
    }

    #[test]
    fn pgn_list_full_is_reported() {
        let mut store = Store::new();
        for i in 0..MAX_PGN_LIST as u32 {
            store
                .insert(MIN_PGN + i, 1, None, None, "x".into(), 0, ExpiryClass::Sensor)
                .unwrap();
        }
        let err = store
            .insert(MIN_PGN + MAX_PGN_LIST as u32, 1, None, None, "x".into(), 0, ExpiryClass::Sensor)
            .unwrap_err();
        assert_eq!(err, StoreError::PgnListFull(MAX_PGN_LIST));
    }

    #[test]
    fn out_of_range_pgn_is_rejected() {
        let mut store = Store::new();
        let err = store
            .insert(131_001, 1, None, None, "x".into(), 0, ExpiryClass::Sensor)
            .unwrap_err();
        assert_eq!(err, StoreError::PgnOutOfRange);
    }
}
