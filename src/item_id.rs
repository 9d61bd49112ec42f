/// A stable identifier for an indexed item.
///
/// Derived from `(collection, source, chunk_index, ordinal)`, so indexing the
/// same chunk again produces the same id and overwrites the stored item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId {
    hex: String,
}

impl ItemId {
    /// Length of the hex digest prefix kept as the id.
    const HEX_LEN: usize = 32;

    pub fn new(
        collection: &str,
        source: &str,
        chunk_index: usize,
        ordinal: usize,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        // Length-prefix the strings so ("ab", "c") and ("a", "bc") differ.
        for part in [collection, source] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hasher.update(&(chunk_index as u64).to_le_bytes());
        hasher.update(&(ordinal as u64).to_le_bytes());

        let full = hasher.finalize().to_hex();
        Self {
            hex: full.as_str()[..Self::HEX_LEN].to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.hex
    }

    /// The first six hex characters, for human display.
    pub fn short(&self) -> &str {
        short_id(&self.hex)
    }
}

/// Number of characters shown for an abbreviated id.
pub const SHORT_LEN: usize = 6;

/// Abbreviate any stored item id for display. Ids shorter than
/// [`SHORT_LEN`] are returned whole.
pub fn short_id(id: &str) -> &str {
    id.char_indices()
        .nth(SHORT_LEN)
        .map_or(id, |(end, _)| &id[..end])
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hex)
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.hex
    }
}
