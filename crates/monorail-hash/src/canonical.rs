use xxhash_rust::xxh64::Xxh64;

/// Streaming canonical encoder over xxh64.
///
/// Every value is written with a type tag and, where variable-sized, a length
/// prefix, so that two different field sequences can never produce the same
/// byte stream. Field order is fixed by the `Hashable` impls; map entries are
/// sorted by the caller before they reach the digest.
pub(crate) struct CanonicalDigest {
    state: Xxh64,
}

const TAG_STR: u8 = 1;
const TAG_NONE: u8 = 2;
const TAG_SOME: u8 = 3;
const TAG_SEQ: u8 = 4;
const TAG_BOOL: u8 = 5;
const TAG_U64: u8 = 6;

impl CanonicalDigest {
    pub(crate) fn new() -> Self {
        Self {
            state: Xxh64::new(0),
        }
    }

    pub(crate) fn finish(self) -> u64 {
        self.state.digest()
    }

    fn tag(&mut self, tag: u8) {
        self.state.update(&[tag]);
    }

    fn len(&mut self, len: usize) {
        self.state.update(&(len as u64).to_le_bytes());
    }

    pub(crate) fn write_str(&mut self, value: impl AsRef<str>) {
        let value = value.as_ref();
        self.tag(TAG_STR);
        self.len(value.len());
        self.state.update(value.as_bytes());
    }

    pub(crate) fn write_opt_str(&mut self, value: Option<impl AsRef<str>>) {
        match value {
            Some(value) => {
                self.tag(TAG_SOME);
                self.write_str(value);
            }
            None => self.tag(TAG_NONE),
        }
    }

    pub(crate) fn write_bool(&mut self, value: bool) {
        self.tag(TAG_BOOL);
        self.state.update(&[value as u8]);
    }

    pub(crate) fn write_u64(&mut self, value: u64) {
        self.tag(TAG_U64);
        self.state.update(&value.to_le_bytes());
    }

    /// Writes a sequence in the order given. Callers that need canonical
    /// ordering sort before calling.
    pub(crate) fn write_seq<I>(&mut self, values: I)
    where
        I: ExactSizeIterator,
        I::Item: AsRef<str>,
    {
        self.tag(TAG_SEQ);
        self.len(values.len());
        for value in values {
            self.write_str(value);
        }
    }

    /// Writes key/value pairs, sorted lexicographically by key.
    pub(crate) fn write_map<'a, K, V>(&mut self, entries: impl Iterator<Item = (&'a K, &'a V)>)
    where
        K: AsRef<str> + 'a + ?Sized,
        V: AsRef<str> + 'a + ?Sized,
    {
        let mut entries: Vec<(&str, &str)> = entries
            .map(|(k, v)| (k.as_ref(), v.as_ref()))
            .collect();
        entries.sort();

        self.tag(TAG_SEQ);
        self.len(entries.len());
        for (key, value) in entries {
            self.write_str(key);
            self.write_str(value);
        }
    }
}

/// Hex-encode a u64 into a fixed 16-byte stack buffer, returning a `&str`.
/// Avoids the heap allocation that `hex::encode()` would perform.
#[inline]
pub(crate) fn hex_encode_u64(value: u64, buf: &mut [u8; 16]) -> &str {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let bytes = value.to_be_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        buf[i * 2] = HEX_CHARS[(b >> 4) as usize];
        buf[i * 2 + 1] = HEX_CHARS[(b & 0x0f) as usize];
    }
    // SAFETY: buf is filled with ASCII hex characters only.
    unsafe { std::str::from_utf8_unchecked(buf) }
}
