use std::collections::HashMap;
use std::io::{Read, Write};

use crate::errors::{Result, TricrfError};

/// Name of the reserved default state.
///
/// Label dictionaries are seeded with this entry at id 0. It substitutes for
/// unseen labels at test time and serves as the boundary label whose outgoing
/// bigrams score the start of a sequence.
pub const DEFAULT_STATE: &str = "@DEFAULT";

/// Name of the reserved wildcard edge feature at feature id 0.
pub const EDGE_FEATURE: &str = "@EDGE";

/// A bidirectional dictionary mapping between strings and integer ids.
///
/// Ids are assigned densely in interning order and never change or shrink.
#[derive(Debug, Clone)]
pub struct Dictionary {
    str_to_id: HashMap<String, u32>,
    id_to_str: Vec<String>,
}

impl Dictionary {
    /// Create a new empty dictionary
    pub fn new() -> Self {
        Self {
            str_to_id: HashMap::new(),
            id_to_str: Vec::new(),
        }
    }

    /// Create a dictionary pre-seeded with a reserved entry at id 0
    pub fn with_reserved(name: &str) -> Self {
        let mut dict = Self::new();
        dict.intern(name);
        dict
    }

    /// Get the number of entries in the dictionary
    pub fn len(&self) -> usize {
        self.id_to_str.len()
    }

    /// Returns `true` if the dictionary contains no entries
    pub fn is_empty(&self) -> bool {
        self.id_to_str.is_empty()
    }

    /// Get or create an id for a string.
    ///
    /// Idempotent: a second call with the same name returns the same id.
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.str_to_id.get(s) {
            id
        } else {
            let id = self.id_to_str.len() as u32;
            self.str_to_id.insert(s.to_string(), id);
            self.id_to_str.push(s.to_string());
            id
        }
    }

    /// Look up the id of a string without inserting
    pub fn find(&self, s: &str) -> Option<u32> {
        self.str_to_id.get(s).copied()
    }

    /// Look up the name of an id
    pub fn name(&self, id: u32) -> Option<&str> {
        self.id_to_str.get(id as usize).map(String::as_str)
    }

    /// Iterate over all (string, id) pairs in id order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.id_to_str
            .iter()
            .enumerate()
            .map(|(id, s)| (s.as_str(), id as u32))
    }

    /// Write the dictionary as a count followed by length-prefixed strings
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&(self.id_to_str.len() as u32).to_le_bytes())?;
        for s in &self.id_to_str {
            let bytes = s.as_bytes();
            let len = u32::try_from(bytes.len())
                .map_err(|_| TricrfError::invalid_argument("dictionary entry too long"))?;
            w.write_all(&len.to_le_bytes())?;
            w.write_all(bytes)?;
        }
        Ok(())
    }

    /// Read a dictionary written by [`write_to`](Self::write_to)
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut buf4 = [0u8; 4];
        r.read_exact(&mut buf4)?;
        let count = u32::from_le_bytes(buf4) as usize;
        let mut dict = Self::new();
        for _ in 0..count {
            r.read_exact(&mut buf4)?;
            let len = u32::from_le_bytes(buf4) as usize;
            let mut bytes = vec![0u8; len];
            r.read_exact(&mut bytes)?;
            let s = String::from_utf8(bytes)
                .map_err(|_| TricrfError::invalid_model("dictionary entry is not valid UTF-8"))?;
            dict.intern(&s);
        }
        Ok(dict)
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dictionary_basic() {
        let mut dict = Dictionary::new();
        assert_eq!(dict.len(), 0);

        let id1 = dict.intern("hello");
        assert_eq!(id1, 0);
        assert_eq!(dict.len(), 1);

        let id2 = dict.intern("world");
        assert_eq!(id2, 1);
        assert_eq!(dict.len(), 2);

        // Interning the same string returns the same id
        let id3 = dict.intern("hello");
        assert_eq!(id3, id1);
        assert_eq!(dict.len(), 2);

        assert_eq!(dict.find("world"), Some(1));
        assert_eq!(dict.find("missing"), None);
        assert_eq!(dict.name(1), Some("world"));
    }

    #[test]
    fn test_dictionary_reserved() {
        let mut dict = Dictionary::with_reserved(DEFAULT_STATE);
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.find(DEFAULT_STATE), Some(0));
        assert_eq!(dict.intern("NONE"), 1);
    }

    #[test]
    fn test_dictionary_roundtrip() {
        let mut dict = Dictionary::with_reserved(EDGE_FEATURE);
        dict.intern("word=denver");
        dict.intern("word=york");

        let mut buf = Vec::new();
        dict.write_to(&mut buf).unwrap();
        let loaded = Dictionary::read_from(&mut buf.as_slice()).unwrap();

        assert_eq!(loaded.len(), dict.len());
        for (name, id) in dict.iter() {
            assert_eq!(loaded.find(name), Some(id));
        }
    }
}
