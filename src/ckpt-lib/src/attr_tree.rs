use serde::{Deserialize, Serialize};

use crate::{CkptError, CkptResult, Fabric};

/// Hierarchical attribute container used to move summary, file, segment and
/// container metadata between ranks and on/off disk.
///
/// Children are unique-keyed and kept in insertion order. A node may carry a
/// scalar leaf in canonical string form; the typed accessors parse on read,
/// so any document that round-trips through serde round-trips bit-for-bit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrTree {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    entries: Vec<(String, AttrTree)>,
}

impl AttrTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leaf(value: impl ToString) -> Self {
        Self {
            value: Some(value.to_string()),
            entries: Vec::new(),
        }
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn set_value(&mut self, value: impl ToString) {
        self.value = Some(value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&AttrTree> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, t)| t)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut AttrTree> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, t)| t)
    }

    /// Get the child under `key`, creating an empty one if absent.
    pub fn ensure(&mut self, key: &str) -> &mut AttrTree {
        if let Some(pos) = self.entries.iter().position(|(k, _)| k == key) {
            return &mut self.entries[pos].1;
        }
        self.entries.push((key.to_string(), AttrTree::new()));
        &mut self.entries.last_mut().unwrap().1
    }

    /// Set the child under `key`, replacing any existing subtree.
    pub fn set(&mut self, key: &str, subtree: AttrTree) {
        if let Some(pos) = self.entries.iter().position(|(k, _)| k == key) {
            self.entries[pos].1 = subtree;
        } else {
            self.entries.push((key.to_string(), subtree));
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<AttrTree> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &AttrTree)> {
        self.entries.iter().map(|(k, t)| (k.as_str(), t))
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = (&str, &mut AttrTree)> {
        self.entries.iter_mut().map(|(k, t)| (k.as_str(), t))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.value = None;
        self.entries.clear();
    }

    fn leaf_str(&self, key: &str) -> CkptResult<&str> {
        let child = self
            .get(key)
            .ok_or_else(|| CkptError::MissingKey(key.to_string()))?;
        child
            .value()
            .ok_or_else(|| CkptError::MissingKey(format!("{} has no value", key)))
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.ensure(key).set_value(value);
    }

    pub fn get_str(&self, key: &str) -> CkptResult<&str> {
        self.leaf_str(key)
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.ensure(key).set_value(value);
    }

    pub fn get_int(&self, key: &str) -> CkptResult<i64> {
        let raw = self.leaf_str(key)?;
        raw.parse::<i64>()
            .map_err(|_| CkptError::InvalidValue(format!("{}={} is not an integer", key, raw)))
    }

    pub fn set_unsigned(&mut self, key: &str, value: u64) {
        self.ensure(key).set_value(value);
    }

    pub fn get_unsigned(&self, key: &str) -> CkptResult<u64> {
        let raw = self.leaf_str(key)?;
        raw.parse::<u64>().map_err(|_| {
            CkptError::InvalidValue(format!("{}={} is not an unsigned integer", key, raw))
        })
    }

    pub fn set_bytecount(&mut self, key: &str, value: u64) {
        self.set_unsigned(key, value);
    }

    pub fn get_bytecount(&self, key: &str) -> CkptResult<u64> {
        self.get_unsigned(key)
    }

    pub fn set_crc32(&mut self, key: &str, value: u32) {
        self.ensure(key).set_value(format!("{:#010x}", value));
    }

    pub fn get_crc32(&self, key: &str) -> CkptResult<u32> {
        let raw = self.leaf_str(key)?;
        let parsed = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16).ok()
        } else {
            raw.parse::<u32>().ok()
        };
        parsed.ok_or_else(|| CkptError::InvalidValue(format!("{}={} is not a crc32", key, raw)))
    }

    /// Deep union copy of `src` into self. Leaf values in `src` overwrite
    /// leaf values here; `src` is left untouched.
    pub fn merge(&mut self, src: &AttrTree) {
        if let Some(v) = src.value() {
            self.value = Some(v.to_string());
        }
        for (key, child) in src.entries() {
            self.ensure(key).merge(child);
        }
    }

    /// Reorder children by integer key, ascending. Non-integer keys sort last
    /// in their original order.
    pub fn sort_int_ascending(&mut self) {
        self.entries
            .sort_by_key(|(k, _)| k.parse::<i64>().unwrap_or(i64::MAX));
    }

    pub fn to_bytes(&self) -> CkptResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CkptError::DecodeError(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> CkptResult<AttrTree> {
        serde_json::from_slice(data).map_err(|e| CkptError::DecodeError(e.to_string()))
    }

    /// Collective: after this call every rank holds root's tree.
    pub async fn broadcast(&mut self, fabric: &dyn Fabric, root: u32) -> CkptResult<()> {
        let payload = if fabric.rank() == root {
            self.to_bytes()?
        } else {
            Vec::new()
        };
        let data = fabric.broadcast(root, payload).await?;
        if fabric.rank() != root {
            *self = AttrTree::from_bytes(&data)?;
        }
        Ok(())
    }

    /// Collective: `send` maps destination-rank keys to subtrees. Every rank
    /// receives a tree whose children are keyed by the rank that sent them.
    pub async fn exchange(fabric: &dyn Fabric, send: &AttrTree) -> CkptResult<AttrTree> {
        let rank = fabric.rank();
        let world = fabric.world_size();

        // One message per destination, empty when nothing is addressed to it.
        for dst in 0..world {
            let mut out = AttrTree::new();
            if let Some(subtree) = send.get(&dst.to_string()) {
                out.set(&rank.to_string(), subtree.clone());
            }
            fabric.send(dst, out.to_bytes()?).await?;
        }

        let mut recv = AttrTree::new();
        for src in 0..world {
            let data = fabric.recv(src).await?;
            let tree = AttrTree::from_bytes(&data)?;
            recv.merge(&tree);
        }
        Ok(recv)
    }
}
