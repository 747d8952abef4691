/// Collects disclosed keys from every party, this party included
pub(crate) struct RevealStore<K> {
    keys: Vec<Option<K>>,
    keys_left: usize,
}

impl<K> RevealStore<K> {
    /// Constructs store for `parties_n` parties
    pub fn new(parties_n: u16) -> Self {
        let parties_n = usize::from(parties_n);
        Self {
            keys: std::iter::repeat_with(|| None).take(parties_n).collect(),
            keys_left: parties_n,
        }
    }

    /// Takes party index (1 <= i <= n) and returns its disclosed key, if received
    pub fn get(&self, party_i: u16) -> Option<&K> {
        self.slot(party_i)
            .and_then(|i| self.keys.get(i))
            .and_then(Option::as_ref)
    }

    pub fn contains(&self, party_i: u16) -> bool {
        self.get(party_i).is_some()
    }

    /// Stores the key, returns it back if slot is taken or party index is out of range
    pub fn insert(&mut self, party_i: u16, key: K) -> Result<(), K> {
        let slot = match self.slot(party_i).and_then(|i| self.keys.get_mut(i)) {
            Some(slot) if slot.is_none() => slot,
            _ => return Err(key),
        };
        *slot = Some(key);
        self.keys_left -= 1;
        Ok(())
    }

    pub fn keys_received(&self) -> usize {
        self.keys.len() - self.keys_left
    }

    pub fn is_complete(&self) -> bool {
        self.keys_left == 0
    }

    /// Indexes of parties that haven't disclosed their key yet
    pub fn missing(&self) -> Vec<u16> {
        self.keys
            .iter()
            .zip(1u16..)
            .filter(|(key, _)| key.is_none())
            .map(|(_, i)| i)
            .collect()
    }

    /// Returns all keys in ascending party index order, or `None` if some are missing
    pub fn take_all(&mut self) -> Option<Vec<K>> {
        if !self.is_complete() {
            return None;
        }
        let keys = std::mem::take(&mut self.keys);
        self.keys_left = 0;
        keys.into_iter().collect()
    }

    fn slot(&self, party_i: u16) -> Option<usize> {
        usize::from(party_i).checked_sub(1)
    }
}
