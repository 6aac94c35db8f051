// Carretón Engine — Request Registry
//
// In-memory record of every forwarded solicitation, keyed by generated id.
// Audit/status only: cancellations are never validated against it.
// Nothing is evicted; the registry lives as long as the process.
//
// Ids handed out for forwards still in flight are reserved so a second
// message in the same millisecond cannot reuse them.

use crate::atoms::constants::REQUEST_ID_SUFFIX_LEN;
use crate::atoms::types::PedidoRecord;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct RequestRegistry {
    records: HashMap<String, PedidoRecord>,
    reserved: HashSet<String>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<epoch millis>-<first 8 chars of message id>`, with a numeric
    /// suffix in the unlikely case the id is already taken or reserved.
    pub fn generate_id(&self, created_at: DateTime<Utc>, message_id: &str) -> String {
        let prefix: String = message_id.chars().take(REQUEST_ID_SUFFIX_LEN).collect();
        let base = format!("{}-{}", created_at.timestamp_millis(), prefix);
        if !self.is_taken(&base) {
            return base;
        }
        (2u32..)
            .map(|n| format!("{}-{}", base, n))
            .find(|candidate| !self.is_taken(candidate))
            .unwrap_or(base)
    }

    /// Generate an id and hold it until `insert` or `release`.
    pub fn reserve(&mut self, created_at: DateTime<Utc>, message_id: &str) -> String {
        let id = self.generate_id(created_at, message_id);
        self.reserved.insert(id.clone());
        id
    }

    pub fn release(&mut self, id: &str) {
        self.reserved.remove(id);
    }

    fn is_taken(&self, id: &str) -> bool {
        self.records.contains_key(id) || self.reserved.contains(id)
    }

    /// Insert a record, consuming its reservation if any. Records are
    /// immutable once stored; a duplicate id is rejected and `false` returned.
    pub fn insert(&mut self, record: PedidoRecord) -> bool {
        self.reserved.remove(&record.id);
        if self.records.contains_key(&record.id) {
            return false;
        }
        self.records.insert(record.id.clone(), record);
        true
    }

    pub fn get(&self, id: &str) -> Option<&PedidoRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str) -> PedidoRecord {
        PedidoRecord {
            id: id.into(),
            sender_display_name: "Ana".into(),
            raw_text: "solicito turno".into(),
            created_at: Utc::now(),
            original_message_id: "3EB0C767D26A1D8E".into(),
        }
    }

    #[test]
    fn id_combines_millis_and_message_prefix() {
        let reg = RequestRegistry::new();
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(reg.generate_id(at, "3EB0C767D26A1D8E"), "1700000000123-3EB0C767");
        assert_eq!(reg.generate_id(at, "ABC"), "1700000000123-ABC");
    }

    #[test]
    fn colliding_ids_get_a_suffix() {
        let mut reg = RequestRegistry::new();
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let first = reg.generate_id(at, "3EB0C767D26A1D8E");
        assert!(reg.insert(record(&first)));
        let second = reg.generate_id(at, "3EB0C767FFFF");
        assert_eq!(second, format!("{}-2", first));
        assert!(reg.insert(record(&second)));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn reserved_ids_are_skipped_until_released() {
        let mut reg = RequestRegistry::new();
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let first = reg.reserve(at, "3EB0C767D26A1D8E");
        assert_eq!(reg.reserve(at, "3EB0C767AAAA"), format!("{}-2", first));
        assert!(reg.is_empty());

        reg.release(&first);
        assert_eq!(reg.generate_id(at, "3EB0C767BBBB"), first);

        assert!(reg.insert(record(&format!("{}-2", first))));
        assert_eq!(reg.generate_id(at, "3EB0C767CCCC"), first);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut reg = RequestRegistry::new();
        assert!(reg.is_empty());
        assert!(reg.insert(record("1-a")));
        assert!(!reg.insert(record("1-a")));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("1-a").map(|r| r.sender_display_name.as_str()), Some("Ana"));
    }
}
