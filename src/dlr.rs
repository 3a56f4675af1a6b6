//! DLR index (C3): correlates SMSC-assigned (smsc-id, timestamp, destination)
//! triples back to the original request so a delivery report can be
//! synthesized and routed home.
//!
//! Grounded on `gw/dlr.c`'s in-memory, non-MySQL branch (`dlr_wle`,
//! `dlr_add`, `dlr_find`). `dashmap` gives the "internal lock striped by key
//! hash" spec.md §4.3 calls out as an acceptable implementation.

use dashmap::DashMap;

use crate::message::{dlr_mask, Message, SmsFields, SmsType};

/// Event bits, as received from an SMSC back-end.
pub mod event {
    pub const DELIVERED_SUCCESS: u8 = super::dlr_mask::DELIVERED_SUCCESS;
    pub const FAIL: u8 = super::dlr_mask::FAIL;
    pub const BUFFERED: u8 = super::dlr_mask::BUFFERED;
    pub const SMSC_SUCCESS: u8 = super::dlr_mask::SMSC_SUCCESS;
    pub const SMSC_FAIL: u8 = super::dlr_mask::SMSC_FAIL;
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct DlrKey {
    smsc_id: String,
    smsc_timestamp: String,
    destination: String,
}

#[derive(Clone, Debug)]
struct DlrEntry {
    original_service: Option<String>,
    original_dlr_url: String,
    dlr_mask: u8,
    original_sender: String,
}

/// Keyed store mapping (smsc-id, smsc-timestamp, destination) to a pending
/// DLR descriptor.
#[derive(Default)]
pub struct DlrIndex {
    entries: DashMap<DlrKey, DlrEntry>,
}

impl DlrIndex {
    pub fn new() -> Self {
        DlrIndex { entries: DashMap::new() }
    }

    /// Only registers the entry if the mask requests at least one event
    /// (`mask & 0x1F != 0`), mirroring `dlr_add`'s guard.
    pub fn add(
        &self,
        smsc_id: impl Into<String>,
        smsc_timestamp: impl Into<String>,
        destination: impl Into<String>,
        service: Option<String>,
        dlr_url: String,
        mask: u8,
    ) {
        if mask & 0x1F == 0 {
            return;
        }
        let key = DlrKey { smsc_id: smsc_id.into(), smsc_timestamp: smsc_timestamp.into(), destination: destination.into() };
        let entry = DlrEntry { original_service: service, original_dlr_url: dlr_url, dlr_mask: mask, original_sender: key.destination.clone() };
        self.entries.insert(key, entry);
    }

    /// Looks up the entry for (smsc_id, smsc_timestamp, destination); if
    /// found, synthesizes a `report` SMS whose sender is the original
    /// destination, whose receiver is the Kannel placeholder `"000"`, and
    /// whose msgdata is the DLR URL. The entry survives only when the event
    /// is buffered *and* the original mask wanted a terminal
    /// (success/fail) report; otherwise it is removed on this call.
    pub fn find(&self, smsc_id: &str, smsc_timestamp: &str, destination: &str, observed_event: u8) -> Option<Message> {
        let key = DlrKey { smsc_id: smsc_id.to_string(), smsc_timestamp: smsc_timestamp.to_string(), destination: destination.to_string() };
        let entry = self.entries.get(&key)?.clone();

        let retain = (observed_event & event::BUFFERED != 0)
            && ((entry.dlr_mask & event::DELIVERED_SUCCESS != 0) || (entry.dlr_mask & event::FAIL != 0));
        if !retain {
            self.entries.remove(&key);
        }

        Some(Message::new_sms(SmsFields {
            sender: entry.original_sender,
            receiver: "000".to_string(),
            msgdata: bytes::Bytes::from(entry.original_dlr_url.into_bytes()),
            udhdata: None,
            coding: crate::message::Coding::Default7Bit,
            message_class: crate::message::MessageClass::Undef,
            mwi: false,
            compress: false,
            dlr_mask: observed_event,
            dlr_url: None,
            validity: None,
            deferred: None,
            service_name: entry.original_service,
            account: None,
            billing_info: None,
            priority: 0,
            protocol_id: 0,
            boxc_id: None,
            sms_type: SmsType::ReportMo,
            split_parts: None,
        }))
    }

    /// Drops every pending entry (admin `flush_dlr`, §6.1).
    pub fn flush(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_without_add_returns_none() {
        let idx = DlrIndex::new();
        assert!(idx.find("s1", "123", "+491", event::DELIVERED_SUCCESS).is_none());
    }

    #[test]
    fn add_with_zero_mask_is_ignored() {
        let idx = DlrIndex::new();
        idx.add("s1", "123", "+491", None, "http://x".into(), 0);
        assert!(idx.is_empty());
    }

    #[test]
    fn terminal_event_removes_entry() {
        let idx = DlrIndex::new();
        idx.add("s1", "123", "+491", None, "http://x".into(), event::SMSC_SUCCESS);
        let report = idx.find("s1", "123", "+491", event::SMSC_SUCCESS).unwrap();
        assert_eq!(report.sms().unwrap().receiver, "000");
        assert!(idx.is_empty());
    }

    #[test]
    fn buffered_event_with_terminal_mask_is_retained() {
        let idx = DlrIndex::new();
        idx.add("s1", "123", "+491", None, "http://x".into(), event::DELIVERED_SUCCESS);
        idx.find("s1", "123", "+491", event::BUFFERED).unwrap();
        assert_eq!(idx.len(), 1);
        idx.find("s1", "123", "+491", event::DELIVERED_SUCCESS).unwrap();
        assert!(idx.is_empty());
    }

    #[test]
    fn buffered_event_without_terminal_mask_is_removed() {
        let idx = DlrIndex::new();
        idx.add("s1", "123", "+491", None, "http://x".into(), event::SMSC_SUCCESS);
        idx.find("s1", "123", "+491", event::BUFFERED).unwrap();
        assert!(idx.is_empty());
    }
}
