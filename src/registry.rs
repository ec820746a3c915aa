//! The PvD registry: name -> record map, attribute store, kernel/user DNS
//! list aggregation and transactional update.
//!
//! Grounded on `t_Pvd`/`RegisterPvd`/`UnregisterPvd`/`PvdBeginTransaction`/
//! `PvdSetAttr`/`PvdEndTransaction`/`UpdateAttribute`/`PvdAttributes2Json` in
//! `examples/original_source/src/pvdd.c`. The source's head-inserted linked
//! list becomes a `HashMap` plus an insertion-order `Vec<String>` index, per
//! spec.md 9.

use std::collections::HashMap;
use std::net::Ipv6Addr;

use crate::json::{json_string, json_string_array, ObjectBuilder};

/// Attribute keys the registry writes at creation time and that callers
/// cannot remove directly via `SET_ATTRIBUTE`/`UNSET_ATTRIBUTE`.
const RESERVED_KEYS: &[&str] = &[".deprecated"];

pub const MAX_ATTRIBUTES_PER_PVD: usize = 128;
pub const MAX_PVDS: usize = 1024;

/// A kernel-sourced attribute bundle, as produced by a socket-option fetch
/// or an `RTM_PVDSTATUS` refresh. Field set mirrors `net_pvd_attribute` in
/// `examples/original_source/include/linux/pvd-user.h`.
#[derive(Debug, Clone, Default)]
pub struct KernelPvdAttributes {
    pub index: u32,
    pub sequence_number: u8,
    pub h_flag: bool,
    pub l_flag: bool,
    pub addresses: Vec<(std::net::Ipv6Addr, u8)>,
    pub routes: Vec<KernelRoute>,
    pub rdnss: Vec<std::net::Ipv6Addr>,
    pub dnssl: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct KernelRoute {
    pub destination: std::net::Ipv6Addr,
    pub prefix_len: u8,
    pub gateway: Option<std::net::Ipv6Addr>,
    pub device: String,
}

/// A single PvD record.
#[derive(Debug, Clone)]
pub struct PvdRecord {
    pub name: String,
    pub index: u32,
    pub dirty: bool,
    attributes: Vec<(String, String)>,
    pub rdnss_kernel: Vec<std::net::Ipv6Addr>,
    pub rdnss_user: Vec<std::net::Ipv6Addr>,
    pub dnssl_kernel: Vec<String>,
    pub dnssl_user: Vec<String>,
}

impl PvdRecord {
    fn new(name: &str) -> Self {
        let mut record = PvdRecord {
            name: name.to_string(),
            index: 0,
            dirty: true,
            attributes: Vec::new(),
            rdnss_kernel: Vec::new(),
            rdnss_user: Vec::new(),
            dnssl_kernel: Vec::new(),
            dnssl_user: Vec::new(),
        };
        record.set_attr_unchecked("name", json_string(name));
        record.set_attr_unchecked("id", "0");
        record.set_attr_unchecked("sequenceNumber", "0");
        record.set_attr_unchecked("hFlag", "0");
        record.set_attr_unchecked("lFlag", "0");
        record
    }

    fn set_attr_unchecked(&mut self, key: &str, value: impl Into<String>) -> bool {
        let value = value.into();
        if let Some(existing) = self.attributes.iter_mut().find(|(k, _)| k == key) {
            if existing.1 == value {
                return false;
            }
            existing.1 = value;
        } else {
            self.attributes.push((key.to_string(), value));
        }
        true
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    /// Recomputes `rdnss`/`dnssl` aggregate attributes from the kernel/user
    /// lists. Aggregation policy per spec.md 4.2: deduplicated concatenation
    /// of kernel-sourced then user-sourced entries.
    fn recompute_aggregates(&mut self) {
        let mut seen = std::collections::HashSet::new();
        let mut rdnss: Vec<String> = Vec::new();
        for addr in self.rdnss_kernel.iter().chain(self.rdnss_user.iter()) {
            let s = addr.to_string();
            if seen.insert(s.clone()) {
                rdnss.push(s);
            }
        }
        self.set_attr_unchecked("rdnss", json_string_array(&rdnss));

        let mut seen = std::collections::HashSet::new();
        let mut dnssl: Vec<String> = Vec::new();
        for suffix in self.dnssl_kernel.iter().chain(self.dnssl_user.iter()) {
            if seen.insert(suffix.clone()) {
                dnssl.push(suffix.clone());
            }
        }
        self.set_attr_unchecked("dnssl", json_string_array(&dnssl));
    }

    /// Serializes the attribute map as a JSON object in insertion order,
    /// with a trailing newline per spec.md 4.2.
    pub fn to_json(&self) -> String {
        let mut builder = ObjectBuilder::new();
        for (k, v) in &self.attributes {
            builder.insert(k.clone(), v.clone());
        }
        let mut out = builder.finish();
        out.push('\n');
        out
    }
}

/// Mutation outcomes returned to the caller so `server.rs` can decide what
/// (if anything) to notify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    Created,
    Updated,
    Unchanged,
    Removed,
}

/// An open transaction handle: the PvD name being mutated.
#[derive(Debug, Clone)]
pub struct TransactionHandle {
    pub name: String,
}

#[derive(Debug, Default)]
pub struct PvdRegistry {
    records: HashMap<String, PvdRecord>,
    order: Vec<String>,
}

impl PvdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of PvD names in insertion order (head-first), per spec.md
    /// 4.2's `list()` operation.
    pub fn list(&self) -> &[String] {
        &self.order
    }

    pub fn get(&self, name: &str) -> Option<&PvdRecord> {
        self.records.get(name)
    }

    /// Opens a transaction on `name`, creating the record if absent.
    /// Returns the creation/update outcome alongside the handle so the
    /// caller can decide whether to notify `NEW_PVD` immediately (RA and
    /// kernel paths do; `BEGIN_TRANSACTION` from a control client notifies
    /// only at `end_transaction` if the record ends up dirty).
    pub fn begin_transaction(&mut self, name: &str) -> (TransactionHandle, bool) {
        let created = if !self.records.contains_key(name) {
            if self.records.len() >= MAX_PVDS {
                // Resource cap reached; caller must check `created` stays
                // false and the record absent before proceeding.
                return (TransactionHandle { name: name.to_string() }, false);
            }
            self.records.insert(name.to_string(), PvdRecord::new(name));
            self.order.push(name.to_string());
            true
        } else {
            false
        };
        if let Some(record) = self.records.get_mut(name) {
            record.dirty = created;
        }
        (TransactionHandle { name: name.to_string() }, created)
    }

    /// Sets an attribute on the PvD named by `handle`. Reserved keys are
    /// silently rejected. Returns `false` if the attribute table is full or
    /// the record is missing.
    pub fn set_attr(&mut self, handle: &TransactionHandle, key: &str, value: &str) -> bool {
        if RESERVED_KEYS.contains(&key) {
            return false;
        }
        let Some(record) = self.records.get_mut(&handle.name) else {
            return false;
        };
        if record.attribute_count() >= MAX_ATTRIBUTES_PER_PVD
            && record.get_attr(key).is_none()
        {
            return false;
        }
        if record.set_attr_unchecked(key, value) {
            record.dirty = true;
        }
        true
    }

    /// Replaces the user-sourced (RA-learned) RDNSS list for `name`. The
    /// `rdnss` aggregate attribute is rebuilt from this at `end_transaction`,
    /// so callers must not write `"rdnss"` directly via `set_attr`.
    pub fn set_rdnss_user(&mut self, handle: &TransactionHandle, addrs: Vec<Ipv6Addr>) {
        if let Some(record) = self.records.get_mut(&handle.name) {
            if record.rdnss_user != addrs {
                record.rdnss_user = addrs;
                record.dirty = true;
            }
        }
    }

    /// Replaces the user-sourced (RA-learned) DNSSL suffix list for `name`.
    /// The `dnssl` aggregate attribute is rebuilt from this at
    /// `end_transaction`, so callers must not write `"dnssl"` directly via
    /// `set_attr`.
    pub fn set_dnssl_user(&mut self, handle: &TransactionHandle, suffixes: Vec<String>) {
        if let Some(record) = self.records.get_mut(&handle.name) {
            if record.dnssl_user != suffixes {
                record.dnssl_user = suffixes;
                record.dirty = true;
            }
        }
    }

    /// Removes an attribute, notifying immediately (spec.md 9's flagged
    /// "emits outside the transaction boundary" behavior, preserved from
    /// the source). Returns `true` if the key was present.
    pub fn unset_attr(&mut self, name: &str, key: &str) -> bool {
        if RESERVED_KEYS.contains(&key) {
            return false;
        }
        let Some(record) = self.records.get_mut(name) else {
            return false;
        };
        let before = record.attribute_count();
        record.attributes.retain(|(k, _)| k != key);
        record.attribute_count() != before
    }

    /// Closes a transaction, recomputing aggregates and returning whether a
    /// notification should fire.
    pub fn end_transaction(&mut self, handle: &TransactionHandle) -> RegistryEvent {
        let Some(record) = self.records.get_mut(&handle.name) else {
            return RegistryEvent::Unchanged;
        };
        record.recompute_aggregates();
        if record.dirty {
            record.dirty = false;
            RegistryEvent::Updated
        } else {
            RegistryEvent::Unchanged
        }
    }

    /// Merges a kernel attribute bundle, creating or updating the record.
    pub fn register_kernel(&mut self, name: &str, attrs: &KernelPvdAttributes) -> RegistryEvent {
        let (handle, created) = self.begin_transaction(name);
        let Some(record) = self.records.get_mut(&handle.name) else {
            return RegistryEvent::Unchanged;
        };
        record.index = attrs.index;
        record.dirty |= record.set_attr_unchecked("id", attrs.index.to_string());
        record.dirty |= record.set_attr_unchecked("sequenceNumber", attrs.sequence_number.to_string());
        record.dirty |= record.set_attr_unchecked("hFlag", if attrs.h_flag { "1" } else { "0" });
        record.dirty |= record.set_attr_unchecked("lFlag", if attrs.l_flag { "1" } else { "0" });

        let addrs_json = json_string_array(
            attrs
                .addresses
                .iter()
                .map(|(addr, plen)| format!("{addr}/{plen}")),
        );
        record.dirty |= record.set_attr_unchecked("addresses", addrs_json);

        let routes_json = {
            let mut out = String::from("[");
            for (i, r) in attrs.routes.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let mut obj = ObjectBuilder::new();
                obj.insert("destination", json_string(&format!("{}/{}", r.destination, r.prefix_len)));
                obj.insert(
                    "gateway",
                    r.gateway
                        .map(|g| json_string(&g.to_string()))
                        .unwrap_or_else(|| "null".to_string()),
                );
                obj.insert("device", json_string(&r.device));
                out.push_str(&obj.finish());
            }
            out.push(']');
            out
        };
        record.dirty |= record.set_attr_unchecked("routes", routes_json);

        record.rdnss_kernel = attrs.rdnss.clone();
        record.dnssl_kernel = attrs.dnssl.clone();
        self.end_transaction(&handle);
        if created {
            RegistryEvent::Created
        } else if self.records.get(name).map(|r| r.dirty).unwrap_or(false) {
            RegistryEvent::Updated
        } else {
            RegistryEvent::Unchanged
        }
    }

    /// Removes a record outright. No-op if unknown, per spec.md 4.2.
    pub fn unregister(&mut self, name: &str) -> RegistryEvent {
        if self.records.remove(name).is_some() {
            self.order.retain(|n| n != name);
            RegistryEvent::Removed
        } else {
            RegistryEvent::Unchanged
        }
    }

    pub fn delete_kernel_rdnss(&mut self, name: &str, addr: &std::net::Ipv6Addr) -> RegistryEvent {
        let Some(record) = self.records.get_mut(name) else {
            return RegistryEvent::Unchanged;
        };
        let before_k = record.rdnss_kernel.len();
        let before_u = record.rdnss_user.len();
        record.rdnss_kernel.retain(|a| a != addr);
        record.rdnss_user.retain(|a| a != addr);
        if record.rdnss_kernel.len() == before_k && record.rdnss_user.len() == before_u {
            return RegistryEvent::Unchanged;
        }
        record.recompute_aggregates();
        RegistryEvent::Updated
    }

    pub fn delete_kernel_dnssl(&mut self, name: &str, suffix: &str) -> RegistryEvent {
        let Some(record) = self.records.get_mut(name) else {
            return RegistryEvent::Unchanged;
        };
        let before_k = record.dnssl_kernel.len();
        let before_u = record.dnssl_user.len();
        record.dnssl_kernel.retain(|s| s != suffix);
        record.dnssl_user.retain(|s| s != suffix);
        if record.dnssl_kernel.len() == before_k && record.dnssl_user.len() == before_u {
            return RegistryEvent::Unchanged;
        }
        record.recompute_aggregates();
        RegistryEvent::Updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_sets_well_known_keys() {
        let mut reg = PvdRegistry::new();
        let (handle, created) = reg.begin_transaction("test.example");
        assert!(created);
        reg.end_transaction(&handle);
        let record = reg.get("test.example").unwrap();
        assert_eq!(record.get_attr("name"), Some("\"test.example\""));
        assert_eq!(record.get_attr("sequenceNumber"), Some("0"));
        assert_eq!(record.get_attr("hFlag"), Some("0"));
        assert_eq!(record.get_attr("lFlag"), Some("0"));
    }

    #[test]
    fn reserved_key_rejected() {
        let mut reg = PvdRegistry::new();
        let (handle, _) = reg.begin_transaction("test.example");
        assert!(!reg.set_attr(&handle, ".deprecated", "1"));
    }

    #[test]
    fn unchanged_value_produces_no_dirty_flag() {
        let mut reg = PvdRegistry::new();
        let (handle, _) = reg.begin_transaction("test.example");
        reg.end_transaction(&handle);
        let (handle, _) = reg.begin_transaction("test.example");
        assert!(reg.set_attr(&handle, "extra", "42"));
        assert!(reg.set_attr(&handle, "extra", "42"));
        assert_eq!(reg.end_transaction(&handle), RegistryEvent::Updated);
        let (handle, _) = reg.begin_transaction("test.example");
        assert!(reg.set_attr(&handle, "extra", "42"));
        assert_eq!(reg.end_transaction(&handle), RegistryEvent::Unchanged);
    }

    #[test]
    fn rdnss_aggregate_is_deduplicated_kernel_then_user() {
        let mut reg = PvdRegistry::new();
        let (handle, _) = reg.begin_transaction("test.example");
        {
            let record = reg.records.get_mut("test.example").unwrap();
            record.rdnss_kernel = vec!["2001:db8::1".parse().unwrap()];
            record.rdnss_user = vec![
                "2001:db8::1".parse().unwrap(),
                "2001:db8::2".parse().unwrap(),
            ];
        }
        reg.end_transaction(&handle);
        let record = reg.get("test.example").unwrap();
        assert_eq!(
            record.get_attr("rdnss"),
            Some("[\"2001:db8::1\",\"2001:db8::2\"]")
        );
    }

    #[test]
    fn attribute_cap_drops_overflow() {
        let mut reg = PvdRegistry::new();
        let (handle, _) = reg.begin_transaction("test.example");
        // 5 well-known keys already present; fill to the cap.
        for i in 0..(MAX_ATTRIBUTES_PER_PVD - 5) {
            assert!(reg.set_attr(&handle, &format!("k{i}"), "1"));
        }
        assert!(!reg.set_attr(&handle, "overflow", "1"));
    }

    #[test]
    fn user_sourced_rdnss_survives_aggregate_recompute() {
        let mut reg = PvdRegistry::new();
        let (handle, _) = reg.begin_transaction("test.example");
        reg.set_rdnss_user(&handle, vec!["2001:db8::1".parse().unwrap()]);
        reg.set_dnssl_user(&handle, vec!["example.com".to_string()]);
        reg.end_transaction(&handle);
        let record = reg.get("test.example").unwrap();
        assert_eq!(record.get_attr("rdnss"), Some("[\"2001:db8::1\"]"));
        assert_eq!(record.get_attr("dnssl"), Some("[\"example.com\"]"));
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let mut reg = PvdRegistry::new();
        assert_eq!(reg.unregister("nope"), RegistryEvent::Unchanged);
    }
}
