//! Event buffer (§4.I): coalesces events from the moment credentials are
//! known until the first `offline_batch` completes, so history-sync
//! delivers as one flush instead of a flood of individual events.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexMap;
use serde_json::{Map, Value};

/// The five buffered event kinds, in their required flush order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Creds,
    Chats,
    Contacts,
    Messages,
    Receipts,
}

/// A single buffered record: an id (the merge key) plus arbitrary fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self { id: id.into(), fields }
    }
}

/// Merges `incoming` into `existing` in place: scalar fields are
/// overwritten (latest wins), array fields whose elements are objects
/// carrying an `id` are union-merged by that id, everything else (arrays
/// without ids, or a shape mismatch) is overwritten wholesale.
fn merge_fields(existing: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, incoming_value) in incoming {
        match (existing.get(key), incoming_value) {
            (Some(Value::Array(current)), Value::Array(new_items)) if elements_are_keyed(current) && elements_are_keyed(new_items) => {
                let merged = union_merge_by_id(current, new_items);
                existing.insert(key.clone(), Value::Array(merged));
            }
            _ => {
                existing.insert(key.clone(), incoming_value.clone());
            }
        }
    }
}

fn elements_are_keyed(items: &[Value]) -> bool {
    items.is_empty() || items.iter().all(|item| item.get("id").is_some())
}

fn union_merge_by_id(current: &[Value], incoming: &[Value]) -> Vec<Value> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: IndexMap<String, Value> = IndexMap::new();

    for item in current.iter().chain(incoming.iter()) {
        let Some(id) = item.get("id").and_then(Value::as_str) else { continue };
        if !by_id.contains_key(id) {
            order.push(id.to_owned());
        }
        by_id.insert(id.to_owned(), item.clone());
    }

    order.into_iter().filter_map(|id| by_id.swap_remove(&id)).collect()
}

/// A flushed event ready for dispatch, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedEvent {
    pub kind: EventKind,
    pub record: Record,
}

#[derive(Default)]
struct Bucket(IndexMap<String, Record>);

impl Bucket {
    fn push(&mut self, record: Record) {
        match self.0.get_mut(&record.id) {
            Some(existing) => merge_fields(&mut existing.fields, &record.fields),
            None => {
                self.0.insert(record.id.clone(), record);
            }
        }
    }

    fn drain(&mut self) -> Vec<Record> {
        self.0.drain(..).map(|(_, record)| record).collect()
    }
}

/// Coalesces events while `active`; once [`EventBuffer::flush`] runs it
/// stays inactive, so later events pass straight through the caller's
/// dispatch path unbuffered.
pub struct EventBuffer {
    active: AtomicBool,
    creds: Mutex<Option<Record>>,
    chats: Mutex<Bucket>,
    contacts: Mutex<Bucket>,
    messages: Mutex<Bucket>,
    receipts: Mutex<Bucket>,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBuffer {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            creds: Mutex::new(None),
            chats: Mutex::new(Bucket::default()),
            contacts: Mutex::new(Bucket::default()),
            messages: Mutex::new(Bucket::default()),
            receipts: Mutex::new(Bucket::default()),
        }
    }

    /// Starts buffering, called once credentials are known (pairing
    /// completes or a stored session resumes).
    pub fn start(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Records an event. Returns `Some` immediately if buffering isn't
    /// active (pass-through mode), `None` if it was absorbed into the
    /// buffer for the eventual coalesced flush.
    pub fn push(&self, kind: EventKind, record: Record) -> Option<FlushedEvent> {
        if !self.is_active() {
            return Some(FlushedEvent { kind, record });
        }

        match kind {
            EventKind::Creds => {
                let mut slot = self.creds.lock().expect("creds mutex poisoned");
                match slot.as_mut() {
                    Some(existing) => merge_fields(&mut existing.fields, &record.fields),
                    None => *slot = Some(record),
                }
            }
            EventKind::Chats => self.chats.lock().expect("chats mutex poisoned").push(record),
            EventKind::Contacts => self.contacts.lock().expect("contacts mutex poisoned").push(record),
            EventKind::Messages => self.messages.lock().expect("messages mutex poisoned").push(record),
            EventKind::Receipts => self.receipts.lock().expect("receipts mutex poisoned").push(record),
        }
        None
    }

    /// Flushes every buffered bucket in the required order (creds, chats,
    /// contacts, messages, receipts) and deactivates buffering so
    /// subsequent events pass straight through. Called on the first
    /// `offline_batch` completion.
    pub fn flush(&self) -> Vec<FlushedEvent> {
        self.active.store(false, Ordering::SeqCst);

        let mut out = Vec::new();
        if let Some(creds) = self.creds.lock().expect("creds mutex poisoned").take() {
            out.push(FlushedEvent { kind: EventKind::Creds, record: creds });
        }
        for record in self.chats.lock().expect("chats mutex poisoned").drain() {
            out.push(FlushedEvent { kind: EventKind::Chats, record });
        }
        for record in self.contacts.lock().expect("contacts mutex poisoned").drain() {
            out.push(FlushedEvent { kind: EventKind::Contacts, record });
        }
        for record in self.messages.lock().expect("messages mutex poisoned").drain() {
            out.push(FlushedEvent { kind: EventKind::Messages, record });
        }
        for record in self.receipts.lock().expect("receipts mutex poisoned").drain() {
            out.push(FlushedEvent { kind: EventKind::Receipts, record });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn buffered_events_pass_through_when_inactive() {
        let buffer = EventBuffer::new();
        let record = Record::new("chat-1", fields(json!({"unread": 1})));
        let flushed = buffer.push(EventKind::Chats, record.clone());
        assert_eq!(flushed, Some(FlushedEvent { kind: EventKind::Chats, record }));
    }

    #[test]
    fn overlapping_scalar_fields_use_latest_wins() {
        let buffer = EventBuffer::new();
        buffer.start();

        buffer.push(EventKind::Chats, Record::new("chat-1", fields(json!({"unread": 1, "name": "old"}))));
        buffer.push(EventKind::Chats, Record::new("chat-1", fields(json!({"unread": 2}))));

        let flushed = buffer.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].record.fields.get("unread"), Some(&json!(2)));
        assert_eq!(flushed[0].record.fields.get("name"), Some(&json!("old")));
    }

    #[test]
    fn array_fields_union_merge_by_id() {
        let buffer = EventBuffer::new();
        buffer.start();

        buffer.push(EventKind::Messages, Record::new("chat-1", fields(json!({"messages": [{"id": "m1", "body": "hi"}]}))));
        buffer.push(EventKind::Messages, Record::new("chat-1", fields(json!({"messages": [{"id": "m1", "body": "hi edited"}, {"id": "m2", "body": "there"}]}))));

        let flushed = buffer.flush();
        let messages = flushed[0].record.fields.get("messages").unwrap().as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["body"], json!("hi edited"));
        assert_eq!(messages[1]["id"], json!("m2"));
    }

    #[test]
    fn flush_order_is_creds_chats_contacts_messages_receipts() {
        let buffer = EventBuffer::new();
        buffer.start();

        buffer.push(EventKind::Receipts, Record::new("r1", fields(json!({}))));
        buffer.push(EventKind::Messages, Record::new("m1", fields(json!({}))));
        buffer.push(EventKind::Contacts, Record::new("c1", fields(json!({}))));
        buffer.push(EventKind::Chats, Record::new("ch1", fields(json!({}))));
        buffer.push(EventKind::Creds, Record::new("self", fields(json!({}))));

        let kinds: Vec<EventKind> = buffer.flush().into_iter().map(|event| event.kind).collect();
        assert_eq!(kinds, vec![EventKind::Creds, EventKind::Chats, EventKind::Contacts, EventKind::Messages, EventKind::Receipts]);
    }

    #[test]
    fn flush_deactivates_buffering() {
        let buffer = EventBuffer::new();
        buffer.start();
        buffer.push(EventKind::Chats, Record::new("ch1", fields(json!({}))));
        buffer.flush();
        assert!(!buffer.is_active());

        let record = Record::new("ch2", fields(json!({})));
        assert_eq!(buffer.push(EventKind::Chats, record.clone()), Some(FlushedEvent { kind: EventKind::Chats, record }));
    }
}
