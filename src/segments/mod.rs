// Partition-side segment state and the subscriber dispatcher.
//
// Each partition caches one `SegmentPartitioned` per named segment: the
// segment's bitmap lives in the attribute index under the SEGMENT system
// property, and a cached interpreter is reused across customers during a
// refresh. Bit flips produce enter/exit messages that buffer locally,
// flush to the table, and fan out to registered webhook subscribers.

use crate::attributes::Attributes;
use crate::bitmap::IndexBits;
use crate::common::{hash_str, now_ms};
use crate::error::Result;
use crate::query::{InterpretMode, Interpreter, Macro};
use crate::table::properties::PROP_SEGMENT;
use crate::table::{ChangeMessage, SegmentChange, Subscriber, Table};
use crate::Services;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct SegmentPartitioned {
    pub name: String,
    pub hash: i64,
    pub macros: Arc<Macro>,
    pub last_modified: i64,
    pub refresh_ms: i64,
    pub refresh_next: i64,
    pub ttl_ms: i64,
    pub ttl_expires: i64,
    pub z_index: i64,
    pub on_insert: bool,
    /// reused across customers within one refresh pass
    pub interpreter: Option<Interpreter>,
}

impl SegmentPartitioned {
    pub fn new(
        name: &str,
        macros: Arc<Macro>,
        flags: crate::query::SegmentFlags,
        last_modified: i64,
    ) -> Self {
        Self {
            name: name.to_string(),
            hash: hash_str(name),
            macros,
            last_modified,
            refresh_ms: flags.refresh_ms,
            refresh_next: 0, // due immediately after (re)load
            ttl_ms: flags.ttl_ms,
            ttl_expires: if flags.ttl_ms > 0 {
                now_ms() + flags.ttl_ms
            } else {
                0
            },
            z_index: flags.z_index,
            on_insert: flags.on_insert,
            interpreter: None,
        }
    }

    pub fn is_refresh_due(&self, now: i64) -> bool {
        self.refresh_next <= now
    }

    pub fn schedule_next_refresh(&mut self) {
        self.refresh_next = now_ms() + self.refresh_ms.max(1_000);
        if self.ttl_ms > 0 {
            self.ttl_expires = now_ms() + self.ttl_ms;
        }
    }

    /// Force a refresh on the next pass (used when segment math cannot be
    /// recomputed inline during insert).
    pub fn expire_now(&mut self) {
        self.refresh_next = 0;
    }

    pub fn bits(&self, attrs: &mut Attributes) -> Result<IndexBits> {
        attrs.get_bits(PROP_SEGMENT, self.hash)
    }

    /// Flip one customer's membership bit; reports the transition.
    pub fn set_bit(
        &self,
        attrs: &mut Attributes,
        linear_id: usize,
        state: bool,
    ) -> Result<Option<SegmentChange>> {
        attrs.with_bits_mut(PROP_SEGMENT, self.hash, |bits| {
            let current = bits.bit_state(linear_id);
            if state && !current {
                bits.bit_set(linear_id);
                Some(SegmentChange::Entered)
            } else if !state && current {
                bits.bit_clear(linear_id);
                Some(SegmentChange::Exited)
            } else {
                None
            }
        })
    }

    /// Replace the whole bitmap (countable refresh path); the caller has
    /// already emitted per-customer differences.
    pub fn store_bits(&self, attrs: &mut Attributes, bits: &IndexBits) -> Result<()> {
        attrs.with_bits_mut(PROP_SEGMENT, self.hash, |current| {
            current.op_copy(bits);
        })
    }

    /// The cached interpreter, built on first use after a (re)load.
    pub fn interpreter(&mut self) -> &mut Interpreter {
        if self.interpreter.is_none() {
            self.interpreter = Some(Interpreter::new(self.macros.clone(), InterpretMode::Count));
        }
        self.interpreter.as_mut().unwrap()
    }

    pub fn make_message(&self, state: SegmentChange, customer_id: String) -> ChangeMessage {
        ChangeMessage {
            segment_hash: self.hash,
            segment: self.name.clone(),
            state,
            customer_id,
            stamp: now_ms(),
        }
    }
}

/// Compare two bitmaps and emit enter/exit messages for flipped bits.
/// `resolve_id` maps a linear id to the external customer id.
pub fn emit_differences(
    segment: &SegmentPartitioned,
    before: &IndexBits,
    after: &IndexBits,
    stop_bit: usize,
    mut resolve_id: impl FnMut(usize) -> Option<String>,
    out: &mut Vec<ChangeMessage>,
) {
    for linear in 0..stop_bit {
        let was = before.bit_state(linear);
        let is = after.bit_state(linear);
        if was == is {
            continue;
        }
        let Some(customer_id) = resolve_id(linear) else {
            continue;
        };
        let state = if is {
            SegmentChange::Entered
        } else {
            SegmentChange::Exited
        };
        out.push(segment.make_message(state, customer_id));
    }
}

struct PendingDelivery {
    subscriber: Subscriber,
    message: ChangeMessage,
    expires: i64,
}

/// Background webhook dispatcher: drains each table's message queue and
/// POSTs to its subscribers, retrying failures until retention runs out.
pub fn start_dispatcher(services: Arc<Services>) {
    std::thread::spawn(move || {
        let client = match reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "subscriber dispatcher disabled");
                return;
            }
        };
        let mut retry: Vec<PendingDelivery> = Vec::new();

        loop {
            if !services.is_running() {
                return;
            }

            let mut deliveries: Vec<PendingDelivery> = std::mem::take(&mut retry);
            for table in services.db.tables() {
                let messages = table.drain_messages();
                if messages.is_empty() {
                    continue;
                }
                let subscribers = table.subscribers.read().clone();
                for message in messages {
                    for subscriber in subscribers
                        .iter()
                        .filter(|s| s.segment == message.segment)
                    {
                        deliveries.push(PendingDelivery {
                            subscriber: subscriber.clone(),
                            message: message.clone(),
                            expires: message.stamp + subscriber.retention_ms.max(0),
                        });
                    }
                }
            }

            let now = now_ms();
            for delivery in deliveries {
                if delivery.expires < now {
                    debug!(
                        segment = %delivery.message.segment,
                        "dropping change message past retention"
                    );
                    continue;
                }
                let url = format!(
                    "http://{}:{}{}",
                    delivery.subscriber.host, delivery.subscriber.port, delivery.subscriber.path
                );
                let sent = client
                    .post(&url)
                    .json(&delivery.message)
                    .send()
                    .map(|r| r.status().is_success())
                    .unwrap_or(false);
                if !sent {
                    retry.push(delivery);
                }
            }

            std::thread::sleep(Duration::from_millis(1000));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeBlob;
    use crate::query;
    use crate::table::properties::Properties;

    fn segment(name: &str) -> SegmentPartitioned {
        let schema = Properties::new();
        let macros = query::compile("each_row { return true }", &schema).unwrap();
        SegmentPartitioned::new(name, macros, Default::default(), now_ms())
    }

    #[test]
    fn test_set_bit_reports_transitions() {
        let mut attrs = Attributes::new(0, Arc::new(AttributeBlob::new()));
        let seg = segment("payers");

        assert_eq!(
            seg.set_bit(&mut attrs, 3, true).unwrap(),
            Some(SegmentChange::Entered)
        );
        assert_eq!(seg.set_bit(&mut attrs, 3, true).unwrap(), None);
        assert_eq!(
            seg.set_bit(&mut attrs, 3, false).unwrap(),
            Some(SegmentChange::Exited)
        );
        assert_eq!(seg.set_bit(&mut attrs, 3, false).unwrap(), None);
    }

    #[test]
    fn test_segment_bits_addressable_by_name_hash() {
        let mut attrs = Attributes::new(0, Arc::new(AttributeBlob::new()));
        let seg = segment("payers");
        seg.set_bit(&mut attrs, 1, true).unwrap();

        let via_index = attrs.get_bits(PROP_SEGMENT, hash_str("payers")).unwrap();
        assert!(via_index.bit_state(1));
    }

    #[test]
    fn test_emit_differences() {
        let seg = segment("s");
        let mut before = IndexBits::new();
        before.bit_set(0);
        before.bit_set(1);
        let mut after = IndexBits::new();
        after.bit_set(1);
        after.bit_set(2);

        let mut out = Vec::new();
        emit_differences(&seg, &before, &after, 3, |lin| Some(format!("u{lin}")), &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].state, SegmentChange::Exited);
        assert_eq!(out[0].customer_id, "u0");
        assert_eq!(out[1].state, SegmentChange::Entered);
        assert_eq!(out[1].customer_id, "u2");
    }
}
