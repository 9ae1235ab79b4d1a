//! The record handed to subscription callbacks.

use bitflags::bitflags;
use mlua::{Lua, Table};
use std::collections::BTreeMap;

bitflags! {
    /// Delivery conditions attached to a [`StreamRecord`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StreamFlags: u32 {
        /// The notification queue overflowed and older notifications were discarded.
        const DROPPED = 1;
        /// An aggregated record lacks a value for a subscribed characteristic.
        const MISSING = 2;
    }
}

/// One callback invocation's payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamRecord {
    /// Per-subscription sequence number, starting at 1.
    pub seq: u64,
    /// Microseconds since the Unix epoch of the newest notification included.
    pub ts_us: i64,
    pub flags: StreamFlags,
    /// Characteristic UUID to value (EveryUpdate, Aggregated).
    pub values: BTreeMap<String, Vec<u8>>,
    /// Characteristic UUID to values in arrival order (Batched).
    pub batch_values: BTreeMap<String, Vec<Vec<u8>>>,
}

impl StreamRecord {
    /// Builds the script-facing table
    /// `{Seq, TsUs, Flags, Values = {uuid = bytes}, BatchValues = {uuid = {bytes...}}}`.
    pub fn to_lua(&self, lua: &Lua) -> mlua::Result<Table> {
        let t = lua.create_table()?;
        t.set("Seq", self.seq)?;
        t.set("TsUs", self.ts_us)?;
        t.set("Flags", self.flags.bits())?;

        let values = lua.create_table()?;
        for (uuid, data) in &self.values {
            values.set(uuid.as_str(), lua.create_string(data)?)?;
        }
        t.set("Values", values)?;

        let batches = lua.create_table()?;
        for (uuid, list) in &self.batch_values {
            let seq = lua.create_table()?;
            for (idx, data) in list.iter().enumerate() {
                seq.raw_set(idx + 1, lua.create_string(data)?)?;
            }
            batches.set(uuid.as_str(), seq)?;
        }
        t.set("BatchValues", batches)?;
        Ok(t)
    }
}
