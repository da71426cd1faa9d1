//! Incremental table synchronization with the server
//!
//! Both directions only ever move the bytes past the last synchronized size,
//! so every call costs O(new data).

use crate::binary::BinaryReader;
use crate::bucket::Bucket;
use crate::client::CacheClient;
use crate::session::CacheStats;
use crate::transport::MessageType;
use crate::{Error, Result};
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::trace;

/// Headroom left in each table chunk for the message header
const CHUNK_HEADER_RESERVE: usize = 32;

#[derive(Debug, Clone, Copy)]
enum SendTable {
    Paths,
    CasKeys,
}

impl CacheClient {
    /// Make sure the server holds at least `required_size` bytes of the
    /// bucket's path table
    pub fn send_path_table(&self, bucket: &Bucket, required_size: u32) -> Result<()> {
        self.send_table(bucket, SendTable::Paths, required_size)
    }

    /// Make sure the server holds at least `required_size` bytes of the
    /// bucket's cas-key table
    pub fn send_cas_table(&self, bucket: &Bucket, required_size: u32) -> Result<()> {
        self.send_table(bucket, SendTable::CasKeys, required_size)
    }

    fn send_table(&self, bucket: &Bucket, table: SendTable, required_size: u32) -> Result<()> {
        let (sent_lock, message_type) = match table {
            SendTable::Paths => (&bucket.path_table_sent, MessageType::StorePathTable),
            SendTable::CasKeys => (&bucket.cas_table_sent, MessageType::StoreCasTable),
        };
        let mut sent = sent_lock.lock();
        if required_size <= *sent {
            return Ok(());
        }

        let chunk_limit = self
            .transport
            .max_message_size()
            .saturating_sub(CHUNK_HEADER_RESERVE)
            .max(1);
        while *sent < required_size {
            let to_send = ((required_size - *sent) as usize).min(chunk_limit);
            let start = *sent as usize;
            let range = start..start + to_send;
            let chunk = match table {
                SendTable::Paths => bucket.send_paths.read().memory().get(range).map(<[u8]>::to_vec),
                SendTable::CasKeys => bucket.send_keys.read().memory().get(range).map(<[u8]>::to_vec),
            }
            .ok_or_else(|| Error::protocol(format!("{message_type} beyond local table size")))?;

            let mut writer = self.writer();
            writer.write_7bit(bucket.wire_id)?;
            writer.write_bytes(&chunk)?;
            self.send(message_type, &writer)?;
            *sent += to_send as u32;
            trace!(bucket = bucket.id, ?message_type, sent = *sent, "Sent table chunk");
        }
        Ok(())
    }

    /// Pull the server tables far enough that the cas-key entry at `offset`
    /// and the path it references can be resolved
    pub fn fetch_cas_table(&self, bucket: &Bucket, stats: &mut CacheStats, offset: u32) -> Result<()> {
        let available = bucket.available_cas_table_size.load(Ordering::Acquire);
        if bucket
            .server_keys
            .read()
            .entry_end(offset)
            .is_some_and(|end| end <= available)
        {
            return Ok(());
        }

        let started = Instant::now();
        let _receive = bucket.receive_lock.lock();

        let mut message_sent = false;
        loop {
            let table_size = bucket.server_keys.read().size();
            if bucket.server_keys.read().has_entry(offset) {
                if !message_sent && bucket.available_cas_table_size.load(Ordering::Acquire) >= table_size {
                    return Ok(());
                }
                break;
            }

            let mut writer = self.writer();
            writer.write_7bit(bucket.wire_id)?;
            writer.write_u32(table_size)?;
            let response = self.send(MessageType::FetchCasTable, &writer)?;
            let mut reader = BinaryReader::new(&response);
            let total = reader.read_u32()?;
            let bytes = reader.remaining();
            if bytes.is_empty() {
                return Err(Error::protocol(format!(
                    "server cas table ends at {total} bytes, entry {offset} not present"
                )));
            }
            bucket.server_keys.write().append_bytes(bytes)?;
            message_sent = true;
        }

        // Cas entries reference path offsets we cannot see without parsing
        // them all, so pull the whole path table
        let mut target = None;
        loop {
            let size = bucket.server_paths.read().size();
            if target.is_some_and(|target| size >= target) {
                break;
            }
            let mut writer = self.writer();
            writer.write_7bit(bucket.wire_id)?;
            writer.write_u32(size)?;
            let response = self.send(MessageType::FetchPathTable, &writer)?;
            let mut reader = BinaryReader::new(&response);
            let total = *target.get_or_insert(reader.read_u32()?);
            let bytes = reader.remaining();
            if bytes.is_empty() && size < total {
                return Err(Error::protocol(format!(
                    "server path table stalled at {size} of {total} bytes"
                )));
            }
            bucket.server_paths.write().append_bytes(bytes)?;
        }

        let size = bucket.server_keys.read().size();
        bucket.available_cas_table_size.store(size, Ordering::Release);
        stats.fetch_cas_table.add_since(started);
        trace!(bucket = bucket.id, cas_table = size, path_table = bucket.server_path_table_size(), "Fetched server tables");
        Ok(())
    }
}
