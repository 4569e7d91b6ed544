//! redb table definitions for the request queue.
//!
//! Messages and dead letters are keyed by their sequence number, so a
//! forward scan yields publish order.

use redb::TableDefinition;

/// Undelivered or in-flight messages keyed by sequence number.
pub const MESSAGES: TableDefinition<u64, &[u8]> = TableDefinition::new("messages");

/// Permanently failed messages keyed by their original sequence number.
pub const DEAD_LETTERS: TableDefinition<u64, &[u8]> = TableDefinition::new("dead_letters");

/// Queue counters.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// `META` key holding the next sequence number to assign.
pub const NEXT_SEQ: &str = "next_seq";
