// ============================================================================
// Transaction Group
// ============================================================================
//
// Open transactions of this process, keyed by id. A transaction is created
// by `begin` with one acquire; a `begin` carrying a known id acquires the
// same transaction again. Commits release acquires and only the origin
// process can run the final commit. Rollback always finishes the
// transaction. A background reaper rolls back transactions that outlive
// their deadline.
//
//   [active, acquires=1] --acquire--> [active, acquires=n]
//          |  commit: acquires-1, backend commit at 0 --> committed
//          |  rollback (idempotent)                   --> rolled back
//          |  reaper, past deadline                   --> timed out
//
// Finished ids are remembered for a while so late callers learn why the
// transaction is gone.
//
// ============================================================================

pub mod group;
pub mod state;

pub use group::TransactionGroup;
pub use state::{Transaction, TransactionId, TransactionState};
