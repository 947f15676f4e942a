// gasm Common Library
// Hashing, word-based transactional memory and the concurrent containers built on it

pub mod hash;
pub mod hashtable;
pub mod queue;
pub mod stm;
pub mod tm;
pub mod types;

// Re-export commonly used types
pub use types::{gasm_version, Base, Segment, Sequence, GASM_VER_MAJOR, GASM_VER_MINOR, NUCLEOTIDES};

// Re-export hash functions
pub use hash::SdbmHash;

// Re-export transactional memory
pub use stm::{direct, Abort, Access, Direct, TVar, TxResult, Txn, Word};
pub use tm::{HybridTm, TmConfig, TmMode, TmStatsSnapshot, Transaction};

// Re-export containers
pub use hashtable::HashIndexTable;
pub use queue::ConcurrentQueue;
