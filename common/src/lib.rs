// Bulwark common library - main library exports

pub mod chain;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod params;
pub mod script;
pub mod target;
pub mod types;
pub mod validation;

// Flattened re-exports
pub use self::hash::{BlockHash, Hash, TxId};
pub use self::types::*;
pub use self::validation::ConsensusError;
